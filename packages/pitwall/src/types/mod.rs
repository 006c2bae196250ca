//! Domain types shared by every pipeline stage.

pub mod alias;
pub mod canonical;
pub mod draft;
pub mod endpoint;
pub mod family;
pub mod run;
