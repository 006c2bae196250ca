//! Scheduled motorsport data collection.
//!
//! Pitwall pulls competitors, teams, events and results from several web
//! sources, reconciles them into one canonical record per real-world entity
//! and keeps a persistent store current on a per-family cadence.
//!
//! # Pipeline
//!
//! ```text
//! Scheduler ──► Orchestrator ──► Fetcher ──► Extractor ──► Normalizer ──► Repository
//!  (cadence,     (one family      (HTTP,      (raw page     (identity,     (SQLite,
//!   Idle/Running) per run)         retries)    → drafts)     merge)         one tx)
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use pitwall::{HttpFetcher, Orchestrator, PitwallConfig, SqliteRepository, Trigger};
//!
//! let config = PitwallConfig::from_env()?;
//! let repo = Arc::new(SqliteRepository::new(&config.database_path).await?);
//! let fetcher = Arc::new(HttpFetcher::new(&config.fetch)?);
//! let orchestrator = Orchestrator::new(config, fetcher, repo);
//!
//! let cancel = CancellationToken::new();
//! let records = orchestrator.run_all(Trigger::Manual, &cancel).await;
//! ```
//!
//! # Modules
//!
//! - [`fetcher`] - HTTP retrieval with per-host rate limiting and retries
//! - [`extractors`] - per-source page parsers producing drafts
//! - [`normalizer`] - identity resolution, deduplication, field merging
//! - [`repository`] - transactional persistence and run history
//! - [`orchestrator`] - one family run through all four stages
//! - [`scheduler`] - per-family cadence with at most one run in flight
//! - [`testing`] - mock fetcher and HTML fixtures

pub mod config;
pub mod error;
pub mod extractors;
pub mod fetcher;
pub mod normalizer;
pub mod orchestrator;
pub mod repository;
pub mod scheduler;
pub mod testing;
pub mod types;

pub use config::{PitwallConfig, SourcePriority};
pub use error::{
    ConfigError, ExtractError, FetchError, FetchErrorKind, SchedulerConflict, StorageError,
    ValidationError,
};
pub use extractors::{Extractor, ExtractorRegistry};
pub use fetcher::{Fetcher, HttpFetcher};
pub use normalizer::{Normalizer, ResolutionContext};
pub use orchestrator::Orchestrator;
pub use repository::{PersistBatch, Repository, SqliteRepository};
pub use scheduler::{FamilyState, Scheduler};
pub use types::{
    alias::CrossSourceAlias,
    canonical::{CanonicalEntity, CanonicalKey},
    draft::EntityDraft,
    family::{EntityFamily, SourceId},
    run::{RunOutcome, RunRecord, Trigger},
};
