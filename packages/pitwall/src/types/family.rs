//! Entity families and source identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// One category of collected data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityFamily {
    Teams,
    Competitors,
    Events,
    Results,
}

impl EntityFamily {
    /// Every family, in dependency order (results reference the other three).
    pub const ALL: [EntityFamily; 4] = [
        EntityFamily::Teams,
        EntityFamily::Competitors,
        EntityFamily::Events,
        EntityFamily::Results,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityFamily::Teams => "teams",
            EntityFamily::Competitors => "competitors",
            EntityFamily::Events => "events",
            EntityFamily::Results => "results",
        }
    }

    /// Name of the table holding this family's canonical records.
    pub fn table(&self) -> &'static str {
        match self {
            EntityFamily::Teams => "teams",
            EntityFamily::Competitors => "competitors",
            EntityFamily::Events => "events",
            EntityFamily::Results => "event_results",
        }
    }

    /// Upper-case token used in `PITWALL_*_<FAMILY>` environment variables.
    pub fn env_token(&self) -> &'static str {
        match self {
            EntityFamily::Teams => "TEAMS",
            EntityFamily::Competitors => "COMPETITORS",
            EntityFamily::Events => "EVENTS",
            EntityFamily::Results => "RESULTS",
        }
    }
}

impl fmt::Display for EntityFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityFamily {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "teams" | "team" | "constructors" => Ok(EntityFamily::Teams),
            "competitors" | "competitor" | "drivers" => Ok(EntityFamily::Competitors),
            "events" | "event" | "races" => Ok(EntityFamily::Events),
            "results" | "event-results" | "event_results" => Ok(EntityFamily::Results),
            other => Err(ConfigError::UnknownFamily(other.to_string())),
        }
    }
}

/// Identifier of one remote source (e.g. `formula1`, `wikipedia`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub const FORMULA1: &'static str = "formula1";
    pub const WIKIPEDIA: &'static str = "wikipedia";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn formula1() -> Self {
        Self::new(Self::FORMULA1)
    }

    pub fn wikipedia() -> Self {
        Self::new(Self::WIKIPEDIA)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is one of the sources the crate ships extractors for.
    pub fn is_known(&self) -> bool {
        matches!(self.0.as_str(), Self::FORMULA1 | Self::WIKIPEDIA)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}
