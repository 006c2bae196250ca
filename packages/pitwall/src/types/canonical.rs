//! Validated, deduplicated records with stable canonical keys.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::family::{EntityFamily, SourceId};

/// Stable identifier of a real-world entity, unique within its family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Natural key of an event: season plus zero-padded round.
    pub fn for_event(season: i32, round: u32) -> Self {
        Self(format!("{}-{:02}", season, round))
    }

    /// Key of one competitor's result in one event.
    pub fn for_result(event: &CanonicalKey, competitor: &CanonicalKey) -> Self {
        Self(format!("{}/{}", event.0, competitor.0))
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Competitor {
    pub key: CanonicalKey,
    pub name: String,
    pub code: Option<String>,
    pub nationality: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub number: Option<u32>,
    pub team_name: Option<String>,
    /// Resolved team, when the team name matched a known team
    pub team_key: Option<CanonicalKey>,
    pub points: Option<f64>,
    pub standing: Option<u32>,
    pub wins: Option<u32>,
    pub podiums: Option<u32>,
    pub championships: Option<u32>,
    pub sources: Vec<SourceId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Team {
    pub key: CanonicalKey,
    pub name: String,
    pub nationality: Option<String>,
    pub base: Option<String>,
    pub power_unit: Option<String>,
    pub points: Option<f64>,
    pub standing: Option<u32>,
    pub wins: Option<u32>,
    pub championships: Option<u32>,
    pub sources: Vec<SourceId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub key: CanonicalKey,
    pub name: String,
    pub season: i32,
    pub round: u32,
    pub circuit: Option<String>,
    pub country: Option<String>,
    pub date: Option<NaiveDate>,
    pub laps: Option<u32>,
    pub sources: Vec<SourceId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventResult {
    pub key: CanonicalKey,
    pub event_key: CanonicalKey,
    pub competitor_key: CanonicalKey,
    pub team_key: Option<CanonicalKey>,
    pub position: Option<u32>,
    pub number: Option<u32>,
    pub laps: Option<u32>,
    pub time: Option<String>,
    pub status: Option<String>,
    pub points: Option<f64>,
    pub sources: Vec<SourceId>,
}

/// Any canonical record, as handed from the normalizer to the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum CanonicalEntity {
    Competitor(Competitor),
    Team(Team),
    Event(Event),
    Result(EventResult),
}

impl CanonicalEntity {
    pub fn key(&self) -> &CanonicalKey {
        match self {
            CanonicalEntity::Competitor(c) => &c.key,
            CanonicalEntity::Team(t) => &t.key,
            CanonicalEntity::Event(e) => &e.key,
            CanonicalEntity::Result(r) => &r.key,
        }
    }

    pub fn family(&self) -> EntityFamily {
        match self {
            CanonicalEntity::Competitor(_) => EntityFamily::Competitors,
            CanonicalEntity::Team(_) => EntityFamily::Teams,
            CanonicalEntity::Event(_) => EntityFamily::Events,
            CanonicalEntity::Result(_) => EntityFamily::Results,
        }
    }

    /// Display name used for fuzzy matching later runs against this record.
    pub fn display_name(&self) -> String {
        match self {
            CanonicalEntity::Competitor(c) => c.name.clone(),
            CanonicalEntity::Team(t) => t.name.clone(),
            CanonicalEntity::Event(e) => format!("{} {}", e.season, e.name),
            CanonicalEntity::Result(r) => r.key.to_string(),
        }
    }

    pub fn sources(&self) -> &[SourceId] {
        match self {
            CanonicalEntity::Competitor(c) => &c.sources,
            CanonicalEntity::Team(t) => &t.sources,
            CanonicalEntity::Event(e) => &e.sources,
            CanonicalEntity::Result(r) => &r.sources,
        }
    }
}

/// A canonical record already in storage, as seen by identity resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownEntity {
    pub key: CanonicalKey,
    pub name: String,
}

impl KnownEntity {
    pub fn new(key: CanonicalKey, name: impl Into<String>) -> Self {
        Self {
            key,
            name: name.into(),
        }
    }
}
