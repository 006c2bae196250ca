//! Unvalidated, source-tagged records produced by extractors.
//!
//! Every field is optional; which ones are required is decided by the
//! normalizer per family. Extractors only guarantee that strings are trimmed
//! and non-empty when present.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::family::{EntityFamily, SourceId};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompetitorDraft {
    pub name: Option<String>,
    pub code: Option<String>,
    pub nationality: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub number: Option<u32>,
    /// Team as written by the source; resolved to a key by the normalizer
    pub team: Option<String>,
    pub points: Option<f64>,
    pub standing: Option<u32>,
    pub wins: Option<u32>,
    pub podiums: Option<u32>,
    pub championships: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TeamDraft {
    pub name: Option<String>,
    pub nationality: Option<String>,
    pub base: Option<String>,
    pub power_unit: Option<String>,
    pub points: Option<f64>,
    pub standing: Option<u32>,
    pub wins: Option<u32>,
    pub championships: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventDraft {
    pub name: Option<String>,
    pub season: Option<i32>,
    pub round: Option<u32>,
    pub circuit: Option<String>,
    pub country: Option<String>,
    pub date: Option<NaiveDate>,
    pub laps: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultDraft {
    pub season: Option<i32>,
    pub round: Option<u32>,
    pub event: Option<String>,
    pub competitor: Option<String>,
    pub team: Option<String>,
    /// Finishing position; `None` for unclassified finishers
    pub position: Option<u32>,
    pub number: Option<u32>,
    pub laps: Option<u32>,
    pub time: Option<String>,
    /// `Finished`, `DNF`, `NC`, `DQ`, ...
    pub status: Option<String>,
    pub points: Option<f64>,
}

/// The family-specific payload of a draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum DraftRecord {
    Competitor(CompetitorDraft),
    Team(TeamDraft),
    Event(EventDraft),
    Result(ResultDraft),
}

impl DraftRecord {
    pub fn family(&self) -> EntityFamily {
        match self {
            DraftRecord::Competitor(_) => EntityFamily::Competitors,
            DraftRecord::Team(_) => EntityFamily::Teams,
            DraftRecord::Event(_) => EntityFamily::Events,
            DraftRecord::Result(_) => EntityFamily::Results,
        }
    }
}

/// One record found by one extractor in one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDraft {
    pub source: SourceId,
    /// URL of the page the record was found in
    pub origin: String,
    /// Position of the item within its page
    pub item: usize,
    pub record: DraftRecord,
}

impl EntityDraft {
    pub fn new(source: SourceId, origin: impl Into<String>, item: usize, record: DraftRecord) -> Self {
        Self {
            source,
            origin: origin.into(),
            item,
            record,
        }
    }

    pub fn family(&self) -> EntityFamily {
        self.record.family()
    }

    /// The raw identifying string the source used for this record.
    ///
    /// Together with the source id this is the alias lookup key.
    pub fn raw_identity(&self) -> Option<String> {
        match &self.record {
            DraftRecord::Competitor(c) => c.name.clone(),
            DraftRecord::Team(t) => t.name.clone(),
            DraftRecord::Event(e) => match (e.season, &e.name) {
                (Some(season), Some(name)) => Some(format!("{} {}", season, name)),
                _ => None,
            },
            DraftRecord::Result(r) => match (r.season, r.round, &r.competitor) {
                (Some(season), Some(round), Some(who)) => {
                    Some(format!("{} R{} {}", season, round, who))
                }
                _ => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_identity_includes_season() {
        let draft = EntityDraft::new(
            SourceId::formula1(),
            "https://example.test/races",
            0,
            DraftRecord::Event(EventDraft {
                name: Some("Bahrain Grand Prix".into()),
                season: Some(2024),
                round: Some(1),
                ..Default::default()
            }),
        );
        assert_eq!(draft.raw_identity().as_deref(), Some("2024 Bahrain Grand Prix"));
        assert_eq!(draft.family(), EntityFamily::Events);
    }

    #[test]
    fn test_identity_missing_when_name_missing() {
        let draft = EntityDraft::new(
            SourceId::wikipedia(),
            "https://example.test/drivers",
            3,
            DraftRecord::Competitor(CompetitorDraft::default()),
        );
        assert!(draft.raw_identity().is_none());
    }
}
