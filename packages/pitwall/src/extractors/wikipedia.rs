//! Extractors for English Wikipedia list and season articles.
//!
//! Wikipedia covers historical entities the official archive no longer
//! lists, and career totals (titles, wins) the standings pages lack.

use super::html::find_table;
use super::parse::{parse_date, parse_leading_u32};
use super::{join_url, page_error, table_drafts, Drafts, Extractor};
use crate::error::ExtractError;
use crate::types::draft::{CompetitorDraft, DraftRecord, EventDraft, TeamDraft};
use crate::types::endpoint::{RawContent, SourceEndpoint};
use crate::types::family::{EntityFamily, SourceId};

const TABLE: &str = "table.wikitable";

/// Drop the markers Wikipedia lists append to names (`*` current, `^` champion, ...).
fn strip_markers(name: &str) -> String {
    name.trim_end_matches(|c: char| matches!(c, '*' | '^' | '~' | '†' | '‡' | '#') || c.is_whitespace())
        .to_string()
}

fn article(base_url: &str, family: EntityFamily, title: &str) -> SourceEndpoint {
    SourceEndpoint::new(SourceId::wikipedia(), family, join_url(base_url, &format!("/wiki/{}", title))).html()
}

// =============================================================================
// Drivers
// =============================================================================

/// `List_of_Formula_One_drivers`: every driver who entered a championship race.
pub struct DriverList {
    base_url: String,
}

impl DriverList {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl Extractor for DriverList {
    fn source(&self) -> SourceId {
        SourceId::wikipedia()
    }

    fn family(&self) -> EntityFamily {
        EntityFamily::Competitors
    }

    fn seeds(&self, season: i32) -> Vec<SourceEndpoint> {
        vec![article(&self.base_url, self.family(), "List_of_Formula_One_drivers").with_param("season", season)]
    }

    fn extract(&self, raw: &RawContent) -> Drafts {
        let origin = raw.endpoint.url.as_str();
        let Some(table) = find_table(&raw.body, TABLE, &["driver", "nationality"]) else {
            return page_error(ExtractError::missing(origin, "drivers list table"));
        };
        let name = match table.require(&["driver name", "driver", "name"], origin) {
            Ok(c) => c,
            Err(e) => return page_error(e),
        };
        let nationality = table.column(&["nationality"]);
        let championships = table.column(&["drivers' championships", "championships", "titles"]);
        let wins = table.column(&["race wins", "wins"]);
        let podiums = table.column(&["podiums"]);

        table_drafts(raw, table, move |row| {
            Ok(DraftRecord::Competitor(CompetitorDraft {
                name: row.value(Some(name)).map(strip_markers).filter(|n| !n.is_empty()),
                nationality: row.owned(nationality),
                championships: row.value(championships).and_then(parse_leading_u32),
                wins: row.value(wins).and_then(parse_leading_u32),
                podiums: row.value(podiums).and_then(parse_leading_u32),
                ..Default::default()
            }))
        })
    }
}

// =============================================================================
// Constructors
// =============================================================================

/// `List_of_Formula_One_constructors`: current and former constructors.
pub struct ConstructorList {
    base_url: String,
}

impl ConstructorList {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl Extractor for ConstructorList {
    fn source(&self) -> SourceId {
        SourceId::wikipedia()
    }

    fn family(&self) -> EntityFamily {
        EntityFamily::Teams
    }

    fn seeds(&self, season: i32) -> Vec<SourceEndpoint> {
        vec![article(&self.base_url, self.family(), "List_of_Formula_One_constructors").with_param("season", season)]
    }

    fn extract(&self, raw: &RawContent) -> Drafts {
        let origin = raw.endpoint.url.as_str();
        let Some(table) = find_table(&raw.body, TABLE, &["constructor"]) else {
            return page_error(ExtractError::missing(origin, "constructors table"));
        };
        let name = match table.require(&["constructor"], origin) {
            Ok(c) => c,
            Err(e) => return page_error(e),
        };
        let licensed = table.column(&["licensed in", "nationality", "licence"]);
        let based = table.column(&["based in", "base"]);
        let engine = table.column(&["engine", "power unit"]);
        let wins = table.column(&["wins"]);
        let titles = table.column(&["wcc", "constructors' championships", "championships"]);

        table_drafts(raw, table, move |row| {
            Ok(DraftRecord::Team(TeamDraft {
                name: row.value(Some(name)).map(strip_markers).filter(|n| !n.is_empty()),
                nationality: row.owned(licensed),
                base: row.owned(based),
                power_unit: row.owned(engine),
                wins: row.value(wins).and_then(parse_leading_u32),
                championships: row.value(titles).and_then(parse_leading_u32),
                ..Default::default()
            }))
        })
    }
}

// =============================================================================
// Season calendar
// =============================================================================

/// `{season}_Formula_One_World_Championship`: the calendar table with round
/// numbers, circuits and race dates.
pub struct SeasonCalendar {
    base_url: String,
}

impl SeasonCalendar {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl Extractor for SeasonCalendar {
    fn source(&self) -> SourceId {
        SourceId::wikipedia()
    }

    fn family(&self) -> EntityFamily {
        EntityFamily::Events
    }

    fn seeds(&self, season: i32) -> Vec<SourceEndpoint> {
        let title = format!("{}_Formula_One_World_Championship", season);
        vec![article(&self.base_url, self.family(), &title).with_param("season", season)]
    }

    fn extract(&self, raw: &RawContent) -> Drafts {
        let origin = raw.endpoint.url.as_str();
        let season: Option<i32> = raw.endpoint.param_as("season");
        let Some(table) = find_table(&raw.body, TABLE, &["round", "grand prix", "circuit"]) else {
            return page_error(ExtractError::missing(origin, "season calendar table"));
        };
        let round = match table.require(&["round"], origin) {
            Ok(c) => c,
            Err(e) => return page_error(e),
        };
        let grand_prix = table.column(&["grand prix", "race"]);
        let circuit = table.column(&["circuit"]);
        let date = table.column(&["race date", "date"]);

        table_drafts(raw, table, move |row| {
            let Some(round) = row.value(Some(round)).and_then(parse_leading_u32) else {
                return Err("round is not a number".to_string());
            };
            Ok(DraftRecord::Event(EventDraft {
                name: row.owned(grand_prix),
                season,
                round: Some(round),
                circuit: row.owned(circuit),
                date: row.value(date).and_then(parse_date),
                ..Default::default()
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;

    const BASE: &str = "https://en.wikipedia.org";

    fn raw_for(extractor: &dyn Extractor, body: String) -> RawContent {
        RawContent::new(extractor.seeds(2024).remove(0), body)
    }

    #[test]
    fn test_driver_list() {
        let extractor = DriverList::new(BASE);
        assert_eq!(
            extractor.seeds(2024)[0].url,
            "https://en.wikipedia.org/wiki/List_of_Formula_One_drivers"
        );

        let body = fixtures::wikipedia_drivers(&[
            ("Max Verstappen*^", "Netherlands", "4 2021–2024", "63", "112"),
            ("Juan Manuel Fangio^", "Argentina", "5", "24", "35"),
        ]);
        let drafts: Vec<_> = extractor
            .extract(&raw_for(&extractor, body))
            .map(|d| d.unwrap())
            .collect();

        let DraftRecord::Competitor(max) = &drafts[0].record else {
            panic!("expected competitor draft");
        };
        assert_eq!(max.name.as_deref(), Some("Max Verstappen"));
        assert_eq!(max.championships, Some(4));
        assert_eq!(max.wins, Some(63));
        assert_eq!(max.podiums, Some(112));
        assert_eq!(max.points, None);
    }

    #[test]
    fn test_constructor_list() {
        let extractor = ConstructorList::new(BASE);
        let body = fixtures::wikipedia_constructors(&[(
            "Red Bull Racing",
            "Honda RBPT",
            "Austria",
            "Milton Keynes, United Kingdom",
            "6",
        )]);
        let drafts: Vec<_> = extractor
            .extract(&raw_for(&extractor, body))
            .map(|d| d.unwrap())
            .collect();

        let DraftRecord::Team(team) = &drafts[0].record else {
            panic!("expected team draft");
        };
        assert_eq!(team.name.as_deref(), Some("Red Bull Racing"));
        assert_eq!(team.base.as_deref(), Some("Milton Keynes, United Kingdom"));
        assert_eq!(team.power_unit.as_deref(), Some("Honda RBPT"));
        assert_eq!(team.championships, Some(6));
    }

    #[test]
    fn test_season_calendar_rejects_bad_round() {
        let extractor = SeasonCalendar::new(BASE);
        let body = fixtures::wikipedia_calendar(&[
            ("1", "Bahrain Grand Prix", "Bahrain International Circuit, Sakhir", "2 March 2024"),
            ("TBA", "Chinese Grand Prix", "Shanghai International Circuit, Shanghai", "21 April 2024"),
        ]);
        let drafts: Vec<_> = extractor.extract(&raw_for(&extractor, body)).collect();
        assert_eq!(drafts.len(), 2);

        let DraftRecord::Event(bahrain) = &drafts[0].as_ref().unwrap().record else {
            panic!("expected event draft");
        };
        assert_eq!(bahrain.round, Some(1));
        assert_eq!(bahrain.season, Some(2024));
        assert_eq!(bahrain.circuit.as_deref(), Some("Bahrain International Circuit, Sakhir"));
        assert!(matches!(drafts[1], Err(ExtractError::MalformedItem { item: 1, .. })));
    }
}
