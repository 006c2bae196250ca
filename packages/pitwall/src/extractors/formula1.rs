//! Extractors for the official results archive on formula1.com.
//!
//! Pages used, per season:
//! - `/en/results/{season}/drivers` - driver standings
//! - `/en/results/{season}/team` - constructor standings
//! - `/en/results/{season}/races` - race calendar with winners, linking to
//!   one result page per race

use super::html::{find_table, resolve, split_driver_code, RowRead};
use super::parse::{parse_classification, parse_date, parse_leading_u32, parse_points, Classification};
use super::{join_url, page_error, table_drafts, Drafts, Extractor};
use crate::error::ExtractError;
use crate::types::draft::{CompetitorDraft, DraftRecord, EventDraft, ResultDraft, TeamDraft};
use crate::types::endpoint::{RawContent, SourceEndpoint};
use crate::types::family::{EntityFamily, SourceId};

const TABLE: &str = "table";

fn standing(text: Option<&str>) -> Option<u32> {
    match text.and_then(parse_classification) {
        Some(Classification::Position(pos)) => Some(pos),
        _ => None,
    }
}

fn season_of(raw: &RawContent) -> Option<i32> {
    raw.endpoint.param_as("season")
}

// =============================================================================
// Driver standings
// =============================================================================

pub struct DriverStandings {
    base_url: String,
}

impl DriverStandings {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl Extractor for DriverStandings {
    fn source(&self) -> SourceId {
        SourceId::formula1()
    }

    fn family(&self) -> EntityFamily {
        EntityFamily::Competitors
    }

    fn seeds(&self, season: i32) -> Vec<SourceEndpoint> {
        let url = join_url(&self.base_url, &format!("/en/results/{}/drivers", season));
        vec![SourceEndpoint::new(self.source(), self.family(), url)
            .html()
            .with_param("season", season)]
    }

    fn extract(&self, raw: &RawContent) -> Drafts {
        let origin = raw.endpoint.url.as_str();
        let Some(table) = find_table(&raw.body, TABLE, &["driver", "pts"]) else {
            return page_error(ExtractError::missing(origin, "driver standings table"));
        };
        let driver = match table.require(&["driver"], origin) {
            Ok(c) => c,
            Err(e) => return page_error(e),
        };
        let pos = table.column(&["pos", "position"]);
        let nationality = table.column(&["nationality"]);
        let car = table.column(&["car", "team"]);
        let pts = table.column(&["pts", "points"]);

        table_drafts(raw, table, move |row| {
            let (name, code) = match row.value(Some(driver)) {
                Some(text) => {
                    let (name, code) = split_driver_code(text);
                    (Some(name), code)
                }
                None => (None, None),
            };
            Ok(DraftRecord::Competitor(CompetitorDraft {
                name,
                code,
                nationality: row.owned(nationality),
                team: row.owned(car),
                points: row.value(pts).and_then(parse_points),
                standing: standing(row.value(pos)),
                ..Default::default()
            }))
        })
    }
}

// =============================================================================
// Team standings
// =============================================================================

pub struct TeamStandings {
    base_url: String,
}

impl TeamStandings {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl Extractor for TeamStandings {
    fn source(&self) -> SourceId {
        SourceId::formula1()
    }

    fn family(&self) -> EntityFamily {
        EntityFamily::Teams
    }

    fn seeds(&self, season: i32) -> Vec<SourceEndpoint> {
        let url = join_url(&self.base_url, &format!("/en/results/{}/team", season));
        vec![SourceEndpoint::new(self.source(), self.family(), url)
            .html()
            .with_param("season", season)]
    }

    fn extract(&self, raw: &RawContent) -> Drafts {
        let origin = raw.endpoint.url.as_str();
        let Some(table) = find_table(&raw.body, TABLE, &["team", "pts"]) else {
            return page_error(ExtractError::missing(origin, "team standings table"));
        };
        let team = match table.require(&["team"], origin) {
            Ok(c) => c,
            Err(e) => return page_error(e),
        };
        let pos = table.column(&["pos", "position"]);
        let pts = table.column(&["pts", "points"]);

        table_drafts(raw, table, move |row| {
            Ok(DraftRecord::Team(TeamDraft {
                name: row.owned(Some(team)),
                points: row.value(pts).and_then(parse_points),
                standing: standing(row.value(pos)),
                ..Default::default()
            }))
        })
    }
}

// =============================================================================
// Race calendar
// =============================================================================

/// Columns of the season races index, shared by the calendar and results
/// extractors.
struct RacesIndex {
    table: super::html::Table,
    grand_prix: usize,
    date: Option<usize>,
    laps: Option<usize>,
}

impl RacesIndex {
    fn read(raw: &RawContent) -> Result<Self, ExtractError> {
        let origin = raw.endpoint.url.as_str();
        let table = find_table(&raw.body, TABLE, &["grand prix"])
            .ok_or_else(|| ExtractError::missing(origin, "season races table"))?;
        let grand_prix = table.require(&["grand prix"], origin)?;
        let date = table.column(&["date"]);
        let laps = table.column(&["laps"]);
        Ok(Self {
            table,
            grand_prix,
            date,
            laps,
        })
    }
}

pub struct RaceCalendar {
    base_url: String,
}

impl RaceCalendar {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl Extractor for RaceCalendar {
    fn source(&self) -> SourceId {
        SourceId::formula1()
    }

    fn family(&self) -> EntityFamily {
        EntityFamily::Events
    }

    fn seeds(&self, season: i32) -> Vec<SourceEndpoint> {
        vec![races_index(&self.base_url, self.family(), season)]
    }

    fn extract(&self, raw: &RawContent) -> Drafts {
        let index = match RacesIndex::read(raw) {
            Ok(index) => index,
            Err(e) => return page_error(e),
        };
        let season = season_of(raw);
        let RacesIndex {
            table,
            grand_prix,
            date,
            laps,
        } = index;

        // rounds follow table order; malformed rows still occupy a round
        let rounds: Vec<usize> = table.rows.iter().map(row_item).collect();
        table_drafts(raw, table, move |row| {
            let round = rounds.iter().position(|item| *item == row.item).map(|i| i as u32 + 1);
            let name = row.owned(Some(grand_prix));
            Ok(DraftRecord::Event(EventDraft {
                country: name.clone(),
                name,
                season,
                round,
                date: row.value(date).and_then(parse_date),
                laps: row.value(laps).and_then(parse_leading_u32),
                ..Default::default()
            }))
        })
    }
}

fn row_item(read: &RowRead) -> usize {
    match read {
        RowRead::Data(row) => row.item,
        RowRead::Malformed { item, .. } => *item,
    }
}

fn races_index(base_url: &str, family: EntityFamily, season: i32) -> SourceEndpoint {
    let url = join_url(base_url, &format!("/en/results/{}/races", season));
    SourceEndpoint::new(SourceId::formula1(), family, url)
        .html()
        .with_param("season", season)
}

// =============================================================================
// Race results
// =============================================================================

/// Classification of every race in a season.
///
/// The seed is the races index; each race linked from it becomes a follow-up
/// endpoint carrying `season`, `round` and `event`.
pub struct RaceResults {
    base_url: String,
}

impl RaceResults {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl Extractor for RaceResults {
    fn source(&self) -> SourceId {
        SourceId::formula1()
    }

    fn family(&self) -> EntityFamily {
        EntityFamily::Results
    }

    fn seeds(&self, season: i32) -> Vec<SourceEndpoint> {
        vec![races_index(&self.base_url, self.family(), season)]
    }

    fn follow_ups(&self, raw: &RawContent) -> Vec<SourceEndpoint> {
        let Ok(index) = RacesIndex::read(raw) else {
            return Vec::new();
        };
        let Some(season) = season_of(raw) else {
            return Vec::new();
        };

        index
            .table
            .rows
            .iter()
            .enumerate()
            .filter_map(|(i, read)| match read {
                RowRead::Data(row) => Some((i as u32 + 1, row)),
                RowRead::Malformed { .. } => None,
            })
            .filter_map(|(round, row)| {
                let cell = row.cell(index.grand_prix)?;
                let url = resolve(&raw.endpoint.url, cell.href.as_deref()?)?;
                Some(
                    SourceEndpoint::new(self.source(), self.family(), url)
                        .html()
                        .with_param("season", season)
                        .with_param("round", round)
                        .with_param("event", &cell.text),
                )
            })
            .collect()
    }

    fn extracts(&self, endpoint: &SourceEndpoint) -> bool {
        endpoint.param("round").is_some()
    }

    fn extract(&self, raw: &RawContent) -> Drafts {
        let origin = raw.endpoint.url.as_str();
        let season = season_of(raw);
        let round: Option<u32> = raw.endpoint.param_as("round");
        if season.is_none() || round.is_none() {
            return page_error(ExtractError::missing(origin, "season and round parameters"));
        }
        let event = raw.endpoint.param("event").map(str::to_string);

        let Some(table) = find_table(&raw.body, TABLE, &["driver", "pts"]) else {
            return page_error(ExtractError::missing(origin, "race classification table"));
        };
        let driver = match table.require(&["driver"], origin) {
            Ok(c) => c,
            Err(e) => return page_error(e),
        };
        let pos = table.column(&["pos", "position"]);
        let number = table.column(&["no", "number"]);
        let car = table.column(&["car", "team"]);
        let laps = table.column(&["laps"]);
        let time = table.column(&["time/retired", "time"]);
        let pts = table.column(&["pts", "points"]);

        table_drafts(raw, table, move |row| {
            let (position, status) = match row.value(pos).map(|p| (p, parse_classification(p))) {
                Some((_, Some(Classification::Position(p)))) => (Some(p), None),
                Some((_, Some(Classification::Status(s)))) => (None, Some(s)),
                Some((text, None)) => return Err(format!("unreadable position {:?}", text)),
                None => (None, None),
            };
            let competitor = row.value(Some(driver)).map(|text| split_driver_code(text).0);

            Ok(DraftRecord::Result(ResultDraft {
                season,
                round,
                event: event.clone(),
                competitor,
                team: row.owned(car),
                position,
                number: row.value(number).and_then(parse_leading_u32),
                laps: row.value(laps).and_then(parse_leading_u32),
                time: row.owned(time),
                status,
                points: row.value(pts).and_then(parse_points),
            }))
        })
    }
}
