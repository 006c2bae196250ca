//! Field-level merging of drafts that share a canonical key.
//!
//! For each field the value comes from the highest-ranked contribution that
//! has one. Rank is `(priority rank for the field, source id, origin, item)`,
//! which is a total order, so the winner never depends on input order.

use crate::config::SourcePriority;
use crate::types::canonical::{CanonicalKey, Competitor, Event, EventResult, Team};
use crate::types::draft::{CompetitorDraft, DraftRecord, EntityDraft, EventDraft, ResultDraft, TeamDraft};
use crate::types::family::SourceId;

/// One draft's payload plus where it came from.
pub(crate) struct Contribution<'a, D> {
    pub source: &'a SourceId,
    pub origin: &'a str,
    pub item: usize,
    pub draft: &'a D,
}

pub(crate) struct Merger<'a, D> {
    items: Vec<Contribution<'a, D>>,
    priority: &'a SourcePriority,
}

impl<'a, D> Merger<'a, D> {
    pub fn new(
        drafts: &[&'a EntityDraft],
        priority: &'a SourcePriority,
        payload: impl Fn(&'a DraftRecord) -> Option<&'a D>,
    ) -> Self {
        let items = drafts
            .iter()
            .filter_map(|&d| {
                payload(&d.record).map(|draft| Contribution {
                    source: &d.source,
                    origin: d.origin.as_str(),
                    item: d.item,
                    draft,
                })
            })
            .collect();
        Self { items, priority }
    }

    /// Winning value for `field`, with the source that supplied it.
    pub fn pick_with_source<T>(
        &self,
        field: &str,
        get: impl Fn(&D) -> Option<T>,
    ) -> Option<(T, &'a SourceId)> {
        self.items
            .iter()
            .filter_map(|c| {
                get(c.draft).map(|value| {
                    let rank = (self.priority.rank(field, c.source), c.source, c.origin, c.item);
                    (rank, value, c.source)
                })
            })
            .min_by(|a, b| a.0.cmp(&b.0))
            .map(|(_, value, source)| (value, source))
    }

    pub fn pick<T>(&self, field: &str, get: impl Fn(&D) -> Option<T>) -> Option<T> {
        self.pick_with_source(field, get).map(|(value, _)| value)
    }

    /// Like `pick` for text fields; blank strings count as missing.
    pub fn text(&self, field: &str, get: impl Fn(&D) -> Option<&String>) -> Option<String> {
        self.text_with_source(field, get).map(|(value, _)| value)
    }

    pub fn text_with_source(
        &self,
        field: &str,
        get: impl Fn(&D) -> Option<&String>,
    ) -> Option<(String, &'a SourceId)> {
        self.pick_with_source(field, |d| {
            get(d)
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
    }

    /// Contributing sources, sorted and deduplicated.
    pub fn sources(&self) -> Vec<SourceId> {
        let mut sources: Vec<SourceId> = self.items.iter().map(|c| c.source.clone()).collect();
        sources.sort();
        sources.dedup();
        sources
    }
}

pub(crate) fn competitors<'a>(
    drafts: &[&'a EntityDraft],
    priority: &'a SourcePriority,
) -> Merger<'a, CompetitorDraft> {
    Merger::new(drafts, priority, |r| match r {
        DraftRecord::Competitor(c) => Some(c),
        _ => None,
    })
}

pub(crate) fn teams<'a>(drafts: &[&'a EntityDraft], priority: &'a SourcePriority) -> Merger<'a, TeamDraft> {
    Merger::new(drafts, priority, |r| match r {
        DraftRecord::Team(t) => Some(t),
        _ => None,
    })
}

pub(crate) fn events<'a>(drafts: &[&'a EntityDraft], priority: &'a SourcePriority) -> Merger<'a, EventDraft> {
    Merger::new(drafts, priority, |r| match r {
        DraftRecord::Event(e) => Some(e),
        _ => None,
    })
}

pub(crate) fn results<'a>(drafts: &[&'a EntityDraft], priority: &'a SourcePriority) -> Merger<'a, ResultDraft> {
    Merger::new(drafts, priority, |r| match r {
        DraftRecord::Result(r) => Some(r),
        _ => None,
    })
}

pub(crate) fn merge_competitor(
    key: CanonicalKey,
    merger: &Merger<'_, CompetitorDraft>,
    team_key: Option<CanonicalKey>,
) -> Competitor {
    Competitor {
        name: merger
            .text("name", |d| d.name.as_ref())
            .unwrap_or_else(|| key.to_string()),
        code: merger.text("code", |d| d.code.as_ref()),
        nationality: merger.text("nationality", |d| d.nationality.as_ref()),
        date_of_birth: merger.pick("date_of_birth", |d| d.date_of_birth),
        number: merger.pick("number", |d| d.number),
        team_name: merger.text("team", |d| d.team.as_ref()),
        team_key,
        points: merger.pick("points", |d| d.points),
        standing: merger.pick("standing", |d| d.standing),
        wins: merger.pick("wins", |d| d.wins),
        podiums: merger.pick("podiums", |d| d.podiums),
        championships: merger.pick("championships", |d| d.championships),
        sources: merger.sources(),
        key,
    }
}

pub(crate) fn merge_team(key: CanonicalKey, merger: &Merger<'_, TeamDraft>) -> Team {
    Team {
        name: merger
            .text("name", |d| d.name.as_ref())
            .unwrap_or_else(|| key.to_string()),
        nationality: merger.text("nationality", |d| d.nationality.as_ref()),
        base: merger.text("base", |d| d.base.as_ref()),
        power_unit: merger.text("power_unit", |d| d.power_unit.as_ref()),
        points: merger.pick("points", |d| d.points),
        standing: merger.pick("standing", |d| d.standing),
        wins: merger.pick("wins", |d| d.wins),
        championships: merger.pick("championships", |d| d.championships),
        sources: merger.sources(),
        key,
    }
}

pub(crate) fn merge_event(
    key: CanonicalKey,
    season: i32,
    round: u32,
    merger: &Merger<'_, EventDraft>,
) -> Event {
    Event {
        name: merger
            .text("name", |d| d.name.as_ref())
            .unwrap_or_else(|| key.to_string()),
        season,
        round,
        circuit: merger.text("circuit", |d| d.circuit.as_ref()),
        country: merger.text("country", |d| d.country.as_ref()),
        date: merger.pick("date", |d| d.date),
        laps: merger.pick("laps", |d| d.laps),
        sources: merger.sources(),
        key,
    }
}

pub(crate) fn merge_result(
    key: CanonicalKey,
    event_key: CanonicalKey,
    competitor_key: CanonicalKey,
    team_key: Option<CanonicalKey>,
    merger: &Merger<'_, ResultDraft>,
) -> EventResult {
    EventResult {
        event_key,
        competitor_key,
        team_key,
        position: merger.pick("position", |d| d.position),
        number: merger.pick("number", |d| d.number),
        laps: merger.pick("laps", |d| d.laps),
        time: merger.text("time", |d| d.time.as_ref()),
        status: merger.text("status", |d| d.status.as_ref()),
        points: merger.pick("points", |d| d.points),
        sources: merger.sources(),
        key,
    }
}
