//! Cross-source identity resolution, deduplication and validation.
//!
//! `Normalizer::normalize` takes every draft one run extracted for a family
//! and returns canonical records, rejected drafts and newly observed aliases.
//! It is pure: everything it knows about storage arrives in a
//! `ResolutionContext`, and its output depends only on its inputs.
//!
//! Identity per family:
//! - competitors, teams: alias, then fuzzy match, then a minted slug key
//! - events: alias, then the natural key `{season}-{round:02}`
//! - results: `{event}/{competitor}`, with competitor and team references
//!   resolved read-only against the competitor and team books

pub mod fold;
pub mod fuzzy;
mod merge;
mod resolve;

use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::config::{PitwallConfig, SourcePriority};
use crate::error::ValidationError;
use crate::types::alias::{AliasSet, CrossSourceAlias};
use crate::types::canonical::{CanonicalEntity, CanonicalKey, KnownEntity};
use crate::types::draft::{DraftRecord, EntityDraft};
use crate::types::family::EntityFamily;
use resolve::Resolver;

/// Aliases and stored entities of one family, as seen at run start.
#[derive(Debug, Clone, Default)]
pub struct IdentityBook {
    pub aliases: AliasSet,
    pub known: Vec<KnownEntity>,
}

impl IdentityBook {
    pub fn new(aliases: AliasSet, known: Vec<KnownEntity>) -> Self {
        Self { aliases, known }
    }
}

/// Identity books needed to normalize one family.
#[derive(Debug, Clone, Default)]
pub struct ResolutionContext {
    books: BTreeMap<EntityFamily, IdentityBook>,
}

impl ResolutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_book(mut self, family: EntityFamily, book: IdentityBook) -> Self {
        self.books.insert(family, book);
        self
    }

    pub fn book(&self, family: EntityFamily) -> Option<&IdentityBook> {
        self.books.get(&family)
    }

    /// Families whose books `family` resolves against.
    pub fn required_families(family: EntityFamily) -> &'static [EntityFamily] {
        match family {
            EntityFamily::Teams => &[EntityFamily::Teams],
            EntityFamily::Competitors => &[EntityFamily::Competitors, EntityFamily::Teams],
            EntityFamily::Events => &[EntityFamily::Events],
            EntityFamily::Results => &[EntityFamily::Competitors, EntityFamily::Teams],
        }
    }
}

/// A draft the normalizer refused, with the reason.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub draft: EntityDraft,
    pub error: ValidationError,
}

#[derive(Debug, Clone, Default)]
pub struct NormalizeOutcome {
    /// One record per canonical key, ordered by key
    pub records: Vec<CanonicalEntity>,
    pub rejected: Vec<Rejection>,
    /// Aliases to persist alongside `records`
    pub new_aliases: Vec<CrossSourceAlias>,
}

pub struct Normalizer {
    threshold: f64,
    priorities: BTreeMap<EntityFamily, SourcePriority>,
}

impl Normalizer {
    /// Normalizer with the default source priorities.
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            priorities: EntityFamily::ALL
                .iter()
                .map(|f| (*f, SourcePriority::defaults_for(*f)))
                .collect(),
        }
    }

    pub fn from_config(config: &PitwallConfig) -> Self {
        let mut normalizer = Self::new(config.fuzzy_threshold);
        for family in EntityFamily::ALL {
            normalizer
                .priorities
                .insert(family, config.family(family).priority);
        }
        normalizer
    }

    pub fn with_priority(mut self, family: EntityFamily, priority: SourcePriority) -> Self {
        self.priorities.insert(family, priority);
        self
    }

    pub fn priority(&self, family: EntityFamily) -> SourcePriority {
        self.priorities
            .get(&family)
            .cloned()
            .unwrap_or_else(|| SourcePriority::defaults_for(family))
    }

    pub fn normalize(
        &self,
        family: EntityFamily,
        drafts: Vec<EntityDraft>,
        context: &ResolutionContext,
    ) -> NormalizeOutcome {
        let priority = self.priority(family);

        let mut rejected = Vec::new();
        let mut valid = Vec::with_capacity(drafts.len());
        for draft in drafts {
            match validate(family, &draft) {
                Ok(()) => valid.push(draft),
                Err(error) => {
                    warn!(
                        family = %family,
                        source = %draft.source,
                        origin = %draft.origin,
                        item = draft.item,
                        error = %error,
                        "Draft rejected"
                    );
                    rejected.push(Rejection { draft, error });
                }
            }
        }

        // highest-priority source first, so it mints the keys
        valid.sort_by(|a, b| {
            let ka = (priority.rank("name", &a.source), &a.source, &a.origin, a.item);
            let kb = (priority.rank("name", &b.source), &b.source, &b.origin, b.item);
            ka.cmp(&kb)
        });

        let (records, new_aliases) = match family {
            EntityFamily::Competitors => self.competitors(&valid, &priority, context),
            EntityFamily::Teams => self.teams(&valid, &priority, context),
            EntityFamily::Events => events(&valid, &priority, context),
            EntityFamily::Results => self.results(&valid, &priority, context),
        };

        debug!(
            family = %family,
            drafts = valid.len() + rejected.len(),
            records = records.len(),
            rejected = rejected.len(),
            new_aliases = new_aliases.len(),
            "Normalized drafts"
        );

        NormalizeOutcome {
            records,
            rejected,
            new_aliases,
        }
    }

    fn competitors(
        &self,
        drafts: &[EntityDraft],
        priority: &SourcePriority,
        context: &ResolutionContext,
    ) -> (Vec<CanonicalEntity>, Vec<CrossSourceAlias>) {
        let family = EntityFamily::Competitors;
        let mut resolver = Resolver::new(family, context.book(family), self.threshold);
        let teams = Resolver::new(
            EntityFamily::Teams,
            context.book(EntityFamily::Teams),
            self.threshold,
        );

        let groups = group_by(drafts, |draft| {
            draft
                .raw_identity()
                .map(|raw| resolver.resolve(&draft.source, &raw))
        });

        let records = groups
            .into_iter()
            .map(|(key, members)| {
                let merger = merge::competitors(&members, priority);
                let team_key = merger
                    .text_with_source("team", |d| d.team.as_ref())
                    .and_then(|(team, source)| teams.lookup(source, &team));
                CanonicalEntity::Competitor(merge::merge_competitor(key, &merger, team_key))
            })
            .collect();

        (records, resolver.into_new_aliases())
    }

    fn teams(
        &self,
        drafts: &[EntityDraft],
        priority: &SourcePriority,
        context: &ResolutionContext,
    ) -> (Vec<CanonicalEntity>, Vec<CrossSourceAlias>) {
        let family = EntityFamily::Teams;
        let mut resolver = Resolver::new(family, context.book(family), self.threshold);

        let groups = group_by(drafts, |draft| {
            draft
                .raw_identity()
                .map(|raw| resolver.resolve(&draft.source, &raw))
        });

        let records = groups
            .into_iter()
            .map(|(key, members)| {
                let merger = merge::teams(&members, priority);
                CanonicalEntity::Team(merge::merge_team(key, &merger))
            })
            .collect();

        (records, resolver.into_new_aliases())
    }

    fn results(
        &self,
        drafts: &[EntityDraft],
        priority: &SourcePriority,
        context: &ResolutionContext,
    ) -> (Vec<CanonicalEntity>, Vec<CrossSourceAlias>) {
        let competitors = Resolver::new(
            EntityFamily::Competitors,
            context.book(EntityFamily::Competitors),
            self.threshold,
        );
        let teams = Resolver::new(
            EntityFamily::Teams,
            context.book(EntityFamily::Teams),
            self.threshold,
        );

        let mut references: BTreeMap<CanonicalKey, (CanonicalKey, CanonicalKey)> = BTreeMap::new();
        let groups = group_by(drafts, |draft| {
            let DraftRecord::Result(r) = &draft.record else {
                return None;
            };
            let event_key = CanonicalKey::for_event(r.season?, r.round?);
            let name = r.competitor.as_deref()?;
            // unknown competitors keep their would-be key; the repository
            // defers the row until that competitor exists
            let competitor_key = competitors
                .lookup(&draft.source, name)
                .unwrap_or_else(|| competitors.provisional_key(name));
            let key = CanonicalKey::for_result(&event_key, &competitor_key);
            references
                .entry(key.clone())
                .or_insert((event_key, competitor_key));
            Some(key)
        });

        let records = groups
            .into_iter()
            .filter_map(|(key, members)| {
                let (event_key, competitor_key) = references.get(&key)?.clone();
                let merger = merge::results(&members, priority);
                let team_key = merger
                    .text_with_source("team", |d| d.team.as_ref())
                    .and_then(|(team, source)| teams.lookup(source, &team));
                Some(CanonicalEntity::Result(merge::merge_result(
                    key,
                    event_key,
                    competitor_key,
                    team_key,
                    &merger,
                )))
            })
            .collect();

        (records, Vec::new())
    }
}

fn events(
    drafts: &[EntityDraft],
    priority: &SourcePriority,
    context: &ResolutionContext,
) -> (Vec<CanonicalEntity>, Vec<CrossSourceAlias>) {
    let family = EntityFamily::Events;
    let mut aliases = context
        .book(family)
        .map(|b| b.aliases.clone())
        .unwrap_or_default();
    let mut new_aliases = Vec::new();
    let mut numbering: BTreeMap<CanonicalKey, (i32, u32)> = BTreeMap::new();

    let groups = group_by(drafts, |draft| {
        let DraftRecord::Event(e) = &draft.record else {
            return None;
        };
        let (season, round) = (e.season?, e.round?);
        let raw = draft.raw_identity()?;

        let key = aliases
            .get(&draft.source, &raw)
            .cloned()
            .unwrap_or_else(|| CanonicalKey::for_event(season, round));
        if aliases.insert(draft.source.clone(), raw.clone(), key.clone()) {
            new_aliases.push(CrossSourceAlias::new(family, draft.source.clone(), raw, key.clone()));
        }
        numbering.entry(key.clone()).or_insert((season, round));
        Some(key)
    });

    let records = groups
        .into_iter()
        .filter_map(|(key, members)| {
            let (season, round) = *numbering.get(&key)?;
            let merger = merge::events(&members, priority);
            Some(CanonicalEntity::Event(merge::merge_event(key, season, round, &merger)))
        })
        .collect();

    (records, new_aliases)
}

/// Group drafts by the key `key_of` assigns, keeping draft order within a
/// group. Drafts without a key are dropped (validation has already run).
fn group_by<'a>(
    drafts: &'a [EntityDraft],
    mut key_of: impl FnMut(&'a EntityDraft) -> Option<CanonicalKey>,
) -> BTreeMap<CanonicalKey, Vec<&'a EntityDraft>> {
    let mut groups: BTreeMap<CanonicalKey, Vec<&'a EntityDraft>> = BTreeMap::new();
    for draft in drafts {
        if let Some(key) = key_of(draft) {
            groups.entry(key).or_default().push(draft);
        }
    }
    groups
}

/// Check family and required fields.
pub fn validate(family: EntityFamily, draft: &EntityDraft) -> Result<(), ValidationError> {
    if draft.family() != family {
        return Err(ValidationError::WrongFamily {
            family: draft.family(),
            expected: family,
            source_id: draft.source.clone(),
        });
    }

    let missing = |field: &'static str| ValidationError::MissingField {
        family,
        source_id: draft.source.clone(),
        field,
    };
    let blank = |value: &Option<String>| value.as_deref().map(str::trim).unwrap_or("").is_empty();

    match &draft.record {
        DraftRecord::Competitor(c) if blank(&c.name) => Err(missing("name")),
        DraftRecord::Team(t) if blank(&t.name) => Err(missing("name")),
        DraftRecord::Event(e) if blank(&e.name) => Err(missing("name")),
        DraftRecord::Event(e) if e.season.is_none() => Err(missing("season")),
        DraftRecord::Event(e) if e.round.is_none() => Err(missing("round")),
        DraftRecord::Result(r) if r.season.is_none() => Err(missing("season")),
        DraftRecord::Result(r) if r.round.is_none() => Err(missing("round")),
        DraftRecord::Result(r) if blank(&r.competitor) => Err(missing("competitor")),
        _ => Ok(()),
    }
}
