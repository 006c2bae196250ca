//! Per-source extraction of entity drafts from raw pages.
//!
//! Each extractor covers one (source, family) pair. Extraction is
//! synchronous and CPU-bound; the orchestrator runs it off the async
//! workers and consumes the returned draft sequence exactly once.

pub mod formula1;
pub mod html;
pub mod parse;
pub mod wikipedia;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::PitwallConfig;
use crate::error::ExtractError;
use crate::types::draft::{DraftRecord, EntityDraft};
use crate::types::endpoint::{RawContent, SourceEndpoint};
use crate::types::family::{EntityFamily, SourceId};
use html::{Row, RowRead, Table};

/// Lazy, single-pass sequence of drafts and per-item errors.
pub type Drafts = Box<dyn Iterator<Item = Result<EntityDraft, ExtractError>> + Send>;

/// Turns raw content from one source into drafts for one family.
pub trait Extractor: Send + Sync {
    fn source(&self) -> SourceId;

    fn family(&self) -> EntityFamily;

    /// Endpoints to fetch first for `season`.
    fn seeds(&self, season: i32) -> Vec<SourceEndpoint>;

    /// Further endpoints discovered in a fetched page.
    fn follow_ups(&self, _raw: &RawContent) -> Vec<SourceEndpoint> {
        Vec::new()
    }

    /// Whether pages from `endpoint` carry drafts, as opposed to only links.
    fn extracts(&self, _endpoint: &SourceEndpoint) -> bool {
        true
    }

    /// Parse one page. A malformed item yields an `Err` in the sequence and
    /// extraction continues with the next one.
    fn extract(&self, raw: &RawContent) -> Drafts;

    fn name(&self) -> String {
        format!("{}/{}", self.source(), self.family())
    }
}

/// Extractors grouped by family.
#[derive(Clone, Default)]
pub struct ExtractorRegistry {
    by_family: BTreeMap<EntityFamily, Vec<Arc<dyn Extractor>>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The formula1 and wikipedia extractors for every family.
    pub fn standard(config: &PitwallConfig) -> Self {
        let f1 = config.sources.formula1.as_str();
        let wiki = config.sources.wikipedia.as_str();

        Self::new()
            .with(formula1::DriverStandings::new(f1))
            .with(formula1::TeamStandings::new(f1))
            .with(formula1::RaceCalendar::new(f1))
            .with(formula1::RaceResults::new(f1))
            .with(wikipedia::DriverList::new(wiki))
            .with(wikipedia::ConstructorList::new(wiki))
            .with(wikipedia::SeasonCalendar::new(wiki))
    }

    pub fn with(mut self, extractor: impl Extractor + 'static) -> Self {
        self.register(Arc::new(extractor));
        self
    }

    pub fn register(&mut self, extractor: Arc<dyn Extractor>) {
        self.by_family
            .entry(extractor.family())
            .or_default()
            .push(extractor);
    }

    pub fn for_family(&self, family: EntityFamily) -> &[Arc<dyn Extractor>] {
        self.by_family
            .get(&family)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.by_family.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A sequence holding a single page-level error.
pub(crate) fn page_error(error: ExtractError) -> Drafts {
    Box::new(std::iter::once(Err(error)))
}

/// Map table rows to drafts with `build`; malformed rows become errors.
///
/// `build` returns `Err(reason)` for rows it cannot use.
pub(crate) fn table_drafts<F>(raw: &RawContent, table: Table, build: F) -> Drafts
where
    F: Fn(&Row) -> Result<DraftRecord, String> + Send + 'static,
{
    let source = raw.endpoint.source.clone();
    let origin = raw.endpoint.url.clone();

    Box::new(table.rows.into_iter().map(move |read| match read {
        RowRead::Data(row) => build(&row)
            .map(|record| EntityDraft::new(source.clone(), origin.clone(), row.item, record))
            .map_err(|reason| ExtractError::malformed(origin.clone(), row.item, reason)),
        RowRead::Malformed {
            item,
            found,
            expected,
        } => Err(ExtractError::malformed(
            origin.clone(),
            item,
            format!("expected {} cells, found {}", expected, found),
        )),
    }))
}

/// Join a base URL and a path without doubling slashes.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_registry_covers_every_family() {
        let registry = ExtractorRegistry::standard(&PitwallConfig::default());
        assert_eq!(registry.len(), 7);
        assert_eq!(registry.for_family(EntityFamily::Competitors).len(), 2);
        assert_eq!(registry.for_family(EntityFamily::Teams).len(), 2);
        assert_eq!(registry.for_family(EntityFamily::Events).len(), 2);
        assert_eq!(registry.for_family(EntityFamily::Results).len(), 1);
    }

    #[test]
    fn test_join_url() {
        assert_eq!(
            join_url("https://www.formula1.com/", "/en/results/2024/drivers"),
            "https://www.formula1.com/en/results/2024/drivers"
        );
    }
}
