//! One family run: Fetch -> Extract -> Normalize -> Persist.
//!
//! ```text
//! seeds ──► fetch (bounded workers) ──► follow-ups ──► fetch ...
//!              │
//!              ▼
//!          extract (blocking pool) ──► normalize ──► upsert ──► deferred retries
//! ```
//!
//! `run_family` never fails: fetch and extraction errors are counted, a
//! storage fault ends the run as `failed:storage`, and cancellation ends it as
//! `failed:cancelled` without committing.

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PitwallConfig;
use crate::error::{FetchResult, StorageError};
use crate::extractors::{Extractor, ExtractorRegistry};
use crate::fetcher::Fetcher;
use crate::normalizer::{IdentityBook, Normalizer, ResolutionContext};
use crate::repository::{PersistBatch, Repository};
use crate::types::alias::AliasSet;
use crate::types::canonical::CanonicalEntity;
use crate::types::draft::EntityDraft;
use crate::types::endpoint::{RawContent, SourceEndpoint};
use crate::types::family::EntityFamily;
use crate::types::run::{RunCounts, RunOutcome, RunRecord, Trigger};

/// Times a batch is normalized again after another writer added
/// conflicting aliases.
const ALIAS_CONFLICT_RETRIES: usize = 2;

/// Families an event result references.
const REFERENCED_FAMILIES: &[EntityFamily] = &[
    EntityFamily::Teams,
    EntityFamily::Competitors,
    EntityFamily::Events,
];

/// A fetched page and the extractor that asked for it.
struct Page {
    extractor: Arc<dyn Extractor>,
    raw: RawContent,
}

pub struct Orchestrator {
    config: PitwallConfig,
    fetcher: Arc<dyn Fetcher>,
    registry: ExtractorRegistry,
    normalizer: Normalizer,
    repo: Arc<dyn Repository>,
}

impl Orchestrator {
    /// Orchestrator with the standard extractors and configured priorities.
    pub fn new(config: PitwallConfig, fetcher: Arc<dyn Fetcher>, repo: Arc<dyn Repository>) -> Self {
        Self {
            registry: ExtractorRegistry::standard(&config),
            normalizer: Normalizer::from_config(&config),
            config,
            fetcher,
            repo,
        }
    }

    pub fn with_registry(mut self, registry: ExtractorRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn config(&self) -> &PitwallConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    /// Run every family once, in dependency order. Stops issuing runs once
    /// `cancel` fires.
    pub async fn run_all(&self, trigger: Trigger, cancel: &CancellationToken) -> Vec<RunRecord> {
        let mut records = Vec::with_capacity(EntityFamily::ALL.len());
        for family in EntityFamily::ALL {
            if cancel.is_cancelled() {
                info!(family = %family, "Shutdown requested; skipping remaining families");
                break;
            }
            records.push(self.run_family(family, trigger, cancel).await);
        }
        records
    }

    /// Run the pipeline for one family and return the finalized record.
    pub async fn run_family(
        &self,
        family: EntityFamily,
        trigger: Trigger,
        cancel: &CancellationToken,
    ) -> RunRecord {
        let mut run = RunRecord::start(family, trigger);
        info!(
            run_id = %run.run_id,
            family = %family,
            trigger = %trigger,
            season = self.config.season(),
            "Run started"
        );

        let mut counts = RunCounts::default();
        let mut storage_failed = false;

        if let Err(e) = self.repo.begin_run(&run).await {
            error!(run_id = %run.run_id, family = %family, error = %e, "Could not record run start");
            storage_failed = true;
        }

        let cancelled = if storage_failed {
            false
        } else {
            match self.pipeline(family, cancel, &mut counts).await {
                Ok(cancelled) => cancelled,
                Err(e) => {
                    error!(run_id = %run.run_id, family = %family, error = %e, "Storage failure; run aborted");
                    counts.errored += 1;
                    storage_failed = true;
                    false
                }
            }
        };

        run.counts = counts;
        let outcome = RunOutcome::decide(&counts, cancelled, storage_failed);
        let run = run.finish(outcome);

        if let Err(e) = self.repo.record_run(&run).await {
            error!(run_id = %run.run_id, family = %family, error = %e, "Could not record run outcome");
        }

        let elapsed_ms = run.duration().map(|d| d.num_milliseconds()).unwrap_or_default();
        if outcome.is_failed() {
            warn!(
                run_id = %run.run_id,
                family = %family,
                outcome = %outcome,
                fetched = counts.fetched,
                extracted = counts.extracted,
                normalized = counts.normalized,
                persisted = counts.persisted,
                errored = counts.errored,
                elapsed_ms,
                "Run finished"
            );
        } else {
            info!(
                run_id = %run.run_id,
                family = %family,
                outcome = %outcome,
                fetched = counts.fetched,
                extracted = counts.extracted,
                normalized = counts.normalized,
                persisted = counts.persisted,
                errored = counts.errored,
                elapsed_ms,
                "Run finished"
            );
        }

        run
    }

    /// Returns whether the run was cancelled before committing.
    async fn pipeline(
        &self,
        family: EntityFamily,
        cancel: &CancellationToken,
        counts: &mut RunCounts,
    ) -> Result<bool, StorageError> {
        let pages = self.fetch_stage(family, cancel, counts).await;
        info!(
            family = %family,
            stage = "fetch",
            fetched = counts.fetched,
            pages = pages.len(),
            errored = counts.errored,
            "Stage complete"
        );
        if cancel.is_cancelled() {
            return Ok(true);
        }

        let drafts = self.extract_stage(family, pages, cancel, counts).await;
        info!(
            family = %family,
            stage = "extract",
            extracted = counts.extracted,
            errored = counts.errored,
            "Stage complete"
        );
        if cancel.is_cancelled() {
            return Ok(true);
        }

        // The books are read outside the write transaction. The store refuses
        // a batch whose new aliases collide with ones committed since, and the
        // drafts are normalized again against the fresh books.
        let mut attempt = 0;
        loop {
            let context = self.resolution_context(family).await?;
            let outcome = self.normalizer.normalize(family, drafts.clone(), &context);
            counts.normalized = outcome.records.len();
            counts.rejected = outcome.rejected.len();
            info!(
                family = %family,
                stage = "normalize",
                normalized = counts.normalized,
                rejected = counts.rejected,
                new_aliases = outcome.new_aliases.len(),
                "Stage complete"
            );
            if cancel.is_cancelled() {
                return Ok(true);
            }

            let batch = PersistBatch::new(family, outcome.records).with_aliases(outcome.new_aliases);
            match self.persist_stage(batch, cancel, counts).await {
                Err(e @ StorageError::AliasConflict { .. }) if attempt < ALIAS_CONFLICT_RETRIES => {
                    attempt += 1;
                    warn!(family = %family, attempt, error = %e, "Aliases changed during the run; normalizing again");
                }
                result => {
                    result?;
                    break;
                }
            }
        }
        counts.errored += counts.rejected;
        info!(
            family = %family,
            stage = "persist",
            persisted = counts.persisted,
            deferred = counts.deferred,
            errored = counts.errored,
            "Stage complete"
        );

        Ok(false)
    }

    /// Fetch seeds, then follow-ups, in waves of at most `workers`
    /// concurrent requests. Each URL is fetched once per run.
    async fn fetch_stage(
        &self,
        family: EntityFamily,
        cancel: &CancellationToken,
        counts: &mut RunCounts,
    ) -> Vec<Page> {
        let season = self.config.season();
        let workers = self.config.fetch.workers.max(1);

        let mut seen = HashSet::new();
        let mut frontier: Vec<(Arc<dyn Extractor>, SourceEndpoint)> = Vec::new();
        for extractor in self.registry.for_family(family) {
            for endpoint in extractor.seeds(season) {
                if seen.insert(endpoint.url.clone()) {
                    frontier.push((extractor.clone(), endpoint));
                }
            }
        }

        let mut pages = Vec::new();
        while !frontier.is_empty() && !cancel.is_cancelled() {
            let wave = std::mem::take(&mut frontier);
            debug!(family = %family, endpoints = wave.len(), workers, "Fetching");

            let fetches: Vec<_> = wave
                .into_iter()
                .map(|(extractor, endpoint)| self.fetch_one(extractor, endpoint, cancel))
                .collect();
            let results: Vec<_> = stream::iter(fetches)
                .buffer_unordered(workers)
                .collect()
                .await;

            for (extractor, result) in results {
                match result {
                    Ok(raw) => {
                        counts.fetched += 1;
                        for next in extractor.follow_ups(&raw) {
                            if seen.insert(next.url.clone()) {
                                frontier.push((extractor.clone(), next));
                            }
                        }
                        if extractor.extracts(&raw.endpoint) {
                            pages.push(Page { extractor, raw });
                        }
                    }
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => {
                        counts.errored += 1;
                        warn!(
                            family = %family,
                            extractor = %extractor.name(),
                            url = %e.url,
                            kind = %e.kind,
                            error = %e,
                            "Fetch failed"
                        );
                    }
                }
            }
        }

        pages.sort_by(|a, b| a.raw.endpoint.url.cmp(&b.raw.endpoint.url));
        pages
    }

    fn fetch_one<'a>(
        &'a self,
        extractor: Arc<dyn Extractor>,
        endpoint: SourceEndpoint,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, (Arc<dyn Extractor>, FetchResult<RawContent>)> {
        async move {
            let result = self.fetcher.fetch(&endpoint, cancel).await;
            (extractor, result)
        }
        .boxed()
    }

    /// Extract every page on the blocking pool, one page at a time.
    async fn extract_stage(
        &self,
        family: EntityFamily,
        pages: Vec<Page>,
        cancel: &CancellationToken,
        counts: &mut RunCounts,
    ) -> Vec<EntityDraft> {
        let mut drafts = Vec::new();

        for Page { extractor, raw } in pages {
            if cancel.is_cancelled() {
                break;
            }
            let token = cancel.clone();
            let name = extractor.name();
            let joined = tokio::task::spawn_blocking(move || {
                let mut found = Vec::new();
                let mut errors = Vec::new();
                for item in extractor.extract(&raw) {
                    if token.is_cancelled() {
                        break;
                    }
                    match item {
                        Ok(draft) => found.push(draft),
                        Err(e) => errors.push(e),
                    }
                }
                (found, errors)
            })
            .await;

            match joined {
                Ok((found, errors)) => {
                    debug!(family = %family, extractor = %name, drafts = found.len(), errors = errors.len(), "Page extracted");
                    for e in &errors {
                        warn!(family = %family, extractor = %name, error = %e, "Extraction error");
                    }
                    counts.extracted += found.len();
                    counts.errored += errors.len();
                    drafts.extend(found);
                }
                Err(e) => {
                    counts.errored += 1;
                    error!(family = %family, extractor = %name, error = %e, "Extraction task failed");
                }
            }
        }

        drafts
    }

    /// Load the alias and known-entity books `family` resolves against.
    async fn resolution_context(&self, family: EntityFamily) -> Result<ResolutionContext, StorageError> {
        let mut context = ResolutionContext::new();
        for &required in ResolutionContext::required_families(family) {
            let aliases = AliasSet::from_aliases(self.repo.get_aliases(required).await?);
            let known = self.repo.known_entities(required).await?;
            context = context.with_book(required, IdentityBook::new(aliases, known));
        }
        Ok(context)
    }

    /// Commit the batch, then retry deferred results in their own
    /// transactions. Results still unresolved afterwards count as errors.
    ///
    /// A retry pass waits `deferred_retry_delay` and only writes when one of
    /// the referenced families gained rows since the previous attempt, which
    /// happens when their runs overlap with this one.
    async fn persist_stage(
        &self,
        batch: PersistBatch,
        cancel: &CancellationToken,
        counts: &mut RunCounts,
    ) -> Result<(), StorageError> {
        let family = batch.family;
        let report = self.repo.upsert(&batch).await?;
        counts.persisted += report.persisted;
        counts.deferred = report.deferred.len();

        let mut pending: Vec<CanonicalEntity> = report.deferred;
        if !pending.is_empty() {
            let mut seen = self.referenced_counts().await?;
            let mut pass = 0;
            while !pending.is_empty() && pass < self.config.deferred_retries {
                pass += 1;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.deferred_retry_delay) => {}
                }

                let current = self.referenced_counts().await?;
                if current == seen {
                    debug!(family = %family, pass, pending = pending.len(), "Referenced families unchanged; pass skipped");
                    continue;
                }
                seen = current;

                debug!(family = %family, pass, pending = pending.len(), "Retrying deferred records");
                let report = self.repo.upsert(&PersistBatch::new(family, pending)).await?;
                counts.persisted += report.persisted;
                pending = report.deferred;
            }
        }

        for record in &pending {
            warn!(family = %family, key = %record.key(), "Record left unresolved after retries");
        }
        counts.errored += pending.len();
        Ok(())
    }

    /// Row counts of the families a deferred result can be waiting for.
    async fn referenced_counts(&self) -> Result<Vec<u64>, StorageError> {
        let mut counts = Vec::with_capacity(REFERENCED_FAMILIES.len());
        for &family in REFERENCED_FAMILIES {
            counts.push(self.repo.count(family).await?);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FetchError, StorageResult};
    use crate::extractors::{formula1, wikipedia};
    use crate::repository::SqliteRepository;
    use crate::testing::{fixtures, MockFetcher};
    use crate::types::alias::CrossSourceAlias;
    use crate::types::canonical::{CanonicalKey, Competitor, Event, KnownEntity, Team};
    use crate::types::family::SourceId;
    use crate::types::run::FailureReason;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const F1: &str = "https://www.formula1.com";
    const WIKI: &str = "https://en.wikipedia.org";

    fn config() -> PitwallConfig {
        PitwallConfig {
            season: Some(2024),
            deferred_retry_delay: Duration::from_millis(10),
            ..PitwallConfig::default()
        }
    }

    async fn setup(fetcher: MockFetcher, registry: ExtractorRegistry) -> (Orchestrator, Arc<SqliteRepository>) {
        let repo = Arc::new(SqliteRepository::in_memory().await.unwrap());
        let orchestrator = Orchestrator::new(config(), Arc::new(fetcher), repo.clone()).with_registry(registry);
        (orchestrator, repo)
    }

    fn team_pages() -> MockFetcher {
        MockFetcher::new()
            .with_page(
                format!("{}/en/results/2024/team", F1),
                fixtures::f1_team_standings(&[
                    ("1", "McLaren Mercedes", "666"),
                    ("2", "Ferrari", "652"),
                    ("3", "Red Bull Racing Honda RBPT", "589"),
                ]),
            )
            .with_page(
                format!("{}/wiki/List_of_Formula_One_constructors", WIKI),
                fixtures::wikipedia_constructors(&[
                    ("McLaren", "Mercedes", "United Kingdom", "Woking, United Kingdom", "9"),
                    ("Ferrari", "Ferrari", "Italy", "Maranello, Italy", "16"),
                    ("Red Bull Racing", "Honda RBPT", "Austria", "Milton Keynes, United Kingdom", "6"),
                ]),
            )
    }

    fn team_registry() -> ExtractorRegistry {
        ExtractorRegistry::new()
            .with(formula1::TeamStandings::new(F1))
            .with(wikipedia::ConstructorList::new(WIKI))
    }

    #[tokio::test]
    async fn test_teams_run_merges_sources() {
        let (orchestrator, repo) = setup(team_pages(), team_registry()).await;
        let cancel = CancellationToken::new();

        let run = orchestrator.run_family(EntityFamily::Teams, Trigger::Manual, &cancel).await;

        assert_eq!(run.outcome, RunOutcome::Success);
        assert_eq!(run.counts.fetched, 2);
        assert_eq!(run.counts.extracted, 6);
        assert_eq!(run.counts.normalized, 3);
        assert_eq!(run.counts.persisted, 3);
        assert_eq!(repo.count(EntityFamily::Teams).await.unwrap(), 3);

        let history = repo.run_history(Some(EntityFamily::Teams), 5).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].run_id, run.run_id);
        assert_eq!(history[0].outcome, RunOutcome::Success);
    }

    enum Interference {
        /// Every batch carries one record of the wrong family at the end, so
        /// the transaction fails after the family's own rows were written.
        WrongFamilyRecord,
        /// Before the first batch, another writer maps formula1's "Ferrari"
        /// to a key of its own.
        ConcurrentAlias,
        /// Right after the first batch commits, an overlapping competitors
        /// run stores Max Verstappen.
        LateCompetitor,
    }

    struct InterferingRepository {
        inner: Arc<SqliteRepository>,
        interference: Interference,
        upserts: AtomicUsize,
    }

    impl InterferingRepository {
        fn new(inner: Arc<SqliteRepository>, interference: Interference) -> Self {
            Self {
                inner,
                interference,
                upserts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl Repository for InterferingRepository {
        async fn upsert(&self, batch: &PersistBatch) -> StorageResult<crate::repository::UpsertReport> {
            let first = self.upserts.fetch_add(1, Ordering::SeqCst) == 0;
            match self.interference {
                Interference::WrongFamilyRecord => {
                    let mut batch = batch.clone();
                    batch.records.push(CanonicalEntity::Event(Event {
                        key: CanonicalKey::for_event(2024, 1),
                        name: "Bahrain Grand Prix".into(),
                        season: 2024,
                        round: 1,
                        circuit: None,
                        country: None,
                        date: None,
                        laps: None,
                        sources: vec![],
                    }));
                    self.inner.upsert(&batch).await
                }
                Interference::ConcurrentAlias => {
                    if first {
                        let key = CanonicalKey::new("scuderia-ferrari");
                        let other = PersistBatch::new(
                            EntityFamily::Teams,
                            vec![CanonicalEntity::Team(Team {
                                key: key.clone(),
                                name: "Ferrari".into(),
                                nationality: None,
                                base: None,
                                power_unit: None,
                                points: None,
                                standing: None,
                                wins: None,
                                championships: None,
                                sources: vec![SourceId::formula1()],
                            })],
                        )
                        .with_aliases(vec![CrossSourceAlias::new(
                            EntityFamily::Teams,
                            SourceId::formula1(),
                            "Ferrari",
                            key,
                        )]);
                        self.inner.upsert(&other).await?;
                    }
                    self.inner.upsert(batch).await
                }
                Interference::LateCompetitor => {
                    let report = self.inner.upsert(batch).await?;
                    if first {
                        let competitor = CanonicalEntity::Competitor(Competitor {
                            key: CanonicalKey::new("max-verstappen"),
                            name: "Max Verstappen".into(),
                            code: Some("VER".into()),
                            nationality: None,
                            date_of_birth: None,
                            number: Some(1),
                            team_name: None,
                            team_key: None,
                            points: None,
                            standing: None,
                            wins: None,
                            podiums: None,
                            championships: None,
                            sources: vec![SourceId::formula1()],
                        });
                        self.inner
                            .upsert(&PersistBatch::new(EntityFamily::Competitors, vec![competitor]))
                            .await?;
                    }
                    Ok(report)
                }
            }
        }

        async fn begin_run(&self, run: &RunRecord) -> StorageResult<()> {
            self.inner.begin_run(run).await
        }

        async fn record_run(&self, run: &RunRecord) -> StorageResult<()> {
            self.inner.record_run(run).await
        }

        async fn get_aliases(&self, family: EntityFamily) -> StorageResult<Vec<CrossSourceAlias>> {
            self.inner.get_aliases(family).await
        }

        async fn known_entities(&self, family: EntityFamily) -> StorageResult<Vec<KnownEntity>> {
            self.inner.known_entities(family).await
        }

        async fn get(&self, family: EntityFamily, key: &CanonicalKey) -> StorageResult<Option<CanonicalEntity>> {
            self.inner.get(family, key).await
        }

        async fn count(&self, family: EntityFamily) -> StorageResult<u64> {
            self.inner.count(family).await
        }

        async fn alias_count(&self, family: EntityFamily) -> StorageResult<u64> {
            self.inner.alias_count(family).await
        }

        async fn run_history(&self, family: Option<EntityFamily>, limit: usize) -> StorageResult<Vec<RunRecord>> {
            self.inner.run_history(family, limit).await
        }

        async fn finalize_interrupted_runs(&self) -> StorageResult<usize> {
            self.inner.finalize_interrupted_runs().await
        }
    }

    #[tokio::test]
    async fn test_storage_fault_rolls_back_whole_batch() {
        let (orchestrator, repo) = setup(team_pages(), team_registry()).await;
        let cancel = CancellationToken::new();
        orchestrator.run_family(EntityFamily::Teams, Trigger::Manual, &cancel).await;
        let aliases = repo.alias_count(EntityFamily::Teams).await.unwrap();

        // a fourth team that would be written before the fault
        let fetcher = team_pages().with_page(
            format!("{}/en/results/2024/team", F1),
            fixtures::f1_team_standings(&[
                ("1", "McLaren Mercedes", "666"),
                ("2", "Ferrari", "652"),
                ("3", "Red Bull Racing Honda RBPT", "589"),
                ("4", "Kick Sauber Ferrari", "4"),
            ]),
        );
        let faulty = Orchestrator::new(
            config(),
            Arc::new(fetcher),
            Arc::new(InterferingRepository::new(repo.clone(), Interference::WrongFamilyRecord)),
        )
        .with_registry(team_registry());

        let run = faulty.run_family(EntityFamily::Teams, Trigger::Manual, &cancel).await;

        assert_eq!(run.outcome, RunOutcome::Failed(FailureReason::Storage));
        assert_eq!(run.counts.persisted, 0);
        assert!(run.counts.errored >= 1);
        assert_eq!(repo.count(EntityFamily::Teams).await.unwrap(), 3);
        assert_eq!(repo.alias_count(EntityFamily::Teams).await.unwrap(), aliases);
        assert_eq!(repo.count(EntityFamily::Events).await.unwrap(), 0);

        let history = repo.run_history(Some(EntityFamily::Teams), 5).await.unwrap();
        assert_eq!(history[0].run_id, run.run_id);
        assert_eq!(history[0].outcome, RunOutcome::Failed(FailureReason::Storage));
    }

    #[tokio::test]
    async fn test_concurrent_alias_write_is_picked_up() {
        let repo = Arc::new(SqliteRepository::in_memory().await.unwrap());
        let orchestrator = Orchestrator::new(
            config(),
            Arc::new(team_pages()),
            Arc::new(InterferingRepository::new(repo.clone(), Interference::ConcurrentAlias)),
        )
        .with_registry(team_registry());

        let run = orchestrator
            .run_family(EntityFamily::Teams, Trigger::Manual, &CancellationToken::new())
            .await;

        assert_eq!(run.outcome, RunOutcome::Success);
        assert_eq!(repo.count(EntityFamily::Teams).await.unwrap(), 3);
        assert!(repo
            .get(EntityFamily::Teams, &CanonicalKey::new("ferrari"))
            .await
            .unwrap()
            .is_none());
        match repo
            .get(EntityFamily::Teams, &CanonicalKey::new("scuderia-ferrari"))
            .await
            .unwrap()
        {
            Some(CanonicalEntity::Team(team)) => {
                assert_eq!(team.sources, vec![SourceId::formula1(), SourceId::wikipedia()]);
            }
            other => panic!("expected the concurrently minted team, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_can_be_spawned() {
        let (orchestrator, repo) = setup(team_pages(), team_registry()).await;
        let orchestrator = Arc::new(orchestrator);

        let handle = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move {
                orchestrator
                    .run_family(EntityFamily::Teams, Trigger::Cadence, &CancellationToken::new())
                    .await
            }
        });

        assert_eq!(handle.await.unwrap().outcome, RunOutcome::Success);
        assert_eq!(repo.count(EntityFamily::Teams).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_second_run_adds_no_rows() {
        let (orchestrator, repo) = setup(team_pages(), team_registry()).await;
        let cancel = CancellationToken::new();

        orchestrator.run_family(EntityFamily::Teams, Trigger::Manual, &cancel).await;
        let aliases = repo.alias_count(EntityFamily::Teams).await.unwrap();
        let second = orchestrator.run_family(EntityFamily::Teams, Trigger::Manual, &cancel).await;

        assert_eq!(second.outcome, RunOutcome::Success);
        assert_eq!(repo.count(EntityFamily::Teams).await.unwrap(), 3);
        assert_eq!(repo.alias_count(EntityFamily::Teams).await.unwrap(), aliases);
    }

    #[tokio::test]
    async fn test_fetch_failure_makes_run_partial() {
        let fetcher = team_pages().with_failure(
            format!("{}/wiki/List_of_Formula_One_constructors", WIKI),
            FetchError::status(format!("{}/wiki/List_of_Formula_One_constructors", WIKI), 404),
        );
        let (orchestrator, repo) = setup(fetcher, team_registry()).await;

        let run = orchestrator
            .run_family(EntityFamily::Teams, Trigger::Manual, &CancellationToken::new())
            .await;

        assert_eq!(run.outcome, RunOutcome::Partial);
        assert_eq!(run.counts.errored, 1);
        assert_eq!(repo.count(EntityFamily::Teams).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_nothing_fetched_is_failed() {
        let (orchestrator, repo) = setup(MockFetcher::new(), team_registry()).await;

        let run = orchestrator
            .run_family(EntityFamily::Teams, Trigger::Cadence, &CancellationToken::new())
            .await;

        assert_eq!(run.outcome, RunOutcome::Failed(FailureReason::NoProgress));
        assert_eq!(run.counts.errored, 2);
        assert_eq!(repo.count(EntityFamily::Teams).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_run_commits_nothing() {
        let fetcher = team_pages().with_delay(Duration::from_secs(30));
        let (orchestrator, repo) = setup(fetcher, team_registry()).await;
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let run = orchestrator.run_family(EntityFamily::Teams, Trigger::Manual, &cancel).await;

        assert_eq!(run.outcome, RunOutcome::Failed(FailureReason::Cancelled));
        assert_eq!(run.counts.errored, 0);
        assert_eq!(repo.count(EntityFamily::Teams).await.unwrap(), 0);

        let history = repo.run_history(None, 5).await.unwrap();
        assert_eq!(history[0].outcome, RunOutcome::Failed(FailureReason::Cancelled));
    }

    #[tokio::test]
    async fn test_results_follow_race_links() {
        let fetcher = MockFetcher::new()
            .with_page(
                format!("{}/en/results/2024/races", F1),
                fixtures::f1_races_index(&[
                    ("Bahrain", "/en/results/2024/races/1229/bahrain/race-result", "02 Mar 2024"),
                    ("Saudi Arabia", "/en/results/2024/races/1230/saudi-arabia/race-result", "09 Mar 2024"),
                ]),
            )
            .with_page(
                format!("{}/en/results/2024/races/1229/bahrain/race-result", F1),
                fixtures::f1_race_result(&[
                    ("1", "1", "Max Verstappen VER", "Red Bull Racing Honda RBPT", "57", "1:31:44.742", "26"),
                    ("2", "11", "Sergio Perez PER", "Red Bull Racing Honda RBPT", "57", "+22.457s", "18"),
                ]),
            )
            .with_page(
                format!("{}/en/results/2024/races/1230/saudi-arabia/race-result", F1),
                fixtures::f1_race_result(&[(
                    "1", "1", "Max Verstappen VER", "Red Bull Racing Honda RBPT", "50", "1:20:43.273", "25",
                )]),
            );
        let registry = ExtractorRegistry::new()
            .with(formula1::RaceCalendar::new(F1))
            .with(formula1::DriverStandings::new(F1))
            .with(formula1::RaceResults::new(F1));
        let fetcher_handle = fetcher.clone();
        let (orchestrator, repo) = setup(fetcher, registry).await;
        let cancel = CancellationToken::new();

        let events = orchestrator.run_family(EntityFamily::Events, Trigger::Manual, &cancel).await;
        assert_eq!(events.outcome, RunOutcome::Success);
        assert_eq!(repo.count(EntityFamily::Events).await.unwrap(), 2);

        fetcher_handle.set_page(
            format!("{}/en/results/2024/drivers", F1),
            fixtures::f1_driver_standings(&[
                ("1", "Max Verstappen VER", "NED", "Red Bull Racing Honda RBPT", "51"),
                ("2", "Sergio Perez PER", "MEX", "Red Bull Racing Honda RBPT", "18"),
            ]),
        );
        let drivers = orchestrator.run_family(EntityFamily::Competitors, Trigger::Manual, &cancel).await;
        assert_eq!(drivers.outcome, RunOutcome::Success);

        let results = orchestrator.run_family(EntityFamily::Results, Trigger::Manual, &cancel).await;
        assert_eq!(results.outcome, RunOutcome::Success);
        assert_eq!(results.counts.fetched, 3);
        assert_eq!(results.counts.persisted, 3);

        let bahrain_win = repo
            .get(EntityFamily::Results, &CanonicalKey::new("2024-01/max-verstappen"))
            .await
            .unwrap();
        assert!(matches!(bahrain_win, Some(CanonicalEntity::Result(r)) if r.position == Some(1)));
    }

    #[tokio::test]
    async fn test_results_without_competitors_are_deferred_then_errored() {
        let fetcher = MockFetcher::new()
            .with_page(
                format!("{}/en/results/2024/races", F1),
                fixtures::f1_races_index(&[(
                    "Bahrain",
                    "/en/results/2024/races/1229/bahrain/race-result",
                    "02 Mar 2024",
                )]),
            )
            .with_page(
                format!("{}/en/results/2024/races/1229/bahrain/race-result", F1),
                fixtures::f1_race_result(&[(
                    "1", "1", "Max Verstappen VER", "Red Bull Racing Honda RBPT", "57", "1:31:44.742", "26",
                )]),
            );
        let registry = ExtractorRegistry::new()
            .with(formula1::RaceCalendar::new(F1))
            .with(formula1::RaceResults::new(F1));
        let (orchestrator, repo) = setup(fetcher, registry).await;
        let cancel = CancellationToken::new();

        orchestrator.run_family(EntityFamily::Events, Trigger::Manual, &cancel).await;
        let run = orchestrator.run_family(EntityFamily::Results, Trigger::Manual, &cancel).await;

        assert_eq!(run.counts.deferred, 1);
        assert_eq!(run.counts.errored, 1);
        assert_eq!(run.outcome, RunOutcome::Failed(FailureReason::NoProgress));
        assert_eq!(repo.count(EntityFamily::Results).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_deferred_result_persists_once_competitor_arrives() {
        let fetcher = MockFetcher::new()
            .with_page(
                format!("{}/en/results/2024/races", F1),
                fixtures::f1_races_index(&[(
                    "Bahrain",
                    "/en/results/2024/races/1229/bahrain/race-result",
                    "02 Mar 2024",
                )]),
            )
            .with_page(
                format!("{}/en/results/2024/races/1229/bahrain/race-result", F1),
                fixtures::f1_race_result(&[(
                    "1", "1", "Max Verstappen VER", "Red Bull Racing Honda RBPT", "57", "1:31:44.742", "26",
                )]),
            );
        let registry = ExtractorRegistry::new()
            .with(formula1::RaceCalendar::new(F1))
            .with(formula1::RaceResults::new(F1));
        let (events, repo) = setup(fetcher.clone(), registry.clone()).await;
        let cancel = CancellationToken::new();
        events.run_family(EntityFamily::Events, Trigger::Manual, &cancel).await;

        let results = Orchestrator::new(
            config(),
            Arc::new(fetcher),
            Arc::new(InterferingRepository::new(repo.clone(), Interference::LateCompetitor)),
        )
        .with_registry(registry);
        let run = results.run_family(EntityFamily::Results, Trigger::Manual, &cancel).await;

        assert_eq!(run.counts.deferred, 1);
        assert_eq!(run.counts.persisted, 1);
        assert_eq!(run.counts.errored, 0);
        assert_eq!(run.outcome, RunOutcome::Success);
        assert_eq!(repo.count(EntityFamily::Results).await.unwrap(), 1);
    }
}
