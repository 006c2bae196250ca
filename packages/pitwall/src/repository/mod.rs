//! Persistent storage of canonical records, aliases and run history.
//!
//! The repository exclusively owns the persisted tables. Every batch is
//! written in one transaction: it commits fully or not at all.

mod sqlite;

pub use sqlite::SqliteRepository;

use async_trait::async_trait;

use crate::error::StorageResult;
use crate::types::alias::CrossSourceAlias;
use crate::types::canonical::{CanonicalEntity, CanonicalKey, KnownEntity};
use crate::types::family::EntityFamily;
use crate::types::run::RunRecord;

/// Records and aliases of one family, committed together.
#[derive(Debug, Clone)]
pub struct PersistBatch {
    pub family: EntityFamily,
    pub records: Vec<CanonicalEntity>,
    pub aliases: Vec<CrossSourceAlias>,
}

impl PersistBatch {
    pub fn new(family: EntityFamily, records: Vec<CanonicalEntity>) -> Self {
        Self {
            family,
            records,
            aliases: Vec::new(),
        }
    }

    pub fn with_aliases(mut self, aliases: Vec<CrossSourceAlias>) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.aliases.is_empty()
    }
}

/// What a committed batch did.
#[derive(Debug, Clone, Default)]
pub struct UpsertReport {
    /// Records inserted or replaced
    pub persisted: usize,
    /// Results whose event, competitor or team did not exist yet; not written
    pub deferred: Vec<CanonicalEntity>,
}

#[async_trait]
pub trait Repository: Send + Sync {
    /// Insert-or-replace every record by canonical key and add new aliases,
    /// in one transaction. Results with unresolved references are returned
    /// in `deferred` instead of being written. An alias whose pair already
    /// maps to another key fails the batch with `StorageError::AliasConflict`.
    async fn upsert(&self, batch: &PersistBatch) -> StorageResult<UpsertReport>;

    /// Store a run in its `running` state.
    async fn begin_run(&self, run: &RunRecord) -> StorageResult<()>;

    /// Finalize a started run. Fails with `AlreadyFinalized` if the run was
    /// finalized before.
    async fn record_run(&self, run: &RunRecord) -> StorageResult<()>;

    async fn get_aliases(&self, family: EntityFamily) -> StorageResult<Vec<CrossSourceAlias>>;

    /// Key and display name of every stored record of `family`.
    async fn known_entities(&self, family: EntityFamily) -> StorageResult<Vec<KnownEntity>>;

    async fn get(
        &self,
        family: EntityFamily,
        key: &CanonicalKey,
    ) -> StorageResult<Option<CanonicalEntity>>;

    async fn count(&self, family: EntityFamily) -> StorageResult<u64>;

    async fn alias_count(&self, family: EntityFamily) -> StorageResult<u64>;

    /// Most recent runs first.
    async fn run_history(
        &self,
        family: Option<EntityFamily>,
        limit: usize,
    ) -> StorageResult<Vec<RunRecord>>;

    /// Mark runs left `running` by a previous process as
    /// `failed:interrupted`. Returns how many were finalized.
    async fn finalize_interrupted_runs(&self) -> StorageResult<usize>;
}
