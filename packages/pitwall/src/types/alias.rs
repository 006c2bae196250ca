//! Cross-source aliases: which canonical key a source's raw name maps to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::canonical::CanonicalKey;
use super::family::{EntityFamily, SourceId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossSourceAlias {
    pub family: EntityFamily,
    pub source: SourceId,
    /// Identifying string exactly as the source wrote it (whitespace collapsed)
    pub raw_name: String,
    pub canonical_key: CanonicalKey,
    pub created_at: DateTime<Utc>,
}

impl CrossSourceAlias {
    pub fn new(
        family: EntityFamily,
        source: SourceId,
        raw_name: impl Into<String>,
        canonical_key: CanonicalKey,
    ) -> Self {
        Self {
            family,
            source,
            raw_name: raw_name.into(),
            canonical_key,
            created_at: Utc::now(),
        }
    }
}

/// In-memory alias lookup for one family.
#[derive(Debug, Clone, Default)]
pub struct AliasSet {
    entries: HashMap<(SourceId, String), CanonicalKey>,
}

impl AliasSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_aliases(aliases: impl IntoIterator<Item = CrossSourceAlias>) -> Self {
        let mut set = Self::new();
        for alias in aliases {
            set.insert(alias.source, alias.raw_name, alias.canonical_key);
        }
        set
    }

    pub fn get(&self, source: &SourceId, raw_name: &str) -> Option<&CanonicalKey> {
        self.entries.get(&(source.clone(), raw_name.to_string()))
    }

    /// Insert a mapping unless the pair is already aliased.
    ///
    /// Returns `true` when the entry is new. An existing mapping is never
    /// replaced.
    pub fn insert(&mut self, source: SourceId, raw_name: String, key: CanonicalKey) -> bool {
        use std::collections::hash_map::Entry;
        match self.entries.entry((source, raw_name)) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(key);
                true
            }
        }
    }

    /// All entries as (source, raw name, key), in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&SourceId, &str, &CanonicalKey)> {
        self.entries
            .iter()
            .map(|((source, raw), key)| (source, raw.as_str(), key))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
