//! Identity resolution for one family within one normalization pass.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use super::fold::{match_key, slug};
use super::fuzzy::{best_match, Candidate};
use super::IdentityBook;
use crate::types::alias::{AliasSet, CrossSourceAlias};
use crate::types::canonical::CanonicalKey;
use crate::types::family::{EntityFamily, SourceId};

/// Resolves (source, raw name) pairs to canonical keys: alias first, then a
/// confident fuzzy match, then a freshly minted key.
///
/// Two different raw names from one source within a pass are two entities:
/// fuzzy matching skips keys the same source has already claimed in this
/// pass (`"Nelson Piquet"` / `"Nelson Piquet Jr."` on one list page).
pub(crate) struct Resolver {
    family: EntityFamily,
    threshold: f64,
    aliases: AliasSet,
    candidates: Vec<Candidate>,
    taken: BTreeSet<CanonicalKey>,
    /// Keys each source has resolved to during this pass
    claimed: BTreeMap<SourceId, BTreeSet<CanonicalKey>>,
    new_aliases: Vec<CrossSourceAlias>,
}

impl Resolver {
    pub fn new(family: EntityFamily, book: Option<&IdentityBook>, threshold: f64) -> Self {
        let mut resolver = Self {
            family,
            threshold,
            aliases: AliasSet::new(),
            candidates: Vec::new(),
            taken: BTreeSet::new(),
            claimed: BTreeMap::new(),
            new_aliases: Vec::new(),
        };

        if let Some(book) = book {
            resolver.aliases = book.aliases.clone();
            for known in &book.known {
                resolver.remember(&known.key, &known.name);
            }
            for (_, raw, key) in book.aliases.iter() {
                resolver.remember(key, raw);
            }
        }
        resolver
    }

    /// Resolve, minting a key if nothing matches, and record an alias for a
    /// pair seen for the first time.
    pub fn resolve(&mut self, source: &SourceId, raw: &str) -> CanonicalKey {
        let key = match self.lookup(source, raw) {
            Some(key) => key,
            None => self.mint(raw),
        };

        if self
            .aliases
            .insert(source.clone(), raw.to_string(), key.clone())
        {
            self.new_aliases.push(CrossSourceAlias::new(
                self.family,
                source.clone(),
                raw,
                key.clone(),
            ));
        }
        self.remember(&key, raw);
        self.claimed
            .entry(source.clone())
            .or_default()
            .insert(key.clone());
        key
    }

    /// Resolve without minting or recording anything.
    pub fn lookup(&self, source: &SourceId, raw: &str) -> Option<CanonicalKey> {
        if let Some(key) = self.aliases.get(source, raw) {
            return Some(key.clone());
        }

        // an exact alias hit was handled above, so a key this source already
        // claimed belongs to a different raw name
        let claimed = self.claimed.get(source);
        let candidates = self
            .candidates
            .iter()
            .filter(|c| claimed.map_or(true, |keys| !keys.contains(&c.key)));

        let folded = match_key(self.family, raw);
        let (key, score) = best_match(self.family, &folded, candidates, self.threshold)?;
        debug!(
            family = %self.family,
            source = %source,
            raw = %raw,
            key = %key,
            score = score,
            "Fuzzy match"
        );
        Some(key)
    }

    /// Key a lookup would mint for `raw`, without reserving it.
    pub fn provisional_key(&self, raw: &str) -> CanonicalKey {
        CanonicalKey::new(slug(self.family, raw))
    }

    pub fn into_new_aliases(self) -> Vec<CrossSourceAlias> {
        self.new_aliases
    }

    fn mint(&mut self, raw: &str) -> CanonicalKey {
        let base = slug(self.family, raw);
        let mut key = CanonicalKey::new(base.clone());
        let mut n = 2;
        while self.taken.contains(&key) {
            key = CanonicalKey::new(format!("{}-{}", base, n));
            n += 1;
        }
        debug!(family = %self.family, raw = %raw, key = %key, "Minted canonical key");
        self.taken.insert(key.clone());
        key
    }

    fn remember(&mut self, key: &CanonicalKey, name: &str) {
        self.taken.insert(key.clone());
        let candidate = Candidate::new(self.family, key.clone(), name);
        if !candidate.folded.is_empty() && !self.candidates.contains(&candidate) {
            self.candidates.push(candidate);
        }
    }
}
