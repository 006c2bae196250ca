//! Similarity scoring between folded names.

use strsim::jaro_winkler;

use super::fold::match_key;
use crate::types::canonical::CanonicalKey;
use crate::types::family::EntityFamily;

/// Score given when one name abbreviates the other's given name
/// (`"M. Verstappen"` / `"Max Verstappen"`).
pub const INITIALS_SCORE: f64 = 0.95;

/// Score given when one team name is a word prefix of the other
/// (`"Red Bull"` / `"Red Bull Honda RBPT"`).
pub const PREFIX_SCORE: f64 = 0.93;

/// A name that identifies an existing canonical key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Candidate {
    pub key: CanonicalKey,
    /// Folded match key of the name
    pub folded: String,
}

impl Candidate {
    pub fn new(family: EntityFamily, key: CanonicalKey, name: &str) -> Self {
        Self {
            key,
            folded: match_key(family, name),
        }
    }
}

/// Similarity in `[0, 1]` of two folded names.
pub fn similarity(family: EntityFamily, a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    let mut score = jaro_winkler(a, b);
    match family {
        EntityFamily::Competitors => {
            if initials_match(a, b) {
                score = score.max(INITIALS_SCORE);
            }
        }
        EntityFamily::Teams => {
            if word_prefix(a, b) || word_prefix(b, a) {
                score = score.max(PREFIX_SCORE);
            }
        }
        EntityFamily::Events | EntityFamily::Results => {}
    }
    score
}

/// Same surname, and each given name equals or abbreviates the other.
fn initials_match(a: &str, b: &str) -> bool {
    let a: Vec<&str> = a.split_whitespace().collect();
    let b: Vec<&str> = b.split_whitespace().collect();
    if a.len() < 2 || b.len() < 2 || a.last() != b.last() {
        return false;
    }
    let given = |x: &str, y: &str| x == y || (x.len() == 1 && y.starts_with(x)) || (y.len() == 1 && x.starts_with(y));
    given(a[0], b[0])
}

fn word_prefix(short: &str, long: &str) -> bool {
    let short: Vec<&str> = short.split_whitespace().collect();
    let long: Vec<&str> = long.split_whitespace().collect();
    !short.is_empty() && short.len() < long.len() && long.starts_with(&short)
}

/// The confidently matching key for `folded`, if any.
///
/// Confident means the best score reaches `threshold` and no other key
/// reaches the same score. Scores are taken per key (best name wins), so a
/// key with several known names is not ambiguous with itself.
pub fn best_match<'a>(
    family: EntityFamily,
    folded: &str,
    candidates: impl IntoIterator<Item = &'a Candidate>,
    threshold: f64,
) -> Option<(CanonicalKey, f64)> {
    let mut best: Option<(&CanonicalKey, f64)> = None;
    let mut tied = false;

    for candidate in candidates {
        let score = similarity(family, folded, &candidate.folded);
        match best {
            None => best = Some((&candidate.key, score)),
            Some((key, top)) => {
                if score > top {
                    best = Some((&candidate.key, score));
                    tied = false;
                } else if score == top && *key != candidate.key {
                    tied = true;
                }
            }
        }
    }

    match best {
        Some((key, score)) if score >= threshold && !tied => Some((key.clone(), score)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(family: EntityFamily, key: &str, name: &str) -> Candidate {
        Candidate::new(family, CanonicalKey::new(key), name)
    }

    #[test]
    fn test_initials_rule() {
        let c = EntityFamily::Competitors;
        assert!(similarity(c, "m verstappen", "max verstappen") >= INITIALS_SCORE);
        assert!(similarity(c, "j verstappen", "max verstappen") < INITIALS_SCORE);
        assert!(similarity(c, "max", "max verstappen") < INITIALS_SCORE);
    }

    #[test]
    fn test_team_prefix_rule() {
        let t = EntityFamily::Teams;
        assert!(similarity(t, "red bull", "red bull honda rbpt") >= PREFIX_SCORE);
        assert!(similarity(t, "mclaren", "mclaren mercedes") >= PREFIX_SCORE);
        assert!(similarity(t, "mercedes", "mclaren mercedes") < PREFIX_SCORE);
    }

    #[test]
    fn test_best_match_requires_threshold() {
        let family = EntityFamily::Competitors;
        let candidates = vec![
            candidate(family, "max-verstappen", "Max Verstappen"),
            candidate(family, "lewis-hamilton", "Lewis Hamilton"),
        ];

        let (key, _) = best_match(family, "m verstappen", &candidates, 0.92).unwrap();
        assert_eq!(key.as_str(), "max-verstappen");
        assert!(best_match(family, "george russell", &candidates, 0.92).is_none());
    }

    #[test]
    fn test_ambiguous_best_is_not_confident() {
        let family = EntityFamily::Competitors;
        let candidates = vec![
            candidate(family, "jos-verstappen", "Jos Verstappen"),
            candidate(family, "max-verstappen", "Max Verstappen"),
        ];
        // the initial singles out Jos
        let (key, _) = best_match(family, "j verstappen", &candidates, 0.92).unwrap();
        assert_eq!(key.as_str(), "jos-verstappen");

        let same = vec![
            candidate(family, "a", "Max Verstappen"),
            candidate(family, "b", "Max Verstappen"),
        ];
        assert!(best_match(family, "max verstappen", &same, 0.92).is_none());
    }

    #[test]
    fn test_one_key_with_two_names_is_not_ambiguous() {
        let family = EntityFamily::Teams;
        let candidates = vec![
            candidate(family, "red-bull", "Red Bull"),
            candidate(family, "red-bull", "Red Bull Racing"),
        ];
        let (key, score) = best_match(family, "red bull", &candidates, 0.92).unwrap();
        assert_eq!(key.as_str(), "red-bull");
        assert_eq!(score, 1.0);
    }
}
