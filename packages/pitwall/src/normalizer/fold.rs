//! Name folding for identity comparison.
//!
//! Folding is for matching only; stored display names keep the merged,
//! unfolded value.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::types::family::EntityFamily;

const HONORIFICS: &[&str] = &["sir", "mr", "dr"];

/// Trailing words that distinguish a team's entry name from the team itself,
/// longest first.
const TEAM_SUFFIXES: &[&[&str]] = &[
    &["formula", "one", "team"],
    &["formula", "1", "team"],
    &["f1", "team"],
    &["racing"],
    &["f1"],
    &["team"],
];

/// Case, diacritics, punctuation and whitespace folding.
///
/// `"Sergio  Pérez"` and `"sergio perez"` fold to the same string.
pub fn fold(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.nfd().filter(|c| !is_combining_mark(*c)) {
        match c {
            'ø' | 'Ø' => out.push('o'),
            'ß' => out.push_str("ss"),
            'æ' | 'Æ' => out.push_str("ae"),
            'ł' | 'Ł' => out.push('l'),
            'đ' | 'Đ' => out.push('d'),
            c if c.is_alphanumeric() => out.extend(c.to_lowercase()),
            // apostrophes join ("D'Ambrosio"), other punctuation separates
            '\'' | '’' => {}
            _ => out.push(' '),
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Folded form used when comparing names within `family`.
pub fn match_key(family: EntityFamily, name: &str) -> String {
    let folded = fold(name);
    let mut tokens: Vec<&str> = folded.split_whitespace().collect();
    match family {
        EntityFamily::Competitors => {
            while tokens.len() > 1 && HONORIFICS.contains(&tokens[0]) {
                tokens.remove(0);
            }
        }
        EntityFamily::Teams => {
            let mut stripped = true;
            while stripped {
                stripped = false;
                for suffix in TEAM_SUFFIXES {
                    if tokens.len() > suffix.len() && tokens.ends_with(suffix) {
                        tokens.truncate(tokens.len() - suffix.len());
                        stripped = true;
                        break;
                    }
                }
            }
        }
        EntityFamily::Events | EntityFamily::Results => {}
    }
    tokens.join(" ")
}

/// URL-safe key derived from a name: folded tokens joined by `-`.
pub fn slug(family: EntityFamily, name: &str) -> String {
    let key = match_key(family, name).replace(' ', "-");
    if key.is_empty() {
        family.as_str().trim_end_matches('s').to_string()
    } else {
        key
    }
}
