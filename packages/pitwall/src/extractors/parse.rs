//! Cell value parsing shared by the extractors.

use chrono::NaiveDate;
use regex::Regex;
use std::sync::LazyLock;

static RE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("number pattern"));
static RE_LEADING_INT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+)").expect("leading int pattern"));

/// Highest finishing position considered plausible.
pub const MAX_POSITION: u32 = 30;

/// A classification cell: a finishing position or a status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Position(u32),
    /// `NC`, `DQ`, `DNF`, `DNS`, `EX`, `Ret`, ...
    Status(String),
}

pub fn parse_classification(text: &str) -> Option<Classification> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(pos) = text.trim_end_matches('.').parse::<u32>() {
        return (1..=MAX_POSITION)
            .contains(&pos)
            .then_some(Classification::Position(pos));
    }
    let is_code = text.len() <= 4 && text.chars().all(|c| c.is_ascii_alphabetic());
    is_code.then(|| Classification::Status(text.to_ascii_uppercase()))
}

/// Points are decimals on official pages (half points for shortened races).
pub fn parse_points(text: &str) -> Option<f64> {
    RE_NUMBER
        .find(text)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|p| p.is_finite() && *p >= 0.0)
}

/// Leading integer of a cell, e.g. `"4\n2021–2024"` -> 4.
pub fn parse_leading_u32(text: &str) -> Option<u32> {
    RE_LEADING_INT
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

const DATE_FORMATS: &[&str] = &[
    "%d %b %Y",
    "%d %B %Y",
    "%Y-%m-%d",
    "%d/%m/%Y",
    "%b %d %Y",
    "%B %d %Y",
];

/// Parse the date formats seen on source pages. Commas and a leading weekday
/// are ignored.
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let cleaned = text.replace(',', " ");
    let tokens: Vec<&str> = cleaned.split_whitespace().collect();
    if tokens.is_empty() {
        return None;
    }

    // Wikipedia sometimes prefixes a sortable ISO date; try each window of
    // up to three tokens.
    for start in 0..tokens.len() {
        for len in (1..=3).rev() {
            if start + len > tokens.len() {
                continue;
            }
            let candidate = tokens[start..start + len].join(" ");
            for format in DATE_FORMATS {
                if let Ok(date) = NaiveDate::parse_from_str(&candidate, format) {
                    return Some(date);
                }
            }
        }
    }
    None
}
