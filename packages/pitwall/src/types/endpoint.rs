//! Source endpoints and the raw content fetched from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::family::{EntityFamily, SourceId};

/// One remote location an extractor reads from.
///
/// Endpoints are immutable once built. Extra context an extractor needs when
/// parsing the response (season, round, event name) travels in `params`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEndpoint {
    pub source: SourceId,
    pub family: EntityFamily,
    /// Fully resolved URL
    pub url: String,
    /// Content type prefix the response must carry (e.g. `text/html`)
    pub expected_content_type: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl SourceEndpoint {
    pub fn new(source: SourceId, family: EntityFamily, url: impl Into<String>) -> Self {
        Self {
            source,
            family,
            url: url.into(),
            expected_content_type: None,
            params: BTreeMap::new(),
        }
    }

    /// Require the response to be HTML.
    pub fn html(mut self) -> Self {
        self.expected_content_type = Some("text/html".to_string());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.expected_content_type = Some(content_type.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(key.into(), value.to_string());
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Parse a numeric parameter.
    pub fn param_as<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.param(key).and_then(|v| v.parse().ok())
    }

    /// Host part of the URL, used as the rate-limit key.
    pub fn host(&self) -> Option<String> {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
    }
}

/// Raw response body for one endpoint, before extraction.
#[derive(Debug, Clone)]
pub struct RawContent {
    pub endpoint: SourceEndpoint,
    pub body: String,
    pub content_type: Option<String>,
    pub status: u16,
    pub fetched_at: DateTime<Utc>,
}

impl RawContent {
    pub fn new(endpoint: SourceEndpoint, body: impl Into<String>) -> Self {
        Self {
            endpoint,
            body: body.into(),
            content_type: None,
            status: 200,
            fetched_at: Utc::now(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn has_content(&self) -> bool {
        !self.body.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_is_lowercased() {
        let ep = SourceEndpoint::new(
            SourceId::formula1(),
            EntityFamily::Competitors,
            "https://WWW.Formula1.com/en/results/2024/drivers",
        );
        assert_eq!(ep.host().as_deref(), Some("www.formula1.com"));
    }

    #[test]
    fn test_params() {
        let ep = SourceEndpoint::new(SourceId::formula1(), EntityFamily::Results, "https://x.test/r")
            .with_param("season", 2024)
            .with_param("round", 5);
        assert_eq!(ep.param_as::<i32>("season"), Some(2024));
        assert_eq!(ep.param_as::<u32>("round"), Some(5));
        assert_eq!(ep.param("event"), None);
    }
}
