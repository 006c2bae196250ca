//! Runtime configuration.
//!
//! `PitwallConfig` is built once at startup and handed to each component.
//! Every option has a default; `from_env` overrides them from `PITWALL_*`
//! variables (after loading `.env` if present).

use chrono::{Datelike, NaiveDate, Utc};
use dotenvy::dotenv;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::types::family::{EntityFamily, SourceId};

/// Base URLs per source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUrls {
    pub formula1: String,
    pub wikipedia: String,
}

impl Default for SourceUrls {
    fn default() -> Self {
        Self {
            formula1: "https://www.formula1.com".to_string(),
            wikipedia: "https://en.wikipedia.org".to_string(),
        }
    }
}

/// Network behaviour of the fetcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
    /// Per-request timeout
    pub timeout: Duration,
    /// Extra attempts after the first for transient failures
    pub max_retries: u32,
    /// First backoff delay; doubles per attempt
    pub backoff_base: Duration,
    /// Upper bound on any single backoff delay
    pub backoff_max: Duration,
    /// Minimum gap between two requests to the same host
    pub min_host_interval: Duration,
    /// Concurrent fetches inside one run
    pub workers: usize,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            min_host_interval: Duration::from_millis(1000),
            workers: 2,
            user_agent: format!("pitwall/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Which source wins a field conflict, per field.
///
/// Sources earlier in the list win. Sources not listed rank after every
/// listed one, ordered by id, so the order is total and stable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePriority {
    pub default: Vec<SourceId>,
    pub fields: BTreeMap<String, Vec<SourceId>>,
}

impl SourcePriority {
    pub fn new(default: Vec<SourceId>) -> Self {
        Self {
            default,
            fields: BTreeMap::new(),
        }
    }

    /// Override the order for one field.
    pub fn with_field(mut self, field: &str, order: Vec<SourceId>) -> Self {
        self.fields.insert(field.to_string(), order);
        self
    }

    /// Order used for `field`.
    pub fn order_for(&self, field: &str) -> &[SourceId] {
        self.fields
            .get(field)
            .map(Vec::as_slice)
            .unwrap_or(&self.default)
    }

    /// Rank of `source` for `field`; lower wins.
    pub fn rank(&self, field: &str, source: &SourceId) -> usize {
        let order = self.order_for(field);
        order
            .iter()
            .position(|s| s == source)
            .unwrap_or(order.len())
    }

    /// Defaults per family.
    ///
    /// The official site wins for current and numeric data. Wikipedia wins
    /// for career history and venue details, which the official site either
    /// lacks or drops once an entity leaves the grid.
    pub fn defaults_for(family: EntityFamily) -> Self {
        let official_first = vec![SourceId::formula1(), SourceId::wikipedia()];
        let history_first = vec![SourceId::wikipedia(), SourceId::formula1()];
        match family {
            EntityFamily::Competitors => Self::new(official_first)
                .with_field("championships", history_first.clone())
                .with_field("date_of_birth", history_first.clone())
                .with_field("wins", history_first.clone())
                .with_field("podiums", history_first),
            EntityFamily::Teams => Self::new(official_first)
                .with_field("championships", history_first.clone())
                .with_field("base", history_first.clone())
                .with_field("power_unit", history_first),
            EntityFamily::Events => {
                Self::new(official_first).with_field("circuit", history_first)
            }
            EntityFamily::Results => Self::new(vec![SourceId::formula1()]),
        }
    }
}

/// Per-family scheduling and conflict resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyConfig {
    pub cadence: Duration,
    pub priority: SourcePriority,
}

impl FamilyConfig {
    pub fn defaults_for(family: EntityFamily) -> Self {
        let cadence = match family {
            EntityFamily::Teams | EntityFamily::Competitors => Duration::from_secs(6 * 3600),
            EntityFamily::Events => Duration::from_secs(12 * 3600),
            EntityFamily::Results => Duration::from_secs(3600),
        };
        Self {
            cadence,
            priority: SourcePriority::defaults_for(family),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PitwallConfig {
    pub database_path: PathBuf,
    /// Season to collect; `None` means the current season
    pub season: Option<i32>,
    pub sources: SourceUrls,
    pub fetch: FetchConfig,
    pub families: BTreeMap<EntityFamily, FamilyConfig>,
    /// Minimum similarity for a fuzzy name match to be trusted
    pub fuzzy_threshold: f64,
    /// Extra persist passes for results whose references were missing
    pub deferred_retries: u32,
    /// Wait before each deferred pass, for concurrent runs of the referenced
    /// families to commit
    pub deferred_retry_delay: Duration,
}

impl Default for PitwallConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/pitwall.db"),
            season: None,
            sources: SourceUrls::default(),
            fetch: FetchConfig::default(),
            families: EntityFamily::ALL
                .iter()
                .map(|f| (*f, FamilyConfig::defaults_for(*f)))
                .collect(),
            fuzzy_threshold: 0.92,
            deferred_retries: 2,
            deferred_retry_delay: Duration::from_secs(5),
        }
    }
}

impl PitwallConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (development)
        let _ = dotenv();
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = lookup("PITWALL_DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Some(season) = parse_var::<i32, _>(&lookup, "PITWALL_SEASON")? {
            config.season = Some(season);
        }
        if let Some(url) = lookup("PITWALL_FORMULA1_BASE_URL") {
            config.sources.formula1 = validate_url("PITWALL_FORMULA1_BASE_URL", &url)?;
        }
        if let Some(url) = lookup("PITWALL_WIKIPEDIA_BASE_URL") {
            config.sources.wikipedia = validate_url("PITWALL_WIKIPEDIA_BASE_URL", &url)?;
        }

        if let Some(secs) = parse_var::<u64, _>(&lookup, "PITWALL_FETCH_TIMEOUT_SECS")? {
            config.fetch.timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = parse_var::<u32, _>(&lookup, "PITWALL_FETCH_MAX_RETRIES")? {
            config.fetch.max_retries = retries;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "PITWALL_FETCH_BACKOFF_MS")? {
            config.fetch.backoff_base = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "PITWALL_FETCH_BACKOFF_MAX_MS")? {
            config.fetch.backoff_max = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "PITWALL_RATE_LIMIT_MS")? {
            config.fetch.min_host_interval = Duration::from_millis(ms);
        }
        if let Some(workers) = parse_var::<usize, _>(&lookup, "PITWALL_FETCH_WORKERS")? {
            config.fetch.workers = workers;
        }
        if let Some(agent) = lookup("PITWALL_USER_AGENT") {
            config.fetch.user_agent = agent;
        }
        if let Some(threshold) = parse_var::<f64, _>(&lookup, "PITWALL_FUZZY_THRESHOLD")? {
            config.fuzzy_threshold = threshold;
        }
        if let Some(retries) = parse_var::<u32, _>(&lookup, "PITWALL_DEFERRED_RETRIES")? {
            config.deferred_retries = retries;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "PITWALL_DEFERRED_RETRY_DELAY_MS")? {
            config.deferred_retry_delay = Duration::from_millis(ms);
        }

        for family in EntityFamily::ALL {
            let entry = config
                .families
                .entry(family)
                .or_insert_with(|| FamilyConfig::defaults_for(family));

            let cadence_var = format!("PITWALL_CADENCE_{}_SECS", family.env_token());
            if let Some(secs) = parse_var::<u64, _>(&lookup, &cadence_var)? {
                entry.cadence = Duration::from_secs(secs);
            }

            let priority_var = format!("PITWALL_PRIORITY_{}", family.env_token());
            if let Some(list) = lookup(&priority_var) {
                entry.priority.default = parse_source_list(&priority_var, &list)?;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make a component misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.fuzzy_threshold > 0.0 && self.fuzzy_threshold <= 1.0) {
            return Err(ConfigError::invalid(
                "PITWALL_FUZZY_THRESHOLD",
                self.fuzzy_threshold.to_string(),
                "must be in (0, 1]",
            ));
        }
        if self.fetch.workers == 0 {
            return Err(ConfigError::invalid("PITWALL_FETCH_WORKERS", "0", "must be at least 1"));
        }
        if self.fetch.timeout.is_zero() {
            return Err(ConfigError::invalid("PITWALL_FETCH_TIMEOUT_SECS", "0", "must be positive"));
        }
        if self.fetch.min_host_interval.is_zero() {
            return Err(ConfigError::invalid("PITWALL_RATE_LIMIT_MS", "0", "must be positive"));
        }
        if self.fetch.backoff_max < self.fetch.backoff_base {
            return Err(ConfigError::invalid(
                "PITWALL_FETCH_BACKOFF_MAX_MS",
                self.fetch.backoff_max.as_millis().to_string(),
                "must not be below PITWALL_FETCH_BACKOFF_MS",
            ));
        }
        for (family, family_config) in &self.families {
            if family_config.cadence.is_zero() {
                return Err(ConfigError::invalid(
                    format!("PITWALL_CADENCE_{}_SECS", family.env_token()),
                    "0",
                    "must be positive",
                ));
            }
        }
        Ok(())
    }

    /// The season to collect.
    pub fn season(&self) -> i32 {
        self.season
            .unwrap_or_else(|| current_season(Utc::now().date_naive()))
    }

    pub fn family(&self, family: EntityFamily) -> FamilyConfig {
        self.families
            .get(&family)
            .cloned()
            .unwrap_or_else(|| FamilyConfig::defaults_for(family))
    }

    /// Create the storage directory and check it can be written.
    pub fn prepare_storage(&self) -> Result<(), ConfigError> {
        prepare_parent_dir(&self.database_path)
    }
}

/// Season in progress on `today`.
///
/// Championships start in March, so January and February still belong to
/// the previous season.
pub fn current_season(today: NaiveDate) -> i32 {
    if today.month() < 3 {
        today.year() - 1
    } else {
        today.year()
    }
}

fn parse_var<T, F>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::invalid(var, raw.clone(), e.to_string())),
    }
}

fn validate_url(var: &str, raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    url::Url::parse(trimmed).map_err(|e| ConfigError::invalid(var, raw, e.to_string()))?;
    Ok(trimmed.to_string())
}

fn parse_source_list(var: &str, raw: &str) -> Result<Vec<SourceId>, ConfigError> {
    let sources: Vec<SourceId> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(SourceId::new)
        .collect();

    if sources.is_empty() {
        return Err(ConfigError::invalid(var, raw, "empty source list"));
    }
    if let Some(unknown) = sources.iter().find(|s| !s.is_known()) {
        return Err(ConfigError::UnknownSource(unknown.to_string()));
    }
    Ok(sources)
}

fn prepare_parent_dir(path: &Path) -> Result<(), ConfigError> {
    let storage_err = |source: std::io::Error| ConfigError::StoragePath {
        path: path.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(storage_err)?;
        let metadata = std::fs::metadata(parent).map_err(storage_err)?;
        if metadata.permissions().readonly() {
            return Err(storage_err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "directory is read-only",
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = PitwallConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.database_path, PathBuf::from("data/pitwall.db"));
        assert_eq!(config.fetch.max_retries, 3);
        assert_eq!(config.family(EntityFamily::Results).cadence, Duration::from_secs(3600));
        assert_eq!(config.families.len(), 4);
    }

    #[test]
    fn test_overrides() {
        let config = PitwallConfig::from_lookup(lookup(&[
            ("PITWALL_DATABASE_PATH", "/tmp/x.db"),
            ("PITWALL_SEASON", "2023"),
            ("PITWALL_CADENCE_EVENTS_SECS", "60"),
            ("PITWALL_PRIORITY_TEAMS", "wikipedia, formula1"),
            ("PITWALL_FORMULA1_BASE_URL", "http://localhost:8080/"),
            ("PITWALL_DEFERRED_RETRY_DELAY_MS", "250"),
        ]))
        .unwrap();

        assert_eq!(config.deferred_retry_delay, Duration::from_millis(250));
        assert_eq!(config.season(), 2023);
        assert_eq!(config.family(EntityFamily::Events).cadence, Duration::from_secs(60));
        assert_eq!(
            config.family(EntityFamily::Teams).priority.default,
            vec![SourceId::wikipedia(), SourceId::formula1()]
        );
        assert_eq!(config.sources.formula1, "http://localhost:8080");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(PitwallConfig::from_lookup(lookup(&[("PITWALL_FETCH_WORKERS", "0")])).is_err());
        assert!(PitwallConfig::from_lookup(lookup(&[("PITWALL_FUZZY_THRESHOLD", "1.5")])).is_err());
        assert!(PitwallConfig::from_lookup(lookup(&[("PITWALL_SEASON", "next")])).is_err());
        assert!(matches!(
            PitwallConfig::from_lookup(lookup(&[("PITWALL_PRIORITY_EVENTS", "espn")])),
            Err(ConfigError::UnknownSource(_))
        ));
    }

    #[test]
    fn test_current_season_rolls_over_in_march() {
        let feb = NaiveDate::from_ymd_opt(2025, 2, 28).unwrap();
        let mar = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        assert_eq!(current_season(feb), 2024);
        assert_eq!(current_season(mar), 2025);
    }

    #[test]
    fn test_priority_rank_and_overrides() {
        let priority = SourcePriority::defaults_for(EntityFamily::Competitors);
        assert_eq!(priority.rank("team", &SourceId::formula1()), 0);
        assert_eq!(priority.rank("team", &SourceId::wikipedia()), 1);
        assert_eq!(priority.rank("championships", &SourceId::wikipedia()), 0);
        assert_eq!(priority.rank("team", &SourceId::new("other")), 2);
    }
}
