//! Typed errors for the collection pipeline.
//!
//! Item-level errors (`ExtractError`, `ValidationError`) are absorbed by the
//! stage that raises them and only show up as counts. `StorageError` aborts the
//! current run. `ConfigError` is the only process-fatal class.

use std::fmt;
use thiserror::Error;

use crate::types::canonical::CanonicalKey;
use crate::types::family::{EntityFamily, SourceId};

/// Broad category of a fetch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// Request exceeded the configured timeout
    Timeout,
    /// Server answered with a non-success status
    HttpStatus(u16),
    /// Transport failure: DNS, connect, reset, body read
    Network,
    /// Response did not carry the expected content type
    ContentType,
    /// Shutdown aborted the request
    Cancelled,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchErrorKind::Timeout => f.write_str("timeout"),
            FetchErrorKind::HttpStatus(code) => write!(f, "HTTP {}", code),
            FetchErrorKind::Network => f.write_str("network error"),
            FetchErrorKind::ContentType => f.write_str("unexpected content type"),
            FetchErrorKind::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// A failed fetch, after any retries the fetcher chose to make.
#[derive(Debug, Clone, Error)]
#[error("{kind} fetching {url}: {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    /// Whether another attempt could plausibly succeed
    pub retriable: bool,
    pub url: String,
    pub message: String,
}

impl FetchError {
    pub fn new(
        kind: FetchErrorKind,
        retriable: bool,
        url: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            retriable,
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn timeout(url: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Timeout, true, url, "request timed out")
    }

    pub fn cancelled(url: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Cancelled, false, url, "shutdown requested")
    }

    /// Classify an HTTP status: 5xx and 429 are transient, other 4xx are not.
    pub fn status(url: impl Into<String>, status: u16) -> Self {
        let retriable = status == 429 || (500..600).contains(&status);
        Self::new(
            FetchErrorKind::HttpStatus(status),
            retriable,
            url,
            format!("server returned {}", status),
        )
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == FetchErrorKind::Cancelled
    }
}

/// A single item (or page) an extractor could not turn into a draft.
#[derive(Debug, Clone, Error)]
pub enum ExtractError {
    #[error("malformed item {item} in {origin}: {reason}")]
    MalformedItem {
        origin: String,
        item: usize,
        reason: String,
    },

    #[error("no {what} found in {origin}")]
    MissingStructure { origin: String, what: String },
}

impl ExtractError {
    pub fn malformed(origin: impl Into<String>, item: usize, reason: impl Into<String>) -> Self {
        ExtractError::MalformedItem {
            origin: origin.into(),
            item,
            reason: reason.into(),
        }
    }

    pub fn missing(origin: impl Into<String>, what: impl Into<String>) -> Self {
        ExtractError::MissingStructure {
            origin: origin.into(),
            what: what.into(),
        }
    }
}

/// Why a draft was rejected by the normalizer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{family} draft from {source_id} is missing required field `{field}`")]
    MissingField {
        family: EntityFamily,
        source_id: SourceId,
        field: &'static str,
    },

    #[error("{family} draft from {source_id} was handed to the {expected} normalizer")]
    WrongFamily {
        family: EntityFamily,
        expected: EntityFamily,
        source_id: SourceId,
    },
}

/// Storage-layer faults. Any of these aborts the current batch.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt stored value: {0}")]
    Corrupt(String),

    /// The batch was normalized against aliases another writer has since
    /// extended. Nothing was committed.
    #[error("{family} alias {source_id}:{raw_name} already maps to {existing}, not {proposed}")]
    AliasConflict {
        family: EntityFamily,
        source_id: SourceId,
        raw_name: String,
        existing: CanonicalKey,
        proposed: CanonicalKey,
    },

    #[error("run {run_id} is already finalized")]
    AlreadyFinalized { run_id: uuid::Uuid },

    #[error("run {run_id} was never started")]
    UnknownRun { run_id: uuid::Uuid },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A trigger arrived while the family was already running. Logged, not fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{family} run already in progress; trigger dropped")]
pub struct SchedulerConflict {
    pub family: EntityFamily,
}

/// Configuration problems detected at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown entity family: {0}")]
    UnknownFamily(String),

    #[error("unknown source id: {0}")]
    UnknownSource(String),

    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },

    #[error("storage path {path} is not writable: {source}")]
    StoragePath {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not open storage: {0}")]
    Storage(#[from] StorageError),
}

impl ConfigError {
    pub fn invalid(var: impl Into<String>, value: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            var: var.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for fetch operations.
pub type FetchResult<T> = std::result::Result<T, FetchError>;

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
