//! Run records: one row per pipeline execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::family::EntityFamily;
use crate::error::StorageError;

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Cadence timer elapsed
    Cadence,
    /// Explicit external trigger (CLI or scheduler handle)
    Manual,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Cadence => "cadence",
            Trigger::Manual => "manual",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Trigger {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cadence" => Ok(Trigger::Cadence),
            "manual" => Ok(Trigger::Manual),
            other => Err(StorageError::Corrupt(format!("unknown trigger: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Shutdown arrived before the run could commit
    Cancelled,
    /// The storage transaction failed
    Storage,
    /// Nothing was persisted and at least one stage failed entirely
    NoProgress,
    /// Left unfinalized by a process that died mid-run
    Interrupted,
}

impl FailureReason {
    fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Cancelled => "cancelled",
            FailureReason::Storage => "storage",
            FailureReason::NoProgress => "no_progress",
            FailureReason::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Running,
    Success,
    Partial,
    Failed(FailureReason),
}

impl RunOutcome {
    /// Classify a finished run from its counts.
    ///
    /// Cancellation and storage failures dominate. Otherwise a run with no
    /// errors is a success, a run that persisted something despite errors is
    /// partial, and a run that errored without persisting anything failed.
    pub fn decide(counts: &RunCounts, cancelled: bool, storage_failed: bool) -> Self {
        if cancelled {
            RunOutcome::Failed(FailureReason::Cancelled)
        } else if storage_failed {
            RunOutcome::Failed(FailureReason::Storage)
        } else if counts.errored == 0 {
            RunOutcome::Success
        } else if counts.persisted > 0 {
            RunOutcome::Partial
        } else {
            RunOutcome::Failed(FailureReason::NoProgress)
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, RunOutcome::Failed(_))
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, RunOutcome::Running)
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Running => f.write_str("running"),
            RunOutcome::Success => f.write_str("success"),
            RunOutcome::Partial => f.write_str("partial"),
            RunOutcome::Failed(reason) => write!(f, "failed:{}", reason.as_str()),
        }
    }
}

impl FromStr for RunOutcome {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let outcome = match s {
            "running" => RunOutcome::Running,
            "success" => RunOutcome::Success,
            "partial" => RunOutcome::Partial,
            "failed:cancelled" => RunOutcome::Failed(FailureReason::Cancelled),
            "failed:storage" => RunOutcome::Failed(FailureReason::Storage),
            "failed:no_progress" => RunOutcome::Failed(FailureReason::NoProgress),
            "failed:interrupted" => RunOutcome::Failed(FailureReason::Interrupted),
            other => return Err(StorageError::Corrupt(format!("unknown run outcome: {}", other))),
        };
        Ok(outcome)
    }
}

/// Per-stage counters aggregated over one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    /// Pages fetched successfully
    pub fetched: usize,
    /// Drafts produced by extractors
    pub extracted: usize,
    /// Canonical records produced by the normalizer
    pub normalized: usize,
    /// Records committed to storage
    pub persisted: usize,
    /// Every recoverable error: fetch, extract, rejection, unresolved deferral, storage
    pub errored: usize,
    /// Drafts rejected by validation (also counted in `errored`)
    pub rejected: usize,
    /// Records deferred at least once for a missing reference
    pub deferred: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub family: EntityFamily,
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: RunOutcome,
    pub counts: RunCounts,
}

impl RunRecord {
    /// Create the in-flight record for a run starting now.
    pub fn start(family: EntityFamily, trigger: Trigger) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            family,
            trigger,
            started_at: Utc::now(),
            finished_at: None,
            outcome: RunOutcome::Running,
            counts: RunCounts::default(),
        }
    }

    /// Close the record. The returned value is final.
    pub fn finish(mut self, outcome: RunOutcome) -> Self {
        self.finished_at = Some(Utc::now());
        self.outcome = outcome;
        self
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(persisted: usize, errored: usize) -> RunCounts {
        RunCounts {
            persisted,
            errored,
            ..Default::default()
        }
    }

    #[test]
    fn test_decide_outcome() {
        assert_eq!(RunOutcome::decide(&counts(10, 0), false, false), RunOutcome::Success);
        assert_eq!(RunOutcome::decide(&counts(0, 0), false, false), RunOutcome::Success);
        assert_eq!(RunOutcome::decide(&counts(9, 1), false, false), RunOutcome::Partial);
        assert_eq!(
            RunOutcome::decide(&counts(0, 3), false, false),
            RunOutcome::Failed(FailureReason::NoProgress)
        );
        assert_eq!(
            RunOutcome::decide(&counts(5, 0), true, false),
            RunOutcome::Failed(FailureReason::Cancelled)
        );
        assert_eq!(
            RunOutcome::decide(&counts(0, 1), false, true),
            RunOutcome::Failed(FailureReason::Storage)
        );
    }

    #[test]
    fn test_outcome_text_round_trips_through_storage_form() {
        for outcome in [
            RunOutcome::Running,
            RunOutcome::Success,
            RunOutcome::Partial,
            RunOutcome::Failed(FailureReason::Cancelled),
            RunOutcome::Failed(FailureReason::Interrupted),
        ] {
            assert_eq!(outcome.to_string().parse::<RunOutcome>().unwrap(), outcome);
        }
        assert_eq!(RunOutcome::Failed(FailureReason::Cancelled).to_string(), "failed:cancelled");
    }

    #[test]
    fn test_finish_sets_end_time() {
        let record = RunRecord::start(EntityFamily::Teams, Trigger::Manual);
        assert!(record.finished_at.is_none());
        let done = record.finish(RunOutcome::Success);
        assert!(done.finished_at.is_some());
        assert!(done.duration().unwrap() >= chrono::Duration::zero());
    }
}
