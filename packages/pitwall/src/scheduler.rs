//! Per-family run scheduling.
//!
//! Each family is `Idle` or `Running`. A trigger (cadence tick or manual)
//! starts a run only from `Idle`; a trigger arriving while the family is
//! running is dropped, never queued. Families are independent of each other.
//!
//! ```text
//!   Idle ──trigger──► Running ──run finished (any outcome)──► Idle
//!                        │
//!                        └── trigger ──► SchedulerConflict (logged, dropped)
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::SchedulerConflict;
use crate::orchestrator::Orchestrator;
use crate::types::family::EntityFamily;
use crate::types::run::{RunRecord, Trigger};

/// Finished runs kept in memory per family.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamilyState {
    Idle,
    Running,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    orchestrator: Arc<Orchestrator>,
    states: Mutex<BTreeMap<EntityFamily, FamilyState>>,
    history: Mutex<BTreeMap<EntityFamily, VecDeque<RunRecord>>>,
    history_limit: usize,
    /// Parent of every run's cancellation token
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// Returns the family to `Idle` when the run task ends, even by panic.
struct RunningGuard {
    inner: Arc<Inner>,
    family: EntityFamily,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        lock(&self.inner.states).insert(self.family, FamilyState::Idle);
    }
}

/// Cheaply cloneable handle to the scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            inner: Arc::new(Inner {
                orchestrator,
                states: Mutex::new(EntityFamily::ALL.iter().map(|f| (*f, FamilyState::Idle)).collect()),
                history: Mutex::new(BTreeMap::new()),
                history_limit: DEFAULT_HISTORY_LIMIT,
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Start a run of `family` unless one is already in flight.
    ///
    /// The returned handle resolves to the finalized record. The run itself
    /// is tracked by the scheduler, so dropping the handle does not stop it.
    pub fn trigger(
        &self,
        family: EntityFamily,
        trigger: Trigger,
    ) -> Result<JoinHandle<RunRecord>, SchedulerConflict> {
        {
            let mut states = lock(&self.inner.states);
            let state = states.entry(family).or_insert(FamilyState::Idle);
            if *state == FamilyState::Running {
                warn!(family = %family, trigger = %trigger, "Run already in progress; trigger dropped");
                return Err(SchedulerConflict { family });
            }
            *state = FamilyState::Running;
        }

        let guard = RunningGuard {
            inner: self.inner.clone(),
            family,
        };
        let token = self.inner.cancel.child_token();
        debug!(family = %family, trigger = %trigger, "Run triggered");

        Ok(self.inner.tracker.spawn(async move {
            let inner = guard.inner.clone();
            let record = inner.orchestrator.run_family(family, trigger, &token).await;

            let mut history = lock(&inner.history);
            let runs = history.entry(family).or_default();
            runs.push_front(record.clone());
            runs.truncate(inner.history_limit);
            drop(history);

            drop(guard);
            record
        }))
    }

    pub fn state(&self, family: EntityFamily) -> FamilyState {
        lock(&self.inner.states)
            .get(&family)
            .copied()
            .unwrap_or(FamilyState::Idle)
    }

    /// Finished runs of `family` this process has seen, most recent first.
    pub fn history(&self, family: EntityFamily) -> Vec<RunRecord> {
        lock(&self.inner.history)
            .get(&family)
            .map(|runs| runs.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drive every family on its cadence until `shutdown` fires, then cancel
    /// in-flight runs and wait for them to finalize.
    pub async fn serve(&self, shutdown: CancellationToken) {
        let config = self.inner.orchestrator.config();
        for family in EntityFamily::ALL {
            let cadence = config.family(family).cadence;
            let scheduler = self.clone();
            let shutdown = shutdown.clone();

            info!(family = %family, cadence_secs = cadence.as_secs(), "Scheduling family");
            self.inner.tracker.spawn(async move {
                let mut ticks = tokio::time::interval(cadence);
                ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = ticks.tick() => {
                            // a conflict is already logged by trigger
                            let _ = scheduler.trigger(family, Trigger::Cadence);
                        }
                    }
                }
                debug!(family = %family, "Timer stopped");
            });
        }

        shutdown.cancelled().await;
        info!("Shutdown requested; waiting for in-flight runs");
        self.shutdown().await;
    }

    /// Cancel in-flight runs and wait until every tracked task has ended.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("Scheduler stopped");
    }
}
