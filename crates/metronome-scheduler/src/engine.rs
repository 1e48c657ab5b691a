//! Scheduler engine — owns the live set of engine entries and fires
//! handlers at their computed times.
//!
//! Fire times sit in a binary heap keyed by next-fire time; the loop
//! sleeps until the earliest deadline or a wake notification from any
//! mutation. Heap items are invalidated lazily: each carries the entry's
//! epoch and target time, and a popped item that no longer matches the
//! entry is discarded.
//!
//! Handlers run on spawned tasks outside the scheduling lock. The engine
//! reports fires, completions, skips, and removals on a notice channel;
//! it never touches the definition store itself.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metronome_core::{MetronomeError, Result};
use tokio::sync::{Mutex, Notify, mpsc};

use crate::definition::{ConcurrencyPolicy, RunStatus, RunTrigger};
use crate::handlers::{HandlerRegistry, JobContext, JobHandler};
use crate::schedule::Schedule;

/// What the engine needs to fire one job. Built by the coordinator from
/// a stored definition.
#[derive(Debug, Clone)]
pub struct EntrySpec {
    pub id: String,
    pub name: String,
    pub group: String,
    pub schedule: Schedule,
    pub handler_ref: String,
    pub policy: ConcurrencyPolicy,
}

/// Result of `unregister`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unregister {
    /// The entry is gone.
    Removed,
    /// A run is in flight; the entry is marked for removal and an
    /// `EntryRemoved` notice follows once the run completes.
    Deferred,
}

/// Live status of one entry.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub next_fire_at: Option<DateTime<Utc>>,
    pub run_in_progress: bool,
    pub last_run_status: Option<RunStatus>,
}

/// Everything the engine tells the coordinator.
#[derive(Debug, Clone)]
pub enum EngineNotice {
    Fired {
        id: String,
        name: String,
        trigger: RunTrigger,
        fired_at: DateTime<Utc>,
    },
    RunFinished {
        id: String,
        name: String,
        trigger: RunTrigger,
        fired_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        status: RunStatus,
        error: Option<String>,
        next_fire: Option<DateTime<Utc>>,
        /// A one-shot schedule has no further fire; the coordinator
        /// disables the definition.
        schedule_exhausted: bool,
    },
    FireSkipped {
        id: String,
        name: String,
        fired_at: DateTime<Utc>,
        next_fire: Option<DateTime<Utc>>,
    },
    /// A deferred removal completed; the entry is gone.
    EntryRemoved { id: String, name: String },
}

struct Entry {
    id: String,
    name: String,
    group: String,
    schedule: Schedule,
    handler_ref: String,
    handler: Arc<dyn JobHandler>,
    policy: ConcurrencyPolicy,
    next_fire: Option<DateTime<Utc>>,
    paused: bool,
    /// Number of handler runs currently executing.
    in_flight: u32,
    /// QueueIfRunning pending slot. At most one fire is retained.
    queued: bool,
    remove_when_idle: bool,
    last_status: Option<RunStatus>,
    /// Bumped on replace/pause/unregister to invalidate heap items.
    epoch: u64,
}

/// Heap item: (fire time, entry epoch, id). Min-ordered via Reverse.
type Deadline = Reverse<(DateTime<Utc>, u64, String)>;

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    heap: BinaryHeap<Deadline>,
}

struct Inner {
    registry: Arc<HandlerRegistry>,
    state: Mutex<State>,
    wake: Notify,
    shutting_down: AtomicBool,
    notices: mpsc::UnboundedSender<EngineNotice>,
    max_sleep: Duration,
}

/// The live firing engine. Cheap to clone; one instance per process,
/// constructed at startup and injected wherever it is needed.
#[derive(Clone)]
pub struct SchedulerEngine {
    inner: Arc<Inner>,
}

impl SchedulerEngine {
    /// Build an engine. Returns the notice receiver the coordinator
    /// consumes; the engine is inert until `spawn` starts the fire loop.
    pub fn new(
        registry: Arc<HandlerRegistry>,
        max_sleep: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<EngineNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Self {
            inner: Arc::new(Inner {
                registry,
                state: Mutex::new(State::default()),
                wake: Notify::new(),
                shutting_down: AtomicBool::new(false),
                notices: tx,
                max_sleep,
            }),
        };
        (engine, rx)
    }

    /// Start the fire loop on the runtime.
    pub fn spawn(&self) -> tokio::task::JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.run_loop().await })
    }

    /// Idempotent register: a fresh entry gets a fire time computed from
    /// now; an existing entry for the same id atomically swaps schedule,
    /// handler, and policy with no gap in coverage (in-flight runs keep
    /// completing under the old handler).
    pub async fn register_or_replace(&self, spec: EntrySpec) -> Result<()> {
        let handler = self.inner.registry.resolve(&spec.handler_ref)?;
        let now = Utc::now();
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        match state.entries.get_mut(&spec.id) {
            Some(entry) => {
                entry.schedule = spec.schedule;
                entry.handler_ref = spec.handler_ref;
                entry.handler = handler;
                entry.policy = spec.policy;
                entry.name = spec.name;
                entry.group = spec.group;
                entry.epoch += 1;
                entry.next_fire = if entry.paused {
                    None
                } else {
                    entry.schedule.first_fire(now)
                };
                if let Some(t) = entry.next_fire {
                    let item = Reverse((t, entry.epoch, entry.id.clone()));
                    state.heap.push(item);
                }
                tracing::debug!("Engine entry replaced: {}", spec.id);
            }
            None => {
                let next_fire = spec.schedule.first_fire(now);
                let entry = Entry {
                    id: spec.id.clone(),
                    name: spec.name,
                    group: spec.group,
                    schedule: spec.schedule,
                    handler_ref: spec.handler_ref,
                    handler,
                    policy: spec.policy,
                    next_fire,
                    paused: false,
                    in_flight: 0,
                    queued: false,
                    remove_when_idle: false,
                    last_status: None,
                    epoch: 0,
                };
                if let Some(t) = next_fire {
                    state.heap.push(Reverse((t, 0, spec.id.clone())));
                }
                state.entries.insert(spec.id.clone(), entry);
                tracing::debug!("Engine entry registered: {}", spec.id);
            }
        }
        drop(guard);
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Remove an entry. A mid-fire entry is marked for removal and
    /// removed when the run's completion notification arrives — the
    /// handler is never interrupted and this call never blocks on it.
    pub async fn unregister(&self, id: &str) -> Unregister {
        let mut state = self.inner.state.lock().await;
        let Some(entry) = state.entries.get_mut(id) else {
            return Unregister::Removed;
        };
        if entry.in_flight > 0 {
            entry.remove_when_idle = true;
            entry.queued = false;
            entry.next_fire = None;
            entry.epoch += 1;
            tracing::debug!("Engine entry removal deferred (run in flight): {id}");
            return Unregister::Deferred;
        }
        state.entries.remove(id);
        tracing::debug!("Engine entry removed: {id}");
        Unregister::Removed
    }

    /// Stop future fires without removing the entry.
    pub async fn pause(&self, id: &str) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let entry = state
            .entries
            .get_mut(id)
            .ok_or_else(|| MetronomeError::NotRegistered(id.to_string()))?;
        entry.paused = true;
        entry.queued = false;
        entry.next_fire = None;
        entry.epoch += 1;
        Ok(())
    }

    /// Resume a paused entry, recomputing the fire time from now.
    /// Fires missed while paused are never backfilled.
    pub async fn resume(&self, id: &str) -> Result<()> {
        let now = Utc::now();
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        let entry = state
            .entries
            .get_mut(id)
            .ok_or_else(|| MetronomeError::NotRegistered(id.to_string()))?;
        entry.paused = false;
        entry.epoch += 1;
        entry.next_fire = entry.schedule.next_from(now);
        if let Some(t) = entry.next_fire {
            let item = Reverse((t, entry.epoch, entry.id.clone()));
            state.heap.push(item);
        }
        drop(guard);
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Fire immediately, respecting the concurrency policy exactly as a
    /// scheduled fire would. The regular `next_fire` is untouched.
    pub async fn trigger_now(&self, id: &str) -> Result<()> {
        let now = Utc::now();
        let mut state = self.inner.state.lock().await;
        let entry = state
            .entries
            .get_mut(id)
            .ok_or_else(|| MetronomeError::NotRegistered(id.to_string()))?;
        if entry.remove_when_idle {
            return Err(MetronomeError::NotRegistered(id.to_string()));
        }
        if entry.in_flight > 0 {
            match entry.policy {
                ConcurrencyPolicy::SkipIfRunning => {
                    entry.last_status = Some(RunStatus::Skipped);
                    let notice = EngineNotice::FireSkipped {
                        id: entry.id.clone(),
                        name: entry.name.clone(),
                        fired_at: now,
                        next_fire: entry.next_fire,
                    };
                    let _ = self.inner.notices.send(notice);
                }
                ConcurrencyPolicy::QueueIfRunning => entry.queued = true,
                ConcurrencyPolicy::AllowOverlap => {
                    self.inner.start_run(entry, now, RunTrigger::Manual);
                }
            }
        } else {
            self.inner.start_run(entry, now, RunTrigger::Manual);
        }
        Ok(())
    }

    /// Live status of one entry.
    pub async fn status(&self, id: &str) -> Result<EngineStatus> {
        let state = self.inner.state.lock().await;
        let entry = state
            .entries
            .get(id)
            .ok_or_else(|| MetronomeError::NotRegistered(id.to_string()))?;
        Ok(EngineStatus {
            next_fire_at: entry.next_fire,
            run_in_progress: entry.in_flight > 0,
            last_run_status: entry.last_status,
        })
    }

    /// Whether an entry exists for this id.
    pub async fn contains(&self, id: &str) -> bool {
        self.inner.state.lock().await.entries.contains_key(id)
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stop firing and wait up to `drain_timeout` for in-flight runs.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
        let deadline = tokio::time::Instant::now() + drain_timeout;
        loop {
            let busy = {
                let state = self.inner.state.lock().await;
                state.entries.values().any(|e| e.in_flight > 0)
            };
            if !busy {
                tracing::info!("Engine drained");
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!("Engine drain timed out with runs still in flight");
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl Inner {
    async fn run_loop(self: Arc<Self>) {
        tracing::info!("Scheduler engine started");
        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                break;
            }
            let next_deadline = self.fire_due().await;
            // Cap the sleep so a backward wall-clock step re-evaluates
            // deadlines within a bounded window.
            let sleep_for = match next_deadline {
                Some(t) => (t - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .min(self.max_sleep),
                None => self.max_sleep,
            };
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.wake.notified() => {}
            }
        }
        tracing::info!("Scheduler engine stopped");
    }

    /// Fire everything that is due and return the earliest upcoming
    /// deadline. Holds the state lock only for scheduling decisions;
    /// handler execution happens on spawned tasks.
    async fn fire_due(self: &Arc<Self>) -> Option<DateTime<Utc>> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let state = &mut *state;
        loop {
            let (t, epoch, id) = match state.heap.peek() {
                Some(Reverse(item)) => item.clone(),
                None => return None,
            };
            // Lazy invalidation: drop items the entry has moved past.
            let valid = state
                .entries
                .get(&id)
                .is_some_and(|e| e.epoch == epoch && e.next_fire == Some(t) && !e.paused);
            if !valid {
                state.heap.pop();
                continue;
            }
            if t > now {
                return Some(t);
            }
            state.heap.pop();
            let Some(entry) = state.entries.get_mut(&id) else {
                continue;
            };

            // Advance the schedule from the scheduled fire time, not from
            // "now", so a late wake does not drift the cadence.
            entry.next_fire = entry.schedule.next_after(t);
            if let Some(next) = entry.next_fire {
                let item = Reverse((next, entry.epoch, entry.id.clone()));
                state.heap.push(item);
            }

            if entry.in_flight > 0 {
                match entry.policy {
                    ConcurrencyPolicy::SkipIfRunning => {
                        entry.last_status = Some(RunStatus::Skipped);
                        tracing::debug!("Fire skipped (run in progress): {}", entry.name);
                        let notice = EngineNotice::FireSkipped {
                            id: entry.id.clone(),
                            name: entry.name.clone(),
                            fired_at: t,
                            next_fire: entry.next_fire,
                        };
                        let _ = self.notices.send(notice);
                    }
                    ConcurrencyPolicy::QueueIfRunning => {
                        // Collapse into the single pending slot.
                        entry.queued = true;
                        tracing::debug!("Fire queued behind running job: {}", entry.name);
                    }
                    ConcurrencyPolicy::AllowOverlap => {
                        self.start_run(entry, t, RunTrigger::Scheduled);
                    }
                }
            } else {
                self.start_run(entry, t, RunTrigger::Scheduled);
            }
        }
    }

    /// Launch one handler run on its own task. Caller holds the state lock.
    fn start_run(self: &Arc<Self>, entry: &mut Entry, fired_at: DateTime<Utc>, trigger: RunTrigger) {
        entry.in_flight += 1;
        let handler = entry.handler.clone();
        let ctx = JobContext {
            job_id: entry.id.clone(),
            name: entry.name.clone(),
            group: entry.group.clone(),
            fired_at,
            trigger,
        };
        let _ = self.notices.send(EngineNotice::Fired {
            id: entry.id.clone(),
            name: entry.name.clone(),
            trigger,
            fired_at,
        });
        tracing::info!("Job fired: '{}' ({:?})", entry.name, trigger);

        let inner = self.clone();
        let (id, name) = (entry.id.clone(), entry.name.clone());
        tokio::spawn(async move {
            let result = handler.run(ctx).await;
            let finished_at = Utc::now();
            let (status, error) = match result {
                Ok(()) => (RunStatus::Success, None),
                Err(e) => {
                    tracing::warn!("Job '{name}' failed: {e}");
                    (RunStatus::Failure, Some(e.to_string()))
                }
            };
            inner
                .complete_run(id, name, trigger, fired_at, finished_at, status, error)
                .await;
        });
    }

    /// Clear the run marker, release the queued fire if one is pending,
    /// and finalize a deferred removal. Called exactly once per run.
    #[allow(clippy::too_many_arguments)]
    async fn complete_run(
        self: &Arc<Self>,
        id: String,
        name: String,
        trigger: RunTrigger,
        fired_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        status: RunStatus,
        error: Option<String>,
    ) {
        let mut removed = false;
        let mut next_fire = None;
        let mut exhausted = false;
        {
            let mut state = self.state.lock().await;
            if let Some(entry) = state.entries.get_mut(&id) {
                entry.in_flight = entry.in_flight.saturating_sub(1);
                entry.last_status = Some(status);
                next_fire = entry.next_fire;
                exhausted =
                    matches!(entry.schedule, Schedule::Once { .. }) && entry.next_fire.is_none();
                if entry.in_flight == 0 {
                    if entry.remove_when_idle {
                        removed = true;
                    } else if entry.queued && !entry.paused {
                        entry.queued = false;
                        self.start_run(entry, Utc::now(), RunTrigger::Queued);
                    }
                }
            }
            if removed {
                state.entries.remove(&id);
            }
        }
        let _ = self.notices.send(EngineNotice::RunFinished {
            id: id.clone(),
            name: name.clone(),
            trigger,
            fired_at,
            finished_at,
            status,
            error,
            next_fire,
            schedule_exhausted: exhausted,
        });
        if removed {
            tracing::debug!("Deferred removal completed: {id}");
            let _ = self.notices.send(EngineNotice::EntryRemoved { id, name });
        }
    }
}
