//! Reconciliation coordinator — the only component that calls both the
//! definition store and the engine, in a fixed order that defines the
//! consistency contract.
//!
//! Define/update: validate, persist, then project into the engine. A
//! failed projection marks the row instead of rolling it back. Delete:
//! unregister first; a mid-fire job goes to `pending_deletion` and the
//! row is purged when the engine confirms removal. A background pass
//! retries failed projections with capped backoff.
//!
//! Mutations on one job id are serialized through a per-id lock;
//! different ids proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metronome_core::config::SchedulerConfig;
use metronome_core::{MetronomeError, Result};
use tokio::sync::{Mutex, mpsc};

use crate::definition::{
    ConcurrencyPolicy, DefinitionPatch, JobRun, PauseState, RunStatus, TaskDefinition,
};
use crate::engine::{EngineNotice, EntrySpec, SchedulerEngine, Unregister};
use crate::events::{EventHub, JobEvent, JobEventKind};
use crate::handlers::HandlerRegistry;
use crate::schedule::Schedule;
use crate::store::DefinitionStore;

/// Administrative input for defining a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub group: String,
    pub schedule: String,
    pub handler_ref: String,
    pub policy: ConcurrencyPolicy,
    pub enabled: bool,
    /// Accept a one-shot time already in the past; it fires immediately.
    pub allow_expired: bool,
}

impl NewJob {
    pub fn new(name: &str, group: &str, schedule: &str, handler_ref: &str) -> Self {
        Self {
            name: name.to_string(),
            group: group.to_string(),
            schedule: schedule.to_string(),
            handler_ref: handler_ref.to_string(),
            policy: ConcurrencyPolicy::SkipIfRunning,
            enabled: true,
            allow_expired: false,
        }
    }

    pub fn with_policy(mut self, policy: ConcurrencyPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Result of a delete request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Row and engine entry are gone.
    Deleted,
    /// A run was in flight; the row is flagged `pending_deletion` and
    /// disappears once the run completes. The caller is not blocked.
    Pending,
}

/// Merged store + engine view of one job.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub definition: TaskDefinition,
    /// Whether an engine entry currently exists for this job.
    pub live: bool,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub run_in_progress: bool,
    pub last_run_status: Option<RunStatus>,
}

struct CoordInner {
    store: Arc<DefinitionStore>,
    registry: Arc<HandlerRegistry>,
    engine: SchedulerEngine,
    events: Arc<EventHub>,
    /// Per-job admin locks; operations on one id are serialized.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    reconcile_interval: Duration,
    reconcile_max_backoff: Duration,
    drain_timeout: Duration,
}

/// Orchestrates the definition store and the engine. Cheap to clone.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordInner>,
}

impl Coordinator {
    pub fn new(
        store: Arc<DefinitionStore>,
        registry: Arc<HandlerRegistry>,
        engine: SchedulerEngine,
        events: Arc<EventHub>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(CoordInner {
                store,
                registry,
                engine,
                events,
                locks: Mutex::new(HashMap::new()),
                reconcile_interval: Duration::from_secs(config.reconcile_interval_secs.max(1)),
                reconcile_max_backoff: Duration::from_secs(config.reconcile_max_backoff_secs.max(1)),
                drain_timeout: Duration::from_secs(config.drain_timeout_secs),
            }),
        }
    }

    pub fn engine(&self) -> &SchedulerEngine {
        &self.inner.engine
    }

    pub fn events(&self) -> &EventHub {
        &self.inner.events
    }

    async fn id_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.inner.locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Validate, persist, and project a new job. A projection failure
    /// (e.g. the handler is not loaded) keeps the row and records the
    /// error on it; the returned definition carries the marker.
    pub async fn define(&self, job: NewJob) -> Result<TaskDefinition> {
        let schedule = Schedule::validate(&job.schedule, job.allow_expired)?;
        let def = TaskDefinition::new(
            &job.name,
            &job.group,
            &schedule.normalized(),
            &job.handler_ref,
            job.policy,
            job.enabled,
        );
        self.inner.store.create(&def).await?;
        tracing::info!("Job defined: '{}/{}' ({})", def.group, def.name, def.id);

        if def.should_be_live() {
            if let Err(e) = self.project(&def, &schedule).await {
                return self.record_projection_failure(&def.id, &def.name, &e).await;
            }
            self.inner
                .events
                .publish(JobEvent::new(&def.id, &def.name, JobEventKind::Registered));
        }
        self.inner.store.get(&def.id).await
    }

    /// Replace a job's schedule. Persists first, then swaps the engine
    /// entry atomically; the old fire time is discarded.
    pub async fn update_schedule(
        &self,
        id: &str,
        expr: &str,
        allow_expired: bool,
    ) -> Result<TaskDefinition> {
        let lock = self.id_lock(id).await;
        let _guard = lock.lock().await;

        let def = self.inner.store.get(id).await?;
        if def.pending_deletion {
            return Err(MetronomeError::PendingDeletion(id.to_string()));
        }
        let schedule = Schedule::validate(expr, allow_expired)?;
        let patch = DefinitionPatch {
            schedule: Some(schedule.normalized()),
            ..Default::default()
        };
        let updated = self.inner.store.update(id, &patch, None).await?;

        if updated.should_be_live() {
            if let Err(e) = self.project(&updated, &schedule).await {
                return self.record_projection_failure(id, &updated.name, &e).await;
            }
            self.inner.store.clear_projection_error(id).await?;
        }
        self.inner.store.get(id).await
    }

    /// Persist the pause intent, then stop fires in the engine. The
    /// engine not knowing the job (not live) is not an error here — the
    /// store reflects intent and reconciliation converges.
    pub async fn pause(&self, id: &str) -> Result<TaskDefinition> {
        let lock = self.id_lock(id).await;
        let _guard = lock.lock().await;

        let def = self.inner.store.get(id).await?;
        if def.pending_deletion {
            return Err(MetronomeError::PendingDeletion(id.to_string()));
        }
        let patch = DefinitionPatch {
            pause_state: Some(PauseState::Paused),
            ..Default::default()
        };
        let updated = self.inner.store.update(id, &patch, None).await?;
        if let Err(e) = self.inner.engine.pause(id).await {
            tracing::debug!("Pause of non-live job {id}: {e}");
        }
        self.inner
            .events
            .publish(JobEvent::new(id, &updated.name, JobEventKind::Paused));
        Ok(updated)
    }

    /// Persist the resume intent, then recompute the fire time from now.
    /// A job that never made it into the engine (projection error,
    /// restart) gets a full projection attempt.
    pub async fn resume(&self, id: &str) -> Result<TaskDefinition> {
        let lock = self.id_lock(id).await;
        let _guard = lock.lock().await;

        let def = self.inner.store.get(id).await?;
        if def.pending_deletion {
            return Err(MetronomeError::PendingDeletion(id.to_string()));
        }
        let patch = DefinitionPatch {
            pause_state: Some(PauseState::Active),
            ..Default::default()
        };
        let updated = self.inner.store.update(id, &patch, None).await?;

        if updated.should_be_live() {
            match self.inner.engine.resume(id).await {
                Ok(()) => {}
                Err(MetronomeError::NotRegistered(_)) => {
                    let schedule = Schedule::parse(&updated.schedule)?;
                    match self.project(&updated, &schedule).await {
                        Ok(()) => self.inner.store.clear_projection_error(id).await?,
                        Err(e) => {
                            return self.record_projection_failure(id, &updated.name, &e).await;
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
        self.inner
            .events
            .publish(JobEvent::new(id, &updated.name, JobEventKind::Resumed));
        self.inner.store.get(id).await
    }

    /// Enable or disable a job. Disabling unregisters the engine entry;
    /// an in-flight run finishes first.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<TaskDefinition> {
        let lock = self.id_lock(id).await;
        let _guard = lock.lock().await;

        let def = self.inner.store.get(id).await?;
        if def.pending_deletion {
            return Err(MetronomeError::PendingDeletion(id.to_string()));
        }
        let patch = DefinitionPatch {
            enabled: Some(enabled),
            ..Default::default()
        };
        let updated = self.inner.store.update(id, &patch, None).await?;

        if updated.should_be_live() {
            let schedule = Schedule::parse(&updated.schedule)?;
            match self.project(&updated, &schedule).await {
                Ok(()) => self.inner.store.clear_projection_error(id).await?,
                Err(e) => return self.record_projection_failure(id, &updated.name, &e).await,
            }
        } else {
            self.inner.engine.unregister(id).await;
        }
        self.inner.store.get(id).await
    }

    /// Fire a job immediately, respecting its concurrency policy. The
    /// regular schedule is untouched; the run's outcome reaches the
    /// store through the outcome writer like any other fire.
    pub async fn trigger_now(&self, id: &str) -> Result<()> {
        // Surfaces NotFound for unknown ids before the engine lookup
        let def = self.inner.store.get(id).await?;
        if def.pending_deletion {
            return Err(MetronomeError::PendingDeletion(id.to_string()));
        }
        self.inner.engine.trigger_now(id).await
    }

    /// Delete a job. Unregisters from the engine first; if a run is in
    /// flight the row is flagged and purged on completion — the caller
    /// gets `Pending` immediately instead of blocking.
    pub async fn delete(&self, id: &str) -> Result<DeleteOutcome> {
        let lock = self.id_lock(id).await;
        let _guard = lock.lock().await;

        let def = self.inner.store.get(id).await?;
        match self.inner.engine.unregister(id).await {
            Unregister::Removed => {
                self.inner.store.delete(id).await?;
                self.inner
                    .events
                    .publish(JobEvent::new(id, &def.name, JobEventKind::Deleted));
                tracing::info!("Job deleted: '{}/{}'", def.group, def.name);
                Ok(DeleteOutcome::Deleted)
            }
            Unregister::Deferred => {
                self.inner.store.mark_pending_deletion(id).await?;
                tracing::info!(
                    "Job deletion pending (run in flight): '{}/{}'",
                    def.group,
                    def.name
                );
                Ok(DeleteOutcome::Pending)
            }
        }
    }

    /// Merged status for one job. Works for non-live definitions too.
    pub async fn get_status(&self, id: &str) -> Result<JobStatus> {
        let definition = self.inner.store.get(id).await?;
        Ok(self.merge_status(definition).await)
    }

    /// All jobs with live engine state merged in.
    pub async fn list_jobs(&self) -> Result<Vec<JobStatus>> {
        let defs = self.inner.store.list_all().await?;
        let mut jobs = Vec::with_capacity(defs.len());
        for def in defs {
            jobs.push(self.merge_status(def).await);
        }
        Ok(jobs)
    }

    /// Run history for one job, newest first.
    pub async fn recent_runs(&self, id: &str, limit: usize) -> Result<Vec<JobRun>> {
        self.inner.store.recent_runs(id, limit).await
    }

    async fn merge_status(&self, definition: TaskDefinition) -> JobStatus {
        match self.inner.engine.status(&definition.id).await {
            Ok(live) => JobStatus {
                live: true,
                next_fire_at: live.next_fire_at,
                run_in_progress: live.run_in_progress,
                last_run_status: live.last_run_status.or(definition.last_run_status),
                definition,
            },
            Err(_) => JobStatus {
                live: false,
                next_fire_at: None,
                run_in_progress: false,
                last_run_status: definition.last_run_status,
                definition,
            },
        }
    }

    /// Startup recovery: purge deletions that were pending when the
    /// process stopped (no run can still be in flight), then project
    /// every enabled, non-paused definition into the fresh engine.
    /// Definitions whose handler cannot be resolved stay in the store
    /// with a projection error, visible for operator correction.
    pub async fn recover(&self) -> Result<()> {
        for id in self.inner.store.list_pending_deletion().await? {
            tracing::info!("Purging job left pending deletion: {id}");
            self.inner.store.delete(&id).await?;
        }

        let defs = self.inner.store.list_enabled().await?;
        let total = defs.len();
        let mut live = 0usize;
        for def in defs {
            let projected = match Schedule::parse(&def.schedule) {
                Ok(schedule) => self.project(&def, &schedule).await,
                Err(e) => Err(e),
            };
            match projected {
                Ok(()) => {
                    if def.projection_error.is_some() {
                        self.inner.store.clear_projection_error(&def.id).await?;
                    }
                    live += 1;
                }
                Err(e) => {
                    tracing::warn!("Recovery could not project '{}': {e}", def.name);
                    let _ = self.record_projection_failure(&def.id, &def.name, &e).await;
                }
            }
        }
        tracing::info!("Recovery complete: {live}/{total} definitions live");
        Ok(())
    }

    /// Outcome writer: consumes engine notices and records them in the
    /// store — run state, run history, one-shot exhaustion, deferred
    /// deletions — and republishes public events.
    pub fn spawn_outcome_writer(
        &self,
        mut notices: mpsc::UnboundedReceiver<EngineNotice>,
    ) -> tokio::task::JoinHandle<()> {
        let coord = self.clone();
        tokio::spawn(async move {
            while let Some(notice) = notices.recv().await {
                coord.apply_notice(notice).await;
            }
        })
    }

    async fn apply_notice(&self, notice: EngineNotice) {
        match notice {
            EngineNotice::Fired { id, name, .. } => {
                self.inner
                    .events
                    .publish(JobEvent::new(&id, &name, JobEventKind::Fired));
            }
            EngineNotice::RunFinished {
                id,
                name,
                trigger,
                fired_at,
                finished_at,
                status,
                error,
                next_fire,
                schedule_exhausted,
            } => {
                if let Err(e) = self
                    .inner
                    .store
                    .update_run_state(&id, fired_at, status, next_fire)
                    .await
                {
                    tracing::warn!("Run-state write failed for {id}: {e}");
                }
                let run = JobRun {
                    job_id: id.clone(),
                    trigger,
                    fired_at,
                    finished_at: Some(finished_at),
                    status,
                    error: error.clone(),
                };
                if let Err(e) = self.inner.store.record_run(&run).await {
                    tracing::warn!("Run-history write failed for {id}: {e}");
                }
                if schedule_exhausted {
                    // One-shot spent: disable so recovery never revives
                    // it, and drop the dead engine entry
                    let patch = DefinitionPatch {
                        enabled: Some(false),
                        ..Default::default()
                    };
                    match self.inner.store.update(&id, &patch, None).await {
                        Ok(_) | Err(MetronomeError::NotFound(_)) => {}
                        Err(e) => tracing::warn!("One-shot disable failed for {id}: {e}"),
                    }
                    self.inner.engine.unregister(&id).await;
                }
                let mut event = JobEvent::from_status(&id, &name, status);
                event.detail = error;
                self.inner.events.publish(event);
            }
            EngineNotice::FireSkipped {
                id,
                name,
                fired_at,
                next_fire,
            } => {
                if let Err(e) = self
                    .inner
                    .store
                    .update_run_state(&id, fired_at, RunStatus::Skipped, next_fire)
                    .await
                {
                    tracing::warn!("Skip write failed for {id}: {e}");
                }
                let run = JobRun {
                    job_id: id.clone(),
                    trigger: crate::definition::RunTrigger::Scheduled,
                    fired_at,
                    finished_at: None,
                    status: RunStatus::Skipped,
                    error: None,
                };
                if let Err(e) = self.inner.store.record_run(&run).await {
                    tracing::warn!("Run-history write failed for {id}: {e}");
                }
                self.inner
                    .events
                    .publish(JobEvent::new(&id, &name, JobEventKind::Skipped));
            }
            EngineNotice::EntryRemoved { id, name } => {
                // A deferred delete finishes here
                match self.inner.store.get(&id).await {
                    Ok(def) if def.pending_deletion => {
                        if let Err(e) = self.inner.store.delete(&id).await {
                            tracing::warn!("Deferred delete failed for {id}: {e}");
                        } else {
                            tracing::info!("Deferred deletion completed: '{}/{}'", def.group, def.name);
                            self.inner
                                .events
                                .publish(JobEvent::new(&id, &name, JobEventKind::Deleted));
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    /// Background reconciliation: retry failed projections with per-job
    /// exponential backoff up to a cap. Runs until the task is dropped.
    pub fn spawn_reconciler(&self) -> tokio::task::JoinHandle<()> {
        let coord = self.clone();
        tokio::spawn(async move {
            // id -> (consecutive failures, do not retry before)
            let mut backoff: HashMap<String, (u32, tokio::time::Instant)> = HashMap::new();
            let mut tick = tokio::time::interval(coord.inner.reconcile_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                coord.reconcile_pass(&mut backoff).await;
            }
        })
    }

    /// One reconciliation sweep. Public so hosts and tests can drive it
    /// directly instead of waiting for the interval.
    pub async fn reconcile_pass(&self, backoff: &mut HashMap<String, (u32, tokio::time::Instant)>) {
        let defs = match self.inner.store.list_projection_errors().await {
            Ok(defs) => defs,
            Err(e) => {
                tracing::warn!("Reconcile scan failed: {e}");
                return;
            }
        };
        let now = tokio::time::Instant::now();
        let listed: Vec<String> = defs.iter().map(|d| d.id.clone()).collect();
        backoff.retain(|id, _| listed.contains(id));

        for def in defs {
            if !def.should_be_live() {
                continue;
            }
            if let Some((_, not_before)) = backoff.get(&def.id) {
                if now < *not_before {
                    continue;
                }
            }
            let projected = match Schedule::parse(&def.schedule) {
                Ok(schedule) => self.project(&def, &schedule).await,
                Err(e) => Err(e),
            };
            match projected {
                Ok(()) => {
                    if let Err(e) = self.inner.store.clear_projection_error(&def.id).await {
                        tracing::warn!("Clearing projection error failed for {}: {e}", def.id);
                    }
                    backoff.remove(&def.id);
                    tracing::info!("Reconciled job '{}': projection recovered", def.name);
                    self.inner
                        .events
                        .publish(JobEvent::new(&def.id, &def.name, JobEventKind::Registered));
                }
                Err(e) => {
                    let failures = backoff.get(&def.id).map(|(n, _)| *n).unwrap_or(0) + 1;
                    let delay = self
                        .inner
                        .reconcile_interval
                        .saturating_mul(2u32.saturating_pow(failures.min(16)))
                        .min(self.inner.reconcile_max_backoff);
                    backoff.insert(def.id.clone(), (failures, now + delay));
                    tracing::debug!(
                        "Projection still failing for '{}' (attempt {failures}): {e}",
                        def.name
                    );
                }
            }
        }
    }

    /// Stop firing and drain in-flight runs.
    pub async fn shutdown(&self) {
        self.inner.engine.shutdown(self.inner.drain_timeout).await;
    }

    async fn project(&self, def: &TaskDefinition, schedule: &Schedule) -> Result<()> {
        // Resolve eagerly so a missing handler surfaces at projection
        // time, not at the moment of firing
        self.inner.registry.resolve(&def.handler_ref)?;
        self.inner
            .engine
            .register_or_replace(EntrySpec {
                id: def.id.clone(),
                name: def.name.clone(),
                group: def.group.clone(),
                schedule: schedule.clone(),
                handler_ref: def.handler_ref.clone(),
                policy: def.concurrency_policy,
            })
            .await
    }

    async fn record_projection_failure(
        &self,
        id: &str,
        name: &str,
        err: &MetronomeError,
    ) -> Result<TaskDefinition> {
        let msg = err.to_string();
        self.inner.store.set_projection_error(id, &msg).await?;
        self.inner.events.publish(
            JobEvent::new(id, name, JobEventKind::ProjectionFailed).with_detail(msg),
        );
        self.inner.store.get(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Harness {
        coordinator: Coordinator,
        registry: Arc<HandlerRegistry>,
        counter: Arc<AtomicU32>,
    }

    /// Full stack on an in-memory store, with a counting handler under
    /// "test:work" that sleeps for `delay_ms`.
    fn harness(delay_ms: u64) -> Harness {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let registry = Arc::new(HandlerRegistry::new());
        registry.register_fn("test:work", move |_ctx| {
            let c = c.clone();
            async move {
                if delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let store = Arc::new(DefinitionStore::open_in_memory().unwrap());
        let events = Arc::new(EventHub::new(100));
        let (engine, notices) =
            SchedulerEngine::new(registry.clone(), Duration::from_millis(20));
        let coordinator = Coordinator::new(
            store,
            registry.clone(),
            engine,
            events,
            &SchedulerConfig::default(),
        );
        coordinator.engine().spawn();
        coordinator.spawn_outcome_writer(notices);
        Harness {
            coordinator,
            registry,
            counter,
        }
    }

    async fn wait_until<F, Fut>(mut cond: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if cond().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_define_fire_and_record() {
        let h = harness(0);
        let coord = &h.coordinator;

        // Expired one-shot with the explicit flag fires immediately
        let def = coord
            .define(
                NewJob::new("sweep", "maintenance", "@at 2020-01-01T00:00:00Z", "test:work")
                    .with_policy(ConcurrencyPolicy::AllowOverlap),
            )
            .await
            .unwrap_err();
        assert!(matches!(def, MetronomeError::InvalidExpression(_)));

        let mut job = NewJob::new(
            "sweep",
            "maintenance",
            "@at 2020-01-01T00:00:00Z",
            "test:work",
        );
        job.allow_expired = true;
        let def = coord.define(job).await.unwrap();
        assert!(def.projection_error.is_none());

        wait_until(|| async { h.counter.load(Ordering::SeqCst) == 1 }).await;

        // Outcome writer persisted the run, disabled the spent one-shot
        wait_until(|| async {
            let status = coord.get_status(&def.id).await.unwrap();
            status.definition.last_run_status == Some(RunStatus::Success)
                && !status.definition.enabled
        })
        .await;
        let runs = coord.recent_runs(&def.id, 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Success);
        coord.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_name_and_redefine_after_delete() {
        let h = harness(0);
        let coord = &h.coordinator;

        let first = coord
            .define(NewJob::new("backup", "daily", "0 3 * * *", "test:work"))
            .await
            .unwrap();
        let err = coord
            .define(NewJob::new("backup", "daily", "0 4 * * *", "test:work"))
            .await
            .unwrap_err();
        assert!(matches!(err, MetronomeError::DuplicateName { .. }));

        assert_eq!(coord.delete(&first.id).await.unwrap(), DeleteOutcome::Deleted);
        coord
            .define(NewJob::new("backup", "daily", "0 4 * * *", "test:work"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_handler_persists_with_projection_error() {
        let h = harness(0);
        let coord = &h.coordinator;

        let def = coord
            .define(NewJob::new("orphan", "g", "@every 60s", "not:loaded"))
            .await
            .unwrap();
        assert!(def.projection_error.as_deref().unwrap().contains("not:loaded"));

        // Not live, but fully visible
        let status = coord.get_status(&def.id).await.unwrap();
        assert!(!status.live);
        assert!(status.next_fire_at.is_none());
        assert!(!coord.engine().contains(&def.id).await);

        // trigger-now on a non-live job surfaces the projection gap
        let err = coord.trigger_now(&def.id).await.unwrap_err();
        assert!(matches!(err, MetronomeError::NotRegistered(_)));
    }

    #[tokio::test]
    async fn test_reconciler_picks_up_late_handler() {
        let h = harness(0);
        let coord = &h.coordinator;

        let def = coord
            .define(NewJob::new("late", "g", "@every 60s", "late:handler"))
            .await
            .unwrap();
        assert!(def.projection_error.is_some());

        let mut backoff = HashMap::new();
        // Still failing: the pass records a backoff entry
        coord.reconcile_pass(&mut backoff).await;
        assert!(backoff.contains_key(&def.id));

        // Operator loads the missing handler, next sweep converges
        h.registry.register_fn("late:handler", |_ctx| async { Ok(()) });
        backoff.clear();
        coord.reconcile_pass(&mut backoff).await;

        let status = coord.get_status(&def.id).await.unwrap();
        assert!(status.live);
        assert!(status.definition.projection_error.is_none());
    }

    #[tokio::test]
    async fn test_pause_resume_roundtrip() {
        let h = harness(0);
        let coord = &h.coordinator;

        let def = coord
            .define(NewJob::new("pausable", "g", "@every 60s", "test:work"))
            .await
            .unwrap();

        let paused = coord.pause(&def.id).await.unwrap();
        assert_eq!(paused.pause_state, PauseState::Paused);
        let status = coord.get_status(&def.id).await.unwrap();
        assert!(status.next_fire_at.is_none());

        let before_resume = Utc::now();
        let resumed = coord.resume(&def.id).await.unwrap();
        assert_eq!(resumed.pause_state, PauseState::Active);
        let status = coord.get_status(&def.id).await.unwrap();
        // Recomputed from now, never a time that passed while paused
        assert!(status.next_fire_at.unwrap() > before_resume);
    }

    #[tokio::test]
    async fn test_recovery_registers_only_live_definitions() {
        let registry = Arc::new(HandlerRegistry::new());
        registry.register_fn("test:work", |_ctx| async { Ok(()) });
        let store = Arc::new(DefinitionStore::open_in_memory().unwrap());

        // Seed the store as a previous process generation would have
        let a = TaskDefinition::new("a", "g", "@every 60s", "test:work",
            ConcurrencyPolicy::SkipIfRunning, true);
        let b = TaskDefinition::new("b", "g", "0 8 * * *", "test:work",
            ConcurrencyPolicy::SkipIfRunning, true);
        let c = TaskDefinition::new("c", "g", "@every 60s", "test:work",
            ConcurrencyPolicy::SkipIfRunning, false);
        for def in [&a, &b, &c] {
            store.create(def).await.unwrap();
        }
        let leftover = TaskDefinition::new("gone", "g", "@every 60s", "test:work",
            ConcurrencyPolicy::SkipIfRunning, true);
        store.create(&leftover).await.unwrap();
        store.mark_pending_deletion(&leftover.id).await.unwrap();

        let events = Arc::new(EventHub::new(100));
        let (engine, _notices) = SchedulerEngine::new(registry.clone(), Duration::from_secs(1));
        let coord = Coordinator::new(store.clone(), registry, engine, events,
            &SchedulerConfig::default());
        coord.recover().await.unwrap();

        // Exactly the two enabled+active definitions are live
        assert_eq!(coord.engine().len().await, 2);
        assert!(coord.engine().contains(&a.id).await);
        assert!(coord.engine().contains(&b.id).await);

        // The disabled one shows no next fire in the listing
        let jobs = coord.list_jobs().await.unwrap();
        let c_status = jobs.iter().find(|j| j.definition.id == c.id).unwrap();
        assert!(!c_status.live);
        assert!(c_status.next_fire_at.is_none());

        // The pending-deletion leftover was purged
        assert!(matches!(
            store.get(&leftover.id).await.unwrap_err(),
            MetronomeError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_recovery_tolerates_missing_handler() {
        let registry = Arc::new(HandlerRegistry::new());
        let store = Arc::new(DefinitionStore::open_in_memory().unwrap());
        let def = TaskDefinition::new("orphan", "g", "@every 60s", "not:loaded",
            ConcurrencyPolicy::SkipIfRunning, true);
        store.create(&def).await.unwrap();

        let events = Arc::new(EventHub::new(100));
        let (engine, _notices) = SchedulerEngine::new(registry.clone(), Duration::from_secs(1));
        let coord = Coordinator::new(store.clone(), registry, engine, events,
            &SchedulerConfig::default());
        coord.recover().await.unwrap();

        assert!(coord.engine().is_empty().await);
        let status = coord.get_status(&def.id).await.unwrap();
        assert!(status.definition.projection_error.is_some());
    }

    #[tokio::test]
    async fn test_delete_while_firing_goes_pending() {
        let h = harness(250);
        let coord = &h.coordinator;

        let def = coord
            .define(NewJob::new("slow", "g", "@every 3600s", "test:work"))
            .await
            .unwrap();
        coord.trigger_now(&def.id).await.unwrap();
        wait_until(|| async {
            coord
                .engine()
                .status(&def.id)
                .await
                .map(|s| s.run_in_progress)
                .unwrap_or(false)
        })
        .await;

        // Mid-fire delete returns immediately as Pending
        assert_eq!(coord.delete(&def.id).await.unwrap(), DeleteOutcome::Pending);
        let status = coord.get_status(&def.id).await.unwrap();
        assert!(status.definition.pending_deletion);

        // Once the run completes, the record disappears everywhere
        wait_until(|| async {
            matches!(
                coord.get_status(&def.id).await,
                Err(MetronomeError::NotFound(_))
            )
        })
        .await;
        assert!(!coord.engine().contains(&def.id).await);
        assert!(coord.list_jobs().await.unwrap().is_empty());
        // The in-flight run was not interrupted
        assert_eq!(h.counter.load(Ordering::SeqCst), 1);
        coord.shutdown().await;
    }

    #[tokio::test]
    async fn test_update_schedule_swaps_live_entry() {
        let h = harness(0);
        let coord = &h.coordinator;

        let def = coord
            .define(NewJob::new("report", "weekly", "@every 3600s", "test:work"))
            .await
            .unwrap();
        let first = coord.get_status(&def.id).await.unwrap().next_fire_at.unwrap();

        let updated = coord
            .update_schedule(&def.id, "@every 60s", false)
            .await
            .unwrap();
        assert_eq!(updated.schedule, "@every 60s");
        let second = coord.get_status(&def.id).await.unwrap().next_fire_at.unwrap();
        assert!(second < first);

        // Mutations on a pending-deletion row are refused
        let other = coord
            .define(NewJob::new("doomed", "g", "@every 3600s", "test:work"))
            .await
            .unwrap();
        coord.inner.store.mark_pending_deletion(&other.id).await.unwrap();
        assert!(matches!(
            coord.update_schedule(&other.id, "@every 60s", false).await,
            Err(MetronomeError::PendingDeletion(_))
        ));
    }

    #[tokio::test]
    async fn test_disable_unregisters() {
        let h = harness(0);
        let coord = &h.coordinator;

        let def = coord
            .define(NewJob::new("toggle", "g", "@every 60s", "test:work"))
            .await
            .unwrap();
        assert!(coord.engine().contains(&def.id).await);

        let disabled = coord.set_enabled(&def.id, false).await.unwrap();
        assert!(!disabled.enabled);
        assert!(!coord.engine().contains(&def.id).await);

        let enabled = coord.set_enabled(&def.id, true).await.unwrap();
        assert!(enabled.enabled);
        assert!(coord.engine().contains(&def.id).await);
    }
}
