//! Job definitions — the durable data model for scheduled work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A durable job definition. One row in the store.
///
/// Observational fields (`last_run_at`, `last_run_status`, `next_fire_at`)
/// are written only by the coordinator's outcome writer, never by an
/// administrative request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Unique job ID, immutable after creation.
    pub id: String,
    /// Human-readable name. `(name, group)` is unique among live rows.
    pub name: String,
    /// Job group, e.g. "daily" or "maintenance".
    pub group: String,
    /// Normalized schedule expression (`@at …`, `@every …`, or cron).
    pub schedule: String,
    /// Identifier resolving to a registered handler. May reference code
    /// that is not currently loaded; surfaced as a projection error.
    pub handler_ref: String,
    /// Whether the job should be live in the engine at all.
    pub enabled: bool,
    /// Pause state, independent of `enabled`.
    pub pause_state: PauseState,
    /// What to do when a fire arrives while a previous run is executing.
    pub concurrency_policy: ConcurrencyPolicy,
    /// Last time a fire was attempted.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Outcome of the last fire.
    pub last_run_status: Option<RunStatus>,
    /// Next computed fire time, as last observed by the coordinator.
    pub next_fire_at: Option<DateTime<Utc>>,
    /// Set when the store row could not be projected into the engine
    /// (e.g. the handler is missing). Cleared when projection succeeds.
    pub projection_error: Option<String>,
    /// Deletion requested while a run was in flight; the row is removed
    /// once the engine confirms the entry is gone.
    pub pending_deletion: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Pause state. A disabled job is never scheduled regardless of this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseState {
    Active,
    Paused,
}

/// Per-job rule for overlapping fires of the same job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    /// A new fire starts even if a previous run has not finished.
    AllowOverlap,
    /// The fire is skipped and recorded as Skipped; `next_fire` advances.
    SkipIfRunning,
    /// At most one fire is held back and runs once the in-flight run
    /// completes. Further fires collapse into the same pending slot.
    QueueIfRunning,
}

/// Outcome of a single fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failure,
    Skipped,
}

/// What caused a fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    /// The regular schedule came due.
    Scheduled,
    /// An operator called trigger-now.
    Manual,
    /// A QueueIfRunning fire released after the previous run finished.
    Queued,
}

/// One row of run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub job_id: String,
    pub trigger: RunTrigger,
    pub fired_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    /// Handler error message, for Failure rows.
    pub error: Option<String>,
}

/// Mutable fields for `DefinitionStore::update`. `None` leaves the
/// column untouched.
#[derive(Debug, Clone, Default)]
pub struct DefinitionPatch {
    pub schedule: Option<String>,
    pub enabled: Option<bool>,
    pub pause_state: Option<PauseState>,
    pub concurrency_policy: Option<ConcurrencyPolicy>,
    pub handler_ref: Option<String>,
}

impl TaskDefinition {
    /// Build a fresh definition with store-managed fields initialized.
    pub fn new(
        name: &str,
        group: &str,
        schedule: &str,
        handler_ref: &str,
        policy: ConcurrencyPolicy,
        enabled: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            group: group.to_string(),
            schedule: schedule.to_string(),
            handler_ref: handler_ref.to_string(),
            enabled,
            pause_state: PauseState::Active,
            concurrency_policy: policy,
            last_run_at: None,
            last_run_status: None,
            next_fire_at: None,
            projection_error: None,
            pending_deletion: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this definition belongs in the live engine.
    pub fn should_be_live(&self) -> bool {
        self.enabled && self.pause_state == PauseState::Active && !self.pending_deletion
    }
}

impl PauseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PauseState::Active => "active",
            PauseState::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "paused" => PauseState::Paused,
            _ => PauseState::Active,
        }
    }
}

impl ConcurrencyPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConcurrencyPolicy::AllowOverlap => "allow_overlap",
            ConcurrencyPolicy::SkipIfRunning => "skip_if_running",
            ConcurrencyPolicy::QueueIfRunning => "queue_if_running",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "allow_overlap" => ConcurrencyPolicy::AllowOverlap,
            "queue_if_running" => ConcurrencyPolicy::QueueIfRunning,
            _ => ConcurrencyPolicy::SkipIfRunning,
        }
    }
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
            RunStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "failure" => RunStatus::Failure,
            "skipped" => RunStatus::Skipped,
            _ => RunStatus::Success,
        }
    }
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTrigger::Scheduled => "scheduled",
            RunTrigger::Manual => "manual",
            RunTrigger::Queued => "queued",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "manual" => RunTrigger::Manual,
            "queued" => RunTrigger::Queued,
            _ => RunTrigger::Scheduled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_definition() {
        let def = TaskDefinition::new(
            "backup",
            "daily",
            "0 3 * * *",
            "backup:full",
            ConcurrencyPolicy::SkipIfRunning,
            true,
        );
        assert!(!def.id.is_empty());
        assert!(def.should_be_live());
        assert!(def.projection_error.is_none());
        assert_eq!(def.pause_state, PauseState::Active);
    }

    #[test]
    fn test_should_be_live() {
        let mut def = TaskDefinition::new(
            "t",
            "g",
            "@every 60s",
            "h",
            ConcurrencyPolicy::AllowOverlap,
            true,
        );
        assert!(def.should_be_live());

        def.pause_state = PauseState::Paused;
        assert!(!def.should_be_live());

        def.pause_state = PauseState::Active;
        def.enabled = false;
        assert!(!def.should_be_live());

        def.enabled = true;
        def.pending_deletion = true;
        assert!(!def.should_be_live());
    }

    #[test]
    fn test_enum_roundtrip() {
        for p in [
            ConcurrencyPolicy::AllowOverlap,
            ConcurrencyPolicy::SkipIfRunning,
            ConcurrencyPolicy::QueueIfRunning,
        ] {
            assert_eq!(ConcurrencyPolicy::parse(p.as_str()), p);
        }
        for s in [RunStatus::Success, RunStatus::Failure, RunStatus::Skipped] {
            assert_eq!(RunStatus::parse(s.as_str()), s);
        }
        for t in [RunTrigger::Scheduled, RunTrigger::Manual, RunTrigger::Queued] {
            assert_eq!(RunTrigger::parse(t.as_str()), t);
        }
    }
}
