//! SQLite-backed definition store — the durable source of truth for
//! which jobs exist. No scheduling logic lives here; the coordinator
//! orders store writes relative to engine projection.
//!
//! Writes are atomic per record (single statements on one connection).
//! The connection sits behind a tokio mutex so concurrent callers
//! serialize at the store boundary.

use std::path::Path;

use chrono::{DateTime, Utc};
use metronome_core::{MetronomeError, Result};
use tokio::sync::Mutex;

use crate::definition::{
    ConcurrencyPolicy, DefinitionPatch, JobRun, PauseState, RunStatus, RunTrigger, TaskDefinition,
};

/// Durable CRUD over job definitions and run history.
pub struct DefinitionStore {
    conn: Mutex<rusqlite::Connection>,
}

impl DefinitionStore {
    /// Open or create the store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| MetronomeError::Store(format!("DB open: {e}")))?;
        Self::migrate(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|e| MetronomeError::Store(format!("DB open: {e}")))?;
        Self::migrate(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn migrate(conn: &rusqlite::Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS job_definitions (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                job_group TEXT NOT NULL,
                schedule TEXT NOT NULL,
                handler_ref TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                pause_state TEXT NOT NULL DEFAULT 'active',
                concurrency_policy TEXT NOT NULL DEFAULT 'skip_if_running',
                last_run_at TEXT,
                last_run_status TEXT,
                next_fire_at TEXT,
                projection_error TEXT,
                pending_deletion INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (name, job_group)
            );

            CREATE TABLE IF NOT EXISTS job_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                trigger_kind TEXT NOT NULL,
                fired_at TEXT NOT NULL,
                finished_at TEXT,
                status TEXT NOT NULL,
                error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_job_runs_job ON job_runs(job_id, id);
            ",
        )
        .map_err(|e| MetronomeError::Store(format!("Migration: {e}")))?;
        Ok(())
    }

    /// Insert a new definition. `(name, group)` must be unique among
    /// live rows; deletion frees the pair for reuse.
    pub async fn create(&self, def: &TaskDefinition) -> Result<()> {
        let conn = self.conn.lock().await;
        let taken: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM job_definitions WHERE name = ?1 AND job_group = ?2",
                rusqlite::params![def.name, def.group],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n > 0)
            .map_err(|e| MetronomeError::Store(format!("Create lookup: {e}")))?;
        if taken {
            return Err(MetronomeError::DuplicateName {
                name: def.name.clone(),
                group: def.group.clone(),
            });
        }
        conn.execute(
            "INSERT INTO job_definitions
             (id, name, job_group, schedule, handler_ref, enabled, pause_state,
              concurrency_policy, last_run_at, last_run_status, next_fire_at,
              projection_error, pending_deletion, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            rusqlite::params![
                def.id,
                def.name,
                def.group,
                def.schedule,
                def.handler_ref,
                def.enabled as i32,
                def.pause_state.as_str(),
                def.concurrency_policy.as_str(),
                def.last_run_at.map(|t| t.to_rfc3339()),
                def.last_run_status.map(|s| s.as_str()),
                def.next_fire_at.map(|t| t.to_rfc3339()),
                def.projection_error,
                def.pending_deletion as i32,
                def.created_at.to_rfc3339(),
                def.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| MetronomeError::Store(format!("Create: {e}")))?;
        Ok(())
    }

    /// Fetch one definition.
    pub async fn get(&self, id: &str) -> Result<TaskDefinition> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM job_definitions WHERE id = ?1"),
            [id],
            row_to_def,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => MetronomeError::NotFound(id.to_string()),
            other => MetronomeError::Store(format!("Get: {other}")),
        })
    }

    /// Secondary lookup by the `(name, group)` pair.
    pub async fn get_by_name(&self, name: &str, group: &str) -> Result<Option<TaskDefinition>> {
        let conn = self.conn.lock().await;
        match conn.query_row(
            &format!("SELECT {COLUMNS} FROM job_definitions WHERE name = ?1 AND job_group = ?2"),
            rusqlite::params![name, group],
            row_to_def,
        ) {
            Ok(def) => Ok(Some(def)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(MetronomeError::Store(format!("Lookup: {e}"))),
        }
    }

    /// Apply a patch of administrative fields. When `expected_updated_at`
    /// is given and the row has moved on since, the caller raced another
    /// mutation and gets `ConcurrencyConflict`.
    pub async fn update(
        &self,
        id: &str,
        patch: &DefinitionPatch,
        expected_updated_at: Option<DateTime<Utc>>,
    ) -> Result<TaskDefinition> {
        let conn = self.conn.lock().await;
        let current = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM job_definitions WHERE id = ?1"),
                [id],
                row_to_def,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => MetronomeError::NotFound(id.to_string()),
                other => MetronomeError::Store(format!("Update read: {other}")),
            })?;
        if let Some(expected) = expected_updated_at {
            if current.updated_at != expected {
                return Err(MetronomeError::ConcurrencyConflict(id.to_string()));
            }
        }

        let mut updated = current;
        if let Some(schedule) = &patch.schedule {
            updated.schedule = schedule.clone();
        }
        if let Some(enabled) = patch.enabled {
            updated.enabled = enabled;
        }
        if let Some(pause_state) = patch.pause_state {
            updated.pause_state = pause_state;
        }
        if let Some(policy) = patch.concurrency_policy {
            updated.concurrency_policy = policy;
        }
        if let Some(handler_ref) = &patch.handler_ref {
            updated.handler_ref = handler_ref.clone();
        }
        updated.updated_at = Utc::now();

        conn.execute(
            "UPDATE job_definitions SET schedule = ?2, handler_ref = ?3, enabled = ?4,
             pause_state = ?5, concurrency_policy = ?6, updated_at = ?7
             WHERE id = ?1",
            rusqlite::params![
                id,
                updated.schedule,
                updated.handler_ref,
                updated.enabled as i32,
                updated.pause_state.as_str(),
                updated.concurrency_policy.as_str(),
                updated.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| MetronomeError::Store(format!("Update: {e}")))?;
        Ok(updated)
    }

    /// Remove a definition row and its run history.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let n = conn
            .execute("DELETE FROM job_definitions WHERE id = ?1", [id])
            .map_err(|e| MetronomeError::Store(format!("Delete: {e}")))?;
        if n == 0 {
            return Err(MetronomeError::NotFound(id.to_string()));
        }
        conn.execute("DELETE FROM job_runs WHERE job_id = ?1", [id])
            .map_err(|e| MetronomeError::Store(format!("Delete runs: {e}")))?;
        Ok(())
    }

    /// All definitions, including disabled and pending-deletion rows.
    pub async fn list_all(&self) -> Result<Vec<TaskDefinition>> {
        self.list_where("1=1").await
    }

    /// Definitions that belong in the engine: enabled, not paused, not
    /// pending deletion. Used by startup recovery.
    pub async fn list_enabled(&self) -> Result<Vec<TaskDefinition>> {
        self.list_where("enabled = 1 AND pause_state = 'active' AND pending_deletion = 0")
            .await
    }

    /// Rows whose last projection into the engine failed.
    pub async fn list_projection_errors(&self) -> Result<Vec<TaskDefinition>> {
        self.list_where("projection_error IS NOT NULL AND pending_deletion = 0")
            .await
    }

    async fn list_where(&self, clause: &str) -> Result<Vec<TaskDefinition>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {COLUMNS} FROM job_definitions WHERE {clause} ORDER BY created_at"
            ))
            .map_err(|e| MetronomeError::Store(format!("List: {e}")))?;
        let rows = stmt
            .query_map([], row_to_def)
            .map_err(|e| MetronomeError::Store(format!("List: {e}")))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| MetronomeError::Store(format!("List: {e}")))
    }

    /// Record a failed projection on the row. The definition is kept —
    /// a job can exist in the store without being live.
    pub async fn set_projection_error(&self, id: &str, msg: &str) -> Result<()> {
        self.set_column(id, "projection_error", Some(msg)).await
    }

    /// Clear the projection marker after a successful (re-)projection.
    pub async fn clear_projection_error(&self, id: &str) -> Result<()> {
        self.set_column(id, "projection_error", None).await
    }

    async fn set_column(&self, id: &str, column: &str, value: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().await;
        let n = conn
            .execute(
                &format!("UPDATE job_definitions SET {column} = ?2, updated_at = ?3 WHERE id = ?1"),
                rusqlite::params![id, value, Utc::now().to_rfc3339()],
            )
            .map_err(|e| MetronomeError::Store(format!("Set {column}: {e}")))?;
        if n == 0 {
            return Err(MetronomeError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Flag a row whose engine entry is still winding down a run. The
    /// row is excluded from recovery listings and removed once the
    /// engine confirms the entry is gone.
    pub async fn mark_pending_deletion(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let n = conn
            .execute(
                "UPDATE job_definitions SET pending_deletion = 1, updated_at = ?2 WHERE id = ?1",
                rusqlite::params![id, Utc::now().to_rfc3339()],
            )
            .map_err(|e| MetronomeError::Store(format!("Mark pending: {e}")))?;
        if n == 0 {
            return Err(MetronomeError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Ids of rows flagged pending deletion.
    pub async fn list_pending_deletion(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT id FROM job_definitions WHERE pending_deletion = 1")
            .map_err(|e| MetronomeError::Store(format!("List pending: {e}")))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| MetronomeError::Store(format!("List pending: {e}")))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| MetronomeError::Store(format!("List pending: {e}")))
    }

    /// Write the observational fields after a fire. Engine-owned data;
    /// administrative requests never reach this.
    pub async fn update_run_state(
        &self,
        id: &str,
        last_run_at: DateTime<Utc>,
        status: RunStatus,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE job_definitions
             SET last_run_at = ?2, last_run_status = ?3, next_fire_at = ?4, updated_at = ?5
             WHERE id = ?1",
            rusqlite::params![
                id,
                last_run_at.to_rfc3339(),
                status.as_str(),
                next_fire_at.map(|t| t.to_rfc3339()),
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| MetronomeError::Store(format!("Run state: {e}")))?;
        Ok(())
    }

    /// Append one run-history row.
    pub async fn record_run(&self, run: &JobRun) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO job_runs (job_id, trigger_kind, fired_at, finished_at, status, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                run.job_id,
                run.trigger.as_str(),
                run.fired_at.to_rfc3339(),
                run.finished_at.map(|t| t.to_rfc3339()),
                run.status.as_str(),
                run.error,
            ],
        )
        .map_err(|e| MetronomeError::Store(format!("Record run: {e}")))?;
        Ok(())
    }

    /// Run history for a job, newest first.
    pub async fn recent_runs(&self, job_id: &str, limit: usize) -> Result<Vec<JobRun>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT job_id, trigger_kind, fired_at, finished_at, status, error
                 FROM job_runs WHERE job_id = ?1 ORDER BY id DESC LIMIT ?2",
            )
            .map_err(|e| MetronomeError::Store(format!("Runs: {e}")))?;
        let rows = stmt
            .query_map(rusqlite::params![job_id, limit as i64], |row| {
                Ok(JobRun {
                    job_id: row.get(0)?,
                    trigger: RunTrigger::parse(&row.get::<_, String>(1)?),
                    fired_at: parse_ts(&row.get::<_, String>(2)?),
                    finished_at: row.get::<_, Option<String>>(3)?.map(|s| parse_ts(&s)),
                    status: RunStatus::parse(&row.get::<_, String>(4)?),
                    error: row.get(5)?,
                })
            })
            .map_err(|e| MetronomeError::Store(format!("Runs: {e}")))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| MetronomeError::Store(format!("Runs: {e}")))
    }
}

const COLUMNS: &str = "id, name, job_group, schedule, handler_ref, enabled, pause_state, \
                       concurrency_policy, last_run_at, last_run_status, next_fire_at, \
                       projection_error, pending_deletion, created_at, updated_at";

fn row_to_def(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskDefinition> {
    Ok(TaskDefinition {
        id: row.get(0)?,
        name: row.get(1)?,
        group: row.get(2)?,
        schedule: row.get(3)?,
        handler_ref: row.get(4)?,
        enabled: row.get::<_, i32>(5)? != 0,
        pause_state: PauseState::parse(&row.get::<_, String>(6)?),
        concurrency_policy: ConcurrencyPolicy::parse(&row.get::<_, String>(7)?),
        last_run_at: row.get::<_, Option<String>>(8)?.map(|s| parse_ts(&s)),
        last_run_status: row
            .get::<_, Option<String>>(9)?
            .map(|s| RunStatus::parse(&s)),
        next_fire_at: row.get::<_, Option<String>>(10)?.map(|s| parse_ts(&s)),
        projection_error: row.get(11)?,
        pending_deletion: row.get::<_, i32>(12)? != 0,
        created_at: parse_ts(&row.get::<_, String>(13)?),
        updated_at: parse_ts(&row.get::<_, String>(14)?),
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::TaskDefinition;

    fn def(name: &str, group: &str) -> TaskDefinition {
        TaskDefinition::new(
            name,
            group,
            "@every 60s",
            "test:handler",
            ConcurrencyPolicy::SkipIfRunning,
            true,
        )
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = DefinitionStore::open_in_memory().unwrap();
        let d = def("backup", "daily");
        store.create(&d).await.unwrap();

        let loaded = store.get(&d.id).await.unwrap();
        assert_eq!(loaded.name, "backup");
        assert_eq!(loaded.group, "daily");
        assert_eq!(loaded.schedule, "@every 60s");
        assert!(loaded.enabled);

        let by_name = store.get_by_name("backup", "daily").await.unwrap().unwrap();
        assert_eq!(by_name.id, d.id);
        assert!(store.get_by_name("backup", "weekly").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_name_then_delete_frees_pair() {
        let store = DefinitionStore::open_in_memory().unwrap();
        let first = def("backup", "daily");
        store.create(&first).await.unwrap();

        let second = def("backup", "daily");
        let err = store.create(&second).await.unwrap_err();
        assert!(matches!(err, MetronomeError::DuplicateName { .. }));

        // Same name in another group is fine
        store.create(&def("backup", "weekly")).await.unwrap();

        // Deleting the first frees the pair for reuse
        store.delete(&first.id).await.unwrap();
        store.create(&def("backup", "daily")).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_and_conflict() {
        let store = DefinitionStore::open_in_memory().unwrap();
        let d = def("report", "weekly");
        store.create(&d).await.unwrap();

        let read = store.get(&d.id).await.unwrap();
        let patch = DefinitionPatch {
            schedule: Some("0 8 * * 1".into()),
            ..Default::default()
        };
        let updated = store
            .update(&d.id, &patch, Some(read.updated_at))
            .await
            .unwrap();
        assert_eq!(updated.schedule, "0 8 * * 1");

        // The stale token now loses
        let err = store
            .update(&d.id, &patch, Some(read.updated_at))
            .await
            .unwrap_err();
        assert!(matches!(err, MetronomeError::ConcurrencyConflict(_)));

        let err = store.update("nope", &patch, None).await.unwrap_err();
        assert!(matches!(err, MetronomeError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_enabled_filters() {
        let store = DefinitionStore::open_in_memory().unwrap();
        let live = def("a", "g");
        store.create(&live).await.unwrap();

        let mut disabled = def("b", "g");
        disabled.enabled = false;
        store.create(&disabled).await.unwrap();

        let mut paused = def("c", "g");
        paused.pause_state = PauseState::Paused;
        store.create(&paused).await.unwrap();

        let pending = def("d", "g");
        store.create(&pending).await.unwrap();
        store.mark_pending_deletion(&pending.id).await.unwrap();

        let listed = store.list_enabled().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, live.id);
        assert_eq!(store.list_all().await.unwrap().len(), 4);
        assert_eq!(store.list_pending_deletion().await.unwrap(), vec![pending.id]);
    }

    #[tokio::test]
    async fn test_projection_error_round_trip() {
        let store = DefinitionStore::open_in_memory().unwrap();
        let d = def("orphan", "g");
        store.create(&d).await.unwrap();

        store
            .set_projection_error(&d.id, "Handler not registered: x")
            .await
            .unwrap();
        let listed = store.list_projection_errors().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].projection_error.as_deref().unwrap().contains("x"));

        store.clear_projection_error(&d.id).await.unwrap();
        assert!(store.list_projection_errors().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_history() {
        let store = DefinitionStore::open_in_memory().unwrap();
        let d = def("history", "g");
        store.create(&d).await.unwrap();

        let now = Utc::now();
        for (trigger, status) in [
            (RunTrigger::Scheduled, RunStatus::Success),
            (RunTrigger::Manual, RunStatus::Failure),
        ] {
            store
                .record_run(&JobRun {
                    job_id: d.id.clone(),
                    trigger,
                    fired_at: now,
                    finished_at: Some(now),
                    status,
                    error: None,
                })
                .await
                .unwrap();
        }

        let runs = store.recent_runs(&d.id, 10).await.unwrap();
        assert_eq!(runs.len(), 2);
        // Newest first
        assert_eq!(runs[0].trigger, RunTrigger::Manual);
        assert_eq!(runs[0].status, RunStatus::Failure);
        assert_eq!(runs[1].trigger, RunTrigger::Scheduled);

        // Deleting the job clears its history
        store.delete(&d.id).await.unwrap();
        assert!(store.recent_runs(&d.id, 10).await.unwrap().is_empty());
    }
}
