//! Persistent store for sessions, workflow state, snapshots, recovery logs,
//! and repository links.
//!
//! SQLite is the durable source of truth; the in-process sandbox registry is
//! only a cache on top of it. Every query is scoped by `workspace_id` so one
//! tenant can never read or mutate another tenant's rows. Status and phase
//! transitions use conditional updates (`UPDATE ... WHERE` on the expected
//! value, checked via affected-row counts) so concurrent writers are rejected
//! instead of silently reordered.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};

use crate::models::*;

/// Rows kept per session in the sync-operation ring.
const SYNC_RING_SIZE: i64 = 20;

/// Async-safe handle to the orchestrator database.
///
/// Wraps `StoreDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<StoreDb>>,
}

impl DbHandle {
    pub fn new(db: StoreDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&StoreDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct StoreDb {
    conn: Connection,
}

/// Aggregate statistics over the recovery log.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryStats {
    pub attempts: u64,
    pub successes: u64,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
}

impl StoreDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    workspace_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'active',
                    sandbox_id TEXT,
                    workdir TEXT,
                    recovery_count INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    last_activity_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS workflow_states (
                    session_id TEXT PRIMARY KEY REFERENCES sessions(id) ON DELETE CASCADE,
                    workspace_id TEXT NOT NULL,
                    current_phase INTEGER NOT NULL,
                    phases TEXT NOT NULL,
                    artifacts TEXT NOT NULL DEFAULT '{}'
                );

                CREATE TABLE IF NOT EXISTS snapshots (
                    id TEXT PRIMARY KEY,
                    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                    workspace_id TEXT NOT NULL,
                    chat_history TEXT NOT NULL,
                    requirements TEXT NOT NULL,
                    workflow_state TEXT NOT NULL,
                    artifacts TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS recovery_log (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT NOT NULL,
                    workspace_id TEXT NOT NULL,
                    attempt INTEGER NOT NULL,
                    session_restored INTEGER NOT NULL DEFAULT 0,
                    sandbox_reconnected INTEGER NOT NULL DEFAULT 0,
                    workflow_restored INTEGER NOT NULL DEFAULT 0,
                    context_restored INTEGER NOT NULL DEFAULT 0,
                    errors TEXT NOT NULL DEFAULT '[]',
                    warnings TEXT NOT NULL DEFAULT '[]',
                    duration_ms INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS repository_links (
                    session_id TEXT PRIMARY KEY REFERENCES sessions(id) ON DELETE CASCADE,
                    workspace_id TEXT NOT NULL,
                    owner_repo TEXT NOT NULL,
                    default_branch TEXT NOT NULL DEFAULT 'main',
                    html_url TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS sync_operations (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT NOT NULL,
                    workspace_id TEXT NOT NULL,
                    direction TEXT NOT NULL,
                    commit_sha TEXT,
                    conflicts TEXT NOT NULL DEFAULT '[]',
                    outcome TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_sessions_workspace ON sessions(workspace_id);
                CREATE INDEX IF NOT EXISTS idx_snapshots_session
                    ON snapshots(session_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_recovery_log_session
                    ON recovery_log(session_id, id);
                CREATE INDEX IF NOT EXISTS idx_sync_operations_session
                    ON sync_operations(session_id, id);
                ",
            )
            .context("Failed to create tables")?;

        Ok(())
    }

    // ── Session CRUD ──────────────────────────────────────────────────

    pub fn create_session(&self, workspace_id: &str, name: &str) -> Result<Session> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        self.conn
            .execute(
                "INSERT INTO sessions (id, workspace_id, name, status, created_at, last_activity_at)
                 VALUES (?1, ?2, ?3, 'active', ?4, ?4)",
                params![id, workspace_id, name, now.to_rfc3339()],
            )
            .context("Failed to insert session")?;
        self.get_session(&id, workspace_id)?
            .context("Session vanished after insert")
    }

    pub fn get_session(&self, session_id: &str, workspace_id: &str) -> Result<Option<Session>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, workspace_id, name, status, sandbox_id, workdir, recovery_count,
                    created_at, last_activity_at
             FROM sessions WHERE id = ?1 AND workspace_id = ?2",
        )?;
        let mut rows = stmt.query(params![session_id, workspace_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_session(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_sessions(&self, workspace_id: &str) -> Result<Vec<Session>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, workspace_id, name, status, sandbox_id, workdir, recovery_count,
                    created_at, last_activity_at
             FROM sessions WHERE workspace_id = ?1 ORDER BY created_at",
        )?;
        let mut rows = stmt.query(params![workspace_id])?;
        let mut sessions = Vec::new();
        while let Some(row) = rows.next()? {
            sessions.push(row_to_session(row)?);
        }
        Ok(sessions)
    }

    /// Compare-and-swap on session status. Returns false (no write) when the
    /// current status doesn't match `expected`.
    pub fn update_session_status(
        &self,
        session_id: &str,
        workspace_id: &str,
        expected: &SessionStatus,
        new: &SessionStatus,
    ) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE sessions SET status = ?1
             WHERE id = ?2 AND workspace_id = ?3 AND status = ?4",
            params![new.as_str(), session_id, workspace_id, expected.as_str()],
        )?;
        Ok(changed == 1)
    }

    pub fn set_session_status(
        &self,
        session_id: &str,
        workspace_id: &str,
        status: &SessionStatus,
    ) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE sessions SET status = ?1 WHERE id = ?2 AND workspace_id = ?3",
            params![status.as_str(), session_id, workspace_id],
        )?;
        Ok(changed == 1)
    }

    pub fn bind_sandbox(
        &self,
        session_id: &str,
        workspace_id: &str,
        sandbox_id: &str,
        workdir: &str,
    ) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE sessions SET sandbox_id = ?1, workdir = ?2
             WHERE id = ?3 AND workspace_id = ?4",
            params![sandbox_id, workdir, session_id, workspace_id],
        )?;
        Ok(changed == 1)
    }

    pub fn clear_sandbox(&self, session_id: &str, workspace_id: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE sessions SET sandbox_id = NULL, workdir = NULL
             WHERE id = ?1 AND workspace_id = ?2",
            params![session_id, workspace_id],
        )?;
        Ok(changed == 1)
    }

    pub fn touch_session(&self, session_id: &str, workspace_id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE sessions SET last_activity_at = ?1 WHERE id = ?2 AND workspace_id = ?3",
            params![Utc::now().to_rfc3339(), session_id, workspace_id],
        )?;
        Ok(())
    }

    /// Bump `recovery_count` and return the new value.
    pub fn increment_recovery_count(&self, session_id: &str, workspace_id: &str) -> Result<u32> {
        self.conn.execute(
            "UPDATE sessions SET recovery_count = recovery_count + 1
             WHERE id = ?1 AND workspace_id = ?2",
            params![session_id, workspace_id],
        )?;
        let count: u32 = self.conn.query_row(
            "SELECT recovery_count FROM sessions WHERE id = ?1 AND workspace_id = ?2",
            params![session_id, workspace_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Explicit archival is the only way a session row is destroyed.
    pub fn archive_session(&self, session_id: &str, workspace_id: &str) -> Result<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM sessions WHERE id = ?1 AND workspace_id = ?2",
            params![session_id, workspace_id],
        )?;
        Ok(deleted == 1)
    }

    /// Sessions inactive past the threshold that still have a bound sandbox.
    /// Pure query — nothing here schedules recovery.
    pub fn sessions_needing_recovery(
        &self,
        workspace_id: &str,
        inactive_threshold_secs: i64,
    ) -> Result<Vec<Session>> {
        let cutoff = Utc::now() - chrono::Duration::seconds(inactive_threshold_secs);
        let mut stmt = self.conn.prepare(
            "SELECT id, workspace_id, name, status, sandbox_id, workdir, recovery_count,
                    created_at, last_activity_at
             FROM sessions
             WHERE workspace_id = ?1 AND status = 'active'
               AND sandbox_id IS NOT NULL AND last_activity_at < ?2",
        )?;
        let mut rows = stmt.query(params![workspace_id, cutoff.to_rfc3339()])?;
        let mut sessions = Vec::new();
        while let Some(row) = rows.next()? {
            sessions.push(row_to_session(row)?);
        }
        Ok(sessions)
    }

    // ── Workflow state ────────────────────────────────────────────────

    pub fn init_workflow_state(&self, state: &WorkflowState) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO workflow_states (session_id, workspace_id, current_phase, phases, artifacts)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    state.session_id,
                    state.workspace_id,
                    state.current_phase,
                    serde_json::to_string(&state.phases)?,
                    serde_json::to_string(&state.artifacts)?,
                ],
            )
            .context("Failed to insert workflow state")?;
        Ok(())
    }

    pub fn get_workflow_state(
        &self,
        session_id: &str,
        workspace_id: &str,
    ) -> Result<Option<WorkflowState>> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id, workspace_id, current_phase, phases, artifacts
             FROM workflow_states WHERE session_id = ?1 AND workspace_id = ?2",
        )?;
        let mut rows = stmt.query(params![session_id, workspace_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_workflow_state(row)?)),
            None => Ok(None),
        }
    }

    /// Save phases/artifacts without moving `current_phase`. Used for
    /// progress merges and gate bookkeeping.
    pub fn save_workflow_state(&self, state: &WorkflowState) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE workflow_states SET phases = ?1, artifacts = ?2
             WHERE session_id = ?3 AND workspace_id = ?4 AND current_phase = ?5",
            params![
                serde_json::to_string(&state.phases)?,
                serde_json::to_string(&state.artifacts)?,
                state.session_id,
                state.workspace_id,
                state.current_phase,
            ],
        )?;
        Ok(changed == 1)
    }

    /// Conditional phase advance: writes the whole state only if the stored
    /// `current_phase` still equals `expected_phase`. A concurrent advance
    /// loses the race and gets `false`.
    pub fn advance_workflow_phase(
        &self,
        state: &WorkflowState,
        expected_phase: u32,
    ) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE workflow_states SET current_phase = ?1, phases = ?2, artifacts = ?3
             WHERE session_id = ?4 AND workspace_id = ?5 AND current_phase = ?6",
            params![
                state.current_phase,
                serde_json::to_string(&state.phases)?,
                serde_json::to_string(&state.artifacts)?,
                state.session_id,
                state.workspace_id,
                expected_phase,
            ],
        )?;
        Ok(changed == 1)
    }

    /// Overwrite the stored state unconditionally. Only the recovery path
    /// uses this, when rolling back to a snapshot.
    pub fn restore_workflow_state(&self, state: &WorkflowState) -> Result<()> {
        self.conn.execute(
            "INSERT INTO workflow_states (session_id, workspace_id, current_phase, phases, artifacts)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(session_id) DO UPDATE SET
                 current_phase = excluded.current_phase,
                 phases = excluded.phases,
                 artifacts = excluded.artifacts",
            params![
                state.session_id,
                state.workspace_id,
                state.current_phase,
                serde_json::to_string(&state.phases)?,
                serde_json::to_string(&state.artifacts)?,
            ],
        )?;
        Ok(())
    }

    // ── Snapshots ─────────────────────────────────────────────────────

    pub fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO snapshots
                     (id, session_id, workspace_id, chat_history, requirements,
                      workflow_state, artifacts, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    snapshot.id,
                    snapshot.session_id,
                    snapshot.workspace_id,
                    serde_json::to_string(&snapshot.chat_history)?,
                    snapshot.requirements,
                    serde_json::to_string(&snapshot.workflow_state)?,
                    serde_json::to_string(&snapshot.artifacts)?,
                    snapshot.created_at.to_rfc3339(),
                ],
            )
            .context("Failed to insert snapshot")?;
        Ok(())
    }

    pub fn latest_snapshot(
        &self,
        session_id: &str,
        workspace_id: &str,
    ) -> Result<Option<Snapshot>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, session_id, workspace_id, chat_history, requirements,
                    workflow_state, artifacts, created_at
             FROM snapshots WHERE session_id = ?1 AND workspace_id = ?2
             ORDER BY created_at DESC, id DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![session_id, workspace_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_snapshot(row)?)),
            None => Ok(None),
        }
    }

    pub fn get_snapshot(&self, snapshot_id: &str, workspace_id: &str) -> Result<Option<Snapshot>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, session_id, workspace_id, chat_history, requirements,
                    workflow_state, artifacts, created_at
             FROM snapshots WHERE id = ?1 AND workspace_id = ?2",
        )?;
        let mut rows = stmt.query(params![snapshot_id, workspace_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_snapshot(row)?)),
            None => Ok(None),
        }
    }

    // ── Recovery log ──────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn append_recovery_log(
        &self,
        session_id: &str,
        workspace_id: &str,
        attempt: u32,
        flags: (bool, bool, bool, bool),
        errors: &[String],
        warnings: &[String],
        duration_ms: u64,
    ) -> Result<RecoveryLog> {
        let (session_restored, sandbox_reconnected, workflow_restored, context_restored) = flags;
        let now = Utc::now();
        self.conn.execute(
            "INSERT INTO recovery_log
                 (session_id, workspace_id, attempt, session_restored, sandbox_reconnected,
                  workflow_restored, context_restored, errors, warnings, duration_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                session_id,
                workspace_id,
                attempt,
                session_restored as i64,
                sandbox_reconnected as i64,
                workflow_restored as i64,
                context_restored as i64,
                serde_json::to_string(errors)?,
                serde_json::to_string(warnings)?,
                duration_ms as i64,
                now.to_rfc3339(),
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        Ok(RecoveryLog {
            id,
            session_id: session_id.to_string(),
            workspace_id: workspace_id.to_string(),
            attempt,
            session_restored,
            sandbox_reconnected,
            workflow_restored,
            context_restored,
            errors: errors.to_vec(),
            warnings: warnings.to_vec(),
            duration_ms,
            created_at: now,
        })
    }

    /// Recovery attempts for a session, most recent first.
    pub fn recovery_history(
        &self,
        session_id: &str,
        workspace_id: &str,
    ) -> Result<Vec<RecoveryLog>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, session_id, workspace_id, attempt, session_restored,
                    sandbox_reconnected, workflow_restored, context_restored,
                    errors, warnings, duration_ms, created_at
             FROM recovery_log WHERE session_id = ?1 AND workspace_id = ?2
             ORDER BY id DESC",
        )?;
        let mut rows = stmt.query(params![session_id, workspace_id])?;
        let mut logs = Vec::new();
        while let Some(row) = rows.next()? {
            logs.push(row_to_recovery_log(row)?);
        }
        Ok(logs)
    }

    pub fn recovery_stats(&self, workspace_id: &str) -> Result<RecoveryStats> {
        let (attempts, successes, avg_duration_ms): (i64, i64, Option<f64>) =
            self.conn.query_row(
                "SELECT COUNT(*),
                        SUM(CASE WHEN session_restored = 1 AND workflow_restored = 1
                            THEN 1 ELSE 0 END),
                        AVG(duration_ms)
                 FROM recovery_log WHERE workspace_id = ?1",
                params![workspace_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                        row.get(2)?,
                    ))
                },
            )?;
        let attempts = attempts.max(0) as u64;
        let successes = successes.max(0) as u64;
        Ok(RecoveryStats {
            attempts,
            successes,
            success_rate: if attempts == 0 {
                0.0
            } else {
                successes as f64 / attempts as f64
            },
            avg_duration_ms: avg_duration_ms.unwrap_or(0.0),
        })
    }

    // ── Repository links & sync ring ──────────────────────────────────

    pub fn upsert_repository_link(&self, link: &RepositoryLink) -> Result<()> {
        self.conn.execute(
            "INSERT INTO repository_links
                 (session_id, workspace_id, owner_repo, default_branch, html_url, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(session_id) DO UPDATE SET
                 owner_repo = excluded.owner_repo,
                 default_branch = excluded.default_branch,
                 html_url = excluded.html_url",
            params![
                link.session_id,
                link.workspace_id,
                link.owner_repo,
                link.default_branch,
                link.html_url,
                link.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_repository_link(
        &self,
        session_id: &str,
        workspace_id: &str,
    ) -> Result<Option<RepositoryLink>> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id, workspace_id, owner_repo, default_branch, html_url, created_at
             FROM repository_links WHERE session_id = ?1 AND workspace_id = ?2",
        )?;
        let mut rows = stmt.query(params![session_id, workspace_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(RepositoryLink {
                session_id: row.get(0)?,
                workspace_id: row.get(1)?,
                owner_repo: row.get(2)?,
                default_branch: row.get(3)?,
                html_url: row.get(4)?,
                created_at: parse_ts(&row.get::<_, String>(5)?)?,
            })),
            None => Ok(None),
        }
    }

    /// Append a sync operation and trim the per-session ring.
    pub fn record_sync_operation(
        &self,
        session_id: &str,
        workspace_id: &str,
        direction: SyncDirection,
        commit_sha: Option<&str>,
        conflicts: &[String],
        outcome: SyncOutcome,
    ) -> Result<SyncOperation> {
        let now = Utc::now();
        self.conn.execute(
            "INSERT INTO sync_operations
                 (session_id, workspace_id, direction, commit_sha, conflicts, outcome, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session_id,
                workspace_id,
                direction.as_str(),
                commit_sha,
                serde_json::to_string(conflicts)?,
                outcome.as_str(),
                now.to_rfc3339(),
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.conn.execute(
            "DELETE FROM sync_operations
             WHERE session_id = ?1 AND workspace_id = ?2 AND id NOT IN (
                 SELECT id FROM sync_operations
                 WHERE session_id = ?1 AND workspace_id = ?2
                 ORDER BY id DESC LIMIT ?3)",
            params![session_id, workspace_id, SYNC_RING_SIZE],
        )?;
        Ok(SyncOperation {
            id,
            session_id: session_id.to_string(),
            workspace_id: workspace_id.to_string(),
            direction,
            commit_sha: commit_sha.map(|s| s.to_string()),
            conflicts: conflicts.to_vec(),
            outcome,
            created_at: now,
        })
    }

    pub fn recent_sync_operations(
        &self,
        session_id: &str,
        workspace_id: &str,
        limit: u32,
    ) -> Result<Vec<SyncOperation>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, session_id, workspace_id, direction, commit_sha, conflicts,
                    outcome, created_at
             FROM sync_operations WHERE session_id = ?1 AND workspace_id = ?2
             ORDER BY id DESC LIMIT ?3",
        )?;
        let mut rows = stmt.query(params![session_id, workspace_id, limit])?;
        let mut ops = Vec::new();
        while let Some(row) = rows.next()? {
            let direction: String = row.get(3)?;
            let outcome: String = row.get(6)?;
            let conflicts: String = row.get(5)?;
            ops.push(SyncOperation {
                id: row.get(0)?,
                session_id: row.get(1)?,
                workspace_id: row.get(2)?,
                direction: SyncDirection::from_str(&direction)
                    .map_err(|e| anyhow::anyhow!(e))?,
                commit_sha: row.get(4)?,
                conflicts: serde_json::from_str(&conflicts)?,
                outcome: SyncOutcome::from_str(&outcome).map_err(|e| anyhow::anyhow!(e))?,
                created_at: parse_ts(&row.get::<_, String>(7)?)?,
            });
        }
        Ok(ops)
    }
}

// ── Row mapping helpers ───────────────────────────────────────────────

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp in store: {}", s))?
        .with_timezone(&Utc))
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<Session> {
    let status: String = row.get(3)?;
    Ok(Session {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        name: row.get(2)?,
        status: SessionStatus::from_str(&status).map_err(|e| anyhow::anyhow!(e))?,
        sandbox_id: row.get(4)?,
        workdir: row.get(5)?,
        recovery_count: row.get(6)?,
        created_at: parse_ts(&row.get::<_, String>(7)?)?,
        last_activity_at: parse_ts(&row.get::<_, String>(8)?)?,
    })
}

fn row_to_workflow_state(row: &rusqlite::Row<'_>) -> Result<WorkflowState> {
    let phases: String = row.get(3)?;
    let artifacts: String = row.get(4)?;
    Ok(WorkflowState {
        session_id: row.get(0)?,
        workspace_id: row.get(1)?,
        current_phase: row.get(2)?,
        phases: serde_json::from_str(&phases).context("Corrupt phases payload")?,
        artifacts: serde_json::from_str(&artifacts).context("Corrupt artifacts payload")?,
    })
}

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> Result<Snapshot> {
    let chat_history: String = row.get(3)?;
    let workflow_state: String = row.get(5)?;
    let artifacts: String = row.get(6)?;
    Ok(Snapshot {
        id: row.get(0)?,
        session_id: row.get(1)?,
        workspace_id: row.get(2)?,
        chat_history: serde_json::from_str(&chat_history).context("Corrupt chat history")?,
        requirements: row.get(4)?,
        workflow_state: serde_json::from_str(&workflow_state)
            .context("Corrupt workflow state in snapshot")?,
        artifacts: serde_json::from_str(&artifacts).context("Corrupt artifacts in snapshot")?,
        created_at: parse_ts(&row.get::<_, String>(7)?)?,
    })
}

fn row_to_recovery_log(row: &rusqlite::Row<'_>) -> Result<RecoveryLog> {
    let errors: String = row.get(8)?;
    let warnings: String = row.get(9)?;
    Ok(RecoveryLog {
        id: row.get(0)?,
        session_id: row.get(1)?,
        workspace_id: row.get(2)?,
        attempt: row.get(3)?,
        session_restored: row.get::<_, i64>(4)? != 0,
        sandbox_reconnected: row.get::<_, i64>(5)? != 0,
        workflow_restored: row.get::<_, i64>(6)? != 0,
        context_restored: row.get::<_, i64>(7)? != 0,
        errors: serde_json::from_str(&errors)?,
        warnings: serde_json::from_str(&warnings)?,
        duration_ms: row.get::<_, i64>(10)?.max(0) as u64,
        created_at: parse_ts(&row.get::<_, String>(11)?)?,
    })
}
