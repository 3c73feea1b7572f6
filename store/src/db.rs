//! SQLite-backed durable store: WAL journaling, checkpoint-and-truncate,
//! transactional workflow operations, and a generic record collection.

use std::collections::HashMap;
use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::record::{Filter, IndexValue, Record};
use crate::workflow::{AuditEvent, RunState, RunStatus, StepStatus, WorkflowRun, WorkflowStep};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(600);

const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        "CREATE TABLE workflow_runs (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            status TEXT NOT NULL,
            input TEXT NOT NULL,
            context TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE TABLE workflow_steps (
            run_id TEXT NOT NULL,
            step_id TEXT NOT NULL,
            status TEXT NOT NULL,
            result TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (run_id, step_id)
        );
        CREATE TABLE audit_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            timestamp INTEGER NOT NULL
        );
        CREATE INDEX idx_audit_events_run_id ON audit_events(run_id);",
    ),
    (
        2,
        "CREATE TABLE records (
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            data TEXT NOT NULL,
            indexed TEXT NOT NULL,
            PRIMARY KEY (collection, id)
        );
        CREATE INDEX idx_records_collection ON records(collection);",
    ),
];

/// Returns the current Unix timestamp in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

struct CheckpointTimer {
    stop: mpsc::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

/// The durable store. A single process owns one `Db` for a given path; the
/// OS-level lockfile enforcing that is the caller's responsibility (the
/// store itself only guards against concurrent in-process writers).
pub struct Db {
    conn: Mutex<Connection>,
    timer: Mutex<Option<CheckpointTimer>>,
}

impl Db {
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")?;

        Self::migrate(&conn)?;

        let db = Arc::new(Self {
            conn: Mutex::new(conn),
            timer: Mutex::new(None),
        });

        // Checkpoint-and-truncate immediately after schema init.
        db.checkpoint_and_truncate()?;
        db.arm_checkpoint_timer();

        Ok(db)
    }

    fn migrate(conn: &Connection) -> Result<()> {
        let current: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
        for (version, sql) in MIGRATIONS {
            if *version > current {
                debug!(version, "applying migration");
                conn.execute_batch(sql)?;
                conn.execute_batch(&format!("PRAGMA user_version = {}", version))?;
            }
        }
        Ok(())
    }

    /// `PRAGMA wal_checkpoint(TRUNCATE)`, invoked at startup, on the
    /// background timer, and once more immediately before close.
    pub fn checkpoint_and_truncate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }

    fn arm_checkpoint_timer(self: &Arc<Self>) {
        let (stop_tx, stop_rx) = mpsc::channel();
        let weak = Arc::downgrade(self);
        let handle = std::thread::spawn(move || loop {
            match stop_rx.recv_timeout(CHECKPOINT_INTERVAL) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    let Some(db) = weak.upgrade() else { break };
                    if let Err(e) = db.checkpoint_and_truncate() {
                        warn!(error = %e, "periodic checkpoint failed");
                    }
                }
            }
        });
        *self.timer.lock().unwrap() = Some(CheckpointTimer {
            stop: stop_tx,
            handle: Some(handle),
        });
    }

    /// Disarms the periodic checkpoint timer, performs a final checkpoint,
    /// and releases the connection. Leaving the timer armed after close is
    /// treated as a defect, so this must be called on every shutdown path.
    pub fn close(&self) -> Result<()> {
        if let Some(mut timer) = self.timer.lock().unwrap().take() {
            let _ = timer.stop.send(());
            if let Some(handle) = timer.handle.take() {
                let _ = handle.join();
            }
        }
        self.checkpoint_and_truncate()?;
        info!("store closed");
        Ok(())
    }

    /// Run `f` inside a single transaction. `f`'s `Err` or a panic rolls the
    /// transaction back; its `Ok` commits.
    pub fn transaction<T>(&self, f: impl FnOnce(&rusqlite::Transaction) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Run `f` inside a named savepoint nested in the caller's transaction
    /// context. On error, only this savepoint rolls back.
    pub fn savepoint<T>(&self, name: &str, f: impl FnOnce(&rusqlite::Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.savepoint_with_name(name)?;
        let result = f(&*tx)?;
        tx.commit()?;
        Ok(result)
    }

    // ---- workflow run / step / audit contract (§4.1) ----

    /// Inserts a run in status=running. If `id` already exists this is a
    /// no-op (idempotent create) and returns the existing run's id.
    pub fn create_run(&self, id: &str, name: &str, input: serde_json::Value) -> Result<String> {
        self.transaction(|tx| {
            let exists: bool = tx.query_row(
                "SELECT 1 FROM workflow_runs WHERE id = ?1",
                [id],
                |_| Ok(true),
            ).unwrap_or(false);
            if exists {
                return Ok(id.to_string());
            }
            let now = now_ms();
            tx.execute(
                "INSERT INTO workflow_runs (id, name, status, input, context, created_at, updated_at)
                 VALUES (?1, ?2, 'running', ?3, '{}', ?4, ?4)",
                rusqlite::params![id, name, input.to_string(), now],
            )?;
            log_event_tx(tx, id, "workflow_started", serde_json::json!({ "name": name }))?;
            Ok(id.to_string())
        })
    }

    /// Monotone transition running -> {completed, failed}. Attempting an
    /// invalid transition is an error, not a silent no-op.
    pub fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<()> {
        self.transaction(|tx| {
            let current: String = tx
                .query_row("SELECT status FROM workflow_runs WHERE id = ?1", [run_id], |r| r.get(0))
                .map_err(|_| StoreError::NotFound {
                    collection: "workflow_runs".into(),
                    id: run_id.to_string(),
                })?;
            let current = RunStatus::parse(&current).unwrap_or(RunStatus::Running);
            if !current.can_transition_to(status) {
                return Err(StoreError::InvalidTransition {
                    collection: "workflow_runs".into(),
                    id: run_id.to_string(),
                    from: current.as_str().into(),
                    to: status.as_str().into(),
                });
            }
            tx.execute(
                "UPDATE workflow_runs SET status = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![status.as_str(), now_ms(), run_id],
            )?;
            log_event_tx(tx, run_id, &format!("workflow_{}", status.as_str()), serde_json::json!({}))?;
            Ok(())
        })
    }

    pub fn update_run_context(&self, run_id: &str, context: serde_json::Value) -> Result<()> {
        self.transaction(|tx| {
            let changed = tx.execute(
                "UPDATE workflow_runs SET context = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![context.to_string(), now_ms(), run_id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound {
                    collection: "workflow_runs".into(),
                    id: run_id.to_string(),
                });
            }
            Ok(())
        })
    }

    /// Inserts on first call, updates thereafter (upsert by primary key).
    pub fn upsert_step(
        &self,
        run_id: &str,
        step_id: &str,
        status: StepStatus,
        result: Option<serde_json::Value>,
        attempts: u32,
    ) -> Result<()> {
        self.transaction(|tx| {
            upsert_step_tx(tx, run_id, step_id, status, result, attempts)
        })
    }

    /// Returns a consistent snapshot of a run and its steps, steps ordered
    /// by step_id.
    pub fn get_run_state(&self, run_id: &str) -> Result<RunState> {
        let conn = self.conn.lock().unwrap();
        let run = conn
            .query_row(
                "SELECT id, name, status, input, context, created_at, updated_at
                 FROM workflow_runs WHERE id = ?1",
                [run_id],
                row_to_run,
            )
            .map_err(|_| StoreError::NotFound {
                collection: "workflow_runs".into(),
                id: run_id.to_string(),
            })?;

        let mut stmt = conn.prepare(
            "SELECT run_id, step_id, status, result, attempts, updated_at
             FROM workflow_steps WHERE run_id = ?1 ORDER BY step_id ASC",
        )?;
        let steps = stmt
            .query_map([run_id], row_to_step)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(RunState { run, steps })
    }

    /// Append-only audit log write; must not fail silently, so errors
    /// propagate rather than being swallowed.
    pub fn log_event(&self, run_id: &str, event_type: &str, payload: serde_json::Value) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO audit_events (run_id, event_type, payload, timestamp) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![run_id, event_type, payload.to_string(), now_ms()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn audit_events(&self, run_id: &str) -> Result<Vec<AuditEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, run_id, event_type, payload, timestamp FROM audit_events
             WHERE run_id = ?1 ORDER BY id ASC",
        )?;
        let events = stmt
            .query_map([run_id], |r| {
                Ok(AuditEvent {
                    id: r.get(0)?,
                    run_id: r.get(1)?,
                    event_type: r.get(2)?,
                    payload: serde_json::from_str(&r.get::<_, String>(3)?).unwrap_or(serde_json::Value::Null),
                    timestamp: r.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    /// Deletes audit events older than `retention_ms`. Exposed but not
    /// scheduled by default; the caller decides the cadence. Returns the
    /// number of rows removed.
    pub fn vacuum_older_than(&self, retention_ms: i64) -> Result<usize> {
        let cutoff = now_ms() - retention_ms;
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute("DELETE FROM audit_events WHERE timestamp < ?1", rusqlite::params![cutoff])?;
        Ok(removed)
    }

    // ---- generic record collection ----

    pub fn put<T: Record>(&self, record: &T) -> Result<()> {
        let data = serde_json::to_string(record)?;
        let indexed = serde_json::to_string(&record.indexed_fields())?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO records (collection, id, updated_at, data, indexed) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(collection, id) DO UPDATE SET updated_at = excluded.updated_at,
                data = excluded.data, indexed = excluded.indexed",
            rusqlite::params![T::collection_name(), record.id(), record.updated_at(), data, indexed],
        )?;
        Ok(())
    }

    pub fn get<T: Record>(&self, id: &str) -> Result<Option<T>> {
        let conn = self.conn.lock().unwrap();
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM records WHERE collection = ?1 AND id = ?2",
                rusqlite::params![T::collection_name(), id],
                |r| r.get(0),
            )
            .ok();
        match data {
            Some(d) => Ok(Some(serde_json::from_str(&d)?)),
            None => Ok(None),
        }
    }

    pub fn delete<T: Record>(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM records WHERE collection = ?1 AND id = ?2",
            rusqlite::params![T::collection_name(), id],
        )?;
        Ok(())
    }

    pub fn all<T: Record>(&self) -> Result<Vec<T>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT data FROM records WHERE collection = ?1")?;
        let rows = stmt
            .query_map([T::collection_name()], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|d| serde_json::from_str(&d).map_err(StoreError::from))
            .collect()
    }

    /// Loads the full collection and filters in-process against the
    /// rebuildable indexed-fields map (collections here, skills, quotas,
    /// model profiles, are small enough that a dynamic SQL builder would be
    /// premature).
    pub fn query<T: Record>(&self, filters: &[Filter]) -> Result<Vec<T>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT data, indexed FROM records WHERE collection = ?1")?;
        let rows = stmt
            .query_map([T::collection_name()], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut out = Vec::new();
        for (data, indexed) in rows {
            let fields: HashMap<String, IndexValue> = serde_json::from_str(&indexed)?;
            if filters.iter().all(|f| f.matches(&fields)) {
                out.push(serde_json::from_str(&data)?);
            }
        }
        Ok(out)
    }
}

fn upsert_step_tx(
    tx: &rusqlite::Transaction,
    run_id: &str,
    step_id: &str,
    status: StepStatus,
    result: Option<serde_json::Value>,
    attempts: u32,
) -> Result<()> {
    tx.execute(
        "INSERT INTO workflow_steps (run_id, step_id, status, result, attempts, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(run_id, step_id) DO UPDATE SET status = excluded.status,
            result = excluded.result, attempts = excluded.attempts, updated_at = excluded.updated_at",
        rusqlite::params![
            run_id,
            step_id,
            status.as_str(),
            result.map(|r| r.to_string()),
            attempts,
            now_ms()
        ],
    )?;
    Ok(())
}

fn log_event_tx(tx: &rusqlite::Transaction, run_id: &str, event_type: &str, payload: serde_json::Value) -> Result<()> {
    tx.execute(
        "INSERT INTO audit_events (run_id, event_type, payload, timestamp) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![run_id, event_type, payload.to_string(), now_ms()],
    )?;
    Ok(())
}

/// Exposed so the engine's executor can fold a step completion, its audit
/// event, and a context update into one transaction (§4.5 "transactional
/// checkpointing").
pub fn complete_step_transactionally(
    tx: &rusqlite::Transaction,
    run_id: &str,
    step_id: &str,
    result: serde_json::Value,
    attempts: u32,
    fallback_applied: bool,
) -> Result<()> {
    upsert_step_tx(tx, run_id, step_id, StepStatus::Completed, Some(result), attempts)?;
    log_event_tx(tx, run_id, "step_completed", serde_json::json!({ "step_id": step_id }))?;
    if fallback_applied {
        log_event_tx(tx, run_id, "quota_fallback", serde_json::json!({ "step_id": step_id }))?;
        let context: String = tx.query_row(
            "SELECT context FROM workflow_runs WHERE id = ?1",
            [run_id],
            |r| r.get(0),
        )?;
        let mut context: serde_json::Value = serde_json::from_str(&context).unwrap_or(serde_json::json!({}));
        context["last_quota_fallback"] = serde_json::json!(now_ms());
        tx.execute(
            "UPDATE workflow_runs SET context = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![context.to_string(), now_ms(), run_id],
        )?;
    }
    Ok(())
}

fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<WorkflowRun> {
    Ok(WorkflowRun {
        id: row.get(0)?,
        name: row.get(1)?,
        status: RunStatus::parse(&row.get::<_, String>(2)?).unwrap_or(RunStatus::Running),
        input: serde_json::from_str(&row.get::<_, String>(3)?).unwrap_or(serde_json::Value::Null),
        context: serde_json::from_str(&row.get::<_, String>(4)?).unwrap_or(serde_json::Value::Null),
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn row_to_step(row: &rusqlite::Row) -> rusqlite::Result<WorkflowStep> {
    Ok(WorkflowStep {
        run_id: row.get(0)?,
        step_id: row.get(1)?,
        status: StepStatus::parse(&row.get::<_, String>(2)?).unwrap_or(StepStatus::Pending),
        result: row
            .get::<_, Option<String>>(3)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        attempts: row.get(4)?,
        updated_at: row.get(5)?,
    })
}
