//! Generic persistent state management over SQLite with WAL journaling.
//!
//! Two layers live here: a purpose-built set of tables for workflow runs,
//! steps, and audit events (the entities the durable-store contract names
//! directly), and a generic [`Record`]-keyed collection store for
//! everything else a caller wants to persist with derived, rebuildable
//! indexes. An [`atomic`] module handles the write-to-temp-and-rename
//! protocol used for sidecar state files that live outside the database.

mod atomic;
mod db;
mod error;
mod record;
mod workflow;

pub use atomic::{read_json, write_json_atomic};
pub use db::{complete_step_transactionally, now_ms, Db};
pub use error::{Result, StoreError};
pub use record::{Filter, FilterOp, IndexValue, Record};
pub use workflow::{AuditEvent, RunState, RunStatus, StepStatus, WorkflowRun, WorkflowStep};
