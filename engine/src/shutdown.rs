//! Graceful shutdown: stop accepting new work, checkpoint, run cleanup
//! hooks in descending priority, checkpoint again, close the store. Does
//! not install any OS signal handler itself; the caller decides what
//! triggers shutdown and calls [`ShutdownCoordinator::run`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use store::Db;

pub type CleanupFn = Box<dyn Fn() -> store::Result<()> + Send + Sync>;

struct CleanupHook {
    name: String,
    priority: i32,
    run: CleanupFn,
}

/// Coordinates the shutdown sequence. `accepting` flips first so any
/// in-flight request dispatcher can check it and stop admitting new work
/// before the store underneath gets torn down.
pub struct ShutdownCoordinator {
    db: Arc<Db>,
    accepting: AtomicBool,
    hooks: Mutex<Vec<CleanupHook>>,
    #[allow(dead_code)]
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(db: Arc<Db>, timeout_secs: u64) -> Self {
        Self {
            db,
            accepting: AtomicBool::new(true),
            hooks: Mutex::new(Vec::new()),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn is_accepting_work(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Registers a cleanup hook. Hooks run in descending `priority` order;
    /// hooks with equal priority run in registration order.
    pub fn register_hook(&self, name: impl Into<String>, priority: i32, run: CleanupFn) {
        self.hooks.lock().unwrap().push(CleanupHook { name: name.into(), priority, run });
    }

    /// Runs the full shutdown sequence. Idempotent on the accept flag but
    /// not safe to call concurrently from two tasks.
    pub fn run(&self) -> store::Result<()> {
        self.accepting.store(false, Ordering::SeqCst);
        info!("shutdown: no longer accepting new work");

        self.db.checkpoint_and_truncate()?;

        let mut hooks = self.hooks.lock().unwrap();
        hooks.sort_by(|a, b| b.priority.cmp(&a.priority));
        for hook in hooks.iter() {
            info!(hook = %hook.name, priority = hook.priority, "running cleanup hook");
            if let Err(e) = (hook.run)() {
                warn!(hook = %hook.name, error = %e, "cleanup hook failed, continuing shutdown");
            }
        }
        drop(hooks);

        self.db.close()
    }
}
