//! Workflow Executor: drives an ordered list of typed steps to a terminal
//! status with crash-safe checkpointing, retry, and bounded parallel-for
//! fan-out.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use tracing::{debug, info, warn};

use store::{Db, RunState, StepStatus};

use crate::config::ExecutorConfig;
use crate::error::{CoreError, Result};

/// Handler-level outcome: the result map shallow-merged into the run
/// context, plus whether the handler applied a quota fallback.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepOutcome {
    pub result: serde_json::Value,
    pub fallback_applied: bool,
}

#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn handle(&self, step_id: &str, params: &serde_json::Value, context: &serde_json::Value) -> Result<StepOutcome>;
}

#[derive(Debug, Clone)]
pub enum StepKind {
    Atomic {
        handler: String,
        params: serde_json::Value,
    },
    ParallelFor {
        /// Dot-separated path into the run context addressing the list to
        /// iterate, e.g. `"batch.items"`.
        items_path: String,
        child_handler: String,
        child_params: serde_json::Value,
        concurrency: Option<usize>,
    },
}

#[derive(Debug, Clone)]
pub struct StepDef {
    pub step_id: String,
    pub kind: StepKind,
}

#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub name: String,
    pub steps: Vec<StepDef>,
}

fn path_get<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    path.split('.').try_fold(value, |acc, part| acc.get(part))
}

/// Shallow-merges `patch`'s top-level keys into `target`, which must be an
/// object (or becomes one).
fn shallow_merge(target: &mut serde_json::Value, patch: &serde_json::Value) {
    if !target.is_object() {
        *target = serde_json::json!({});
    }
    if let serde_json::Value::Object(patch_map) = patch {
        let target_map = target.as_object_mut().unwrap();
        for (k, v) in patch_map {
            target_map.insert(k.clone(), v.clone());
        }
    }
}

/// Drives one run's steps to completion and spawns bounded parallel-for
/// fan-out. Owns no per-run state beyond what the durable store persists,
/// so any instance can resume any run.
pub struct Executor {
    db: Arc<Db>,
    config: ExecutorConfig,
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl Executor {
    pub fn new(db: Arc<Db>, config: ExecutorConfig) -> Self {
        Self {
            db,
            config,
            handlers: HashMap::new(),
        }
    }

    pub fn register_handler(&mut self, name: impl Into<String>, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    fn handler(&self, name: &str) -> Result<Arc<dyn StepHandler>> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::Config(format!("no handler registered for {name}")))
    }

    fn existing_attempts(state: &RunState, step_id: &str) -> (u32, Option<StepStatus>) {
        state
            .steps
            .iter()
            .find(|s| s.step_id == step_id)
            .map(|s| (s.attempts, Some(s.status)))
            .unwrap_or((0, None))
    }

    /// Runs `handler_name` with bounded retry and exponential backoff,
    /// persisting the terminal state of this step attempt transactionally
    /// on success.
    async fn execute_with_retry(
        &self,
        run_id: &str,
        step_id: &str,
        handler_name: &str,
        params: &serde_json::Value,
        context: &serde_json::Value,
        mut attempts: u32,
    ) -> Result<StepOutcome> {
        let handler = self.handler(handler_name)?;

        loop {
            attempts += 1;
            self.db.upsert_step(run_id, step_id, StepStatus::Running, None, attempts)?;

            match handler.handle(step_id, params, context).await {
                Ok(outcome) => {
                    self.db.transaction(|tx| {
                        store::complete_step_transactionally(
                            tx,
                            run_id,
                            step_id,
                            outcome.result.clone(),
                            attempts,
                            outcome.fallback_applied,
                        )
                    })?;
                    return Ok(outcome);
                }
                Err(e) if attempts < self.config.default_retries && e.recoverable() => {
                    let backoff_ms = self.config.default_backoff_ms * 2u64.pow(attempts - 1);
                    warn!(run_id, step_id, attempts, error = %e, backoff_ms, "step attempt failed, retrying");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
                Err(e) => {
                    self.db.upsert_step(run_id, step_id, StepStatus::Failed, None, attempts)?;
                    self.db.log_event(
                        run_id,
                        "step_failed",
                        serde_json::json!({ "step_id": step_id, "error": e.to_string() }),
                    )?;
                    return Err(e);
                }
            }
        }
    }

    async fn run_parallel_for(
        &self,
        run_id: &str,
        step_id: &str,
        items_path: &str,
        child_handler: &str,
        child_params: &serde_json::Value,
        concurrency: Option<usize>,
        context: &serde_json::Value,
        attempts: u32,
    ) -> Result<()> {
        let items = path_get(context, items_path)
            .and_then(|v| v.as_array())
            .cloned()
            .ok_or_else(|| CoreError::Validation(format!("parallel-for path {items_path} is not a list")))?;

        let concurrency = concurrency.unwrap_or(self.config.default_parallel_concurrency).max(1);

        self.db.upsert_step(run_id, step_id, StepStatus::Running, None, attempts)?;

        let results: Vec<Result<StepOutcome>> = stream::iter(items.into_iter().enumerate())
            .map(|(i, item)| {
                let child_step_id = format!("{step_id}:{i}");
                let mut params = child_params.clone();
                shallow_merge(&mut params, &serde_json::json!({ "item": item }));
                async move {
                    self.execute_with_retry(run_id, &child_step_id, child_handler, &params, context, 0)
                        .await
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let completed = results.iter().filter(|r| r.is_ok()).count();
        let failed = results.len() - completed;

        if failed > 0 {
            self.db.upsert_step(
                run_id,
                step_id,
                StepStatus::Failed,
                Some(serde_json::json!({ "children_completed": completed, "children_failed": failed })),
                attempts,
            )?;
            return Err(CoreError::Internal(format!("{failed} of {} parallel-for children failed", results.len())));
        }

        self.db.transaction(|tx| {
            store::complete_step_transactionally(
                tx,
                run_id,
                step_id,
                serde_json::json!({ "children_completed": completed }),
                attempts,
                false,
            )
        })?;
        Ok(())
    }

    /// Drives `definition` to completion, resuming from persisted step
    /// state when `run_id` already exists. Idempotent: calling twice with
    /// the same input is a no-op past the point already reached.
    pub async fn run(&self, run_id: &str, definition: &WorkflowDefinition, input: serde_json::Value) -> Result<RunState> {
        self.db.create_run(run_id, &definition.name, input)?;

        let mut run_failed = false;

        for step in &definition.steps {
            let state = self.db.get_run_state(run_id)?;
            let (attempts, status) = Self::existing_attempts(&state, &step.step_id);

            if status == Some(StepStatus::Completed) {
                if let StepKind::Atomic { .. } = &step.kind {
                    if let Some(result) = state.steps.iter().find(|s| s.step_id == step.step_id).and_then(|s| s.result.clone()) {
                        let mut context = state.run.context.clone();
                        shallow_merge(&mut context, &result);
                        self.db.update_run_context(run_id, context)?;
                    }
                }
                debug!(run_id, step_id = %step.step_id, "step already completed, skipping");
                continue;
            }

            let context = self.db.get_run_state(run_id)?.run.context;

            let outcome = match &step.kind {
                StepKind::Atomic { handler, params } => {
                    match self.execute_with_retry(run_id, &step.step_id, handler, params, &context, attempts).await {
                        Ok(outcome) => {
                            let mut merged = context.clone();
                            shallow_merge(&mut merged, &outcome.result);
                            self.db.update_run_context(run_id, merged)?;
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                }
                StepKind::ParallelFor {
                    items_path,
                    child_handler,
                    child_params,
                    concurrency,
                } => {
                    self.run_parallel_for(
                        run_id,
                        &step.step_id,
                        items_path,
                        child_handler,
                        child_params,
                        *concurrency,
                        &context,
                        attempts,
                    )
                    .await
                }
            };

            if let Err(e) = outcome {
                run_failed = true;
                warn!(run_id, step_id = %step.step_id, error = %e, "step failed, aborting run");
                break;
            }
        }

        if run_failed {
            self.db.update_run_status(run_id, store::RunStatus::Failed)?;
        } else {
            self.db.update_run_status(run_id, store::RunStatus::Completed)?;
            info!(run_id, "run completed");
        }

        Ok(self.db.get_run_state(run_id)?)
    }

    /// Read-only companion to `getRunState`, enriched with per-step attempt
    /// counts for surfacing in user-visible failure messages.
    pub fn describe_run(&self, run_id: &str) -> Result<serde_json::Value> {
        let state = self.db.get_run_state(run_id)?;
        let steps: Vec<_> = state
            .steps
            .iter()
            .map(|s| {
                serde_json::json!({
                    "step_id": s.step_id,
                    "status": s.status.as_str(),
                    "attempts": s.attempts,
                })
            })
            .collect();
        Ok(serde_json::json!({
            "run_id": state.run.id,
            "status": state.run.status.as_str(),
            "steps": steps,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct AlwaysSucceeds;

    #[async_trait]
    impl StepHandler for AlwaysSucceeds {
        async fn handle(&self, _step_id: &str, params: &serde_json::Value, _context: &serde_json::Value) -> Result<StepOutcome> {
            Ok(StepOutcome {
                result: params.clone(),
                fallback_applied: false,
            })
        }
    }

    struct FailsNTimes {
        remaining: AtomicU32,
    }

    #[async_trait]
    impl StepHandler for FailsNTimes {
        async fn handle(&self, _step_id: &str, _params: &serde_json::Value, _context: &serde_json::Value) -> Result<StepOutcome> {
            if self.remaining.fetch_sub(1, Ordering::SeqCst) > 0 {
                Err(CoreError::Network("transient".to_string()))
            } else {
                Ok(StepOutcome::default())
            }
        }
    }

    fn executor() -> (Executor, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path().join("test.db")).unwrap();
        (Executor::new(db, ExecutorConfig { default_backoff_ms: 1, ..Default::default() }), dir)
    }

    #[tokio::test]
    async fn atomic_step_merges_result_into_context() {
        let (mut executor, _dir) = executor();
        executor.register_handler("greet", Arc::new(AlwaysSucceeds));
        let definition = WorkflowDefinition {
            name: "demo".to_string(),
            steps: vec![StepDef {
                step_id: "s1".to_string(),
                kind: StepKind::Atomic {
                    handler: "greet".to_string(),
                    params: serde_json::json!({ "greeting": "hi" }),
                },
            }],
        };
        let state = executor.run("run-1", &definition, serde_json::json!({})).await.unwrap();
        assert_eq!(state.run.status, store::RunStatus::Completed);
        assert_eq!(state.run.context["greeting"], "hi");
    }

    #[tokio::test]
    async fn retries_transient_failures_up_to_limit() {
        let (mut executor, _dir) = executor();
        executor.register_handler("flaky", Arc::new(FailsNTimes { remaining: AtomicU32::new(2) }));
        let definition = WorkflowDefinition {
            name: "demo".to_string(),
            steps: vec![StepDef {
                step_id: "s1".to_string(),
                kind: StepKind::Atomic {
                    handler: "flaky".to_string(),
                    params: serde_json::json!({}),
                },
            }],
        };
        let state = executor.run("run-2", &definition, serde_json::json!({})).await.unwrap();
        assert_eq!(state.run.status, store::RunStatus::Completed);
    }

    #[tokio::test]
    async fn parallel_for_runs_all_children_without_cancelling_siblings() {
        let (mut executor, _dir) = executor();
        executor.register_handler("greet", Arc::new(AlwaysSucceeds));
        let definition = WorkflowDefinition {
            name: "demo".to_string(),
            steps: vec![StepDef {
                step_id: "fanout".to_string(),
                kind: StepKind::ParallelFor {
                    items_path: "batch".to_string(),
                    child_handler: "greet".to_string(),
                    child_params: serde_json::json!({}),
                    concurrency: Some(2),
                },
            }],
        };
        let state = executor
            .run("run-3", &definition, serde_json::json!({ "batch": [1, 2, 3] }))
            .await
            .unwrap();
        assert_eq!(state.run.status, store::RunStatus::Completed);
        assert_eq!(state.steps.iter().filter(|s| s.step_id.starts_with("fanout:")).count(), 3);
    }
}
