//! Integration tests exercising the components wired together the way
//! the composition root does: store, Governor, Router, Tier Resolver,
//! Executor, Evolution Engine.

use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use engine::config::{ExecutorConfig, GovernorConfig, RouterConfig, TierConfig};
use engine::domain::{Period, QuotaType, RouterModelProfile, Tier1Category, Tier2Entry, TierRegistry};
use engine::error::{CoreError, Result};
use engine::evolution::EvolutionEngine;
use engine::executor::{Executor, StepDef, StepHandler, StepKind, StepOutcome, WorkflowDefinition};
use engine::governor::Governor;
use engine::router::{Router, TaskContext};
use engine::tier::TierResolver;

struct EchoHandler;

#[async_trait]
impl StepHandler for EchoHandler {
    async fn handle(&self, _step_id: &str, params: &serde_json::Value, _context: &serde_json::Value) -> Result<StepOutcome> {
        Ok(StepOutcome {
            result: params.clone(),
            fallback_applied: false,
        })
    }
}

struct AlwaysFails;

#[async_trait]
impl StepHandler for AlwaysFails {
    async fn handle(&self, _step_id: &str, _params: &serde_json::Value, _context: &serde_json::Value) -> Result<StepOutcome> {
        Err(CoreError::Validation("deliberately broken step".to_string()))
    }
}

fn open_db(dir: &TempDir) -> Arc<store::Db> {
    store::Db::open(dir.path().join("test.db")).expect("open store")
}

#[test]
fn router_falls_back_to_governor_flagged_provider_and_executor_runs_selected_model() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    let governor = Arc::new(Governor::new(db.clone(), GovernorConfig::default(), dir.path()));
    governor.configure_quota("anthropic", QuotaType::TokenBased, 100, Period::Day, None, None).unwrap();
    governor.record_usage("anthropic", "claude", "s1", 100, 0, 0.0).unwrap();

    let router_config = RouterConfig {
        primary_provider: "anthropic".to_string(),
        ..Default::default()
    };
    let router = Router::new(db.clone(), router_config, governor.clone());
    db.put(&RouterModelProfile::new("claude", "anthropic", "mid")).unwrap();
    db.put(&RouterModelProfile::new("gpt4", "openai", "mid")).unwrap();

    let selection = router
        .select_model(&TaskContext {
            complexity_class: "moderate".to_string(),
            session: "s1".to_string(),
            task: "draft-email".to_string(),
            ..Default::default()
        })
        .unwrap();

    assert_eq!(selection.model, "gpt4");
    assert!(selection.fallback_applied);

    router.record_outcome(&selection.model, true, Some(120.0)).unwrap();
    let profile = router.describe(&selection.model).unwrap().unwrap();
    assert!(profile.observation_count == 1);
}

#[tokio::test]
async fn tier_resolver_promotion_feeds_into_evolution_tier_feedback() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    let registry = TierRegistry {
        tier0: vec!["read_file".to_string()],
        tier1: vec![Tier1Category {
            name: "git".to_string(),
            pattern: "git".to_string(),
            tools: vec!["git_status".to_string()],
            skills: vec![],
            mcps: vec![],
        }],
        tier2: vec![Tier2Entry {
            name: "deploy".to_string(),
            description: "deployment helper".to_string(),
        }],
    };
    let tier_config = TierConfig {
        promotion_threshold: 1,
        ..Default::default()
    };
    let tier_resolver = TierResolver::new(db.clone(), tier_config, registry);
    tier_resolver.load_on_demand("deploy", Some("ops")).unwrap();

    let evolution = EvolutionEngine::new(db.clone(), 1);
    evolution.record_success("ops", &[], None).unwrap();
    let feedback = evolution.maybe_tier_feedback().unwrap().expect("feedback due every task");
    assert_eq!(feedback.promotions, 1);
    assert_eq!(feedback.demotions, 0);
}

#[tokio::test]
async fn executor_failure_feeds_evolution_engine_failure_path() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    let mut executor = Executor::new(db.clone(), ExecutorConfig { default_retries: 1, ..Default::default() });
    executor.register_handler("broken", Arc::new(AlwaysFails));
    executor.register_handler("echo", Arc::new(EchoHandler));

    let definition = WorkflowDefinition {
        name: "onboarding".to_string(),
        steps: vec![
            StepDef {
                step_id: "greet".to_string(),
                kind: StepKind::Atomic {
                    handler: "echo".to_string(),
                    params: serde_json::json!({ "greeting": "hi" }),
                },
            },
            StepDef {
                step_id: "provision".to_string(),
                kind: StepKind::Atomic {
                    handler: "broken".to_string(),
                    params: serde_json::json!({}),
                },
            },
        ],
    };

    let state = executor.run("run-onboarding", &definition, serde_json::json!({})).await.unwrap();
    assert_eq!(state.run.status, store::RunStatus::Failed);

    let evolution = EvolutionEngine::new(db.clone(), 100);
    evolution
        .record_failure("onboarding", &["systematic-debugging".to_string()], "missing-validation", None)
        .unwrap();

    let needed: engine::domain::Skill = db.get("onboarding::validate-inputs-early").unwrap().unwrap();
    assert_eq!(needed.success_rate, 0.6);
}
