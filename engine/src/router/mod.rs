//! Model Router: composite scoring across candidate models with live
//! outcome tuning and quota-aware fallback.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use store::Db;

use crate::config::RouterConfig;
use crate::domain::{QuotaStatusKind, RouterModelProfile, RoutingDecision};
use crate::governor::Governor;

const W_PROVIDER: f64 = 0.25;
const W_TIER: f64 = 0.20;
const W_PREFERENCE: f64 = 0.25;
const W_SUCCESS: f64 = 0.20;
const STRENGTH_BONUS_PER_TAG: f64 = 0.1;
const STRENGTH_BONUS_CAP: f64 = 0.1;
const COST_PENALTY: f64 = 0.15;
const LATENCY_PENALTY: f64 = 0.15;
const DEFAULT_SUCCESS_PRIOR: f64 = 0.5;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskContext {
    pub complexity_class: String,
    pub requested_cost_tier: Option<String>,
    pub requested_strengths: Vec<String>,
    pub max_cost_tier: Option<String>,
    pub max_latency_ms: Option<f64>,
    pub session: String,
    pub task: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Selection {
    pub model: String,
    pub score: f64,
    pub reason: String,
    pub cost_tier: String,
    pub fallbacks: Vec<String>,
    pub fallback_applied: bool,
    pub quota_signal: Option<String>,
}

fn tier_rank(tier: &str) -> i32 {
    match tier {
        "low" => 0,
        "mid" => 1,
        "high" => 2,
        _ => 1,
    }
}

struct Scored {
    profile: RouterModelProfile,
    score: f64,
}

/// Scores candidate models against a task context, records outcomes with
/// exponential decay, and walks a quota-aware fallback chain before
/// emitting a selection.
pub struct Router {
    db: Arc<Db>,
    config: RouterConfig,
    governor: Arc<Governor>,
}

impl Router {
    pub fn new(db: Arc<Db>, config: RouterConfig, governor: Arc<Governor>) -> Self {
        Self { db, config, governor }
    }

    fn provider_weight(&self, provider: &str) -> f64 {
        if let Some(w) = self.config.provider_weights.get(provider) {
            return *w;
        }
        if provider == self.config.primary_provider {
            0.60
        } else {
            0.40
        }
    }

    fn score(&self, profile: &RouterModelProfile, ctx: &TaskContext, preference_list_len: usize) -> f64 {
        let provider_component = self.provider_weight(&profile.provider) * W_PROVIDER;

        let tier_distance = if let Some(requested) = &ctx.requested_cost_tier {
            (tier_rank(&profile.cost_tier) - tier_rank(requested)).unsigned_abs()
        } else {
            0
        };
        let tier_match = match tier_distance {
            0 => 1.0,
            1 => 0.5,
            _ => 0.0,
        };
        let tier_component = tier_match * W_TIER;

        let preference_component = profile
            .preference_positions
            .get(&ctx.complexity_class)
            .map(|&pos| {
                let list_len = preference_list_len.max(pos + 1) as f64;
                ((list_len - pos as f64) / list_len).max(0.0)
            })
            .unwrap_or(0.0)
            * W_PREFERENCE;

        let observed_weight = (profile.observation_count as f64 / self.config.observation_threshold as f64).min(1.0);
        let success_blend = DEFAULT_SUCCESS_PRIOR * (1.0 - observed_weight) + profile.success_rate * observed_weight;
        let success_component = success_blend * W_SUCCESS;

        let matched_strengths = ctx
            .requested_strengths
            .iter()
            .filter(|t| profile.strength_tags.contains(t))
            .count();
        let strength_bonus = (matched_strengths as f64 * STRENGTH_BONUS_PER_TAG).min(STRENGTH_BONUS_CAP);

        let mut penalty = 0.0;
        if let Some(max_tier) = &ctx.max_cost_tier {
            if tier_rank(&profile.cost_tier) > tier_rank(max_tier) {
                penalty += COST_PENALTY;
            }
        }
        if let Some(max_latency) = ctx.max_latency_ms {
            if profile.observation_count > 0 && profile.latency_avg_ms > max_latency {
                penalty += LATENCY_PENALTY;
            }
        }

        provider_component + tier_component + preference_component + success_component + strength_bonus - penalty
    }

    fn ranked_candidates(&self, ctx: &TaskContext) -> store::Result<Vec<Scored>> {
        let profiles: Vec<RouterModelProfile> = self.db.all()?;
        let preference_list_len = profiles
            .iter()
            .filter_map(|p| p.preference_positions.get(&ctx.complexity_class))
            .count()
            .max(1);
        let mut scored: Vec<Scored> = profiles
            .into_iter()
            .map(|profile| {
                let score = self.score(&profile, ctx, preference_list_len);
                Scored { profile, score }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.profile
                        .success_rate
                        .partial_cmp(&a.profile.success_rate)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| {
                    a.profile
                        .latency_avg_ms
                        .partial_cmp(&b.profile.latency_avg_ms)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        });
        Ok(scored)
    }

    /// Pure read: does not mutate live state. Walks the fallback chain when
    /// the top candidate's provider is quota-exhausted.
    pub fn select_model(&self, ctx: &TaskContext) -> store::Result<Selection> {
        let ranked = self.ranked_candidates(ctx)?;
        if ranked.is_empty() {
            return Ok(Selection {
                model: String::new(),
                score: 0.0,
                reason: "no router model profiles registered".to_string(),
                cost_tier: String::new(),
                fallbacks: Vec::new(),
                fallback_applied: false,
                quota_signal: None,
            });
        }

        let fallbacks: Vec<String> = ranked.iter().skip(1).map(|s| s.profile.model_id.clone()).collect();
        let top = &ranked[0];

        let mut chosen = top;
        let mut fallback_applied = false;
        let mut quota_signal = None;
        let mut reason = format!("top-scored candidate (score={:.3})", top.score);

        let top_status = self.governor.get_quota_status(&top.profile.provider)?;
        if top_status.status == QuotaStatusKind::Exhausted {
            if let Some(next) = ranked.iter().skip(1).find(|candidate| {
                self.governor
                    .get_quota_status(&candidate.profile.provider)
                    .map(|s| s.status != QuotaStatusKind::Exhausted)
                    .unwrap_or(false)
            }) {
                chosen = next;
                fallback_applied = true;
                reason = format!("provider {} exhausted, fell back to {}", top.profile.provider, next.profile.model_id);
            } else {
                reason = format!("provider {} exhausted and no non-exhausted fallback available", top.profile.provider);
            }
        } else if top_status.status == QuotaStatusKind::Critical {
            quota_signal = Some(format!("provider {} at critical quota usage", top.profile.provider));
        }

        let selection = Selection {
            model: chosen.profile.model_id.clone(),
            score: chosen.score,
            reason: reason.clone(),
            cost_tier: chosen.profile.cost_tier.clone(),
            fallbacks,
            fallback_applied,
            quota_signal: quota_signal.clone(),
        };

        let mut decision = RoutingDecision::new(&ctx.session, &ctx.task);
        decision.requested_category = ctx.requested_cost_tier.clone();
        decision.requested_skills = ctx.requested_strengths.clone();
        decision.original_selection = top.profile.model_id.clone();
        decision.final_selection = selection.model.clone();
        decision.fallback_applied = fallback_applied;
        decision.reason = reason;
        decision.quota_factors = quota_signal.map(|s| serde_json::json!({ "signal": s }));
        self.db.put(&decision)?;

        info!(model = %selection.model, score = selection.score, fallback_applied, "model selected");
        Ok(selection)
    }

    /// Mutates live stats and persists immediately.
    pub fn record_outcome(&self, model_id: &str, success: bool, latency_ms: Option<f64>) -> store::Result<()> {
        let mut profile: RouterModelProfile = self
            .db
            .get(model_id)?
            .unwrap_or_else(|| RouterModelProfile::new(model_id, "unknown", "mid"));
        profile.record_outcome(success, latency_ms);
        debug!(model_id, success, success_rate = profile.success_rate, "recorded routing outcome");
        self.db.put(&profile)
    }

    pub fn describe(&self, model_id: &str) -> store::Result<Option<RouterModelProfile>> {
        self.db.get(model_id)
    }

    pub fn list_models(&self) -> store::Result<Vec<RouterModelProfile>> {
        self.db.all()
    }

    pub fn export_state(&self) -> store::Result<serde_json::Value> {
        let profiles = self.list_models()?;
        Ok(serde_json::to_value(profiles)?)
    }

    pub fn import_state(&self, state: serde_json::Value) -> store::Result<()> {
        let profiles: Vec<RouterModelProfile> = serde_json::from_value(state)?;
        for profile in profiles {
            self.db.put(&profile)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> (Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path().join("test.db")).unwrap();
        let governor = Arc::new(Governor::new(db.clone(), Default::default(), dir.path()));
        let config = RouterConfig {
            primary_provider: "anthropic".to_string(),
            ..Default::default()
        };
        (Router::new(db, config, governor), dir)
    }

    #[test]
    fn select_model_prefers_primary_provider_and_exact_tier() {
        let (router, _dir) = router();
        let mut cheap = RouterModelProfile::new("haiku", "anthropic", "low");
        cheap.success_rate = 0.8;
        let mut costly = RouterModelProfile::new("gpt4", "openai", "high");
        costly.success_rate = 0.8;
        router.db.put(&cheap).unwrap();
        router.db.put(&costly).unwrap();

        let ctx = TaskContext {
            complexity_class: "simple".to_string(),
            requested_cost_tier: Some("low".to_string()),
            session: "s1".to_string(),
            task: "t1".to_string(),
            ..Default::default()
        };
        let selection = router.select_model(&ctx).unwrap();
        assert_eq!(selection.model, "haiku");
        assert!(!selection.fallback_applied);
    }

    #[test]
    fn select_model_falls_back_when_top_provider_exhausted() {
        let (router, _dir) = router();
        let mut preferred = RouterModelProfile::new("claude", "anthropic", "mid");
        preferred.success_rate = 0.9;
        let mut fallback = RouterModelProfile::new("gpt4", "openai", "mid");
        fallback.success_rate = 0.5;
        router.db.put(&preferred).unwrap();
        router.db.put(&fallback).unwrap();

        router
            .governor
            .configure_quota("anthropic", crate::domain::QuotaType::TokenBased, 100, crate::domain::Period::Day, None, None)
            .unwrap();
        router.governor.record_usage("anthropic", "claude", "s1", 100, 0, 0.0).unwrap();

        let ctx = TaskContext {
            complexity_class: "simple".to_string(),
            session: "s1".to_string(),
            task: "t1".to_string(),
            ..Default::default()
        };
        let selection = router.select_model(&ctx).unwrap();
        assert_eq!(selection.model, "gpt4");
        assert!(selection.fallback_applied);
    }

    #[test]
    fn record_outcome_persists_ewma_update() {
        let (router, _dir) = router();
        router.db.put(&RouterModelProfile::new("m1", "anthropic", "mid")).unwrap();
        router.record_outcome("m1", true, Some(150.0)).unwrap();
        let profile = router.describe("m1").unwrap().unwrap();
        assert!((profile.success_rate - 0.6).abs() < 1e-9);
    }
}
