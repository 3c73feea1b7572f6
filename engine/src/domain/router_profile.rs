//! Router model profiles and the append-only routing decision audit log.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use store::{IndexValue, Record};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterModelProfile {
    pub model_id: String,
    pub provider: String,
    pub cost_tier: String,
    /// complexity class -> index in that class's preference list.
    pub preference_positions: HashMap<String, usize>,
    pub strength_tags: Vec<String>,
    pub success_rate: f64,
    pub latency_avg_ms: f64,
    pub observation_count: u32,
    pub updated_at: i64,
}

impl RouterModelProfile {
    pub fn new(model_id: impl Into<String>, provider: impl Into<String>, cost_tier: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            provider: provider.into(),
            cost_tier: cost_tier.into(),
            preference_positions: HashMap::new(),
            strength_tags: Vec::new(),
            success_rate: 0.5,
            latency_avg_ms: 0.0,
            observation_count: 0,
            updated_at: store::now_ms(),
        }
    }

    /// EWMA update with outcome encoded as 1.0/0.0; α=0.2.
    pub fn record_outcome(&mut self, success: bool, latency_ms: Option<f64>) {
        const ALPHA: f64 = 0.2;
        let outcome = if success { 1.0 } else { 0.0 };
        self.success_rate = ALPHA * outcome + (1.0 - ALPHA) * self.success_rate;
        if let Some(latency) = latency_ms {
            self.latency_avg_ms = if self.observation_count == 0 {
                latency
            } else {
                ALPHA * latency + (1.0 - ALPHA) * self.latency_avg_ms
            };
        }
        self.observation_count += 1;
        self.updated_at = store::now_ms();
    }
}

impl Record for RouterModelProfile {
    fn id(&self) -> &str {
        &self.model_id
    }
    fn updated_at(&self) -> i64 {
        self.updated_at
    }
    fn collection_name() -> &'static str {
        "router_model_profiles"
    }
    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut m = HashMap::new();
        m.insert("provider".to_string(), IndexValue::String(self.provider.clone()));
        m.insert("cost_tier".to_string(), IndexValue::String(self.cost_tier.clone()));
        m
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub decision_id: String,
    pub session: String,
    pub task: String,
    pub requested_category: Option<String>,
    pub requested_skills: Vec<String>,
    pub original_selection: String,
    pub final_selection: String,
    pub quota_factors: Option<serde_json::Value>,
    pub fallback_applied: bool,
    pub reason: String,
    pub timestamp: i64,
}

impl RoutingDecision {
    pub fn new(session: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            decision_id: uuid::Uuid::now_v7().to_string(),
            session: session.into(),
            task: task.into(),
            requested_category: None,
            requested_skills: Vec::new(),
            original_selection: String::new(),
            final_selection: String::new(),
            quota_factors: None,
            fallback_applied: false,
            reason: String::new(),
            timestamp: store::now_ms(),
        }
    }
}

impl Record for RoutingDecision {
    fn id(&self) -> &str {
        &self.decision_id
    }
    fn updated_at(&self) -> i64 {
        self.timestamp
    }
    fn collection_name() -> &'static str {
        "routing_decisions"
    }
    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut m = HashMap::new();
        m.insert("session".to_string(), IndexValue::String(self.session.clone()));
        m.insert("timestamp".to_string(), IndexValue::Int(self.timestamp));
        m
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_success_moves_toward_one() {
        let mut profile = RouterModelProfile::new("m1", "anthropic", "mid");
        profile.success_rate = 0.5;
        profile.record_outcome(true, Some(200.0));
        assert!((profile.success_rate - 0.6).abs() < 1e-9);
    }

    #[test]
    fn ewma_failure_applies_point_eight_times_rate() {
        let mut profile = RouterModelProfile::new("m1", "anthropic", "mid");
        profile.success_rate = 0.5;
        profile.record_outcome(false, None);
        assert!((profile.success_rate - 0.4).abs() < 1e-9);
    }
}
