//! Tier registry configuration and runtime overrides.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use store::{IndexValue, Record};

/// Tier 1 category: a named, compiled pattern plus the tools/skills/mcps it
/// brings in when the pattern matches a prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tier1Category {
    pub name: String,
    pub pattern: String,
    pub tools: Vec<String>,
    pub skills: Vec<String>,
    pub mcps: Vec<String>,
}

/// Tier 2 catalog entry: a named skill with a brief description, loadable
/// on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tier2Entry {
    pub name: String,
    pub description: String,
}

/// Static configuration: Tier 0 always-loaded set, Tier 1 pattern-matched
/// categories, Tier 2 on-demand catalog. Loaded from config, not persisted
/// as a `Record` itself ([`TierOverride`] is the learned, persisted part).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierRegistry {
    pub tier0: Vec<String>,
    pub tier1: Vec<Tier1Category>,
    pub tier2: Vec<Tier2Entry>,
}

/// A runtime-learned promotion or demotion. Promotes a Tier 2 entry to
/// Tier 1 for named task types, or demotes a Tier 1 entry to Tier 2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierOverride {
    pub skill: String,
    pub tier: u8,
    pub task_types: Vec<String>,
    pub timestamp: i64,
    pub reason: String,
}

impl TierOverride {
    pub fn promote(skill: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            skill: skill.into(),
            tier: 1,
            task_types: vec![task_type.into()],
            timestamp: store::now_ms(),
            reason: "promotion threshold reached".to_string(),
        }
    }

    pub fn demote(skill: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            skill: skill.into(),
            tier: 2,
            task_types: vec![task_type.into()],
            timestamp: store::now_ms(),
            reason: "usage rate below demotion floor".to_string(),
        }
    }
}

impl Record for TierOverride {
    fn id(&self) -> &str {
        &self.skill
    }
    fn updated_at(&self) -> i64 {
        self.timestamp
    }
    fn collection_name() -> &'static str {
        "tier_overrides"
    }
    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut m = HashMap::new();
        m.insert("tier".to_string(), IndexValue::Int(self.tier as i64));
        m
    }
}
