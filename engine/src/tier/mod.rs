//! Skill/Tool Tier Resolver: Tier 0/1/2 classification with LRU-memoized
//! prompt resolution and usage-driven promotion/demotion.

mod lru;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use store::Db;

use crate::config::TierConfig;
use crate::domain::{Tier1Category, Tier2Entry, TierOverride, TierRegistry};
use lru::LruCache;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectToolsResult {
    pub tools: Vec<String>,
    pub skills: Vec<String>,
    pub mcps: Vec<String>,
    pub tier2_available: Vec<Tier2Entry>,
    pub metadata: serde_json::Value,
}

struct CompiledCategory {
    category: Tier1Category,
    pattern: Regex,
}

/// Classifies prompts into Tier 0/1/2 tool sets and learns promotions and
/// demotions from observed usage. `selectTools` is memoized by a keyword
/// fingerprint; `recordUsage`/`loadOnDemand` mutate the learned state.
pub struct TierResolver {
    db: Arc<Db>,
    config: TierConfig,
    tier0: Vec<String>,
    tier1: Vec<CompiledCategory>,
    tier2: Vec<Tier2Entry>,
    cache: Mutex<LruCache<String, SelectToolsResult>>,
    promotion_counts: Mutex<HashMap<(String, String), u32>>,
    usage_windows: Mutex<HashMap<(String, String), VecDeque<bool>>>,
}

impl TierResolver {
    pub fn new(db: Arc<Db>, config: TierConfig, registry: TierRegistry) -> Self {
        let tier1 = registry
            .tier1
            .into_iter()
            .filter_map(|category| {
                let pattern = Regex::new(&format!("(?i){}", category.pattern))
                    .map_err(|e| tracing::warn!(name = %category.name, error = %e, "invalid tier1 pattern, skipping"))
                    .ok()?;
                Some(CompiledCategory { category, pattern })
            })
            .collect();

        Self {
            db,
            cache: Mutex::new(LruCache::new(config.lru_capacity)),
            config,
            tier0: registry.tier0,
            tier1,
            tier2: registry.tier2,
            promotion_counts: Mutex::new(HashMap::new()),
            usage_windows: Mutex::new(HashMap::new()),
        }
    }

    fn fingerprint(prompt: &str, task_type: Option<&str>) -> String {
        let mut words: Vec<String> = prompt
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| w.to_string())
            .collect();
        words.sort();
        words.dedup();
        format!("{}::{}", task_type.unwrap_or(""), words.join("|"))
    }

    fn active_overrides(&self, task_type: Option<&str>, tier: u8) -> store::Result<Vec<TierOverride>> {
        let all: Vec<TierOverride> = self.db.all()?;
        Ok(all
            .into_iter()
            .filter(|o| o.tier == tier && task_type.map(|t| o.task_types.iter().any(|tt| tt == t)).unwrap_or(true))
            .collect())
    }

    /// Pure read, memoized by prompt fingerprint.
    pub fn select_tools(&self, prompt: &str, task_type: Option<&str>) -> store::Result<SelectToolsResult> {
        let key = Self::fingerprint(prompt, task_type);
        if let Some(cached) = self.cache.lock().unwrap().get(&key) {
            return Ok(cached);
        }

        let lowered = prompt.to_lowercase();
        let mut tools: Vec<String> = self.tier0.clone();
        let mut skills = Vec::new();
        let mut mcps = Vec::new();
        let mut matched_categories = Vec::new();

        for compiled in &self.tier1 {
            if compiled.pattern.is_match(&lowered) {
                matched_categories.push(compiled.category.name.clone());
                for t in &compiled.category.tools {
                    if !tools.contains(t) {
                        tools.push(t.clone());
                    }
                }
                skills.extend(compiled.category.skills.iter().cloned());
                mcps.extend(compiled.category.mcps.iter().cloned());
            }
        }

        let promoted = self.active_overrides(task_type, 1)?;
        let demoted_skills: Vec<String> = self.active_overrides(task_type, 2)?.into_iter().map(|o| o.skill).collect();
        for o in &promoted {
            if !skills.contains(&o.skill) {
                skills.push(o.skill.clone());
            }
        }

        tools.retain(|t| !demoted_skills.contains(t));
        tools.truncate(self.config.max_tier1_tools);

        skills.sort();
        skills.dedup();
        mcps.sort();
        mcps.dedup();

        let promoted_names: Vec<String> = promoted.iter().map(|o| o.skill.clone()).collect();
        let tier2_available: Vec<Tier2Entry> = self
            .tier2
            .iter()
            .filter(|e| !promoted_names.contains(&e.name))
            .cloned()
            .chain(demoted_skills.iter().map(|name| Tier2Entry {
                name: name.clone(),
                description: "demoted from tier 1".to_string(),
            }))
            .collect();

        let result = SelectToolsResult {
            tools,
            skills,
            mcps,
            tier2_available,
            metadata: serde_json::json!({ "matched_categories": matched_categories }),
        };

        self.cache.lock().unwrap().put(key, result.clone());
        Ok(result)
    }

    /// Tracks usage and may trigger a promotion when the counter crosses
    /// the configured threshold.
    pub fn load_on_demand(&self, skill_name: &str, task_type: Option<&str>) -> store::Result<Option<Tier2Entry>> {
        let Some(entry) = self.tier2.iter().find(|e| e.name == skill_name).cloned() else {
            return Ok(None);
        };
        let task_type = task_type.unwrap_or("").to_string();
        let mut counts = self.promotion_counts.lock().unwrap();
        let key = (skill_name.to_string(), task_type.clone());
        let count = counts.entry(key.clone()).or_insert(0);
        *count += 1;

        if *count >= self.config.promotion_threshold {
            *count = 0;
            drop(counts);
            let override_record = TierOverride::promote(skill_name, &task_type);
            self.db.put(&override_record)?;
            self.invalidate_cache();
            info!(skill_name, task_type, "promoted tier 2 skill to tier 1");
        }
        Ok(Some(entry))
    }

    /// Called after task completion. Demotes a Tier 1 entry whose in-window
    /// usage rate falls below the floor once the window is full.
    pub fn record_usage(&self, used_tools: &[String], task_type: &str) -> store::Result<()> {
        let tier1_names: Vec<String> = self
            .tier1
            .iter()
            .flat_map(|c| c.category.tools.iter().cloned())
            .chain(self.active_overrides(Some(task_type), 1)?.into_iter().map(|o| o.skill))
            .collect();

        let mut windows = self.usage_windows.lock().unwrap();
        let mut to_demote = Vec::new();
        for name in tier1_names {
            let key = (name.clone(), task_type.to_string());
            let window = windows.entry(key.clone()).or_insert_with(VecDeque::new);
            window.push_back(used_tools.contains(&name));
            if window.len() > self.config.demotion_window as usize {
                window.pop_front();
            }
            if window.len() == self.config.demotion_window as usize {
                let used_count = window.iter().filter(|&&u| u).count();
                let rate = used_count as f64 / window.len() as f64;
                if rate < self.config.demotion_usage_floor {
                    to_demote.push((name, task_type.to_string()));
                }
            }
        }
        drop(windows);

        for (skill, task_type) in to_demote {
            let override_record = TierOverride::demote(&skill, &task_type);
            self.db.put(&override_record)?;
            debug!(skill, task_type, "demoted tier 1 entry to tier 2");
            self.invalidate_cache();
        }
        Ok(())
    }

    fn invalidate_cache(&self) {
        *self.cache.lock().unwrap() = LruCache::new(self.config.lru_capacity);
    }

    pub fn describe_catalog(&self) -> Vec<Tier2Entry> {
        self.tier2.clone()
    }

    pub fn export_state(&self) -> store::Result<serde_json::Value> {
        let overrides: Vec<TierOverride> = self.db.all()?;
        Ok(serde_json::json!({ "overrides": overrides }))
    }

    pub fn import_state(&self, state: serde_json::Value) -> store::Result<()> {
        if let Some(overrides) = state.get("overrides").and_then(|v| v.as_array()) {
            for value in overrides {
                let o: TierOverride = serde_json::from_value(value.clone())?;
                self.db.put(&o)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> (TierResolver, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path().join("test.db")).unwrap();
        let registry = TierRegistry {
            tier0: vec!["read_file".to_string()],
            tier1: vec![Tier1Category {
                name: "git".to_string(),
                pattern: "git|commit|branch".to_string(),
                tools: vec!["git_status".to_string(), "git_diff".to_string()],
                skills: vec![],
                mcps: vec![],
            }],
            tier2: vec![Tier2Entry {
                name: "deploy".to_string(),
                description: "deployment helper".to_string(),
            }],
        };
        let config = TierConfig {
            max_tier1_tools: 15,
            promotion_threshold: 2,
            demotion_usage_floor: 0.05,
            demotion_window: 3,
            lru_capacity: 100,
        };
        (TierResolver::new(db, config, registry), dir)
    }

    #[test]
    fn select_tools_matches_tier1_category_case_insensitively() {
        let (resolver, _dir) = resolver();
        let result = resolver.select_tools("Please check GIT status", None).unwrap();
        assert!(result.tools.contains(&"read_file".to_string()));
        assert!(result.tools.contains(&"git_status".to_string()));
    }

    #[test]
    fn select_tools_is_memoized() {
        let (resolver, _dir) = resolver();
        let a = resolver.select_tools("git commit please", Some("coding")).unwrap();
        let b = resolver.select_tools("git commit please", Some("coding")).unwrap();
        assert_eq!(a.tools, b.tools);
    }

    #[test]
    fn load_on_demand_promotes_after_threshold() {
        let (resolver, _dir) = resolver();
        resolver.load_on_demand("deploy", Some("ops")).unwrap();
        resolver.load_on_demand("deploy", Some("ops")).unwrap();
        let overrides: Vec<TierOverride> = resolver.db.all().unwrap();
        assert!(overrides.iter().any(|o| o.skill == "deploy" && o.tier == 1));
    }

    #[test]
    fn promoted_tier2_skill_appears_in_select_tools_skills() {
        let (resolver, _dir) = resolver();
        for _ in 0..5 {
            resolver.load_on_demand("deploy", Some("ops")).unwrap();
        }
        let result = resolver.select_tools("nothing matching any tier 1 category", Some("ops")).unwrap();
        assert!(result.skills.contains(&"deploy".to_string()));
        assert!(!result.tools.contains(&"deploy".to_string()));
    }

    #[test]
    fn record_usage_demotes_after_window_below_floor() {
        let (resolver, _dir) = resolver();
        for _ in 0..3 {
            resolver.record_usage(&[], "coding").unwrap();
        }
        let overrides: Vec<TierOverride> = resolver.db.all().unwrap();
        assert!(overrides.iter().any(|o| o.skill == "git_status" && o.tier == 2));
    }
}
