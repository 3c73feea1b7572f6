//! Configuration loading: explicit path -> project-local file -> user config
//! file -> built-in defaults, each layer deep-merged, with environment
//! variable overrides applied last.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

const ENV_PREFIX: &str = "OPENCODE_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub performance: PerformanceConfig,
    pub governor: GovernorConfig,
    pub router: RouterConfig,
    pub tier: TierConfig,
    pub executor: ExecutorConfig,
    pub evolution: EvolutionConfig,
    pub storage: StorageConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            performance: PerformanceConfig::default(),
            governor: GovernorConfig::default(),
            router: RouterConfig::default(),
            tier: TierConfig::default(),
            executor: ExecutorConfig::default(),
            evolution: EvolutionConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PerformanceConfig {
    pub concurrency: ConcurrencyConfig,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            concurrency: ConcurrencyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConcurrencyConfig {
    pub default_limit: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { default_limit: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct GovernorConfig {
    /// Fallback maximum for models with no entry in `model_maxima`.
    pub default_session_max_tokens: u64,
    pub model_maxima: HashMap<String, u64>,
    pub warn_threshold: f64,
    pub error_threshold: f64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            default_session_max_tokens: 100_000,
            model_maxima: HashMap::new(),
            warn_threshold: 0.75,
            error_threshold: 0.90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RouterConfig {
    pub primary_provider: String,
    pub provider_weights: HashMap<String, f64>,
    /// Accepted under both `intent_routing` and `intentRouting` on read
    /// (§9 open question); canonical form on write is `intent_routing`.
    #[serde(alias = "intentRouting")]
    pub intent_routing: bool,
    pub observation_threshold: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            primary_provider: "anthropic".to_string(),
            provider_weights: HashMap::new(),
            intent_routing: true,
            observation_threshold: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TierConfig {
    pub max_tier1_tools: usize,
    pub promotion_threshold: u32,
    pub demotion_usage_floor: f64,
    pub demotion_window: u32,
    pub lru_capacity: usize,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            max_tier1_tools: 15,
            promotion_threshold: 5,
            demotion_usage_floor: 0.05,
            demotion_window: 50,
            lru_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ExecutorConfig {
    pub default_retries: u32,
    pub default_backoff_ms: u64,
    pub default_parallel_concurrency: usize,
    pub shutdown_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_retries: 3,
            default_backoff_ms: 1000,
            default_parallel_concurrency: 5,
            shutdown_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EvolutionConfig {
    /// How many recorded outcomes between emitted tier feedback summaries.
    pub tier_feedback_every: u32,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self { tier_feedback_every: 20 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StorageConfig {
    pub db_path: PathBuf,
    pub sidecar_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".orchestrator/store.db"),
            sidecar_dir: PathBuf::from(".orchestrator/state"),
        }
    }
}

impl Config {
    /// Fallback chain: explicit path -> `.orchestrator.yml` (project-local)
    /// -> `~/.config/orchestrator/orchestrator.yml` (user) -> defaults. Each
    /// layer is deep-merged over the previous one; environment variables
    /// have the final word.
    pub fn load(config_path: Option<&Path>) -> Self {
        let mut merged = serde_json::to_value(Config::default()).unwrap_or(serde_json::json!({}));

        if let Some(path) = config_path {
            match load_layer(path) {
                Ok(Some(layer)) => deep_merge(&mut merged, layer),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to load explicit config path"),
            }
        } else {
            let project_local = PathBuf::from(".orchestrator.yml");
            match load_layer(&project_local) {
                Ok(Some(layer)) => deep_merge(&mut merged, layer),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "failed to load project-local config"),
            }

            if let Some(config_dir) = dirs::config_dir() {
                let user_path = config_dir.join("orchestrator").join("orchestrator.yml");
                match load_layer(&user_path) {
                    Ok(Some(layer)) => deep_merge(&mut merged, layer),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "failed to load user config"),
                }
            }
        }

        apply_env_overrides(&mut merged, ENV_PREFIX);

        serde_json::from_value(merged).unwrap_or_else(|e| {
            warn!(error = %e, "config did not deserialize cleanly, falling back to defaults");
            Config::default()
        })
    }
}

fn load_layer(path: &Path) -> std::io::Result<Option<serde_json::Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)?;
    let value: serde_json::Value = serde_yaml::from_str(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

/// Merges `b` into `a` in place: objects merge key-by-key recursively,
/// any other type (including arrays) is a full replacement.
fn deep_merge(a: &mut serde_json::Value, b: serde_json::Value) {
    match (a, b) {
        (serde_json::Value::Object(a_map), serde_json::Value::Object(b_map)) => {
            for (k, v) in b_map {
                deep_merge(a_map.entry(k).or_insert(serde_json::Value::Null), v);
            }
        }
        (a_slot, b_val) => *a_slot = b_val,
    }
}

/// `OPENCODE_PERFORMANCE_CONCURRENCY_DEFAULTLIMIT=10` ->
/// `config.performance.concurrency.defaultLimit = 10`. Values are
/// JSON-parsed with string fallback.
fn apply_env_overrides(merged: &mut serde_json::Value, prefix: &str) {
    for (key, raw) in std::env::vars() {
        let Some(rest) = key.strip_prefix(prefix) else { continue };
        let path: Vec<String> = rest.split('_').map(|s| s.to_lowercase()).collect();
        if path.is_empty() {
            continue;
        }
        let value = serde_json::from_str::<serde_json::Value>(&raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.clone()));
        set_path(merged, &path, value);
    }
}

fn set_path(root: &mut serde_json::Value, path: &[String], value: serde_json::Value) {
    if !root.is_object() {
        *root = serde_json::json!({});
    }
    let obj = root.as_object_mut().unwrap();
    if path.len() == 1 {
        obj.insert(path[0].clone(), value);
        return;
    }
    let child = obj.entry(path[0].clone()).or_insert(serde_json::json!({}));
    set_path(child, &path[1..], value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_governor_values() {
        let cfg = Config::default();
        assert_eq!(cfg.governor.default_session_max_tokens, 100_000);
        assert_eq!(cfg.governor.warn_threshold, 0.75);
    }

    #[test]
    fn deep_merge_overlays_nested_keys_without_clobbering_siblings() {
        let mut a = serde_json::json!({ "governor": { "warn_threshold": 0.75, "error_threshold": 0.9 } });
        let b = serde_json::json!({ "governor": { "warn_threshold": 0.6 } });
        deep_merge(&mut a, b);
        assert_eq!(a["governor"]["warn_threshold"], 0.6);
        assert_eq!(a["governor"]["error_threshold"], 0.9);
    }

    #[test]
    fn env_override_sets_nested_path() {
        let mut merged = serde_json::json!({ "performance": { "concurrency": { "defaultlimit": 5 } } });
        unsafe {
            std::env::set_var("OPENCODE_PERFORMANCE_CONCURRENCY_DEFAULTLIMIT", "10");
        }
        apply_env_overrides(&mut merged, ENV_PREFIX);
        unsafe {
            std::env::remove_var("OPENCODE_PERFORMANCE_CONCURRENCY_DEFAULTLIMIT");
        }
        assert_eq!(merged["performance"]["concurrency"]["defaultlimit"], 10);
    }

    #[test]
    fn intent_routing_accepts_camel_case_alias() {
        let cfg: RouterConfig = serde_json::from_value(serde_json::json!({ "intentRouting": false })).unwrap();
        assert!(!cfg.intent_routing);
    }
}
