//! Quota & Budget Governor: per-(session, model) token budgets and
//! per-provider quota tracking against a period window.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use store::{Db, Filter, IndexValue};

use crate::config::GovernorConfig;
use crate::domain::{
    ApiUsageRecord, BudgetCheck, BudgetStatusKind, Period, ProviderQuotaConfig, QuotaStatus, QuotaStatusKind,
    QuotaType, SessionBudget,
};

#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionBudgetSidecar {
    sessions: HashMap<String, HashMap<String, u64>>,
    saved_at: i64,
}

/// Tracks session token budgets and provider quotas. In-memory state is
/// authoritative for the running process; the session-budget sidecar is a
/// best-effort mirror for restart recovery.
pub struct Governor {
    db: Arc<Db>,
    config: GovernorConfig,
    sidecar_path: PathBuf,
    budgets: Mutex<HashMap<String, SessionBudget>>,
}

impl Governor {
    pub fn new(db: Arc<Db>, config: GovernorConfig, sidecar_dir: &std::path::Path) -> Self {
        Self {
            db,
            config,
            sidecar_path: sidecar_dir.join("session-budget.json"),
            budgets: Mutex::new(HashMap::new()),
        }
    }

    fn max_for(&self, model: &str) -> u64 {
        self.config
            .model_maxima
            .get(model)
            .copied()
            .unwrap_or(self.config.default_session_max_tokens)
    }

    async fn budget_for(&self, budgets: &mut HashMap<String, SessionBudget>, session: &str, model: &str) -> SessionBudget {
        let key = SessionBudget::key(session, model);
        if let Some(existing) = budgets.get(&key) {
            return existing.clone();
        }
        let fresh = SessionBudget::new(session, model, self.max_for(model));
        budgets.insert(key, fresh.clone());
        fresh
    }

    /// Advisory only, no mutation. `allowed=false` once the hypothetical
    /// usage reaches the maximum (percent=1.0 counts as exceeded, not just
    /// usage past it).
    pub async fn check_budget(&self, session: &str, model: &str, proposed_tokens: u64) -> BudgetCheck {
        let mut budgets = self.budgets.lock().await;
        let current = self.budget_for(&mut budgets, session, model).await;

        let hypothetical = current.tokens_used + proposed_tokens;
        let percent = SessionBudget::percent_for(hypothetical, current.max_tokens);
        let status = SessionBudget::status_for(percent, self.config.warn_threshold, self.config.error_threshold);
        let allowed = hypothetical < current.max_tokens;
        let remaining = current.max_tokens.saturating_sub(hypothetical.min(current.max_tokens));

        BudgetCheck {
            allowed,
            status,
            remaining,
            message: format!("{:?} at {:.0}% of budget", status, percent * 100.0),
        }
    }

    /// Idempotence is NOT required: every call adds. Persists the sidecar
    /// snapshot; a persistence failure is logged but non-fatal.
    pub async fn consume_tokens(&self, session: &str, model: &str, count: u64) -> SessionBudget {
        let mut budgets = self.budgets.lock().await;
        let mut current = self.budget_for(&mut budgets, session, model).await;
        current.consume(count);
        let key = SessionBudget::key(session, model);
        budgets.insert(key, current.clone());

        self.persist_sidecar(&budgets).await;
        debug!(session, model, count, total = current.tokens_used, "consumed tokens");
        current
    }

    pub async fn reset_session(&self, session: &str, model: Option<&str>) {
        let mut budgets = self.budgets.lock().await;
        match model {
            Some(model) => {
                let key = SessionBudget::key(session, model);
                if let Some(b) = budgets.get_mut(&key) {
                    b.reset();
                }
            }
            None => {
                for (k, b) in budgets.iter_mut() {
                    if k.starts_with(&format!("{session}::")) {
                        b.reset();
                    }
                }
            }
        }
        self.persist_sidecar(&budgets).await;
    }

    async fn persist_sidecar(&self, budgets: &HashMap<String, SessionBudget>) {
        let mut sidecar = SessionBudgetSidecar {
            saved_at: store::now_ms(),
            ..Default::default()
        };
        for budget in budgets.values() {
            sidecar
                .sessions
                .entry(budget.session.clone())
                .or_default()
                .insert(budget.model.clone(), budget.tokens_used);
        }
        if let Err(e) = store::write_json_atomic(&self.sidecar_path, &sidecar) {
            warn!(error = %e, "session budget sidecar persistence failed; in-memory counter remains authoritative");
        }
    }

    // ---- provider quota ----

    /// Idempotent upsert. `warn_threshold`/`critical_threshold` default to
    /// 0.8/0.95 when not overridden by the caller.
    pub fn configure_quota(
        &self,
        provider: &str,
        quota_type: QuotaType,
        limit: u64,
        period: Period,
        warn_threshold: Option<f64>,
        critical_threshold: Option<f64>,
    ) -> store::Result<()> {
        let cfg = ProviderQuotaConfig::with_thresholds(
            provider,
            quota_type,
            limit,
            period,
            warn_threshold.unwrap_or(0.8),
            critical_threshold.unwrap_or(0.95),
        );
        self.db.put(&cfg)
    }

    pub fn record_usage(
        &self,
        provider: &str,
        model: &str,
        session: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost: f64,
    ) -> store::Result<()> {
        let record = ApiUsageRecord::new(provider, model, session, input_tokens, output_tokens, cost);
        self.db.put(&record)
    }

    fn period_start(period: Period) -> i64 {
        let now = Utc::now();
        match period {
            Period::Day => Utc
                .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
                .single()
                .map(|d| d.timestamp_millis())
                .unwrap_or(0),
            Period::Month => Utc
                .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
                .single()
                .map(|d| d.timestamp_millis())
                .unwrap_or(0),
            Period::AllTime => 0,
        }
    }

    pub fn get_quota_status(&self, provider: &str) -> store::Result<QuotaStatus> {
        let config: Option<ProviderQuotaConfig> = self.db.get(provider)?;
        let config = config.unwrap_or_else(|| ProviderQuotaConfig::new(provider, QuotaType::Unlimited, 0, Period::AllTime));

        let window_start = Self::period_start(config.period);
        let usage: Vec<ApiUsageRecord> = self.db.query(&[
            Filter::eq("provider", IndexValue::String(provider.to_string())),
            Filter::gte("timestamp", IndexValue::Int(window_start)),
        ])?;

        let used: u64 = match config.quota_type {
            QuotaType::RequestBased => usage.len() as u64,
            QuotaType::TokenBased => usage.iter().map(|r| r.total_tokens()).sum(),
            QuotaType::Unlimited => 0,
        };

        let percent = if config.limit == 0 {
            0.0
        } else {
            used as f64 / config.limit as f64
        };

        let status = match config.quota_type {
            QuotaType::Unlimited => QuotaStatusKind::Healthy,
            _ if percent >= 1.0 => QuotaStatusKind::Exhausted,
            _ if percent >= config.critical_threshold => QuotaStatusKind::Critical,
            _ if percent >= config.warn_threshold => QuotaStatusKind::Warning,
            _ => QuotaStatusKind::Healthy,
        };

        Ok(QuotaStatus {
            used,
            remaining: config.limit.saturating_sub(used),
            percent,
            status,
            quota_type: config.quota_type,
            limit: config.limit,
            critical_threshold: config.critical_threshold,
        })
    }

    pub fn has_capacity(&self, provider: &str, est_tokens: u64) -> store::Result<bool> {
        let status = self.get_quota_status(provider)?;
        if status.status == QuotaStatusKind::Exhausted {
            return Ok(false);
        }
        Ok(status.remaining >= est_tokens || status.percent < status.critical_threshold)
    }

    pub fn list_providers(&self) -> store::Result<Vec<ProviderQuotaConfig>> {
        self.db.all()
    }

    pub fn reset_provider(&self, provider: &str) -> store::Result<()> {
        self.db.delete::<ProviderQuotaConfig>(provider)
    }

    /// Picks the non-exhausted candidate with the lowest percent_used; ties
    /// broken by input order.
    pub fn suggest_fallback(&self, candidate_providers: &[String]) -> store::Result<Option<String>> {
        let mut best: Option<(String, f64)> = None;
        for provider in candidate_providers {
            let status = self.get_quota_status(provider)?;
            if status.status == QuotaStatusKind::Exhausted {
                continue;
            }
            match &best {
                Some((_, best_percent)) if *best_percent <= status.percent => {}
                _ => best = Some((provider.clone(), status.percent)),
            }
        }
        Ok(best.map(|(provider, _)| provider))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor() -> (Governor, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path().join("test.db")).unwrap();
        let config = GovernorConfig {
            default_session_max_tokens: 1000,
            warn_threshold: 0.75,
            error_threshold: 0.90,
            ..Default::default()
        };
        (Governor::new(db, config, dir.path()), dir)
    }

    #[tokio::test]
    async fn budget_gate_scenario_from_spec() {
        let (gov, _dir) = governor();

        let check = gov.check_budget("s1", "m1", 500).await;
        assert!(check.allowed);
        assert_eq!(check.status, BudgetStatusKind::Ok);
        assert_eq!(check.remaining, 500);

        let budget = gov.consume_tokens("s1", "m1", 500).await;
        assert_eq!(budget.tokens_used, 500);
        assert_eq!(budget.remaining(), 500);

        let check = gov.check_budget("s1", "m1", 400).await;
        assert!(check.allowed);
        assert_eq!(check.status, BudgetStatusKind::Warn);
        assert_eq!(check.remaining, 100);

        let budget = gov.consume_tokens("s1", "m1", 600).await;
        assert_eq!(budget.tokens_used, 1100);
        assert_eq!(budget.remaining(), 0);
        assert_eq!(budget.status(0.75, 0.90), BudgetStatusKind::Exceeded);
    }

    #[tokio::test]
    async fn quota_fallback_scenario_from_spec() {
        let (gov, _dir) = governor();
        gov.configure_quota("p1", QuotaType::TokenBased, 1000, Period::Day, None, None).unwrap();
        gov.configure_quota("p2", QuotaType::TokenBased, 1000, Period::Day, None, None).unwrap();

        gov.record_usage("p1", "m1", "s1", 1000, 0, 0.0).unwrap();
        gov.record_usage("p2", "m2", "s1", 100, 0, 0.0).unwrap();

        let p1 = gov.get_quota_status("p1").unwrap();
        assert_eq!(p1.status, QuotaStatusKind::Exhausted);

        let fallback = gov.suggest_fallback(&["p1".to_string(), "p2".to_string()]).unwrap();
        assert_eq!(fallback, Some("p2".to_string()));
    }

    #[test]
    fn configure_quota_is_idempotent() {
        let (gov, _dir) = governor();
        gov.configure_quota("p1", QuotaType::TokenBased, 1000, Period::Day, None, None).unwrap();
        gov.configure_quota("p1", QuotaType::TokenBased, 1000, Period::Day, None, None).unwrap();
        let all: Vec<ProviderQuotaConfig> = gov.db.all().unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn configure_quota_accepts_explicit_thresholds() {
        let (gov, _dir) = governor();
        gov.configure_quota("p1", QuotaType::TokenBased, 1000, Period::Day, Some(0.5), Some(0.75)).unwrap();
        let cfg: ProviderQuotaConfig = gov.db.get("p1").unwrap().unwrap();
        assert_eq!(cfg.warn_threshold, 0.5);
        assert_eq!(cfg.critical_threshold, 0.75);
    }

    #[tokio::test]
    async fn check_budget_exactly_at_max_is_exceeded_and_disallowed() {
        let (gov, _dir) = governor();
        let check = gov.check_budget("s1", "m1", 1000).await;
        assert!(!check.allowed);
        assert_eq!(check.status, BudgetStatusKind::Exceeded);
        assert_eq!(check.remaining, 0);
    }
}
