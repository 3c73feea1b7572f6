//! Provider quota configuration and usage accounting.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use store::{IndexValue, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuotaType {
    RequestBased,
    TokenBased,
    Unlimited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Day,
    Month,
    AllTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderQuotaConfig {
    pub provider: String,
    pub quota_type: QuotaType,
    pub limit: u64,
    pub period: Period,
    pub warn_threshold: f64,
    pub critical_threshold: f64,
    pub updated_at: i64,
}

impl ProviderQuotaConfig {
    pub fn new(provider: impl Into<String>, quota_type: QuotaType, limit: u64, period: Period) -> Self {
        Self::with_thresholds(provider, quota_type, limit, period, 0.8, 0.95)
    }

    pub fn with_thresholds(
        provider: impl Into<String>,
        quota_type: QuotaType,
        limit: u64,
        period: Period,
        warn_threshold: f64,
        critical_threshold: f64,
    ) -> Self {
        Self {
            provider: provider.into(),
            quota_type,
            limit,
            period,
            warn_threshold,
            critical_threshold,
            updated_at: store::now_ms(),
        }
    }
}

impl Record for ProviderQuotaConfig {
    fn id(&self) -> &str {
        &self.provider
    }
    fn updated_at(&self) -> i64 {
        self.updated_at
    }
    fn collection_name() -> &'static str {
        "provider_quota_configs"
    }
    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut m = HashMap::new();
        m.insert("provider".to_string(), IndexValue::String(self.provider.clone()));
        m
    }
}

/// Append-only usage record; aggregated by provider within the current
/// period window to compute [`QuotaStatus`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiUsageRecord {
    pub id: String,
    pub provider: String,
    pub model: String,
    pub session: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_estimate: f64,
    pub timestamp: i64,
}

impl ApiUsageRecord {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        session: impl Into<String>,
        input_tokens: u64,
        output_tokens: u64,
        cost_estimate: f64,
    ) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            provider: provider.into(),
            model: model.into(),
            session: session.into(),
            input_tokens,
            output_tokens,
            cost_estimate,
            timestamp: store::now_ms(),
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl Record for ApiUsageRecord {
    fn id(&self) -> &str {
        &self.id
    }
    fn updated_at(&self) -> i64 {
        self.timestamp
    }
    fn collection_name() -> &'static str {
        "api_usage_records"
    }
    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut m = HashMap::new();
        m.insert("provider".to_string(), IndexValue::String(self.provider.clone()));
        m.insert("timestamp".to_string(), IndexValue::Int(self.timestamp));
        m
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaStatusKind {
    Healthy,
    Warning,
    Critical,
    Exhausted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub used: u64,
    pub remaining: u64,
    pub percent: f64,
    pub status: QuotaStatusKind,
    pub quota_type: QuotaType,
    pub limit: u64,
    pub critical_threshold: f64,
}
