//! Per-(session, model) token budget tracking.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use store::{IndexValue, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetStatusKind {
    Ok,
    Warn,
    Error,
    Exceeded,
}

/// Advisory result of `checkBudget`: never mutates state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetCheck {
    pub allowed: bool,
    pub status: BudgetStatusKind,
    pub remaining: u64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionBudget {
    /// `<session>::<model>`, memoized at construction so `Record::id` can
    /// return a borrowed `&str`.
    key: String,
    pub session: String,
    pub model: String,
    pub tokens_used: u64,
    pub max_tokens: u64,
    pub updated_at: i64,
}

impl SessionBudget {
    pub fn new(session: impl Into<String>, model: impl Into<String>, max_tokens: u64) -> Self {
        let session = session.into();
        let model = model.into();
        Self {
            key: composite_key(&session, &model),
            session,
            model,
            tokens_used: 0,
            max_tokens,
            updated_at: store::now_ms(),
        }
    }

    pub fn key(session: &str, model: &str) -> String {
        composite_key(session, model)
    }

    pub fn percent_for(tokens_used: u64, max_tokens: u64) -> f64 {
        if max_tokens == 0 {
            return 1.0;
        }
        tokens_used as f64 / max_tokens as f64
    }

    pub fn percent(&self) -> f64 {
        Self::percent_for(self.tokens_used, self.max_tokens)
    }

    pub fn remaining(&self) -> u64 {
        self.max_tokens.saturating_sub(self.tokens_used)
    }

    /// ok < warn_threshold <= warn < error_threshold <= error < 1.0 <= exceeded.
    pub fn status_for(percent: f64, warn_threshold: f64, error_threshold: f64) -> BudgetStatusKind {
        if percent >= 1.0 {
            BudgetStatusKind::Exceeded
        } else if percent >= error_threshold {
            BudgetStatusKind::Error
        } else if percent >= warn_threshold {
            BudgetStatusKind::Warn
        } else {
            BudgetStatusKind::Ok
        }
    }

    pub fn status(&self, warn_threshold: f64, error_threshold: f64) -> BudgetStatusKind {
        Self::status_for(self.percent(), warn_threshold, error_threshold)
    }

    pub fn consume(&mut self, count: u64) {
        self.tokens_used += count;
        self.updated_at = store::now_ms();
    }

    pub fn reset(&mut self) {
        self.tokens_used = 0;
        self.updated_at = store::now_ms();
    }
}

fn composite_key(session: &str, model: &str) -> String {
    format!("{session}::{model}")
}

impl Record for SessionBudget {
    fn id(&self) -> &str {
        &self.key
    }
    fn updated_at(&self) -> i64 {
        self.updated_at
    }
    fn collection_name() -> &'static str {
        "session_budgets"
    }
    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut m = HashMap::new();
        m.insert("session".to_string(), IndexValue::String(self.session.clone()));
        m.insert("model".to_string(), IndexValue::String(self.model.clone()));
        m
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_bands_follow_boundary_rules() {
        assert_eq!(SessionBudget::status_for(0.5, 0.75, 0.9), BudgetStatusKind::Ok);
        assert_eq!(SessionBudget::status_for(0.75, 0.75, 0.9), BudgetStatusKind::Warn);
        assert_eq!(SessionBudget::status_for(0.9, 0.75, 0.9), BudgetStatusKind::Error);
        assert_eq!(SessionBudget::status_for(1.0, 0.75, 0.9), BudgetStatusKind::Exceeded);
    }

    #[test]
    fn consume_accumulates_and_is_not_idempotent() {
        let mut budget = SessionBudget::new("s1", "m1", 1000);
        budget.consume(500);
        budget.consume(500);
        assert_eq!(budget.tokens_used, 1000);
    }
}
