//! Skill Bank entries: general (cross-task) and task-specific skills.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use store::{IndexValue, Record};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    /// `<task_type>::<name>` for task-specific skills, just `<name>` for
    /// general ones; memoized so `Record::id` can borrow.
    key: String,
    pub name: String,
    pub task_type: Option<String>,
    pub principle: String,
    pub application_context: String,
    pub success_rate: f64,
    pub usage_count: u32,
    pub last_updated: i64,
    pub tags: Vec<String>,
}

const ALPHA: f64 = 0.2;

impl Skill {
    pub fn general(name: impl Into<String>, principle: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            key: name.clone(),
            name,
            task_type: None,
            principle: principle.into(),
            application_context: String::new(),
            success_rate: 0.6,
            usage_count: 0,
            last_updated: store::now_ms(),
            tags: Vec::new(),
        }
    }

    pub fn task_specific(task_type: impl Into<String>, name: impl Into<String>, principle: impl Into<String>) -> Self {
        let task_type = task_type.into();
        let name = name.into();
        Self {
            key: format!("{task_type}::{name}"),
            name,
            task_type: Some(task_type),
            principle: principle.into(),
            application_context: String::new(),
            success_rate: 0.6,
            usage_count: 0,
            last_updated: store::now_ms(),
            tags: Vec::new(),
        }
    }

    /// `rate <- α·outcome + (1−α)·rate`, α=0.2. Never a direct overwrite
    /// outside an explicit reset.
    pub fn apply_outcome(&mut self, outcome: f64) {
        self.success_rate = ALPHA * outcome + (1.0 - ALPHA) * self.success_rate;
        self.usage_count += 1;
        self.last_updated = store::now_ms();
    }

    pub fn boost(&mut self, delta: f64) {
        self.success_rate = (self.success_rate + delta).min(1.0);
        self.last_updated = store::now_ms();
    }
}

impl Record for Skill {
    fn id(&self) -> &str {
        &self.key
    }
    fn updated_at(&self) -> i64 {
        self.last_updated
    }
    fn collection_name() -> &'static str {
        "skills"
    }
    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut m = HashMap::new();
        if let Some(task_type) = &self.task_type {
            m.insert("task_type".to_string(), IndexValue::String(task_type.clone()));
        }
        m.insert("name".to_string(), IndexValue::String(self.name.clone()));
        m
    }
}
