//! Generic record trait and index value types shared by every collection.

use std::collections::HashMap;

/// A value that can be used as an indexed column for filtering a collection.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum IndexValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl IndexValue {
    /// Render as the text representation stored in the SQLite index column.
    pub fn to_sql_text(&self) -> String {
        match self {
            IndexValue::String(s) => s.clone(),
            IndexValue::Int(i) => i.to_string(),
            IndexValue::Float(f) => f.to_string(),
            IndexValue::Bool(b) => b.to_string(),
        }
    }
}

/// A type that can be persisted in a generic collection.
///
/// Implementors supply their own id, an `updated_at` timestamp used for
/// last-write-wins conflict resolution, a stable collection name, and a set
/// of derived fields the store indexes for cheap filtering. The indexed
/// fields are always rebuildable from the record itself, the store never
/// treats them as a second source of truth.
pub trait Record: serde::Serialize + for<'de> serde::Deserialize<'de> {
    fn id(&self) -> &str;
    fn updated_at(&self) -> i64;
    fn collection_name() -> &'static str;
    fn indexed_fields(&self) -> HashMap<String, IndexValue>;
}

/// Comparison applied by a [`Filter`] against an indexed field.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    In,
}

/// A single predicate over an indexed field. `Collection::query` ANDs a slice
/// of these together.
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: IndexValue,
    /// Only consulted when `op == FilterOp::In`; holds the candidate set.
    pub values: Vec<IndexValue>,
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: IndexValue) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq,
            value,
            values: Vec::new(),
        }
    }

    pub fn gte(field: impl Into<String>, value: IndexValue) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Gte,
            value,
            values: Vec::new(),
        }
    }

    pub fn lt(field: impl Into<String>, value: IndexValue) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Lt,
            value,
            values: Vec::new(),
        }
    }

    pub fn r#in(field: impl Into<String>, values: Vec<IndexValue>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::In,
            value: IndexValue::Bool(false),
            values,
        }
    }

    /// Evaluate this filter against a materialized indexed-field map.
    pub fn matches(&self, fields: &HashMap<String, IndexValue>) -> bool {
        let Some(actual) = fields.get(&self.field) else {
            return false;
        };
        match self.op {
            FilterOp::Eq => actual == &self.value,
            FilterOp::Ne => actual != &self.value,
            FilterOp::Gt => cmp_numeric(actual, &self.value).is_gt(),
            FilterOp::Gte => !cmp_numeric(actual, &self.value).is_lt(),
            FilterOp::Lt => cmp_numeric(actual, &self.value).is_lt(),
            FilterOp::Lte => !cmp_numeric(actual, &self.value).is_gt(),
            FilterOp::Contains => match actual {
                IndexValue::String(s) => match &self.value {
                    IndexValue::String(needle) => s.contains(needle.as_str()),
                    _ => false,
                },
                _ => false,
            },
            FilterOp::In => self.values.contains(actual),
        }
    }
}

fn cmp_numeric(a: &IndexValue, b: &IndexValue) -> std::cmp::Ordering {
    let to_f64 = |v: &IndexValue| match v {
        IndexValue::Int(i) => *i as f64,
        IndexValue::Float(f) => *f,
        IndexValue::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        IndexValue::String(s) => s.parse::<f64>().unwrap_or(f64::NAN),
    };
    to_f64(a).partial_cmp(&to_f64(b)).unwrap_or(std::cmp::Ordering::Equal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_eq_matches() {
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), IndexValue::String("ok".to_string()));
        let f = Filter::eq("status", IndexValue::String("ok".to_string()));
        assert!(f.matches(&fields));
    }

    #[test]
    fn filter_gte_numeric() {
        let mut fields = HashMap::new();
        fields.insert("count".to_string(), IndexValue::Int(5));
        assert!(Filter::gte("count", IndexValue::Int(5)).matches(&fields));
        assert!(!Filter::gte("count", IndexValue::Int(6)).matches(&fields));
    }

    #[test]
    fn filter_in_set() {
        let mut fields = HashMap::new();
        fields.insert("provider".to_string(), IndexValue::String("anthropic".to_string()));
        let f = Filter::r#in(
            "provider",
            vec![
                IndexValue::String("anthropic".to_string()),
                IndexValue::String("openai".to_string()),
            ],
        );
        assert!(f.matches(&fields));
    }

    #[test]
    fn filter_missing_field_never_matches() {
        let fields = HashMap::new();
        assert!(!Filter::eq("missing", IndexValue::Bool(true)).matches(&fields));
    }
}
