//! Record filters for the `filtered` sync strategy.
//!
//! A filter is evaluated against the JSON payload of a record. Missing
//! fields never match, except for `ne` and `not_in`.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    In,
    NotIn,
    Like,
}

impl std::str::FromStr for FilterOperator {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s.to_lowercase().as_str() {
            "eq" | "=" | "==" => Ok(FilterOperator::Eq),
            "ne" | "!=" | "<>" => Ok(FilterOperator::Ne),
            "gt" | ">" => Ok(FilterOperator::Gt),
            "lt" | "<" => Ok(FilterOperator::Lt),
            "gte" | ">=" => Ok(FilterOperator::Gte),
            "lte" | "<=" => Ok(FilterOperator::Lte),
            "in" => Ok(FilterOperator::In),
            "not_in" | "nin" => Ok(FilterOperator::NotIn),
            "like" => Ok(FilterOperator::Like),
            other => Err(CoreError::unknown(
                "filter operator",
                other,
                "eq, ne, gt, lt, gte, lte, in, not_in, like",
            )),
        }
    }
}

/// One field condition. A list of filters is combined with AND.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncFilter {
    pub field: String,
    pub operator: FilterOperator,
    pub value: Value,
}

impl SyncFilter {
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        SyncFilter {
            field: field.into(),
            operator,
            value,
        }
    }

    /// Checks that the operand shape fits the operator.
    pub fn validate(&self) -> CoreResult<()> {
        if self.field.trim().is_empty() {
            return Err(CoreError::InvalidFilter {
                field: self.field.clone(),
                reason: "field name is empty".into(),
            });
        }
        match self.operator {
            FilterOperator::In | FilterOperator::NotIn if !self.value.is_array() => {
                Err(CoreError::InvalidFilter {
                    field: self.field.clone(),
                    reason: "in/not_in need an array value".into(),
                })
            }
            FilterOperator::Like if !self.value.is_string() => Err(CoreError::InvalidFilter {
                field: self.field.clone(),
                reason: "like needs a string pattern".into(),
            }),
            _ => Ok(()),
        }
    }

    /// Evaluates the filter against a record. Dotted field names walk
    /// nested objects (`"location.usage"`).
    pub fn matches(&self, record: &Value) -> bool {
        let actual = lookup(record, &self.field);
        match self.operator {
            FilterOperator::Eq => actual.is_some_and(|a| loose_eq(a, &self.value)),
            FilterOperator::Ne => !actual.is_some_and(|a| loose_eq(a, &self.value)),
            FilterOperator::Gt => cmp(actual, &self.value) == Some(Ordering::Greater),
            FilterOperator::Lt => cmp(actual, &self.value) == Some(Ordering::Less),
            FilterOperator::Gte => matches!(
                cmp(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOperator::Lte => matches!(
                cmp(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOperator::In => match (actual, self.value.as_array()) {
                (Some(a), Some(list)) => list.iter().any(|v| loose_eq(a, v)),
                _ => false,
            },
            FilterOperator::NotIn => match (actual, self.value.as_array()) {
                (Some(a), Some(list)) => !list.iter().any(|v| loose_eq(a, v)),
                (None, _) => true,
                _ => false,
            },
            FilterOperator::Like => match (actual.and_then(Value::as_str), self.value.as_str()) {
                (Some(text), Some(pattern)) => like(text, pattern),
                _ => false,
            },
        }
    }
}

/// True when every filter matches.
pub fn matches_all(filters: &[SyncFilter], record: &Value) -> bool {
    filters.iter().all(|f| f.matches(record))
}

fn lookup<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = record;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn cmp(actual: Option<&Value>, expected: &Value) -> Option<Ordering> {
    let actual = actual?;
    if let (Some(x), Some(y)) = (actual.as_f64(), expected.as_f64()) {
        return x.partial_cmp(&y);
    }
    match (actual.as_str(), expected.as_str()) {
        (Some(x), Some(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// SQL-style LIKE, case-insensitive: `%` any run, `_` any single char.
fn like(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.to_lowercase().chars().collect();
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();

    let (mut t, mut p) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '_' || pattern[p] == text[t]) {
            t += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == '%' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '%' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_equality_and_numbers() {
        let rec = json!({"usage": "internal", "qty": 5});
        assert!(SyncFilter::new("usage", FilterOperator::Eq, json!("internal")).matches(&rec));
        assert!(SyncFilter::new("qty", FilterOperator::Eq, json!(5.0)).matches(&rec));
        assert!(SyncFilter::new("qty", FilterOperator::Gte, json!(5)).matches(&rec));
        assert!(!SyncFilter::new("qty", FilterOperator::Gt, json!(5)).matches(&rec));
        assert!(SyncFilter::new("qty", FilterOperator::Lt, json!(10)).matches(&rec));
    }

    #[test]
    fn test_missing_field() {
        let rec = json!({"name": "x"});
        assert!(!SyncFilter::new("state", FilterOperator::Eq, json!("done")).matches(&rec));
        assert!(SyncFilter::new("state", FilterOperator::Ne, json!("done")).matches(&rec));
        assert!(SyncFilter::new("state", FilterOperator::NotIn, json!(["done"])).matches(&rec));
    }

    #[test]
    fn test_in_and_nested_fields() {
        let rec = json!({"location": {"usage": "internal"}, "state": "assigned"});
        assert!(SyncFilter::new("location.usage", FilterOperator::Eq, json!("internal")).matches(&rec));
        assert!(SyncFilter::new("state", FilterOperator::In, json!(["assigned", "done"])).matches(&rec));
        assert!(!SyncFilter::new("state", FilterOperator::NotIn, json!(["assigned"])).matches(&rec));
    }

    #[test]
    fn test_like_patterns() {
        assert!(like("WH/Stock/Shelf A", "wh/%shelf%"));
        assert!(like("LOT-0042", "lot-00__"));
        assert!(!like("LOT-0042", "lot-00_"));
        assert!(like("", "%"));
    }

    #[test]
    fn test_validate_shapes() {
        assert!(SyncFilter::new("state", FilterOperator::In, json!("done")).validate().is_err());
        assert!(SyncFilter::new("name", FilterOperator::Like, json!(3)).validate().is_err());
        assert!(SyncFilter::new("", FilterOperator::Eq, json!(1)).validate().is_err());
        assert!(SyncFilter::new("qty", FilterOperator::Gt, json!(1)).validate().is_ok());
    }

    #[test]
    fn test_matches_all_and_operator_parse() {
        let rec = json!({"active": true, "qty": 2});
        let filters = vec![
            SyncFilter::new("active", FilterOperator::Eq, json!(true)),
            SyncFilter::new("qty", "lte".parse().unwrap(), json!(2)),
        ];
        assert!(matches_all(&filters, &rec));
        assert!("between".parse::<FilterOperator>().is_err());
    }
}
