use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

// ── Label selectors ──────────────────────────────────────────────────────────

/// Selects resources by label. `match_labels` keeps absent distinct from
/// empty: `None` plus no expressions matches nothing, while an explicitly
/// empty map matches every resource.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_labels: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<MatchExpression>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchExpression {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl LabelSelector {
    pub fn from_labels(labels: BTreeMap<String, String>) -> Self {
        Self {
            match_labels: Some(labels),
            match_expressions: Vec::new(),
        }
    }

    /// True when every `match_labels` entry is present in `labels` and every
    /// expression evaluates true over it.
    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        let empty = BTreeMap::new();
        let labels = labels.unwrap_or(&empty);

        if self.match_labels.is_none() && self.match_expressions.is_empty() {
            return false;
        }

        if let Some(required) = &self.match_labels {
            for (key, value) in required {
                if labels.get(key) != Some(value) {
                    return false;
                }
            }
        }

        self.match_expressions.iter().all(|expr| expr.evaluate(labels))
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        for expr in &self.match_expressions {
            if expr.key.is_empty() {
                return Err(DomainError::InvalidSelector(
                    "match expression with empty key".to_string(),
                ));
            }
            match expr.operator {
                SelectorOperator::In | SelectorOperator::NotIn if expr.values.is_empty() => {
                    return Err(DomainError::InvalidSelector(format!(
                        "operator {:?} on key '{}' requires values",
                        expr.operator, expr.key
                    )));
                }
                SelectorOperator::Exists | SelectorOperator::DoesNotExist
                    if !expr.values.is_empty() =>
                {
                    return Err(DomainError::InvalidSelector(format!(
                        "operator {:?} on key '{}' takes no values",
                        expr.operator, expr.key
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl MatchExpression {
    fn evaluate(&self, labels: &BTreeMap<String, String>) -> bool {
        match self.operator {
            SelectorOperator::In => labels
                .get(&self.key)
                .map(|v| self.values.contains(v))
                .unwrap_or(false),
            SelectorOperator::NotIn => labels
                .get(&self.key)
                .map(|v| !self.values.contains(v))
                .unwrap_or(true),
            SelectorOperator::Exists => labels.contains_key(&self.key),
            SelectorOperator::DoesNotExist => !labels.contains_key(&self.key),
        }
    }
}
