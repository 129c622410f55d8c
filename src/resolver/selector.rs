//! Label Selectors
//!
//! Validation, server-side query rendering and client-side matching of the
//! selector declared on an exporter identifier.

use crate::crd::{LabelSelector, LabelSelectorRequirement};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Set-based selector operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl FromStr for SelectorOperator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "In" => Ok(SelectorOperator::In),
            "NotIn" => Ok(SelectorOperator::NotIn),
            "Exists" => Ok(SelectorOperator::Exists),
            "DoesNotExist" => Ok(SelectorOperator::DoesNotExist),
            other => Err(Error::Selector(format!("unknown operator {:?}", other))),
        }
    }
}

impl LabelSelector {
    /// True when the selector matches every object
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    /// Reject selectors the API server would refuse
    pub fn validate(&self) -> Result<()> {
        for (key, value) in &self.match_labels {
            validate_key(key)?;
            validate_value(key, value)?;
        }

        for requirement in &self.match_expressions {
            validate_key(&requirement.key)?;
            let operator: SelectorOperator = requirement.operator.parse()?;
            match operator {
                SelectorOperator::In | SelectorOperator::NotIn => {
                    if requirement.values.is_empty() {
                        return Err(Error::Selector(format!(
                            "operator {} on {:?} requires at least one value",
                            requirement.operator, requirement.key
                        )));
                    }
                }
                SelectorOperator::Exists | SelectorOperator::DoesNotExist => {
                    if !requirement.values.is_empty() {
                        return Err(Error::Selector(format!(
                            "operator {} on {:?} takes no values",
                            requirement.operator, requirement.key
                        )));
                    }
                }
            }
            for value in &requirement.values {
                validate_value(&requirement.key, value)?;
            }
        }

        Ok(())
    }

    /// Render as a `labelSelector` query string, `None` when empty
    pub fn to_query(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }

        let mut terms: Vec<String> = self
            .match_labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        for requirement in &self.match_expressions {
            let term = match requirement.operator.parse::<SelectorOperator>() {
                Ok(SelectorOperator::In) => {
                    format!("{} in ({})", requirement.key, requirement.values.join(","))
                }
                Ok(SelectorOperator::NotIn) => {
                    format!("{} notin ({})", requirement.key, requirement.values.join(","))
                }
                Ok(SelectorOperator::Exists) => requirement.key.clone(),
                Ok(SelectorOperator::DoesNotExist) => format!("!{}", requirement.key),
                Err(_) => continue,
            };
            terms.push(term);
        }

        Some(terms.join(","))
    }

    /// Evaluate the selector against an object's labels
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let labels_match = self
            .match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v));

        labels_match
            && self
                .match_expressions
                .iter()
                .all(|requirement| requirement_matches(requirement, labels))
    }
}

fn requirement_matches(requirement: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let value = labels.get(&requirement.key);
    match requirement.operator.parse::<SelectorOperator>() {
        Ok(SelectorOperator::In) => value.map_or(false, |v| requirement.values.contains(v)),
        Ok(SelectorOperator::NotIn) => value.map_or(true, |v| !requirement.values.contains(v)),
        Ok(SelectorOperator::Exists) => value.is_some(),
        Ok(SelectorOperator::DoesNotExist) => value.is_none(),
        Err(_) => false,
    }
}

/// Qualified name: optional DNS subdomain prefix, then a name segment
fn validate_key(key: &str) -> Result<()> {
    let (prefix, name) = match key.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };

    if let Some(prefix) = prefix {
        let valid_prefix = !prefix.is_empty()
            && prefix.len() <= 253
            && prefix
                .split('.')
                .all(|part| !part.is_empty() && is_name_segment(part, false));
        if !valid_prefix {
            return Err(Error::Selector(format!("invalid label key prefix in {:?}", key)));
        }
    }

    if name.is_empty() || name.len() > 63 || !is_name_segment(name, true) {
        return Err(Error::Selector(format!("invalid label key {:?}", key)));
    }

    Ok(())
}

fn validate_value(key: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Ok(());
    }
    if value.len() > 63 || !is_name_segment(value, true) {
        return Err(Error::Selector(format!(
            "invalid value {:?} for label {:?}",
            value, key
        )));
    }
    Ok(())
}

/// Alphanumeric at both ends, `-` (and `_`, `.` for names) inside
fn is_name_segment(s: &str, allow_underscore_dot: bool) -> bool {
    let bytes = s.as_bytes();
    let (Some(first), Some(last)) = (bytes.first(), bytes.last()) else {
        return false;
    };
    if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
        return false;
    }
    bytes.iter().all(|&b| {
        b.is_ascii_alphanumeric() || b == b'-' || (allow_underscore_dot && (b == b'_' || b == b'.'))
    })
}
