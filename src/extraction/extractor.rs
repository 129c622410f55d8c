//! Instrument Extraction
//!
//! Compiles instrument definitions once per reconcile and evaluates them
//! against every tracked object.

use super::path::FieldPath;
use crate::crd::{InstrumentSpec, InstrumentType, UnitAggregation};
use crate::domain::ObjectKey;
use crate::error::{Error, Result};
use crate::instruments::{InstrumentKind, LabelSet};
use serde_json::Value;
use std::collections::BTreeMap;

/// Label carrying the namespace of the source object
pub const NAMESPACE_LABEL: &str = "namespace";
/// Label carrying the name of the source object
pub const NAME_LABEL: &str = "name";

/// One data point extracted from one object
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub value: f64,
    pub labels: LabelSet,
}

/// Instrument with its paths parsed
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledInstrument {
    pub name: String,
    pub instrument_type: InstrumentType,
    pub aggregation: UnitAggregation,
    value_path: Option<FieldPath>,
    label_paths: BTreeMap<String, FieldPath>,
}

impl CompiledInstrument {
    /// Parse all path expressions of an instrument
    pub fn compile(spec: &InstrumentSpec) -> Result<Self> {
        let value_path = spec
            .value_json_path
            .as_deref()
            .map(FieldPath::parse)
            .transpose()?;

        let label_paths = spec
            .additional_labels_from_fields
            .iter()
            .map(|(label, expr)| Ok((label.clone(), FieldPath::parse(expr)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        Ok(Self {
            name: spec.name.clone(),
            instrument_type: spec.r#type,
            aggregation: spec.aggregation()?,
            value_path,
            label_paths,
        })
    }

    /// Compile every instrument of an exporter, failing on the first bad one
    pub fn compile_all(specs: &[InstrumentSpec]) -> Result<Vec<Self>> {
        specs.iter().map(Self::compile).collect()
    }

    /// Series kind this instrument writes
    pub fn kind(&self) -> InstrumentKind {
        InstrumentKind::new(self.instrument_type, self.aggregation)
    }

    /// Extract value and labels from a raw object
    pub fn extract(&self, object: &Value) -> Result<Sample> {
        Ok(Sample {
            value: self.extract_value(object)?,
            labels: self.extract_labels(object),
        })
    }

    /// Numeric value, 1 when the instrument declares no value path
    pub fn extract_value(&self, object: &Value) -> Result<f64> {
        let Some(path) = &self.value_path else {
            return Ok(1.0);
        };
        match path.lookup(object) {
            None | Some(Value::Null) => Err(Error::PathNotFound {
                path: path.to_string(),
            }),
            Some(value) => coerce_number(path, value),
        }
    }

    /// Additional labels; a missing field yields an empty value
    pub fn extract_labels(&self, object: &Value) -> LabelSet {
        self.label_paths
            .iter()
            .map(|(label, path)| (label.clone(), label_value(path.lookup(object))))
            .collect()
    }
}

/// Add `namespace` (namespaced objects only) and `name` unless the
/// instrument already defines them
pub fn add_identity_labels(labels: &mut LabelSet, key: &ObjectKey) {
    if let Some(namespace) = &key.namespace {
        labels
            .entry(NAMESPACE_LABEL.to_string())
            .or_insert_with(|| namespace.clone());
    }
    labels
        .entry(NAME_LABEL.to_string())
        .or_insert_with(|| key.name.clone());
}

fn coerce_number(path: &FieldPath, value: &Value) -> Result<f64> {
    let mismatch = |found: String| Error::TypeMismatch {
        path: path.to_string(),
        found,
    };

    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| mismatch(n.to_string())),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => parse_quantity(s).ok_or_else(|| mismatch(format!("string {:?}", s))),
        Value::Array(_) => Err(mismatch("array".into())),
        Value::Object(_) => Err(mismatch("object".into())),
        Value::Null => Err(Error::PathNotFound {
            path: path.to_string(),
        }),
    }
}

fn label_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Plain number or Kubernetes quantity (`250m`, `1Gi`, `2k`)
pub fn parse_quantity(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(v) = s.parse::<f64>() {
        return v.is_finite().then_some(v);
    }

    let split = s.find(|c: char| c.is_ascii_alphabetic())?;
    let (number, suffix) = s.split_at(split);
    let number: f64 = number.parse().ok()?;

    let multiplier = match suffix {
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024f64,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        _ => return None,
    };

    let value = number * multiplier;
    value.is_finite().then_some(value)
}
