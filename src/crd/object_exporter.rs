//! ObjectExporter CRD
//!
//! Declares which cluster objects are tracked (a group/version/kind plus a
//! label selector) and which of their fields are exported as time series.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::error::{Error, Result};

// =============================================================================
// ObjectExporter CRD
// =============================================================================

/// ObjectExporter exports selected fields of every object matching an
/// identifier as gauges or counters.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "exporter.thrawny.com",
    version = "v1alpha1",
    kind = "ObjectExporter",
    plural = "objectexporters",
    shortname = "oe",
    status = "ObjectExporterStatus",
    printcolumn = r#"{"name": "Kind", "type": "string", "jsonPath": ".spec.identifier.kind"}"#,
    printcolumn = r#"{"name": "Objects", "type": "integer", "jsonPath": ".status.instrumentedResourceCount"}"#,
    printcolumn = r#"{"name": "Series", "type": "integer", "jsonPath": ".status.exportedSeriesCount"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ObjectExporterSpec {
    /// Resource identifier of the tracked objects
    #[serde(default)]
    pub identifier: ResourceIdentifier,

    /// Time series exported for every tracked object
    #[serde(default)]
    pub instruments: Vec<InstrumentSpec>,

    /// Free-form description of the exporter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Identifier of the underlying kube resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceIdentifier {
    /// API group, empty for the core group
    #[serde(default)]
    pub group: String,

    /// API version
    #[serde(default)]
    pub version: String,

    /// Kind
    #[serde(default)]
    pub kind: String,

    /// Label query over the kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
}

impl std::fmt::Display for ResourceIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Kubernetes label selector
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    /// Exact label matches
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,

    /// Set-based requirements
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

/// One set-based selector requirement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorRequirement {
    /// Label key
    pub key: String,
    /// In, NotIn, Exists or DoesNotExist
    pub operator: String,
    /// Values for In and NotIn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

/// Time series metric type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum InstrumentType {
    Gauge,
    Counter,
}

impl std::fmt::Display for InstrumentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstrumentType::Gauge => write!(f, "Gauge"),
            InstrumentType::Counter => write!(f, "Counter"),
        }
    }
}

/// How repeated readings of a counter combine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum UnitAggregation {
    /// The reading is the counter's current total
    #[default]
    Total,
    /// The reading is added to the running total
    Sum,
}

impl UnitAggregation {
    /// Parse the `unit` field of an instrument
    pub fn parse(unit: &str) -> Result<Self> {
        match unit.trim().to_lowercase().as_str() {
            "" | "total" | "_total" | "count" | "_count" => Ok(UnitAggregation::Total),
            "sum" | "_sum" => Ok(UnitAggregation::Sum),
            other => Err(Error::InvalidSpec(format!(
                "unknown unit aggregation {:?}, expected \"total\" or \"sum\"",
                other
            ))),
        }
    }
}

impl std::fmt::Display for UnitAggregation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitAggregation::Total => write!(f, "total"),
            UnitAggregation::Sum => write!(f, "sum"),
        }
    }
}

/// One exported time series definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentSpec {
    /// Metric name, unique within the exporter
    pub name: String,

    /// Unit aggregation: "total" (default) or "sum"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    /// Metric type
    pub r#type: InstrumentType,

    /// Path of the numeric value; when omitted every object reports 1
    #[serde(default, rename = "valueJSONPath", skip_serializing_if = "Option::is_none")]
    pub value_json_path: Option<String>,

    /// Label name to source field path
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_labels_from_fields: BTreeMap<String, String>,
}

impl InstrumentSpec {
    /// Resolved unit aggregation of this instrument
    pub fn aggregation(&self) -> Result<UnitAggregation> {
        UnitAggregation::parse(self.unit.as_deref().unwrap_or(""))
    }
}

// =============================================================================
// Status
// =============================================================================

/// Observed state of the ObjectExporter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectExporterStatus {
    /// Current phase
    #[serde(default)]
    pub phase: ExporterPhase,

    /// Number of objects currently tracked
    #[serde(default)]
    pub instrumented_resource_count: i64,

    /// Number of series currently exported
    #[serde(default)]
    pub exported_series_count: i64,

    /// Preview of the exported series
    #[serde(default)]
    pub exported_time_series: Vec<String>,

    /// Objects whose value could not be extracted since the watch started
    #[serde(default)]
    pub extraction_errors: i64,

    /// Generation of the spec last processed
    #[serde(default)]
    pub observed_generation: Option<i64>,

    /// Human readable detail, set in the Error phase
    #[serde(default)]
    pub message: Option<String>,

    /// Time of the last phase change
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// Exporter lifecycle phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ExporterPhase {
    #[default]
    Uninitialized,
    WatchEstablished,
    Syncing,
    Error,
    Terminated,
}

impl std::fmt::Display for ExporterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExporterPhase::Uninitialized => write!(f, "Uninitialized"),
            ExporterPhase::WatchEstablished => write!(f, "WatchEstablished"),
            ExporterPhase::Syncing => write!(f, "Syncing"),
            ExporterPhase::Error => write!(f, "Error"),
            ExporterPhase::Terminated => write!(f, "Terminated"),
        }
    }
}

// =============================================================================
// Validation
// =============================================================================

impl ObjectExporterSpec {
    /// Check the invariants the API server schema cannot express
    pub fn validate(&self) -> Result<()> {
        if self.identifier.version.is_empty() || self.identifier.kind.is_empty() {
            return Err(Error::InvalidSpec(
                "identifier.version and identifier.kind are required".into(),
            ));
        }

        let mut names = HashSet::new();
        for instrument in &self.instruments {
            if !is_valid_metric_name(&instrument.name) {
                return Err(Error::InvalidSpec(format!(
                    "instrument name {:?} is not a valid metric name",
                    instrument.name
                )));
            }
            if instrument.name.starts_with(RESERVED_METRIC_PREFIX) {
                return Err(Error::InvalidSpec(format!(
                    "instrument name {:?} uses the reserved prefix {:?}",
                    instrument.name, RESERVED_METRIC_PREFIX
                )));
            }
            if !names.insert(instrument.name.as_str()) {
                return Err(Error::InvalidSpec(format!(
                    "instrument name {:?} is declared more than once",
                    instrument.name
                )));
            }
            for label in instrument.additional_labels_from_fields.keys() {
                if !is_valid_label_name(label) {
                    return Err(Error::InvalidSpec(format!(
                        "label {:?} of instrument {:?} is not a valid label name",
                        label, instrument.name
                    )));
                }
            }
            instrument.aggregation()?;
        }

        Ok(())
    }
}

/// Prefix of the operator's own metrics, not available to instruments
pub const RESERVED_METRIC_PREFIX: &str = "object_exporter_";

/// `[a-zA-Z_:][a-zA-Z0-9_:]*`
pub fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

/// `[a-zA-Z_][a-zA-Z0-9_]*`, excluding the reserved `__` prefix
pub fn is_valid_label_name(name: &str) -> bool {
    if name.starts_with("__") {
        return false;
    }
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
