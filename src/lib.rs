//! Object Exporter Operator
//!
//! A Kubernetes operator that turns fields of arbitrary cluster objects into
//! Prometheus series. Each `ObjectExporter` names a kind (group, version,
//! kind plus an optional label selector) and a list of instruments whose
//! values and labels are read from every matching object.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         Export Reconciler                            │
//! │   ObjectExporter watch ──► work queue ──► workers ──► status patch   │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  ┌────────────────────┐  ┌────────────────────┐  ┌────────────────┐  │
//! │  │ Identifier Resolver│  │  Field Extractor   │  │  Target Watch  │  │
//! │  │ (type registry +   │  │  (paths, values,   │  │  (one per      │  │
//! │  │  API discovery)    │  │   label fields)    │  │   exporter)    │  │
//! │  └────────────────────┘  └────────────────────┘  └───────┬────────┘  │
//! │                                                          │           │
//! │                         ┌────────────────────────────────┴────────┐  │
//! │                         │          Instrument Registry            │  │
//! │                         │  (series per exporter, owner tracking)  │  │
//! │                         └────────────────────┬────────────────────┘  │
//! ├──────────────────────────────────────────────┼───────────────────────┤
//! │                                   /metrics (prometheus text)         │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controller`]: Reconciler, target watches and the work queue
//! - [`crd`]: The ObjectExporter custom resource
//! - [`domain`]: Identifiers, events and the cluster port
//! - [`error`]: Error types and handling
//! - [`extraction`]: Field paths and instrument extraction
//! - [`instruments`]: Exported series storage
//! - [`kubernetes`]: kube-rs adapter and API discovery
//! - [`metrics`]: Operator self metrics
//! - [`resolver`]: Resource identifier resolution and label selectors

pub mod controller;
pub mod crd;
pub mod domain;
pub mod error;
pub mod extraction;
pub mod instruments;
pub mod kubernetes;
pub mod metrics;
pub mod resolver;

// Re-export commonly used types
pub use controller::{ExportReconciler, ReconcileOutcome, ReconcilerConfig, WorkQueue};

pub use crd::{
    ExporterPhase, InstrumentSpec, InstrumentType, ObjectExporter, ObjectExporterSpec,
    ObjectExporterStatus, ResourceIdentifier, UnitAggregation,
};

pub use domain::{ClusterClient, ClusterClientRef, ConfigId, ExporterTrigger, ObjectKey, TargetEvent};

pub use error::{Error, ErrorAction, Result};

pub use extraction::{CompiledInstrument, FieldPath, Sample};

pub use instruments::{InstrumentKind, InstrumentRegistry, LabelSet, RegistrySnapshot, SeriesKey};

pub use kubernetes::{discover_types, KubeClusterClient};

pub use metrics::OperatorMetrics;

pub use resolver::{ResolvedTarget, Resolver, TypeRegistry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
