//! Domain Ports - Core trait definitions for the exporter
//!
//! The reconciler only talks to the cluster through [`ClusterClient`]; the
//! kube-rs adapter implements it against the API server and tests implement it
//! in memory.

use crate::crd::{ObjectExporter, ObjectExporterStatus};
use crate::error::Result;
use crate::resolver::ResolvedTarget;
use async_trait::async_trait;
use futures::stream::BoxStream;
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Identities
// =============================================================================

/// Identity of one ObjectExporter
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConfigId {
    pub namespace: String,
    pub name: String,
}

impl ConfigId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_exporter(exporter: &ObjectExporter) -> Self {
        Self::new(exporter.namespace().unwrap_or_default(), exporter.name_any())
    }
}

impl std::fmt::Display for ConfigId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Identity of a tracked object within the target kind
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }

    pub fn from_object(object: &DynamicObject) -> Self {
        Self {
            namespace: object.namespace(),
            name: object.name_any(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

// =============================================================================
// Events
// =============================================================================

/// Change notification for objects of a watched target kind
#[derive(Debug, Clone)]
pub enum TargetEvent {
    /// Object added or modified
    Applied(DynamicObject),
    /// Object deleted
    Deleted(DynamicObject),
    /// Full relist: the complete current set of matching objects
    Restarted(Vec<DynamicObject>),
}

/// Signal that one or more exporters need a reconcile pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExporterTrigger {
    /// An exporter was created, updated or deleted
    Changed(ConfigId),
    /// Full relist of exporters; anything not listed may have been deleted
    Resync(Vec<ConfigId>),
}

// =============================================================================
// Cluster Client Port
// =============================================================================

/// Port for every API server interaction the exporter needs
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch an exporter, `None` when it no longer exists
    async fn get_exporter(&self, id: &ConfigId) -> Result<Option<ObjectExporter>>;

    /// Overwrite the status subresource of an exporter
    async fn patch_status(&self, id: &ConfigId, status: &ObjectExporterStatus) -> Result<()>;

    /// Open a list+watch stream over the objects of a resolved target
    fn watch_objects(&self, target: &ResolvedTarget) -> BoxStream<'static, Result<TargetEvent>>;

    /// Stream of exporter changes driving the work queue
    fn watch_exporters(&self) -> BoxStream<'static, Result<ExporterTrigger>>;
}

pub type ClusterClientRef = Arc<dyn ClusterClient>;
