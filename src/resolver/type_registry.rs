//! Type Registry
//!
//! Explicit map from group/version/kind to a watchable resource descriptor.
//! Seeded with the built-in k8s-openapi types and extended at runtime with the
//! results of API discovery, so custom resources resolve as well.

use crate::crd::{ObjectExporter, ResourceIdentifier};
use kube::discovery::ApiResource;
use std::collections::HashMap;

// =============================================================================
// GVK
// =============================================================================

/// Group/version/kind triple
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }
}

impl From<&ResourceIdentifier> for Gvk {
    fn from(identifier: &ResourceIdentifier) -> Self {
        Self::new(
            identifier.group.trim(),
            identifier.version.trim(),
            identifier.kind.trim(),
        )
    }
}

impl From<&ApiResource> for Gvk {
    fn from(ar: &ApiResource) -> Self {
        Self::new(ar.group.clone(), ar.version.clone(), ar.kind.clone())
    }
}

impl std::fmt::Display for Gvk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}, Kind={}", self.version, self.kind)
        } else {
            write!(f, "{}/{}, Kind={}", self.group, self.version, self.kind)
        }
    }
}

// =============================================================================
// Type Descriptor
// =============================================================================

/// Everything needed to list and watch objects of one kind
#[derive(Debug, Clone, PartialEq)]
pub struct TypeDescriptor {
    /// Dynamic API resource (group, version, kind, plural)
    pub api_resource: ApiResource,
    /// Namespace scoped or cluster scoped
    pub namespaced: bool,
}

// =============================================================================
// Type Registry
// =============================================================================

/// Registry of watchable kinds
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: HashMap<Gvk, TypeDescriptor>,
}

macro_rules! builtin {
    ($registry:ident, $type:ty, namespaced) => {
        builtin!(@inner $registry, $type, true)
    };
    ($registry:ident, $type:ty, cluster) => {
        builtin!(@inner $registry, $type, false)
    };
    (@inner $registry:ident, $type:ty, $namespaced:expr) => {
        $registry.register(TypeDescriptor {
            api_resource: ApiResource::erase::<$type>(&()),
            namespaced: $namespaced,
        })
    };
}

impl TypeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry of the built-in kinds known at compile time
    pub fn with_builtin_types() -> Self {
        use k8s_openapi::api::{
            apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet},
            autoscaling::v2::HorizontalPodAutoscaler,
            batch::v1::{CronJob, Job},
            core::v1::{
                ConfigMap, Endpoints, Namespace, Node, PersistentVolume, PersistentVolumeClaim,
                Pod, ResourceQuota, Secret, Service, ServiceAccount,
            },
            networking::v1::Ingress,
            policy::v1::PodDisruptionBudget,
            storage::v1::StorageClass,
        };

        let mut registry = Self::new();

        builtin!(registry, Pod, namespaced);
        builtin!(registry, Service, namespaced);
        builtin!(registry, Endpoints, namespaced);
        builtin!(registry, ConfigMap, namespaced);
        builtin!(registry, Secret, namespaced);
        builtin!(registry, ServiceAccount, namespaced);
        builtin!(registry, PersistentVolumeClaim, namespaced);
        builtin!(registry, ResourceQuota, namespaced);
        builtin!(registry, Deployment, namespaced);
        builtin!(registry, StatefulSet, namespaced);
        builtin!(registry, DaemonSet, namespaced);
        builtin!(registry, ReplicaSet, namespaced);
        builtin!(registry, Job, namespaced);
        builtin!(registry, CronJob, namespaced);
        builtin!(registry, HorizontalPodAutoscaler, namespaced);
        builtin!(registry, Ingress, namespaced);
        builtin!(registry, PodDisruptionBudget, namespaced);
        builtin!(registry, Node, cluster);
        builtin!(registry, Namespace, cluster);
        builtin!(registry, PersistentVolume, cluster);
        builtin!(registry, StorageClass, cluster);
        builtin!(registry, ObjectExporter, namespaced);

        registry
    }

    /// Register a kind, replacing any previous descriptor for the same GVK
    pub fn register(&mut self, descriptor: TypeDescriptor) {
        let gvk = Gvk::from(&descriptor.api_resource);
        self.types.insert(gvk, descriptor);
    }

    /// Look up a kind
    pub fn lookup(&self, gvk: &Gvk) -> Option<&TypeDescriptor> {
        self.types.get(gvk)
    }

    /// Check if a kind is registered
    pub fn contains(&self, gvk: &Gvk) -> bool {
        self.types.contains_key(gvk)
    }

    /// Merge another registry into this one
    pub fn merge(&mut self, other: TypeRegistry) {
        self.types.extend(other.types);
    }

    /// Number of registered kinds
    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
