//! Identifier Resolver
//!
//! Turns the identifier declared on an exporter into a [`ResolvedTarget`]:
//! a registered kind plus a validated label selector, ready to be listed and
//! watched.

pub mod selector;
pub mod type_registry;

pub use selector::*;
pub use type_registry::*;

use crate::crd::{LabelSelector, ResourceIdentifier};
use crate::error::{Error, Result};
use kube::discovery::ApiResource;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

// =============================================================================
// Resolved Target
// =============================================================================

/// A watchable kind together with its object filter
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTarget {
    /// Resolved kind
    pub gvk: Gvk,
    /// Descriptor from the type registry
    pub descriptor: TypeDescriptor,
    /// Selector applied client-side to every object
    pub selector: Option<LabelSelector>,
    /// Selector rendered for server-side filtering
    pub label_query: Option<String>,
}

impl ResolvedTarget {
    /// API resource used to build a dynamic API handle
    pub fn api_resource(&self) -> &ApiResource {
        &self.descriptor.api_resource
    }

    pub fn namespaced(&self) -> bool {
        self.descriptor.namespaced
    }

    /// Client-side selector check
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.selector
            .as_ref()
            .map_or(true, |selector| selector.matches(labels))
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Resolves exporter identifiers against a shared type registry
#[derive(Debug, Clone)]
pub struct Resolver {
    types: Arc<RwLock<TypeRegistry>>,
}

impl Resolver {
    /// Create a resolver over a type registry
    pub fn new(types: TypeRegistry) -> Self {
        Self {
            types: Arc::new(RwLock::new(types)),
        }
    }

    /// Merge freshly discovered kinds into the registry
    pub fn refresh(&self, discovered: TypeRegistry) {
        let mut types = self.types.write();
        types.merge(discovered);
        debug!("Type registry refreshed, {} kinds registered", types.len());
    }

    /// Number of kinds currently resolvable
    pub fn known_kinds(&self) -> usize {
        self.types.read().len()
    }

    /// Resolve an identifier into a watchable target
    pub fn resolve(&self, identifier: &ResourceIdentifier) -> Result<ResolvedTarget> {
        let gvk = Gvk::from(identifier);

        let descriptor = self
            .types
            .read()
            .lookup(&gvk)
            .cloned()
            .ok_or_else(|| Error::UnknownKind {
                group: gvk.group.clone(),
                version: gvk.version.clone(),
                kind: gvk.kind.clone(),
            })?;

        let selector = match &identifier.selector {
            Some(selector) if !selector.is_empty() => {
                selector.validate()?;
                Some(selector.clone())
            }
            _ => None,
        };
        let label_query = selector.as_ref().and_then(LabelSelector::to_query);

        Ok(ResolvedTarget {
            gvk,
            descriptor,
            selector,
            label_query,
        })
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new(TypeRegistry::with_builtin_types())
    }
}
