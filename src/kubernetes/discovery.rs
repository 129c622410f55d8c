//! API Discovery
//!
//! Populates the type registry from the API server so custom resources
//! installed in the cluster can be exported like built-in kinds.

use crate::error::Result;
use crate::metrics::OperatorMetrics;
use crate::resolver::{Resolver, TypeDescriptor, TypeRegistry};
use kube::discovery::{verbs, Discovery, Scope};
use kube::Client;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Every served kind that supports list and watch, in every served version
pub async fn discover_types(client: &Client) -> Result<TypeRegistry> {
    let discovery = Discovery::new(client.clone()).run().await?;
    let mut registry = TypeRegistry::new();

    for group in discovery.groups() {
        for version in group.versions() {
            for (ar, caps) in group.versioned_resources(version) {
                // Subresources (pods/log, ...) are not watchable kinds
                if ar.plural.contains('/') {
                    continue;
                }
                if !caps.supports_operation(verbs::LIST) || !caps.supports_operation(verbs::WATCH) {
                    continue;
                }
                registry.register(TypeDescriptor {
                    api_resource: ar,
                    namespaced: caps.scope == Scope::Namespaced,
                });
            }
        }
    }

    debug!("Discovered {} watchable kinds", registry.len());
    Ok(registry)
}

/// Refresh the resolver's type registry every `interval` until shutdown
pub async fn run_discovery(
    client: Client,
    resolver: Resolver,
    metrics: OperatorMetrics,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // Startup already ran one discovery
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match discover_types(&client).await {
            Ok(discovered) => {
                resolver.refresh(discovered);
                metrics.set_known_kinds(resolver.known_kinds());
                info!("Type discovery complete: {} kinds resolvable", resolver.known_kinds());
            }
            Err(e) => warn!("Type discovery failed: {}", e),
        }
    }
}
