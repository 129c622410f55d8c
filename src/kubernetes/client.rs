//! Kubernetes Cluster Client
//!
//! kube-rs implementation of the [`ClusterClient`] port: exporter lookups,
//! status patches and the list+watch streams for exporters and targets.

use crate::crd::{ObjectExporter, ObjectExporterStatus};
use crate::domain::{ClusterClient, ConfigId, ExporterTrigger, TargetEvent};
use crate::error::{Error, Result};
use crate::resolver::ResolvedTarget;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::runtime::watcher::{self, watcher, Event};
use kube::runtime::WatchStreamExt;
use kube::Client;
use tracing::debug;

/// Cluster client backed by the API server
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn exporters(&self, namespace: &str) -> Api<ObjectExporter> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_exporter(&self, id: &ConfigId) -> Result<Option<ObjectExporter>> {
        Ok(self.exporters(&id.namespace).get_opt(&id.name).await?)
    }

    async fn patch_status(&self, id: &ConfigId, status: &ObjectExporterStatus) -> Result<()> {
        let patch = serde_json::json!({ "status": status });
        self.exporters(&id.namespace)
            .patch_status(&id.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!("Patched status of {}", id);
        Ok(())
    }

    fn watch_objects(&self, target: &ResolvedTarget) -> BoxStream<'static, Result<TargetEvent>> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), target.api_resource());
        let mut config = watcher::Config::default();
        if let Some(query) = &target.label_query {
            config = config.labels(query);
        }

        watcher(api, config)
            .default_backoff()
            .map(|event| match event {
                Ok(Event::Applied(object)) => Ok(TargetEvent::Applied(object)),
                Ok(Event::Deleted(object)) => Ok(TargetEvent::Deleted(object)),
                Ok(Event::Restarted(objects)) => Ok(TargetEvent::Restarted(objects)),
                Err(e) => Err(Error::WatchStream(e.to_string())),
            })
            .boxed()
    }

    fn watch_exporters(&self) -> BoxStream<'static, Result<ExporterTrigger>> {
        let api: Api<ObjectExporter> = Api::all(self.client.clone());

        watcher(api, watcher::Config::default())
            .default_backoff()
            .map(|event| match event {
                Ok(Event::Applied(exporter)) | Ok(Event::Deleted(exporter)) => {
                    Ok(ExporterTrigger::Changed(ConfigId::from_exporter(&exporter)))
                }
                Ok(Event::Restarted(exporters)) => Ok(ExporterTrigger::Resync(
                    exporters.iter().map(ConfigId::from_exporter).collect(),
                )),
                Err(e) => Err(Error::WatchStream(e.to_string())),
            })
            .boxed()
    }
}
