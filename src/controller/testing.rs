//! In-memory cluster used by the controller tests

use crate::crd::{
    InstrumentSpec, InstrumentType, LabelSelector, ObjectExporter, ObjectExporterSpec,
    ObjectExporterStatus, ResourceIdentifier,
};
use crate::domain::{ClusterClient, ConfigId, ExporterTrigger, TargetEvent};
use crate::error::Result;
use crate::resolver::ResolvedTarget;
use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::DynamicObject;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub struct FakeCluster {
    exporters: Mutex<HashMap<ConfigId, ObjectExporter>>,
    patches: Mutex<Vec<(ConfigId, ObjectExporterStatus)>>,
    watches: Mutex<Vec<UnboundedSender<Result<TargetEvent>>>>,
    watch_calls: AtomicUsize,
    trigger_tx: UnboundedSender<Result<ExporterTrigger>>,
    trigger_rx: Mutex<Option<UnboundedReceiver<Result<ExporterTrigger>>>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        let (trigger_tx, trigger_rx) = unbounded();
        Self {
            exporters: Mutex::new(HashMap::new()),
            patches: Mutex::new(Vec::new()),
            watches: Mutex::new(Vec::new()),
            watch_calls: AtomicUsize::new(0),
            trigger_tx,
            trigger_rx: Mutex::new(Some(trigger_rx)),
        }
    }

    pub fn put_exporter(&self, id: &ConfigId, spec: ObjectExporterSpec) {
        let mut exporters = self.exporters.lock();
        let generation = exporters
            .get(id)
            .and_then(|e| e.metadata.generation)
            .unwrap_or(0)
            + 1;
        let status = exporters.get(id).and_then(|e| e.status.clone());

        let mut exporter = ObjectExporter::new(&id.name, spec);
        exporter.metadata.namespace = Some(id.namespace.clone());
        exporter.metadata.generation = Some(generation);
        exporter.status = status;
        exporters.insert(id.clone(), exporter);
    }

    pub fn delete_exporter(&self, id: &ConfigId) {
        self.exporters.lock().remove(id);
    }

    /// Status currently stored for an exporter
    pub fn status(&self, id: &ConfigId) -> Option<ObjectExporterStatus> {
        self.exporters.lock().get(id).and_then(|e| e.status.clone())
    }

    pub fn patch_count(&self) -> usize {
        self.patches.lock().len()
    }

    pub fn watch_calls(&self) -> usize {
        self.watch_calls.load(Ordering::SeqCst)
    }

    /// Push an event into the most recently opened target watch
    pub fn send(&self, event: TargetEvent) {
        if let Some(tx) = self.watches.lock().last() {
            let _ = tx.unbounded_send(Ok(event));
        }
    }

    pub fn send_error(&self, message: &str) {
        if let Some(tx) = self.watches.lock().last() {
            let _ = tx.unbounded_send(Err(crate::error::Error::WatchStream(message.into())));
        }
    }

    /// End the most recently opened target watch stream
    pub fn close_watch(&self) {
        if let Some(tx) = self.watches.lock().last() {
            tx.close_channel();
        }
    }

    pub fn trigger(&self, trigger: ExporterTrigger) {
        let _ = self.trigger_tx.unbounded_send(Ok(trigger));
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_exporter(&self, id: &ConfigId) -> Result<Option<ObjectExporter>> {
        Ok(self.exporters.lock().get(id).cloned())
    }

    async fn patch_status(&self, id: &ConfigId, status: &ObjectExporterStatus) -> Result<()> {
        if let Some(exporter) = self.exporters.lock().get_mut(id) {
            exporter.status = Some(status.clone());
        }
        self.patches.lock().push((id.clone(), status.clone()));
        Ok(())
    }

    fn watch_objects(&self, _target: &ResolvedTarget) -> BoxStream<'static, Result<TargetEvent>> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = unbounded();
        self.watches.lock().push(tx);
        rx.boxed()
    }

    fn watch_exporters(&self) -> BoxStream<'static, Result<ExporterTrigger>> {
        match self.trigger_rx.lock().take() {
            Some(rx) => rx.boxed(),
            None => futures::stream::empty().boxed(),
        }
    }
}

// =============================================================================
// Fixtures
// =============================================================================

pub fn deployments_spec(selector: Option<LabelSelector>, instruments: Vec<InstrumentSpec>) -> ObjectExporterSpec {
    ObjectExporterSpec {
        identifier: ResourceIdentifier {
            group: "apps".into(),
            version: "v1".into(),
            kind: "Deployment".into(),
            selector,
        },
        instruments,
        description: None,
    }
}

pub fn instrument(name: &str, r#type: InstrumentType, value_path: Option<&str>) -> InstrumentSpec {
    InstrumentSpec {
        name: name.into(),
        unit: None,
        r#type,
        value_json_path: value_path.map(str::to_string),
        additional_labels_from_fields: BTreeMap::new(),
    }
}

pub fn team_selector(team: &str) -> LabelSelector {
    LabelSelector {
        match_labels: [("team".to_string(), team.to_string())].into(),
        match_expressions: vec![],
    }
}

/// Deployment object with a team label, replica count and resource version
pub fn deployment(name: &str, team: &str, replicas: i64, resource_version: &str) -> DynamicObject {
    serde_json::from_value(serde_json::json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": name,
            "namespace": "shop",
            "labels": {"team": team},
            "resourceVersion": resource_version
        },
        "spec": {"template": {"spec": {"containers": [{"image": format!("{}:1.0", name)}]}}},
        "status": {"replicas": replicas}
    }))
    .unwrap()
}

/// Poll `condition` until it holds, panicking after two seconds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
