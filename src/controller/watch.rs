//! Target Watches
//!
//! One task per active exporter consumes the list+watch stream of its target
//! kind, runs every instrument against each object and writes the results to
//! the instrument registry. Status refreshes are requested by enqueueing the
//! exporter, never written from here.

use crate::controller::queue::WorkQueue;
use crate::crd::{InstrumentSpec, ResourceIdentifier};
use crate::domain::{ConfigId, ObjectKey, TargetEvent};
use crate::error::{Error, Result};
use crate::extraction::{add_identity_labels, CompiledInstrument};
use crate::instruments::{ApplyOutcome, InstrumentRegistry};
use crate::metrics::OperatorMetrics;
use crate::resolver::ResolvedTarget;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::DynamicObject;
use kube::ResourceExt;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Active Watch
// =============================================================================

/// Handle of a running target watch
#[derive(Debug)]
pub struct ActiveWatch {
    /// Identifier the watch was started for
    pub identifier: ResourceIdentifier,
    /// Instruments the watch was started with
    pub instruments: Vec<InstrumentSpec>,
    /// Resolved target
    pub target: ResolvedTarget,
    /// Set once a dead stream has been reported in the status
    pub failure_reported: bool,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ActiveWatch {
    /// True while the watch task runs and was not cancelled
    pub fn is_alive(&self) -> bool {
        !self.cancel.is_cancelled() && !self.task.is_finished()
    }

    /// Same identifier, instruments and resolution
    pub fn serves(&self, identifier: &ResourceIdentifier, instruments: &[InstrumentSpec], target: &ResolvedTarget) -> bool {
        &self.identifier == identifier && self.instruments == instruments && &self.target == target
    }

    /// Stop the watch task
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ActiveWatch {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// =============================================================================
// Watch Task
// =============================================================================

/// Everything a watch task needs to turn events into series
pub struct WatchContext {
    pub config: ConfigId,
    pub epoch: u64,
    pub target: ResolvedTarget,
    pub instruments: Vec<CompiledInstrument>,
    pub registry: Arc<InstrumentRegistry>,
    pub metrics: OperatorMetrics,
    pub queue: Arc<WorkQueue<ConfigId>>,
}

/// Spawn the task consuming `stream` until cancelled or the stream ends
pub fn spawn_watch(
    ctx: WatchContext,
    identifier: ResourceIdentifier,
    instruments: Vec<InstrumentSpec>,
    stream: BoxStream<'static, Result<TargetEvent>>,
    cancel: CancellationToken,
) -> ActiveWatch {
    let target = ctx.target.clone();
    let task = tokio::spawn(run_watch(ctx, stream, cancel.clone()));

    ActiveWatch {
        identifier,
        instruments,
        target,
        failure_reported: false,
        cancel,
        task,
    }
}

async fn run_watch(
    ctx: WatchContext,
    mut stream: BoxStream<'static, Result<TargetEvent>>,
    cancel: CancellationToken,
) {
    info!("Watching {} for {}", ctx.target.gvk, ctx.config);
    let mut failing = false;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Watch for {} cancelled", ctx.config);
                return;
            }
            next = stream.next() => next,
        };

        match next {
            Some(Ok(event)) => {
                let mut changed = ctx.handle_event(event);
                if failing {
                    failing = false;
                    ctx.registry.set_watch_error(&ctx.config, ctx.epoch, None);
                    changed = true;
                }
                if changed {
                    ctx.queue.add(ctx.config.clone());
                }
            }
            Some(Err(e)) => {
                warn!("Watch for {} failed: {}", ctx.config, e);
                ctx.metrics.record_watch_error(&ctx.config);
                ctx.registry
                    .set_watch_error(&ctx.config, ctx.epoch, Some(e.to_string()));
                failing = true;
                ctx.queue.add(ctx.config.clone());
            }
            None => {
                if cancel.is_cancelled() {
                    return;
                }
                warn!("Watch stream for {} ended", ctx.config);
                ctx.metrics.record_watch_error(&ctx.config);
                ctx.registry.set_watch_error(
                    &ctx.config,
                    ctx.epoch,
                    Some(Error::WatchStream("stream ended".into()).to_string()),
                );
                ctx.queue.add(ctx.config.clone());
                return;
            }
        }
    }
}

impl WatchContext {
    /// Apply one event, returns true when the exporter status may have changed
    pub fn handle_event(&self, event: TargetEvent) -> bool {
        match event {
            TargetEvent::Applied(object) => self.apply(&object),
            TargetEvent::Deleted(object) => {
                let key = ObjectKey::from_object(&object);
                let forgotten = self.registry.forget_object(&self.config, self.epoch, &key);
                if forgotten {
                    debug!("Stopped tracking {} for {}", key, self.config);
                }
                forgotten
            }
            TargetEvent::Restarted(objects) => {
                let mut keep = HashSet::new();
                for object in &objects {
                    if self.target.matches(object.labels()) {
                        keep.insert(ObjectKey::from_object(object));
                    }
                    self.apply(object);
                }
                let dropped = self.registry.retain_objects(&self.config, self.epoch, &keep);
                self.registry.mark_synced(&self.config, self.epoch);
                debug!(
                    "Relisted {} for {}: {} objects tracked, {} dropped",
                    self.target.gvk,
                    self.config,
                    keep.len(),
                    dropped
                );
                true
            }
        }
    }

    /// Extract every instrument from one object and store the samples
    fn apply(&self, object: &DynamicObject) -> bool {
        let key = ObjectKey::from_object(object);

        // Objects relabelled out of the selector stop being tracked
        if !self.target.matches(object.labels()) {
            return self.registry.forget_object(&self.config, self.epoch, &key);
        }

        let resource_version = object.resource_version();
        if !self
            .registry
            .needs_update(&self.config, self.epoch, &key, resource_version.as_deref())
        {
            return false;
        }

        let raw = match serde_json::to_value(object) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Failed to serialize {} for {}: {}", key, self.config, e);
                return false;
            }
        };

        let mut samples = Vec::with_capacity(self.instruments.len());
        for instrument in &self.instruments {
            match instrument.extract(&raw) {
                Ok(mut sample) => {
                    add_identity_labels(&mut sample.labels, &key);
                    samples.push((instrument.name.clone(), instrument.kind(), sample));
                }
                Err(e) => {
                    if e.is_per_object() {
                        debug!("Skipping {} on {} for {}: {}", instrument.name, key, self.config, e);
                    } else {
                        warn!("Failed to extract {} on {} for {}: {}", instrument.name, key, self.config, e);
                    }
                    self.registry.record_extraction_error(&self.config, self.epoch);
                    self.metrics.record_extraction_error(&self.config);
                }
            }
        }

        match self.registry.apply_object(
            &self.config,
            self.epoch,
            &key,
            resource_version.as_deref(),
            samples,
        ) {
            Ok(ApplyOutcome::Applied) => true,
            Ok(ApplyOutcome::Unchanged) | Ok(ApplyOutcome::Stale) => false,
            Err(e) => {
                warn!("Failed to record {} for {}: {}", key, self.config, e);
                self.registry.record_extraction_error(&self.config, self.epoch);
                self.metrics.record_extraction_error(&self.config);
                true
            }
        }
    }
}
