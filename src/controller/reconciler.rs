//! Export Reconciler
//!
//! Drives every ObjectExporter through its lifecycle:
//!
//! ```text
//! Uninitialized -> WatchEstablished -> Syncing <-> Error -> Terminated
//! ```
//!
//! A fixed pool of workers pulls exporter ids from the deduplicating work
//! queue. Each pass resolves the identifier, compiles the instruments, makes
//! sure exactly one watch serves the exporter and writes the status derived
//! from the registry snapshot.

use crate::controller::queue::WorkQueue;
use crate::controller::watch::{spawn_watch, ActiveWatch, WatchContext};
use crate::crd::{ExporterPhase, ObjectExporterSpec, ObjectExporterStatus};
use crate::domain::{ClusterClientRef, ConfigId, ExporterTrigger};
use crate::error::{Error, ErrorAction, Result};
use crate::extraction::CompiledInstrument;
use crate::instruments::InstrumentRegistry;
use crate::metrics::OperatorMetrics;
use crate::resolver::{ResolvedTarget, Resolver};
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the reconciler
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Number of reconcile workers
    pub workers: usize,
    /// Interval at which every active exporter is reconciled again
    pub resync_interval: Duration,
    /// Number of series listed in `status.exportedTimeSeries`
    pub preview_limit: usize,
    /// First retry delay after a failed pass
    pub backoff_initial: Duration,
    /// Upper bound of the retry delay
    pub backoff_max: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_interval: Duration::from_secs(60),
            preview_limit: 10,
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
        }
    }
}

// =============================================================================
// Reconcile Outcome
// =============================================================================

/// Result of one reconcile pass
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    /// Phase written to the status
    pub phase: ExporterPhase,
    /// A new watch was started during this pass
    pub watch_started: bool,
    /// The status subresource was patched
    pub status_patched: bool,
    /// Requested follow-up pass
    pub requeue_after: Option<Duration>,
}

impl ReconcileOutcome {
    fn terminated() -> Self {
        Self {
            phase: ExporterPhase::Terminated,
            watch_started: false,
            status_patched: false,
            requeue_after: None,
        }
    }
}

enum WatchCheck {
    /// The running watch serves the current spec
    Current,
    /// The watch stream died and this is the first pass to notice
    Died(String),
    /// No usable watch, start one
    Restart,
}

// =============================================================================
// Export Reconciler
// =============================================================================

/// Reconciles ObjectExporters into watches and exported series
pub struct ExportReconciler {
    client: ClusterClientRef,
    resolver: Resolver,
    registry: Arc<InstrumentRegistry>,
    metrics: OperatorMetrics,
    queue: Arc<WorkQueue<ConfigId>>,
    watches: Mutex<HashMap<ConfigId, ActiveWatch>>,
    backoffs: Mutex<HashMap<ConfigId, ExponentialBackoff>>,
    shutdown: CancellationToken,
    config: ReconcilerConfig,
}

impl ExportReconciler {
    pub fn new(
        client: ClusterClientRef,
        resolver: Resolver,
        registry: Arc<InstrumentRegistry>,
        metrics: OperatorMetrics,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            client,
            resolver,
            registry,
            metrics,
            queue: Arc::new(WorkQueue::new()),
            watches: Mutex::new(HashMap::new()),
            backoffs: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            config,
        }
    }

    pub fn queue(&self) -> Arc<WorkQueue<ConfigId>> {
        Arc::clone(&self.queue)
    }

    pub fn registry(&self) -> Arc<InstrumentRegistry> {
        Arc::clone(&self.registry)
    }

    /// Token that stops `run` and every watch when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Exporters with a running watch
    pub fn active_watches(&self) -> Vec<ConfigId> {
        self.watches.lock().keys().cloned().collect()
    }

    pub fn watch_count(&self) -> usize {
        self.watches.lock().len()
    }

    // =========================================================================
    // Reconcile
    // =========================================================================

    /// Bring one exporter's watch, series and status in line with its spec
    pub async fn reconcile(&self, id: &ConfigId) -> Result<ReconcileOutcome> {
        let Some(exporter) = self.client.get_exporter(id).await? else {
            if self.teardown(id) {
                info!("ObjectExporter {} deleted, watch stopped", id);
            }
            self.metrics.forget_exporter(id);
            return Ok(ReconcileOutcome::terminated());
        };

        let current = exporter.status.clone().unwrap_or_default();
        let generation = exporter.metadata.generation;

        let (target, instruments) = match self.prepare(&exporter.spec) {
            Ok(prepared) => prepared,
            Err(e) if e.is_config_error() => {
                // The previous watch and its series stay in place until the spec is fixed
                warn!("ObjectExporter {} is misconfigured: {}", id, e);
                let status = self.error_status(id, &current, generation, e.to_string());
                let status_patched = self.write_status(id, &current, status).await?;
                let requeue_after = match e.action() {
                    ErrorAction::RequeueAfter(delay) => Some(delay),
                    _ => None,
                };
                return Ok(ReconcileOutcome {
                    phase: ExporterPhase::Error,
                    watch_started: false,
                    status_patched,
                    requeue_after,
                });
            }
            Err(e) => return Err(e),
        };

        let watch_started = match self.check_watch(id, &exporter.spec, &target) {
            WatchCheck::Current => false,
            WatchCheck::Died(reason) => {
                let status = self.error_status(id, &current, generation, format!("watch failed: {}", reason));
                self.write_status(id, &current, status).await?;
                return Err(Error::WatchStream(reason));
            }
            WatchCheck::Restart => {
                self.setup_watches(id, &exporter.spec, target, instruments);
                true
            }
        };

        let status = self.observed_status(id, &current, generation);
        let phase = status.phase;
        let status_patched = self.write_status(id, &current, status).await?;

        Ok(ReconcileOutcome {
            phase,
            watch_started,
            status_patched,
            requeue_after: None,
        })
    }

    /// Validate the spec, resolve the identifier and compile every instrument
    fn prepare(&self, spec: &ObjectExporterSpec) -> Result<(ResolvedTarget, Vec<CompiledInstrument>)> {
        spec.validate()?;
        let target = self.resolver.resolve(&spec.identifier)?;
        let instruments = CompiledInstrument::compile_all(&spec.instruments)?;
        Ok((target, instruments))
    }

    fn check_watch(&self, id: &ConfigId, spec: &ObjectExporterSpec, target: &ResolvedTarget) -> WatchCheck {
        let mut watches = self.watches.lock();
        let Some(watch) = watches.get_mut(id) else {
            return WatchCheck::Restart;
        };
        if !watch.serves(&spec.identifier, &spec.instruments, target) {
            debug!("ObjectExporter {} changed, restarting watch", id);
            return WatchCheck::Restart;
        }
        if watch.is_alive() {
            return WatchCheck::Current;
        }
        if watch.failure_reported {
            return WatchCheck::Restart;
        }

        watch.failure_reported = true;
        let reason = self
            .registry
            .snapshot(id, 0)
            .watch_error
            .unwrap_or_else(|| "watch stream ended".to_string());
        WatchCheck::Died(reason)
    }

    /// Replace any watch of `id` with a fresh one over `target`
    pub fn setup_watches(
        &self,
        id: &ConfigId,
        spec: &ObjectExporterSpec,
        target: ResolvedTarget,
        instruments: Vec<CompiledInstrument>,
    ) {
        self.teardown(id);

        let epoch = self.registry.attach(id);
        let stream = self.client.watch_objects(&target);
        info!(
            "Starting watch for {}: {} ({} instruments, selector {:?})",
            id,
            target.gvk,
            instruments.len(),
            target.label_query
        );

        let ctx = WatchContext {
            config: id.clone(),
            epoch,
            target,
            instruments,
            registry: Arc::clone(&self.registry),
            metrics: self.metrics.clone(),
            queue: Arc::clone(&self.queue),
        };
        let watch = spawn_watch(
            ctx,
            spec.identifier.clone(),
            spec.instruments.clone(),
            stream,
            self.shutdown.child_token(),
        );

        let mut watches = self.watches.lock();
        watches.insert(id.clone(), watch);
        self.metrics.set_active_watches(watches.len());
    }

    /// Drop all series of `id`, then stop its watch
    fn teardown(&self, id: &ConfigId) -> bool {
        let removed = self.registry.remove_all(id);
        let mut watches = self.watches.lock();
        let stopped = watches.remove(id).map(|watch| watch.cancel()).is_some();
        self.metrics.set_active_watches(watches.len());
        if stopped {
            debug!("Stopped watch for {} ({} series removed)", id, removed);
        }
        stopped
    }

    // =========================================================================
    // Status
    // =========================================================================

    fn observed_status(
        &self,
        id: &ConfigId,
        current: &ObjectExporterStatus,
        generation: Option<i64>,
    ) -> ObjectExporterStatus {
        let snapshot = self.registry.snapshot(id, self.config.preview_limit);
        let (phase, message) = match &snapshot.watch_error {
            Some(e) => (ExporterPhase::Error, Some(format!("watch failed: {}", e))),
            None if snapshot.synced => (ExporterPhase::Syncing, None),
            None => (ExporterPhase::WatchEstablished, None),
        };

        let status = ObjectExporterStatus {
            phase,
            instrumented_resource_count: snapshot.tracked_objects as i64,
            exported_series_count: snapshot.series_count as i64,
            exported_time_series: snapshot.preview,
            extraction_errors: snapshot.extraction_errors as i64,
            observed_generation: generation,
            message,
            last_transition_time: current.last_transition_time,
        };
        with_transition(current, status)
    }

    fn error_status(
        &self,
        id: &ConfigId,
        current: &ObjectExporterStatus,
        generation: Option<i64>,
        message: String,
    ) -> ObjectExporterStatus {
        let mut status = self.observed_status(id, current, generation);
        status.phase = ExporterPhase::Error;
        status.message = Some(message);
        status.last_transition_time = current.last_transition_time;
        with_transition(current, status)
    }

    /// Patch the status if it differs from the stored one
    async fn write_status(
        &self,
        id: &ConfigId,
        current: &ObjectExporterStatus,
        desired: ObjectExporterStatus,
    ) -> Result<bool> {
        if current == &desired {
            return Ok(false);
        }
        if current.phase != desired.phase {
            info!("ObjectExporter {}: {} -> {}", id, current.phase, desired.phase);
        }
        self.client.patch_status(id, &desired).await?;
        Ok(true)
    }

    // =========================================================================
    // Run Loop
    // =========================================================================

    /// Run the workers and feed them from the exporter watch until shutdown
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let workers: Vec<_> = (0..self.config.workers.max(1))
            .map(|worker_id| {
                let this = Arc::clone(&self);
                tokio::spawn(async move { this.worker(worker_id).await })
            })
            .collect();
        info!("Started {} reconcile workers", workers.len());

        let mut triggers = self.client.watch_exporters();
        let mut resync = tokio::time::interval(self.config.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        resync.tick().await;

        let result = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                _ = resync.tick() => {
                    for id in self.active_watches() {
                        self.queue.add(id);
                    }
                }
                trigger = triggers.next() => match trigger {
                    Some(Ok(trigger)) => self.handle_trigger(trigger),
                    Some(Err(e)) => warn!("ObjectExporter watch error: {}", e),
                    None => {
                        error!("ObjectExporter watch stream ended");
                        break Err(Error::WatchStream("ObjectExporter watch ended".into()));
                    }
                },
            }
        };

        self.queue.shutdown();
        self.shutdown.cancel();
        for worker in workers {
            let _ = worker.await;
        }
        self.shutdown_watches();
        info!("Reconciler stopped");
        result
    }

    fn handle_trigger(&self, trigger: ExporterTrigger) {
        match trigger {
            ExporterTrigger::Changed(id) => self.queue.add(id),
            ExporterTrigger::Resync(listed) => {
                // Exporters with a watch but missing from the list were deleted
                let ids: BTreeSet<ConfigId> = listed.into_iter().chain(self.active_watches()).collect();
                debug!("Resyncing {} ObjectExporters", ids.len());
                for id in ids {
                    self.queue.add(id);
                }
            }
        }
    }

    async fn worker(self: Arc<Self>, worker_id: usize) {
        debug!("Reconcile worker {} started", worker_id);
        while let Some(id) = self.queue.next().await {
            let start = Instant::now();
            let result = self.reconcile(&id).await;

            match result {
                Ok(outcome) => {
                    self.metrics.observe_reconcile(None, start.elapsed());
                    self.backoffs.lock().remove(&id);
                    if let Some(delay) = outcome.requeue_after {
                        self.queue.add_after(id.clone(), delay);
                    }
                }
                Err(e) => {
                    self.metrics.observe_reconcile(Some(e.metric_label()), start.elapsed());
                    match e.action() {
                        ErrorAction::RequeueWithBackoff => {
                            let delay = self.next_backoff(&id);
                            if e.is_transient() {
                                warn!("Reconcile of {} failed: {}, retrying in {:?}", id, e, delay);
                            } else {
                                error!("Reconcile of {} failed: {}, retrying in {:?}", id, e, delay);
                            }
                            self.queue.add_after(id.clone(), delay);
                        }
                        ErrorAction::RequeueAfter(delay) => {
                            warn!("Reconcile of {} failed: {}, retrying in {:?}", id, e, delay);
                            self.queue.add_after(id.clone(), delay);
                        }
                        ErrorAction::NoRequeue => {
                            warn!("Reconcile of {} failed: {}", id, e);
                        }
                    }
                }
            }

            self.queue.done(&id);
        }
        debug!("Reconcile worker {} stopped", worker_id);
    }

    fn next_backoff(&self, id: &ConfigId) -> Duration {
        let mut backoffs = self.backoffs.lock();
        let backoff = backoffs.entry(id.clone()).or_insert_with(|| {
            ExponentialBackoffBuilder::new()
                .with_initial_interval(self.config.backoff_initial)
                .with_max_interval(self.config.backoff_max)
                .with_max_elapsed_time(None)
                .build()
        });
        backoff.next_backoff().unwrap_or(self.config.backoff_max)
    }

    fn shutdown_watches(&self) {
        let mut watches = self.watches.lock();
        for watch in watches.values() {
            watch.cancel();
        }
        watches.clear();
        self.metrics.set_active_watches(0);
    }
}

/// Stamp a transition time when the phase changes
fn with_transition(current: &ObjectExporterStatus, mut status: ObjectExporterStatus) -> ObjectExporterStatus {
    if status.phase != current.phase || status.last_transition_time.is_none() {
        status.last_transition_time = Some(Utc::now());
    }
    status
}
