//! Instrument Registry
//!
//! Single owner of every exported series. Each exporter gets its own
//! lock-protected series table inside a `DashMap`, so watches of unrelated
//! exporters never contend with each other or with `/metrics` scrapes.
//!
//! Watch tasks write through the object-level API (`apply_object`,
//! `forget_object`, ...) tagged with the epoch returned by `attach`. Once an
//! exporter is torn down with `remove_all` its epoch is gone and late writes
//! from a cancelled watch are dropped.

use crate::crd::{InstrumentType, UnitAggregation};
use crate::domain::{ConfigId, ObjectKey};
use crate::error::{Error, Result};
use crate::extraction::Sample;
use dashmap::DashMap;
use parking_lot::RwLock;
use prometheus::proto::{self, MetricFamily, MetricType};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Label name to label value, ordered by name
pub type LabelSet = BTreeMap<String, String>;

/// Help text attached to every exported family
const FAMILY_HELP: &str = "Exported from Kubernetes objects by an ObjectExporter";

// =============================================================================
// Series Identity
// =============================================================================

/// Type and aggregation of a series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstrumentKind {
    pub instrument_type: InstrumentType,
    pub aggregation: UnitAggregation,
}

impl InstrumentKind {
    /// Gauges always replace, their aggregation is normalised to `Total`
    pub fn new(instrument_type: InstrumentType, aggregation: UnitAggregation) -> Self {
        let aggregation = match instrument_type {
            InstrumentType::Gauge => UnitAggregation::Total,
            InstrumentType::Counter => aggregation,
        };
        Self {
            instrument_type,
            aggregation,
        }
    }

    pub fn gauge() -> Self {
        Self::new(InstrumentType::Gauge, UnitAggregation::Total)
    }

    pub fn counter(aggregation: UnitAggregation) -> Self {
        Self::new(InstrumentType::Counter, aggregation)
    }

    /// True when a write adds to the stored value instead of replacing it
    pub fn accumulates(&self) -> bool {
        self.instrument_type == InstrumentType::Counter && self.aggregation == UnitAggregation::Sum
    }
}

impl std::fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.instrument_type {
            InstrumentType::Gauge => write!(f, "Gauge"),
            InstrumentType::Counter => write!(f, "Counter({})", self.aggregation),
        }
    }
}

/// Instrument name plus label set
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeriesKey {
    pub instrument: String,
    pub labels: LabelSet,
}

impl SeriesKey {
    pub fn new(instrument: impl Into<String>, labels: LabelSet) -> Self {
        Self {
            instrument: instrument.into(),
            labels,
        }
    }
}

impl std::fmt::Display for SeriesKey {
    /// Exposition style: `name{k="v",...}`
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.instrument)?;
        if self.labels.is_empty() {
            return Ok(());
        }
        write!(f, "{{")?;
        for (i, (k, v)) in self.labels.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}=\"{}\"", k, escape_label_value(v))?;
        }
        write!(f, "}}")
    }
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', r"\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

// =============================================================================
// Per-Config State
// =============================================================================

#[derive(Debug, Clone)]
struct SeriesEntry {
    kind: InstrumentKind,
    value: f64,
    /// Tracked objects currently producing this series, with their last reading
    owners: BTreeMap<ObjectKey, f64>,
}

#[derive(Debug, Default)]
struct TrackedObject {
    resource_version: Option<String>,
    series: BTreeSet<SeriesKey>,
}

#[derive(Debug)]
struct ConfigSeries {
    epoch: u64,
    series: BTreeMap<SeriesKey, SeriesEntry>,
    objects: HashMap<ObjectKey, TrackedObject>,
    extraction_errors: u64,
    watch_error: Option<String>,
    synced: bool,
}

impl ConfigSeries {
    fn new(epoch: u64) -> Self {
        Self {
            epoch,
            series: BTreeMap::new(),
            objects: HashMap::new(),
            extraction_errors: 0,
            watch_error: None,
            synced: false,
        }
    }

    fn check_kind(&self, key: &SeriesKey, kind: InstrumentKind) -> Result<()> {
        match self.series.get(key) {
            Some(entry) if entry.kind != kind => Err(Error::RegistryConflict {
                series: key.to_string(),
                reason: format!("registered as {}, written as {}", entry.kind, kind),
            }),
            _ => Ok(()),
        }
    }

    /// Write a value according to the series kind, returns the stored value
    fn write(&mut self, key: SeriesKey, kind: InstrumentKind, value: f64) -> f64 {
        let entry = self.series.entry(key).or_insert(SeriesEntry {
            kind,
            value: 0.0,
            owners: BTreeMap::new(),
        });
        if kind.accumulates() {
            entry.value += value;
        } else {
            entry.value = value;
        }
        entry.value
    }

    /// Drop `owner` from a series; a shared gauge falls back to a remaining owner's reading
    fn release(&mut self, key: &SeriesKey, owner: &ObjectKey) {
        let Some(entry) = self.series.get_mut(key) else {
            return;
        };
        entry.owners.remove(owner);
        match entry.owners.values().next_back().copied() {
            None => {
                self.series.remove(key);
            }
            Some(reading) if !entry.kind.accumulates() => entry.value = reading,
            Some(_) => {}
        }
    }

    fn forget(&mut self, key: &ObjectKey) -> bool {
        match self.objects.remove(key) {
            Some(tracked) => {
                for series in &tracked.series {
                    self.release(series, key);
                }
                true
            }
            None => false,
        }
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Point-in-time view of one exporter's series
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrySnapshot {
    /// Number of live series
    pub series_count: usize,
    /// Number of tracked objects
    pub tracked_objects: usize,
    /// Extraction failures since the watch was attached
    pub extraction_errors: u64,
    /// Last watch stream failure, cleared on recovery
    pub watch_error: Option<String>,
    /// Initial list applied
    pub synced: bool,
    /// First series in exposition form
    pub preview: Vec<String>,
}

/// Result of an object-level write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Series written
    Applied,
    /// Same resource version as last time, nothing written
    Unchanged,
    /// Epoch no longer current, write discarded
    Stale,
}

// =============================================================================
// Instrument Registry
// =============================================================================

/// Registry of all exported series, keyed by exporter
#[derive(Debug)]
pub struct InstrumentRegistry {
    configs: DashMap<ConfigId, Arc<RwLock<ConfigSeries>>>,
    next_epoch: AtomicU64,
}

impl InstrumentRegistry {
    pub fn new() -> Self {
        Self {
            configs: DashMap::new(),
            next_epoch: AtomicU64::new(1),
        }
    }

    fn allocate_epoch(&self) -> u64 {
        self.next_epoch.fetch_add(1, Ordering::Relaxed)
    }

    /// Clone the per-config handle out so the map shard is released before locking
    fn get(&self, config: &ConfigId) -> Option<Arc<RwLock<ConfigSeries>>> {
        self.configs.get(config).map(|entry| Arc::clone(entry.value()))
    }

    fn get_or_create(&self, config: &ConfigId) -> Arc<RwLock<ConfigSeries>> {
        let entry = self
            .configs
            .entry(config.clone())
            .or_insert_with(|| Arc::new(RwLock::new(ConfigSeries::new(self.allocate_epoch()))));
        Arc::clone(entry.value())
    }

    /// Run `f` on the config state if `epoch` is still current
    fn with_epoch<T>(&self, config: &ConfigId, epoch: u64, f: impl FnOnce(&mut ConfigSeries) -> T) -> Option<T> {
        let handle = self.get(config)?;
        let mut state = handle.write();
        if state.epoch != epoch {
            debug!("Discarding stale write for {} (epoch {} != {})", config, epoch, state.epoch);
            return None;
        }
        Some(f(&mut state))
    }

    // =========================================================================
    // Series Operations
    // =========================================================================

    /// Write one value, returns the value now stored
    pub fn upsert(
        &self,
        config: &ConfigId,
        instrument: &str,
        labels: LabelSet,
        value: f64,
        kind: InstrumentKind,
    ) -> Result<f64> {
        let handle = self.get_or_create(config);
        let mut state = handle.write();
        let key = SeriesKey::new(instrument, labels);
        state.check_kind(&key, kind)?;
        Ok(state.write(key, kind, value))
    }

    /// Remove one series, no-op if absent
    pub fn remove(&self, config: &ConfigId, instrument: &str, labels: &LabelSet) -> bool {
        let Some(handle) = self.get(config) else {
            return false;
        };
        let mut state = handle.write();
        let key = SeriesKey::new(instrument, labels.clone());
        if state.series.remove(&key).is_none() {
            return false;
        }
        for tracked in state.objects.values_mut() {
            tracked.series.remove(&key);
        }
        true
    }

    /// Drop every series of an exporter and invalidate its epoch
    pub fn remove_all(&self, config: &ConfigId) -> usize {
        match self.configs.remove(config) {
            Some((_, handle)) => {
                let removed = handle.read().series.len();
                debug!("Removed {} series of {}", removed, config);
                removed
            }
            None => 0,
        }
    }

    /// Counts and preview of one exporter
    pub fn snapshot(&self, config: &ConfigId, preview_limit: usize) -> RegistrySnapshot {
        let Some(handle) = self.get(config) else {
            return RegistrySnapshot::default();
        };
        let state = handle.read();
        RegistrySnapshot {
            series_count: state.series.len(),
            tracked_objects: state.objects.len(),
            extraction_errors: state.extraction_errors,
            watch_error: state.watch_error.clone(),
            synced: state.synced,
            preview: state
                .series
                .keys()
                .take(preview_limit)
                .map(SeriesKey::to_string)
                .collect(),
        }
    }

    /// Current value of one series
    pub fn value(&self, config: &ConfigId, instrument: &str, labels: &LabelSet) -> Option<f64> {
        let handle = self.get(config)?;
        let state = handle.read();
        state
            .series
            .get(&SeriesKey::new(instrument, labels.clone()))
            .map(|entry| entry.value)
    }

    // =========================================================================
    // Object Operations (watch path)
    // =========================================================================

    /// Start a fresh generation for an exporter, returns its epoch
    pub fn attach(&self, config: &ConfigId) -> u64 {
        let epoch = self.allocate_epoch();
        self.configs
            .insert(config.clone(), Arc::new(RwLock::new(ConfigSeries::new(epoch))));
        epoch
    }

    /// False when the object was already applied at this resource version
    pub fn needs_update(
        &self,
        config: &ConfigId,
        epoch: u64,
        object: &ObjectKey,
        resource_version: Option<&str>,
    ) -> bool {
        let Some(rv) = resource_version else {
            return true;
        };
        let Some(handle) = self.get(config) else {
            return false;
        };
        let state = handle.read();
        if state.epoch != epoch {
            return false;
        }
        state
            .objects
            .get(object)
            .map_or(true, |tracked| tracked.resource_version.as_deref() != Some(rv))
    }

    /// Replace the series produced by one object
    ///
    /// Series the object no longer produces are released. Nothing is written
    /// when the resource version matches the last applied one.
    pub fn apply_object(
        &self,
        config: &ConfigId,
        epoch: u64,
        object: &ObjectKey,
        resource_version: Option<&str>,
        samples: Vec<(String, InstrumentKind, Sample)>,
    ) -> Result<ApplyOutcome> {
        let outcome = self.with_epoch(config, epoch, |state| {
            let previous = state.objects.get(object);
            if let (Some(previous), Some(rv)) = (previous, resource_version) {
                if previous.resource_version.as_deref() == Some(rv) {
                    return Ok(ApplyOutcome::Unchanged);
                }
            }

            let samples: Vec<(SeriesKey, InstrumentKind, f64)> = samples
                .into_iter()
                .map(|(instrument, kind, sample)| (SeriesKey::new(instrument, sample.labels), kind, sample.value))
                .collect();
            for (key, kind, _) in &samples {
                state.check_kind(key, *kind)?;
            }

            let previous = state
                .objects
                .remove(object)
                .map(|tracked| tracked.series)
                .unwrap_or_default();

            let mut current = BTreeSet::new();
            for (key, kind, value) in samples {
                state.write(key.clone(), kind, value);
                if let Some(entry) = state.series.get_mut(&key) {
                    entry.owners.insert(object.clone(), value);
                }
                current.insert(key);
            }
            for stale in previous.difference(&current) {
                state.release(stale, object);
            }

            state.objects.insert(
                object.clone(),
                TrackedObject {
                    resource_version: resource_version.map(str::to_string),
                    series: current,
                },
            );
            Ok(ApplyOutcome::Applied)
        });

        outcome.unwrap_or(Ok(ApplyOutcome::Stale))
    }

    /// Drop one object and the series only it produced
    pub fn forget_object(&self, config: &ConfigId, epoch: u64, object: &ObjectKey) -> bool {
        self.with_epoch(config, epoch, |state| state.forget(object))
            .unwrap_or(false)
    }

    /// Forget every tracked object not in `keep`, returns how many were dropped
    pub fn retain_objects(&self, config: &ConfigId, epoch: u64, keep: &HashSet<ObjectKey>) -> usize {
        self.with_epoch(config, epoch, |state| {
            let gone: Vec<ObjectKey> = state
                .objects
                .keys()
                .filter(|key| !keep.contains(*key))
                .cloned()
                .collect();
            for key in &gone {
                state.forget(key);
            }
            gone.len()
        })
        .unwrap_or(0)
    }

    pub fn record_extraction_error(&self, config: &ConfigId, epoch: u64) {
        self.with_epoch(config, epoch, |state| state.extraction_errors += 1);
    }

    /// Mark the initial list as applied
    pub fn mark_synced(&self, config: &ConfigId, epoch: u64) {
        self.with_epoch(config, epoch, |state| state.synced = true);
    }

    /// Record or clear a watch stream failure
    pub fn set_watch_error(&self, config: &ConfigId, epoch: u64, error: Option<String>) {
        self.with_epoch(config, epoch, |state| state.watch_error = error);
    }

    // =========================================================================
    // Exposition
    // =========================================================================

    /// Metric families of every exporter, merged by instrument name
    pub fn families(&self) -> Vec<MetricFamily> {
        let mut families: BTreeMap<String, (InstrumentType, Vec<proto::Metric>, HashSet<LabelSet>)> =
            BTreeMap::new();

        // Exporters in name order so the first type of a clashing name is stable
        let mut handles: Vec<(ConfigId, Arc<RwLock<ConfigSeries>>)> = self
            .configs
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        handles.sort_by(|a, b| a.0.cmp(&b.0));

        for (config, handle) in handles {
            let state = handle.read();
            for (key, entry) in &state.series {
                let (family_type, metrics, seen) = families
                    .entry(key.instrument.clone())
                    .or_insert_with(|| (entry.kind.instrument_type, Vec::new(), HashSet::new()));
                if *family_type != entry.kind.instrument_type {
                    warn!(
                        "Skipping {} from {}: {} already exported as {}",
                        key, config, key.instrument, family_type
                    );
                    continue;
                }
                if !seen.insert(key.labels.clone()) {
                    debug!("Skipping duplicate series {} from {}", key, config);
                    continue;
                }
                metrics.push(to_metric(&key.labels, entry));
            }
        }

        families
            .into_iter()
            .filter(|(_, (_, metrics, _))| !metrics.is_empty())
            .map(|(name, (instrument_type, metrics, _))| {
                let mut family = MetricFamily::default();
                family.set_name(name);
                family.set_help(FAMILY_HELP.to_string());
                family.set_field_type(match instrument_type {
                    InstrumentType::Gauge => MetricType::GAUGE,
                    InstrumentType::Counter => MetricType::COUNTER,
                });
                for metric in metrics {
                    family.mut_metric().push(metric);
                }
                family
            })
            .collect()
    }
}

impl Default for InstrumentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn to_metric(labels: &LabelSet, entry: &SeriesEntry) -> proto::Metric {
    let mut metric = proto::Metric::default();
    for (name, value) in labels {
        let mut pair = proto::LabelPair::default();
        pair.set_name(name.clone());
        pair.set_value(value.clone());
        metric.mut_label().push(pair);
    }
    match entry.kind.instrument_type {
        InstrumentType::Gauge => {
            let mut gauge = proto::Gauge::default();
            gauge.set_value(entry.value);
            metric.set_gauge(gauge);
        }
        InstrumentType::Counter => {
            let mut counter = proto::Counter::default();
            counter.set_value(entry.value);
            metric.set_counter(counter);
        }
    }
    metric
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use prometheus::{Encoder, TextEncoder};

    fn config() -> ConfigId {
        ConfigId::new("monitoring", "deployments")
    }

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn sample(value: f64, pairs: &[(&str, &str)]) -> Sample {
        Sample {
            value,
            labels: labels(pairs),
        }
    }

    #[test]
    fn test_counter_sum_accumulates() {
        let registry = InstrumentRegistry::new();
        let l = labels(&[("name", "web")]);
        for v in [2.0, 3.0, 5.0] {
            registry
                .upsert(&config(), "restarts", l.clone(), v, InstrumentKind::counter(UnitAggregation::Sum))
                .unwrap();
        }
        assert_eq!(registry.value(&config(), "restarts", &l), Some(10.0));
    }

    #[test]
    fn test_counter_total_keeps_last() {
        let registry = InstrumentRegistry::new();
        let l = labels(&[("name", "web")]);
        for v in [2.0, 3.0, 5.0] {
            registry
                .upsert(&config(), "restarts", l.clone(), v, InstrumentKind::counter(UnitAggregation::Total))
                .unwrap();
        }
        assert_eq!(registry.value(&config(), "restarts", &l), Some(5.0));
    }

    #[test]
    fn test_gauge_replaces() {
        let registry = InstrumentRegistry::new();
        let l = labels(&[]);
        registry.upsert(&config(), "replicas", l.clone(), 3.0, InstrumentKind::gauge()).unwrap();
        registry.upsert(&config(), "replicas", l.clone(), 1.0, InstrumentKind::gauge()).unwrap();
        assert_eq!(registry.value(&config(), "replicas", &l), Some(1.0));
    }

    #[test]
    fn test_kind_conflict() {
        let registry = InstrumentRegistry::new();
        let l = labels(&[("name", "web")]);
        registry.upsert(&config(), "replicas", l.clone(), 3.0, InstrumentKind::gauge()).unwrap();
        let result = registry.upsert(
            &config(),
            "replicas",
            l,
            3.0,
            InstrumentKind::counter(UnitAggregation::Total),
        );
        assert_matches!(result, Err(Error::RegistryConflict { .. }));
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let registry = InstrumentRegistry::new();
        assert!(!registry.remove(&config(), "replicas", &labels(&[])));
        registry.upsert(&config(), "replicas", labels(&[]), 1.0, InstrumentKind::gauge()).unwrap();
        assert!(registry.remove(&config(), "replicas", &labels(&[])));
        assert_eq!(registry.snapshot(&config(), 10).series_count, 0);
    }

    #[test]
    fn test_remove_all_empties_snapshot() {
        let registry = InstrumentRegistry::new();
        for name in ["a", "b", "c"] {
            registry
                .upsert(&config(), "replicas", labels(&[("name", name)]), 1.0, InstrumentKind::gauge())
                .unwrap();
        }
        let other = ConfigId::new("monitoring", "pods");
        registry.upsert(&other, "pods", labels(&[]), 1.0, InstrumentKind::gauge()).unwrap();

        assert_eq!(registry.remove_all(&config()), 3);
        assert_eq!(registry.snapshot(&config(), 10), RegistrySnapshot::default());
        assert_eq!(registry.snapshot(&other, 10).series_count, 1);
    }

    #[test]
    fn test_stale_epoch_is_discarded() {
        let registry = InstrumentRegistry::new();
        let epoch = registry.attach(&config());
        registry.remove_all(&config());

        let outcome = registry
            .apply_object(
                &config(),
                epoch,
                &ObjectKey::new(Some("shop"), "web"),
                Some("1"),
                vec![("replicas".into(), InstrumentKind::gauge(), sample(3.0, &[]))],
            )
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Stale);
        assert_eq!(registry.snapshot(&config(), 10).series_count, 0);

        // A new generation does not accept writes of the old one either
        let fresh = registry.attach(&config());
        assert_ne!(fresh, epoch);
        assert!(!registry.forget_object(&config(), epoch, &ObjectKey::new(Some("shop"), "web")));
    }

    #[test]
    fn test_apply_and_forget_object() {
        let registry = InstrumentRegistry::new();
        let epoch = registry.attach(&config());
        let web = ObjectKey::new(Some("shop"), "web");
        let api = ObjectKey::new(Some("shop"), "api");

        for (key, rv) in [(&web, "1"), (&api, "2")] {
            registry
                .apply_object(
                    &config(),
                    epoch,
                    key,
                    Some(rv),
                    vec![(
                        "replicas".into(),
                        InstrumentKind::gauge(),
                        sample(2.0, &[("name", key.name.as_str())]),
                    )],
                )
                .unwrap();
        }
        let snapshot = registry.snapshot(&config(), 10);
        assert_eq!(snapshot.series_count, 2);
        assert_eq!(snapshot.tracked_objects, 2);
        assert_eq!(
            snapshot.preview,
            vec![r#"replicas{name="api"}"#.to_string(), r#"replicas{name="web"}"#.to_string()]
        );

        assert!(registry.forget_object(&config(), epoch, &web));
        let snapshot = registry.snapshot(&config(), 10);
        assert_eq!(snapshot.series_count, 1);
        assert_eq!(snapshot.tracked_objects, 1);
        assert_eq!(snapshot.preview, vec![r#"replicas{name="api"}"#.to_string()]);
    }

    #[test]
    fn test_unchanged_resource_version_does_not_double_count() {
        let registry = InstrumentRegistry::new();
        let epoch = registry.attach(&config());
        let web = ObjectKey::new(Some("shop"), "web");
        let write = |rv: &str, value: f64| {
            registry
                .apply_object(
                    &config(),
                    epoch,
                    &web,
                    Some(rv),
                    vec![(
                        "restarts".into(),
                        InstrumentKind::counter(UnitAggregation::Sum),
                        sample(value, &[]),
                    )],
                )
                .unwrap()
        };

        assert!(registry.needs_update(&config(), epoch, &web, Some("1")));
        assert_eq!(write("1", 2.0), ApplyOutcome::Applied);
        assert!(!registry.needs_update(&config(), epoch, &web, Some("1")));
        assert_eq!(write("1", 2.0), ApplyOutcome::Unchanged);
        assert_eq!(write("2", 3.0), ApplyOutcome::Applied);
        assert_eq!(registry.value(&config(), "restarts", &labels(&[])), Some(5.0));
    }

    #[test]
    fn test_object_drops_series_it_no_longer_produces() {
        let registry = InstrumentRegistry::new();
        let epoch = registry.attach(&config());
        let web = ObjectKey::new(Some("shop"), "web");

        registry
            .apply_object(
                &config(),
                epoch,
                &web,
                Some("1"),
                vec![("info".into(), InstrumentKind::gauge(), sample(1.0, &[("image", "nginx:1.24")]))],
            )
            .unwrap();
        registry
            .apply_object(
                &config(),
                epoch,
                &web,
                Some("2"),
                vec![("info".into(), InstrumentKind::gauge(), sample(1.0, &[("image", "nginx:1.25")]))],
            )
            .unwrap();

        let snapshot = registry.snapshot(&config(), 10);
        assert_eq!(snapshot.preview, vec![r#"info{image="nginx:1.25"}"#.to_string()]);
    }

    #[test]
    fn test_shared_series_survives_one_owner() {
        let registry = InstrumentRegistry::new();
        let epoch = registry.attach(&config());
        let a = ObjectKey::new(Some("shop"), "a");
        let b = ObjectKey::new(Some("shop"), "b");

        for (key, value) in [(&b, 2.0), (&a, 7.0)] {
            registry
                .apply_object(
                    &config(),
                    epoch,
                    key,
                    None,
                    vec![("replicas".into(), InstrumentKind::gauge(), sample(value, &[("team", "core")]))],
                )
                .unwrap();
        }
        let team = labels(&[("team", "core")]);
        assert_eq!(registry.value(&config(), "replicas", &team), Some(7.0));

        // The remaining owner's reading takes over
        registry.forget_object(&config(), epoch, &a);
        assert_eq!(registry.snapshot(&config(), 10).series_count, 1);
        assert_eq!(registry.value(&config(), "replicas", &team), Some(2.0));

        registry.forget_object(&config(), epoch, &b);
        assert_eq!(registry.snapshot(&config(), 10).series_count, 0);
    }

    #[test]
    fn test_concurrent_upserts_are_not_lost() {
        const THREADS: usize = 8;
        const WRITES: usize = 1000;

        let registry = InstrumentRegistry::new();
        let kind = InstrumentKind::counter(UnitAggregation::Sum);
        let key = labels(&[("team", "core")]);

        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    for _ in 0..WRITES {
                        registry.upsert(&config(), "objects", key.clone(), 1.0, kind).unwrap();
                    }
                });
            }
        });

        assert_eq!(
            registry.value(&config(), "objects", &key),
            Some((THREADS * WRITES) as f64)
        );
    }

    #[test]
    fn test_concurrent_upsert_and_remove() {
        let registry = InstrumentRegistry::new();
        let kind = InstrumentKind::counter(UnitAggregation::Sum);
        let key = labels(&[("team", "core")]);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for _ in 0..1000 {
                    registry.upsert(&config(), "objects", key.clone(), 1.0, kind).unwrap();
                }
            });
            scope.spawn(|| {
                for _ in 0..1000 {
                    registry.remove(&config(), "objects", &key);
                }
            });
        });

        // Every interleaving leaves a whole number of writes since the last removal
        let value = registry.value(&config(), "objects", &key).unwrap_or(0.0);
        assert!((0.0..=1000.0).contains(&value) && value.fract() == 0.0);
    }

    #[test]
    fn test_retain_objects() {
        let registry = InstrumentRegistry::new();
        let epoch = registry.attach(&config());
        for name in ["a", "b", "c"] {
            registry
                .apply_object(
                    &config(),
                    epoch,
                    &ObjectKey::new(Some("shop"), name),
                    None,
                    vec![("info".into(), InstrumentKind::gauge(), sample(1.0, &[("name", name)]))],
                )
                .unwrap();
        }

        let keep: HashSet<ObjectKey> = [ObjectKey::new(Some("shop"), "b")].into_iter().collect();
        assert_eq!(registry.retain_objects(&config(), epoch, &keep), 2);
        let snapshot = registry.snapshot(&config(), 10);
        assert_eq!(snapshot.tracked_objects, 1);
        assert_eq!(snapshot.series_count, 1);
    }

    #[test]
    fn test_watch_state() {
        let registry = InstrumentRegistry::new();
        let epoch = registry.attach(&config());
        registry.record_extraction_error(&config(), epoch);
        registry.mark_synced(&config(), epoch);
        registry.set_watch_error(&config(), epoch, Some("stream ended".into()));

        let snapshot = registry.snapshot(&config(), 10);
        assert_eq!(snapshot.extraction_errors, 1);
        assert!(snapshot.synced);
        assert_eq!(snapshot.watch_error.as_deref(), Some("stream ended"));
    }

    #[test]
    fn test_preview_limit_and_escaping() {
        let registry = InstrumentRegistry::new();
        for i in 0..5 {
            registry
                .upsert(&config(), "info", labels(&[("i", i.to_string().as_str())]), 1.0, InstrumentKind::gauge())
                .unwrap();
        }
        let snapshot = registry.snapshot(&config(), 2);
        assert_eq!(snapshot.series_count, 5);
        assert_eq!(snapshot.preview.len(), 2);

        let key = SeriesKey::new("info", labels(&[("msg", "say \"hi\"")]));
        assert_eq!(key.to_string(), r#"info{msg="say \"hi\""}"#);
    }

    #[test]
    fn test_families_encode() {
        let registry = InstrumentRegistry::new();
        registry
            .upsert(&config(), "deployment_replicas", labels(&[("name", "web")]), 3.0, InstrumentKind::gauge())
            .unwrap();
        registry
            .upsert(
                &ConfigId::new("other", "restarts"),
                "pod_restarts",
                labels(&[("name", "web-0")]),
                4.0,
                InstrumentKind::counter(UnitAggregation::Total),
            )
            .unwrap();

        let families = registry.families();
        assert_eq!(families.len(), 2);

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("# TYPE deployment_replicas gauge"));
        assert!(text.contains(r#"deployment_replicas{name="web"} 3"#));
        assert!(text.contains("# TYPE pod_restarts counter"));
        assert!(text.contains(r#"pod_restarts{name="web-0"} 4"#));
    }

    #[test]
    fn test_families_skip_type_clash() {
        let registry = InstrumentRegistry::new();
        registry
            .upsert(
                &ConfigId::new("b", "b"),
                "objects",
                labels(&[("x", "2")]),
                1.0,
                InstrumentKind::counter(UnitAggregation::Total),
            )
            .unwrap();
        registry
            .upsert(&ConfigId::new("a", "a"), "objects", labels(&[("x", "1")]), 1.0, InstrumentKind::gauge())
            .unwrap();

        // Exporters are visited in name order whatever the map order is
        for _ in 0..5 {
            let families = registry.families();
            assert_eq!(families.len(), 1);
            assert_eq!(families[0].get_field_type(), MetricType::GAUGE);
            assert_eq!(families[0].get_metric().len(), 1);
        }
    }
}
