//! Operator Self-Metrics
//!
//! Health of the exporter itself, kept in a dedicated registry and served on
//! `/metrics` next to the series exported from cluster objects.

use crate::domain::ConfigId;
use crate::error::Result;
use prometheus::proto::MetricFamily;
use prometheus::{Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry};
use std::collections::HashSet;
use std::time::Duration;
use tracing::warn;

/// Prometheus metrics of the operator
#[derive(Clone)]
pub struct OperatorMetrics {
    registry: Registry,
    reconciliations: IntCounterVec,
    reconcile_errors: IntCounterVec,
    reconcile_duration: Histogram,
    extraction_errors: IntCounterVec,
    watch_errors: IntCounterVec,
    active_watches: IntGauge,
    known_kinds: IntGauge,
}

impl OperatorMetrics {
    /// Create and register every operator metric
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let reconciliations = IntCounterVec::new(
            Opts::new(
                "object_exporter_reconciliations_total",
                "Reconcile passes by result",
            ),
            &["result"],
        )?;
        let reconcile_errors = IntCounterVec::new(
            Opts::new(
                "object_exporter_reconcile_errors_total",
                "Failed reconcile passes by error kind",
            ),
            &["error"],
        )?;
        let reconcile_duration = Histogram::with_opts(
            HistogramOpts::new(
                "object_exporter_reconcile_duration_seconds",
                "Duration of reconcile passes",
            )
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        )?;
        let extraction_errors = IntCounterVec::new(
            Opts::new(
                "object_exporter_extraction_errors_total",
                "Objects whose instrument value could not be extracted",
            ),
            &["exporter"],
        )?;
        let watch_errors = IntCounterVec::new(
            Opts::new(
                "object_exporter_watch_errors_total",
                "Errors reported by target watch streams",
            ),
            &["exporter"],
        )?;
        let active_watches = IntGauge::new(
            "object_exporter_active_watches",
            "Number of running target watches",
        )?;
        let known_kinds = IntGauge::new(
            "object_exporter_known_kinds",
            "Number of kinds in the type registry",
        )?;

        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(reconcile_errors.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;
        registry.register(Box::new(extraction_errors.clone()))?;
        registry.register(Box::new(watch_errors.clone()))?;
        registry.register(Box::new(active_watches.clone()))?;
        registry.register(Box::new(known_kinds.clone()))?;

        Ok(Self {
            registry,
            reconciliations,
            reconcile_errors,
            reconcile_duration,
            extraction_errors,
            watch_errors,
            active_watches,
            known_kinds,
        })
    }

    /// Record one reconcile pass; `error` is the error kind of a failed pass
    pub fn observe_reconcile(&self, error: Option<&str>, elapsed: Duration) {
        self.reconcile_duration.observe(elapsed.as_secs_f64());
        match error {
            None => self.reconciliations.with_label_values(&["success"]).inc(),
            Some(kind) => {
                self.reconciliations.with_label_values(&["error"]).inc();
                self.reconcile_errors.with_label_values(&[kind]).inc();
            }
        }
    }

    pub fn record_extraction_error(&self, config: &ConfigId) {
        self.extraction_errors
            .with_label_values(&[&config.to_string()])
            .inc();
    }

    pub fn record_watch_error(&self, config: &ConfigId) {
        self.watch_errors
            .with_label_values(&[&config.to_string()])
            .inc();
    }

    /// Drop per-exporter series once an exporter is gone
    pub fn forget_exporter(&self, config: &ConfigId) {
        let exporter = config.to_string();
        let _ = self.extraction_errors.remove_label_values(&[&exporter]);
        let _ = self.watch_errors.remove_label_values(&[&exporter]);
    }

    pub fn set_active_watches(&self, count: usize) {
        self.active_watches.set(count as i64);
    }

    pub fn set_known_kinds(&self, count: usize) {
        self.known_kinds.set(count as i64);
    }

    /// Gather the operator's own families
    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }

    /// Operator families followed by `exported`, minus exported families
    /// reusing an operator metric name
    pub fn exposition(&self, exported: Vec<MetricFamily>) -> Vec<MetricFamily> {
        let mut families = self.gather();
        let own: HashSet<String> = families.iter().map(|f| f.get_name().to_string()).collect();
        for family in exported {
            if own.contains(family.get_name()) {
                warn!("Dropping exported family {}: name is used by the operator", family.get_name());
                continue;
            }
            families.push(family);
        }
        families
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::UnitAggregation;
    use crate::instruments::{InstrumentKind, InstrumentRegistry, LabelSet};
    use prometheus::{Encoder, TextEncoder};

    fn encode(families: &[MetricFamily]) -> String {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn test_observe_reconcile() {
        let metrics = OperatorMetrics::new().unwrap();
        metrics.observe_reconcile(None, Duration::from_millis(3));
        metrics.observe_reconcile(Some("kube"), Duration::from_millis(40));

        let text = encode(&metrics.gather());
        assert!(text.contains(r#"object_exporter_reconciliations_total{result="success"} 1"#));
        assert!(text.contains(r#"object_exporter_reconciliations_total{result="error"} 1"#));
        assert!(text.contains(r#"object_exporter_reconcile_errors_total{error="kube"} 1"#));
        assert!(text.contains("object_exporter_reconcile_duration_seconds_count 2"));
    }

    #[test]
    fn test_per_exporter_counters() {
        let metrics = OperatorMetrics::new().unwrap();
        let config = ConfigId::new("monitoring", "deployments");
        metrics.record_extraction_error(&config);
        metrics.record_extraction_error(&config);
        metrics.record_watch_error(&config);

        let text = encode(&metrics.gather());
        assert!(text.contains(r#"object_exporter_extraction_errors_total{exporter="monitoring/deployments"} 2"#));
        assert!(text.contains(r#"object_exporter_watch_errors_total{exporter="monitoring/deployments"} 1"#));

        metrics.forget_exporter(&config);
        let text = encode(&metrics.gather());
        assert!(!text.contains("monitoring/deployments"));
    }

    #[test]
    fn test_exposition_drops_colliding_families() {
        let metrics = OperatorMetrics::new().unwrap();
        metrics.set_active_watches(2);

        let registry = InstrumentRegistry::new();
        let config = ConfigId::new("monitoring", "deployments");
        registry
            .upsert(
                &config,
                "object_exporter_active_watches",
                LabelSet::new(),
                5.0,
                InstrumentKind::counter(UnitAggregation::Total),
            )
            .unwrap();
        registry
            .upsert(&config, "deployment_replicas", LabelSet::new(), 3.0, InstrumentKind::gauge())
            .unwrap();

        let text = encode(&metrics.exposition(registry.families()));
        assert_eq!(text.matches("# TYPE object_exporter_active_watches").count(), 1);
        assert!(text.contains("# TYPE object_exporter_active_watches gauge"));
        assert!(text.contains("object_exporter_active_watches 2"));
        assert!(text.contains("deployment_replicas 3"));
    }

    #[test]
    fn test_gauges() {
        let metrics = OperatorMetrics::new().unwrap();
        metrics.set_active_watches(3);
        metrics.set_known_kinds(42);

        let text = encode(&metrics.gather());
        assert!(text.contains("object_exporter_active_watches 3"));
        assert!(text.contains("object_exporter_known_kinds 42"));
    }
}
