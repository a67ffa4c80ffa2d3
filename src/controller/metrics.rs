//! Operator Metrics
//!
//! Prometheus collectors registered in a registry owned by the controller,
//! gathered by the metrics server.

use crate::error::{Error, Result};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Metric name prefix
const NAMESPACE: &str = "storage_provisioner_operator";

/// Collectors for the reconcile loop, child writes and node rollouts
#[derive(Clone)]
pub struct OperatorMetrics {
    registry: Registry,
    /// Reconcile passes by kind and result
    pub reconciliations: IntCounterVec,
    /// Reconcile pass duration by kind
    pub reconcile_duration: HistogramVec,
    /// Child object writes by verb and kind
    pub child_writes: IntCounterVec,
    /// Node rollout phase transitions by phase
    pub node_transitions: IntCounterVec,
    /// Keys waiting in the work queue
    pub queue_depth: IntGauge,
}

impl OperatorMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let reconciliations = IntCounterVec::new(
            Opts::new("reconciliations_total", "Reconcile passes by kind and result")
                .namespace(NAMESPACE),
            &["kind", "result"],
        )
        .map_err(metrics_error)?;
        let reconcile_duration = HistogramVec::new(
            HistogramOpts::new("reconcile_duration_seconds", "Duration of reconcile passes")
                .namespace(NAMESPACE),
            &["kind"],
        )
        .map_err(metrics_error)?;
        let child_writes = IntCounterVec::new(
            Opts::new("child_writes_total", "Child object writes by verb and kind")
                .namespace(NAMESPACE),
            &["verb", "kind"],
        )
        .map_err(metrics_error)?;
        let node_transitions = IntCounterVec::new(
            Opts::new("node_phase_transitions_total", "Node rollout phase transitions")
                .namespace(NAMESPACE),
            &["phase"],
        )
        .map_err(metrics_error)?;
        let queue_depth = IntGauge::with_opts(
            Opts::new("queue_depth", "Keys waiting in the work queue").namespace(NAMESPACE),
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(reconciliations.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(reconcile_duration.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(child_writes.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(node_transitions.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(queue_depth.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            reconciliations,
            reconcile_duration,
            child_writes,
            node_transitions,
            queue_depth,
        })
    }

    pub fn record_reconcile(&self, kind: &str, result: &str, elapsed: Duration) {
        self.reconciliations.with_label_values(&[kind, result]).inc();
        self.reconcile_duration
            .with_label_values(&[kind])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_write(&self, verb: &str, kind: &str) {
        self.child_writes.with_label_values(&[verb, kind]).inc();
    }

    pub fn record_transition(&self, phase: &str) {
        self.node_transitions.with_label_values(&[phase]).inc();
    }

    /// Text exposition of every collector
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}
