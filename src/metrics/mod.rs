mod server;

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

pub use server::start_metrics_server;

// ============================================================================
// Metrics - Prometheus metrics for the fulfillment core
// ============================================================================
//
// - Line item transitions (applied, rejected, conflicts, latency)
// - Delivery events appended
// - Payment gateway calls and the circuit breaker guarding them
// - Compensation ledger (recorded, resolved, pending)
// - Auto purchase confirmation sweeps
//
// Everything is registered on a private registry and served on /metrics.
// ============================================================================

pub struct Metrics {
    registry: Registry,

    // Transitions
    pub transitions_applied: IntCounterVec,
    pub transitions_rejected: IntCounterVec,
    pub version_conflicts: IntCounterVec,
    pub transition_duration: HistogramVec,

    // Delivery
    pub delivery_events: IntCounterVec,

    // Payment gateway
    pub gateway_calls: IntCounterVec,
    pub gateway_call_duration: HistogramVec,
    pub circuit_breaker_state: IntGauge,
    pub circuit_breaker_transitions: IntCounterVec,

    // Compensation ledger
    pub compensations_recorded: IntCounterVec,
    pub compensations_resolved: IntCounterVec,
    pub pending_compensations: IntGauge,

    // Jobs
    pub auto_confirmed: IntCounter,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let transitions_applied = IntCounterVec::new(
            Opts::new("fulfillment_transitions_applied_total", "Line item transitions committed"),
            &["action"],
        )?;
        registry.register(Box::new(transitions_applied.clone()))?;

        let transitions_rejected = IntCounterVec::new(
            Opts::new("fulfillment_transitions_rejected_total", "Line item transitions rejected"),
            &["action", "reason"],
        )?;
        registry.register(Box::new(transitions_rejected.clone()))?;

        let version_conflicts = IntCounterVec::new(
            Opts::new("fulfillment_version_conflicts_total", "Writes rejected because of a stale version"),
            &["stage"],
        )?;
        registry.register(Box::new(version_conflicts.clone()))?;

        let transition_duration = HistogramVec::new(
            HistogramOpts::new("fulfillment_transition_duration_seconds", "Time to apply a transition")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["action"],
        )?;
        registry.register(Box::new(transition_duration.clone()))?;

        let delivery_events = IntCounterVec::new(
            Opts::new("fulfillment_delivery_events_total", "Delivery events appended"),
            &["delivery_type"],
        )?;
        registry.register(Box::new(delivery_events.clone()))?;

        let gateway_calls = IntCounterVec::new(
            Opts::new("payment_gateway_calls_total", "Payment gateway calls by outcome"),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(gateway_calls.clone()))?;

        let gateway_call_duration = HistogramVec::new(
            HistogramOpts::new("payment_gateway_call_duration_seconds", "Payment gateway call latency")
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["operation"],
        )?;
        registry.register(Box::new(gateway_call_duration.clone()))?;

        let circuit_breaker_state = IntGauge::new(
            "payment_gateway_circuit_state",
            "Gateway circuit breaker state (0=Closed, 1=Open, 2=HalfOpen)",
        )?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        let circuit_breaker_transitions = IntCounterVec::new(
            Opts::new("payment_gateway_circuit_transitions_total", "Gateway circuit breaker state changes"),
            &["from_state", "to_state"],
        )?;
        registry.register(Box::new(circuit_breaker_transitions.clone()))?;

        let compensations_recorded = IntCounterVec::new(
            Opts::new("payment_compensations_recorded_total", "Compensation records written"),
            &["kind"],
        )?;
        registry.register(Box::new(compensations_recorded.clone()))?;

        let compensations_resolved = IntCounterVec::new(
            Opts::new("payment_compensations_resolved_total", "Compensation records resolved"),
            &["resolution"],
        )?;
        registry.register(Box::new(compensations_resolved.clone()))?;

        let pending_compensations = IntGauge::new(
            "payment_compensations_pending",
            "Compensation records still waiting for resolution",
        )?;
        registry.register(Box::new(pending_compensations.clone()))?;

        let auto_confirmed = IntCounter::new(
            "fulfillment_auto_confirmed_total",
            "Line items confirmed by the auto purchase confirmation sweep",
        )?;
        registry.register(Box::new(auto_confirmed.clone()))?;

        Ok(Self {
            registry,
            transitions_applied,
            transitions_rejected,
            version_conflicts,
            transition_duration,
            delivery_events,
            gateway_calls,
            gateway_call_duration,
            circuit_breaker_state,
            circuit_breaker_transitions,
            compensations_recorded,
            compensations_resolved,
            pending_compensations,
            auto_confirmed,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_transition(&self, action: &str, duration_secs: f64) {
        self.transitions_applied.with_label_values(&[action]).inc();
        self.transition_duration.with_label_values(&[action]).observe(duration_secs);
    }

    pub fn record_rejection(&self, action: &str, reason: &str) {
        self.transitions_rejected.with_label_values(&[action, reason]).inc();
    }

    /// `stage` is where the stale version was caught: `load` or `commit`.
    pub fn record_conflict(&self, stage: &str) {
        self.version_conflicts.with_label_values(&[stage]).inc();
    }

    pub fn record_delivery_event(&self, delivery_type: &str) {
        self.delivery_events.with_label_values(&[delivery_type]).inc();
    }

    pub fn record_gateway_call(&self, operation: &str, outcome: &str, duration_secs: f64) {
        self.gateway_calls.with_label_values(&[operation, outcome]).inc();
        self.gateway_call_duration.with_label_values(&[operation]).observe(duration_secs);
    }

    pub fn record_circuit_transition(&self, from_state: &str, to_state: &str, gauge: i64) {
        self.circuit_breaker_transitions.with_label_values(&[from_state, to_state]).inc();
        self.circuit_breaker_state.set(gauge);
    }

    pub fn record_compensation(&self, kind: &str) {
        self.compensations_recorded.with_label_values(&[kind]).inc();
        self.pending_compensations.inc();
    }

    pub fn record_compensation_resolved(&self, resolution: &str) {
        self.compensations_resolved.with_label_values(&[resolution]).inc();
        self.pending_compensations.dec();
    }

    pub fn set_pending_compensations(&self, pending: usize) {
        self.pending_compensations.set(pending as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_value(metrics: &Metrics, name: &str) -> Option<f64> {
        metrics
            .registry
            .gather()
            .iter()
            .find(|m| m.name() == name)
            .and_then(|m| m.metric.first().map(|v| v.counter.value.unwrap_or_default()))
    }

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        metrics.record_transition("SHIP", 0.01);
        assert!(!metrics.registry().gather().is_empty());
    }

    #[test]
    fn test_record_transition_and_rejection() {
        let metrics = Metrics::new().unwrap();
        metrics.record_transition("SHIP", 0.002);
        metrics.record_transition("SHIP", 0.004);
        metrics.record_rejection("APPROVE_CANCEL", "illegal_transition");

        assert_eq!(counter_value(&metrics, "fulfillment_transitions_applied_total"), Some(2.0));
        assert_eq!(counter_value(&metrics, "fulfillment_transitions_rejected_total"), Some(1.0));
    }

    #[test]
    fn test_pending_compensation_gauge_follows_records() {
        let metrics = Metrics::new().unwrap();
        metrics.record_compensation("order_creation_failed");
        metrics.record_compensation("refund_failed");
        metrics.record_compensation_resolved("refunded");

        assert_eq!(metrics.pending_compensations.get(), 1);
    }

    #[test]
    fn test_circuit_transition_sets_gauge() {
        let metrics = Metrics::new().unwrap();
        metrics.record_circuit_transition("closed", "open", 1);

        let gathered = metrics.registry.gather();
        let state = gathered.iter().find(|m| m.name() == "payment_gateway_circuit_state").unwrap();
        assert_eq!(state.metric[0].gauge.value, Some(1.0));
    }
}
