use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use std::sync::Arc;

/// Metrics collector for the admission-control core
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Admission metrics
    checks: IntCounterVec,
    gate_decisions: IntCounterVec,

    // Store metrics
    store_failures: IntCounterVec,
    store_operation_duration: HistogramVec,

    // Administrative state
    active_rules: IntGauge,
    access_entries: IntGaugeVec,

    gate_duration: Histogram,
}

impl Metrics {
    /// Create a new metrics instance with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let checks = IntCounterVec::new(
            Opts::new(
                "ratelimit_checks_total",
                "Admission checks by rule and outcome",
            ),
            &["rule", "outcome"],
        )?;

        let gate_decisions = IntCounterVec::new(
            Opts::new(
                "ratelimit_gate_decisions_total",
                "Final gate decisions by kind",
            ),
            &["decision"],
        )?;

        let store_failures = IntCounterVec::new(
            Opts::new(
                "ratelimit_store_failures_total",
                "Counter store failures; admission checks fail open on these",
            ),
            &["operation"],
        )?;

        let store_operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "ratelimit_store_operation_duration_seconds",
                "Duration of counter store operations in seconds",
            ),
            &["operation"],
        )?;

        let active_rules = IntGauge::new(
            "ratelimit_active_rules",
            "Number of named rules in the registry",
        )?;

        let access_entries = IntGaugeVec::new(
            Opts::new(
                "ratelimit_access_entries",
                "Number of allow/deny entries, expired ones included until purged",
            ),
            &["list"],
        )?;

        let gate_duration = Histogram::with_opts(HistogramOpts::new(
            "ratelimit_gate_duration_seconds",
            "Time spent in the gate per request in seconds",
        ))?;

        registry.register(Box::new(checks.clone()))?;
        registry.register(Box::new(gate_decisions.clone()))?;
        registry.register(Box::new(store_failures.clone()))?;
        registry.register(Box::new(store_operation_duration.clone()))?;
        registry.register(Box::new(active_rules.clone()))?;
        registry.register(Box::new(access_entries.clone()))?;
        registry.register(Box::new(gate_duration.clone()))?;

        Ok(Self {
            registry,
            checks,
            gate_decisions,
            store_failures,
            store_operation_duration,
            active_rules,
            access_entries,
            gate_duration,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record an admission check outcome (`admitted`, `rejected`, `fail_open`)
    pub fn record_check(&self, rule: &str, outcome: &str) {
        self.checks.with_label_values(&[rule, outcome]).inc();
    }

    pub fn check_count(&self, rule: &str, outcome: &str) -> u64 {
        self.checks.with_label_values(&[rule, outcome]).get()
    }

    /// Record the gate's final decision
    pub fn record_gate_decision(&self, decision: &str) {
        self.gate_decisions.with_label_values(&[decision]).inc();
    }

    pub fn gate_decision_count(&self, decision: &str) -> u64 {
        self.gate_decisions.with_label_values(&[decision]).get()
    }

    /// Record a store failure
    pub fn record_store_failure(&self, operation: &str) {
        self.store_failures.with_label_values(&[operation]).inc();
    }

    pub fn store_failure_count(&self, operation: &str) -> u64 {
        self.store_failures.with_label_values(&[operation]).get()
    }

    /// Record store operation duration
    pub fn record_store_operation_duration(&self, operation: &str, duration_seconds: f64) {
        self.store_operation_duration
            .with_label_values(&[operation])
            .observe(duration_seconds);
    }

    pub fn set_active_rules(&self, count: usize) {
        self.active_rules.set(count as i64);
    }

    pub fn set_access_entries(&self, list: &str, count: usize) {
        self.access_entries.with_label_values(&[list]).set(count as i64);
    }

    /// Create a timer for measuring time spent in the gate
    pub fn start_gate_timer(&self) -> prometheus::HistogramTimer {
        self.gate_duration.start_timer()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}
