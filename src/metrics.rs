//! Prometheus counters for ledger and webhook activity.

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

/// Process-wide metric handles, registered on a private registry.
pub struct LedgerMetrics {
    registry: Registry,
    operations: IntCounterVec,
    version_conflicts: IntCounterVec,
    webhook_events: IntCounterVec,
}

impl LedgerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let operations = IntCounterVec::new(
            Opts::new(
                "ledger_operations_total",
                "Ledger operations by name and result code",
            ),
            &["op", "result"],
        )?;
        let version_conflicts = IntCounterVec::new(
            Opts::new(
                "ledger_version_conflicts_total",
                "Conditional writes rejected because the record changed",
            ),
            &["op"],
        )?;
        let webhook_events = IntCounterVec::new(
            Opts::new(
                "webhook_events_total",
                "Payment webhook deliveries by terminal outcome",
            ),
            &["outcome"],
        )?;

        registry.register(Box::new(operations.clone()))?;
        registry.register(Box::new(version_conflicts.clone()))?;
        registry.register(Box::new(webhook_events.clone()))?;

        Ok(Self {
            registry,
            operations,
            version_conflicts,
            webhook_events,
        })
    }

    pub fn record_operation(&self, op: &str, result: &str) {
        self.operations.with_label_values(&[op, result]).inc();
    }

    pub fn record_conflict(&self, op: &str) {
        self.version_conflicts.with_label_values(&[op]).inc();
    }

    pub fn record_webhook(&self, outcome: &str) {
        self.webhook_events.with_label_values(&[outcome]).inc();
    }

    /// Current value of an operation counter.
    pub fn operation_count(&self, op: &str, result: &str) -> u64 {
        self.operations.with_label_values(&[op, result]).get()
    }

    pub fn conflict_count(&self, op: &str) -> u64 {
        self.version_conflicts.with_label_values(&[op]).get()
    }

    pub fn webhook_count(&self, outcome: &str) -> u64 {
        self.webhook_events.with_label_values(&[outcome]).get()
    }

    /// Text exposition format for `GET /metrics`.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
