//! Prometheus metrics for the gateway.
//!
//! Each [`GatewayMetrics`] owns its own registry so that several routers
//! (tests, embedded mode) can coexist in one process.

use prometheus::{
    histogram_opts, opts, CounterVec, Encoder, HistogramVec, IntCounter, Registry, TextEncoder,
};

pub struct GatewayMetrics {
    registry: Registry,
    requests_total: CounterVec,
    records_delivered_total: CounterVec,
    settle_failures_total: IntCounter,
    stream_duration_seconds: HistogramVec,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            opts!("pricegate_requests_total", "Price requests by terminal outcome"),
            &["exchange", "outcome"],
        )
        .expect("valid pricegate_requests_total definition");

        let records_delivered_total = CounterVec::new(
            opts!("pricegate_records_delivered_total", "Price records handed to clients"),
            &["exchange", "variant"],
        )
        .expect("valid pricegate_records_delivered_total definition");

        let settle_failures_total = IntCounter::with_opts(opts!(
            "pricegate_settle_failures_total",
            "Quota settlements that failed after the response was sent"
        ))
        .expect("valid pricegate_settle_failures_total definition");

        let stream_duration_seconds = HistogramVec::new(
            histogram_opts!(
                "pricegate_stream_duration_seconds",
                "Time from opening the price stream to settlement",
                vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
            ),
            &["exchange", "variant"],
        )
        .expect("valid pricegate_stream_duration_seconds definition");

        for collector in [
            Box::new(requests_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(records_delivered_total.clone()),
            Box::new(settle_failures_total.clone()),
            Box::new(stream_duration_seconds.clone()),
        ] {
            registry
                .register(collector)
                .expect("metric names are unique within a fresh registry");
        }

        Self {
            registry,
            requests_total,
            records_delivered_total,
            settle_failures_total,
            stream_duration_seconds,
        }
    }

    pub fn record_outcome(&self, exchange: &str, outcome: &str) {
        self.requests_total.with_label_values(&[exchange, outcome]).inc();
    }

    pub fn record_delivery(&self, exchange: &str, variant: &str, delivered: i64, elapsed_secs: f64) {
        if delivered > 0 {
            self.records_delivered_total
                .with_label_values(&[exchange, variant])
                .inc_by(delivered as f64);
        }
        self.stream_duration_seconds
            .with_label_values(&[exchange, variant])
            .observe(elapsed_secs);
    }

    pub fn record_settle_failure(&self) {
        self.settle_failures_total.inc();
    }

    pub fn settle_failures(&self) -> u64 {
        self.settle_failures_total.get()
    }

    /// Encode all metrics as Prometheus text format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_recorders_do_not_collide() {
        let a = GatewayMetrics::new();
        let b = GatewayMetrics::new();
        a.record_outcome("binance", "completed");
        b.record_settle_failure();
        assert!(a.encode().contains("pricegate_requests_total"));
        assert_eq!(b.settle_failures(), 1);
        assert_eq!(a.settle_failures(), 0);
    }

    #[test]
    fn test_delivery_counts_records() {
        let m = GatewayMetrics::new();
        m.record_delivery("bybit", "sse", 7, 0.2);
        let text = m.encode();
        assert!(text.contains(r#"pricegate_records_delivered_total{exchange="bybit",variant="sse"} 7"#));
    }
}
