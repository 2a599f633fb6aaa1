//! Prometheus metrics registry for parcel
//!
//! Storage pressure gauges, and counters for stored, evicted and delivered
//! payloads.

use prometheus::{Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

/// Central metrics registry holding all Prometheus metrics.
pub struct MetricsRegistry {
    registry: Registry,
    /// Gauge: bytes used by stored payloads, by location (`files`, `cache`)
    pub storage_used_bytes: IntGaugeVec,
    /// Gauge: bytes available on the filesystem holding the files directory
    pub storage_available_bytes: IntGauge,
    /// Counter: payloads written, by envelope type
    pub payloads_stored_total: IntCounterVec,
    /// Counter: payloads deleted under storage pressure, by envelope type
    pub payloads_evicted_total: IntCounterVec,
    /// Counter: delivery attempts by (envelope_type, result)
    pub delivery_attempts_total: IntCounterVec,
}

impl MetricsRegistry {
    /// Creates a new `MetricsRegistry` with all metrics registered.
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new_custom(Some("parcel".to_string()), None)?;

        let storage_used_bytes = IntGaugeVec::new(
            Opts::new("storage_used_bytes", "Bytes used by stored payloads"),
            &["location"],
        )?;
        registry.register(Box::new(storage_used_bytes.clone()))?;

        let storage_available_bytes = IntGauge::with_opts(Opts::new(
            "storage_available_bytes",
            "Bytes available on the payload filesystem",
        ))?;
        registry.register(Box::new(storage_available_bytes.clone()))?;

        let payloads_stored_total = IntCounterVec::new(
            Opts::new("payloads_stored_total", "Total payloads stored"),
            &["envelope_type"],
        )?;
        registry.register(Box::new(payloads_stored_total.clone()))?;

        let payloads_evicted_total = IntCounterVec::new(
            Opts::new("payloads_evicted_total", "Total payloads evicted under storage pressure"),
            &["envelope_type"],
        )?;
        registry.register(Box::new(payloads_evicted_total.clone()))?;

        let delivery_attempts_total = IntCounterVec::new(
            Opts::new("delivery_attempts_total", "Total delivery attempts"),
            &["envelope_type", "result"],
        )?;
        registry.register(Box::new(delivery_attempts_total.clone()))?;

        Ok(Self {
            registry,
            storage_used_bytes,
            storage_available_bytes,
            payloads_stored_total,
            payloads_evicted_total,
            delivery_attempts_total,
        })
    }

    // ========================================================================
    // Recording helpers
    // ========================================================================

    pub fn record_stored(&self, envelope_type: &str) {
        self.payloads_stored_total
            .with_label_values(&[envelope_type])
            .inc();
    }

    pub fn record_evicted(&self, envelope_type: &str) {
        self.payloads_evicted_total
            .with_label_values(&[envelope_type])
            .inc();
    }

    /// Record a delivery attempt outcome.
    pub fn record_delivery_attempt(&self, envelope_type: &str, result: &str) {
        self.delivery_attempts_total
            .with_label_values(&[envelope_type, result])
            .inc();
    }

    pub fn set_storage_used(&self, location: &str, bytes: u64) {
        self.storage_used_bytes
            .with_label_values(&[location])
            .set(clamp_i64(bytes));
    }

    pub fn set_storage_available(&self, bytes: u64) {
        self.storage_available_bytes.set(clamp_i64(bytes));
    }

    // ========================================================================
    // Encoding
    // ========================================================================

    /// Encode all metrics in Prometheus text exposition format.
    pub fn encode(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
