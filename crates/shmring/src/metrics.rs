use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};
use std::time::Duration;

const METER_NAME: &str = "shmring";

/// OpenTelemetry instruments for one ring endpoint.
///
/// Recorded against the global meter provider, which drops everything until
/// a binary installs one (see `common::TelemetryGuard`).
#[derive(Clone)]
pub struct RingMetrics {
    bytes: Counter<u64>,
    chunks: Counter<u64>,
    wraparounds: Counter<u64>,
    barrier_wait: Histogram<f64>,
    attributes: [KeyValue; 2],
}

impl RingMetrics {
    pub fn writer(key: u32) -> Self {
        Self::build(&global::meter(METER_NAME), key, "writer")
    }

    pub fn reader(key: u32) -> Self {
        Self::build(&global::meter(METER_NAME), key, "reader")
    }

    fn build(meter: &Meter, key: u32, role: &'static str) -> Self {
        let wait_buckets = [
            0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0,
        ];
        let bytes = meter
            .u64_counter("ring_bytes_total")
            .with_description("Payload bytes moved through the ring")
            .with_unit("By")
            .build();
        let chunks = meter
            .u64_counter("ring_chunks_total")
            .with_description("Chunks moved through the ring")
            .build();
        let wraparounds = meter
            .u64_counter("ring_wraparounds_total")
            .with_description("Wraparounds completed (writer) or acknowledged (reader)")
            .build();
        let barrier_wait = meter
            .f64_histogram("ring_barrier_wait_seconds")
            .with_description("Time the writer waited for readers to acknowledge a wraparound")
            .with_unit("s")
            .with_boundaries(wait_buckets.to_vec())
            .build();

        Self {
            bytes,
            chunks,
            wraparounds,
            barrier_wait,
            attributes: [
                KeyValue::new("ring.key", i64::from(key)),
                KeyValue::new("ring.role", role),
            ],
        }
    }

    pub fn record_chunk(&self, len: usize) {
        self.bytes.add(len as u64, &self.attributes);
        self.chunks.add(1, &self.attributes);
    }

    /// Writer side: the barrier wait is only known to the writer.
    pub fn record_wrap(&self, waited: Duration) {
        self.wraparounds.add(1, &self.attributes);
        self.barrier_wait.record(waited.as_secs_f64(), &self.attributes);
    }

    pub fn record_acknowledge(&self) {
        self.wraparounds.add(1, &self.attributes);
    }
}
