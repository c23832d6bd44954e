// Prometheus instruments for the ingestion path and the writer. All of them
// are registered on the registry served by `/metrics`.
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

#[derive(Clone)]
pub struct IngestMetrics {
    /// `outcome` = accepted | rejected | backpressured
    pub requests: IntCounterVec,
    pub rejections: IntCounterVec,
    pub buffer_depth: IntGauge,
    pub batches_written: IntCounter,
    pub readings_written: IntCounter,
    pub write_retries: IntCounter,
    pub readings_dead_lettered: IntCounter,
    pub readings_lost: IntCounter,
}

impl IngestMetrics {
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let requests = IntCounterVec::new(
            Opts::new("sensor_requests_total", "Sensor data requests by outcome"),
            &["outcome"],
        )?;
        let rejections = IntCounterVec::new(
            Opts::new("sensor_rejections_total", "Rejected sensor data requests by reason"),
            &["reason"],
        )?;
        let buffer_depth = IntGauge::new(
            "sensor_buffer_depth",
            "Readings waiting in the ingestion buffer",
        )?;
        let batches_written = IntCounter::new(
            "sensor_batches_written_total",
            "Batches appended to the durable log",
        )?;
        let readings_written = IntCounter::new(
            "sensor_readings_written_total",
            "Readings appended to the durable log",
        )?;
        let write_retries =
            IntCounter::new("sensor_write_retries_total", "Retried durable log appends")?;
        let readings_dead_lettered = IntCounter::new(
            "sensor_readings_dead_lettered_total",
            "Readings routed to the dead-letter file after exhausting retries",
        )?;
        let readings_lost = IntCounter::new(
            "sensor_readings_lost_total",
            "Readings that could not be written to the log nor the dead-letter file",
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(rejections.clone()))?;
        registry.register(Box::new(buffer_depth.clone()))?;
        registry.register(Box::new(batches_written.clone()))?;
        registry.register(Box::new(readings_written.clone()))?;
        registry.register(Box::new(write_retries.clone()))?;
        registry.register(Box::new(readings_dead_lettered.clone()))?;
        registry.register(Box::new(readings_lost.clone()))?;

        Ok(Self {
            requests,
            rejections,
            buffer_depth,
            batches_written,
            readings_written,
            write_retries,
            readings_dead_lettered,
            readings_lost,
        })
    }

    pub fn accepted(&self) -> u64 {
        self.requests.with_label_values(&["accepted"]).get()
    }

    pub fn rejected(&self) -> u64 {
        self.requests.with_label_values(&["rejected"]).get()
    }

    pub fn backpressured(&self) -> u64 {
        self.requests.with_label_values(&["backpressured"]).get()
    }
}
