// Per-request pipeline: Received -> Decoded -> Validated -> Enqueued, or
// rejected at whichever stage fails. Everything after the body has been read
// is synchronous, so a request cancelled by the runtime (client hung up) is
// either fully enqueued or not enqueued at all.
use std::sync::Arc;

use tracing::debug;

use crate::buffer::IngestBuffer;
use crate::decoder;
use crate::error::IngestError;
use crate::metrics::IngestMetrics;
use crate::reading::RawRequest;
use crate::validator::Validator;

#[derive(Clone)]
pub struct IngestPipeline {
    validator: Arc<Validator>,
    buffer: Arc<IngestBuffer>,
    metrics: IngestMetrics,
}

impl IngestPipeline {
    pub fn new(validator: Validator, buffer: Arc<IngestBuffer>, metrics: IngestMetrics) -> Self {
        Self {
            validator: Arc::new(validator),
            buffer,
            metrics,
        }
    }

    /// Run one request through the pipeline. Returns the sequence number of
    /// the accepted reading.
    pub fn ingest(&self, raw: RawRequest) -> Result<u64, IngestError> {
        let outcome = self.process(raw);
        self.observe(&outcome);
        outcome
    }

    fn process(&self, raw: RawRequest) -> Result<u64, IngestError> {
        let reading = decoder::decode(&raw)?;
        let checked = self.validator.check(reading)?;

        // Stamp while holding the admission permit so sequence order and
        // buffer order agree, and a full buffer burns no sequence number.
        let permit = self.buffer.reserve()?;
        let validated = self.validator.stamp(checked, raw.arrived_at);
        let seq = validated.seq;
        debug!(
            seq,
            device_id = %validated.device_id,
            metric = %validated.metric,
            value = validated.value,
            "reading accepted"
        );
        permit.send(validated)?;
        Ok(seq)
    }

    fn observe(&self, outcome: &Result<u64, IngestError>) {
        match outcome {
            Ok(_) => {
                self.metrics.requests.with_label_values(&["accepted"]).inc();
            }
            Err(e) => {
                let label = if e.is_backpressure() { "backpressured" } else { "rejected" };
                self.metrics.requests.with_label_values(&[label]).inc();
                self.metrics.rejections.with_label_values(&[e.reason()]).inc();
                debug!(stage = e.stage(), reason = e.reason(), error = %e, "request rejected");
            }
        }
        self.metrics.buffer_depth.set(self.buffer.len() as i64);
    }

    pub fn buffer(&self) -> &Arc<IngestBuffer> {
        &self.buffer
    }

    pub fn metrics(&self) -> &IngestMetrics {
        &self.metrics
    }
}
