// The single background writer. It owns the durable sink and the
// dead-letter sink, drains the ingestion buffer in batches, retries
// transient failures with exponential backoff and routes batches that still
// fail to the dead-letter sink. Like a DB worker it runs on a blocking
// thread, so sink I/O never touches the async request path.
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::buffer::IngestBuffer;
use crate::error::WriteError;
use crate::metrics::IngestMetrics;
use crate::reading::ValidatedReading;

/// Destination for batches of accepted readings. `append` must leave the
/// sink unchanged when it returns an error.
pub trait Sink: Send {
    fn append(&mut self, batch: &[ValidatedReading]) -> io::Result<()>;
}

/// Keeps everything in memory. Clones share the same storage.
#[derive(Clone, Default)]
pub struct MemorySink {
    entries: Arc<Mutex<Vec<ValidatedReading>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<ValidatedReading> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Sink for MemorySink {
    fn append(&mut self, batch: &[ValidatedReading]) -> io::Result<()> {
        self.entries.lock().extend_from_slice(batch);
        Ok(())
    }
}

/// Exponential backoff between write attempts.
///
/// `backoff(n) = min(initial_backoff * multiplier^n, max_backoff)`
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt.
    pub max_retries: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, retry: usize) -> Duration {
        let factor = self.backoff_multiplier.powi(retry.min(i32::MAX as usize) as i32);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        Duration::from_millis(millis.min(self.max_backoff.as_millis() as f64) as u64)
    }
}

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub batch_size: usize,
    /// Upper bound on how long a reading sits in a partial batch.
    pub flush_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_millis(200),
            retry: RetryPolicy::default(),
        }
    }
}

/// Totals reported when the writer stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub batches_written: u64,
    pub readings_written: u64,
    pub write_retries: u64,
    pub batches_dead_lettered: u64,
    pub readings_dead_lettered: u64,
    /// Readings that could be written neither to the log nor the dead letter.
    pub readings_lost: u64,
}

pub struct Writer {
    buffer: Arc<IngestBuffer>,
    sink: Box<dyn Sink>,
    dead_letter: Box<dyn Sink>,
    config: WriterConfig,
    metrics: IngestMetrics,
    stats: WriterStats,
}

impl Writer {
    pub fn new(
        buffer: Arc<IngestBuffer>,
        sink: Box<dyn Sink>,
        dead_letter: Box<dyn Sink>,
        config: WriterConfig,
        metrics: IngestMetrics,
    ) -> Self {
        Self {
            buffer,
            sink,
            dead_letter,
            config,
            metrics,
            stats: WriterStats::default(),
        }
    }

    /// Run the writer on tokio's blocking pool. The task finishes once the
    /// buffer has been closed and everything in it has been written.
    pub fn spawn(self) -> JoinHandle<WriterStats> {
        task::spawn_blocking(move || self.run())
    }

    /// The writer loop. Returns after the buffer is closed and drained.
    pub fn run(mut self) -> WriterStats {
        info!(
            batch_size = self.config.batch_size,
            flush_interval_ms = self.config.flush_interval.as_millis() as u64,
            "writer started"
        );
        loop {
            // Checked before dequeueing: once closed, no reading can be
            // admitted, so a drain after this point sees everything.
            if self.buffer.is_closed() {
                let remaining = self.buffer.drain();
                self.metrics.buffer_depth.set(0);
                info!(remaining = remaining.len(), "draining buffer for shutdown");
                for chunk in remaining.chunks(self.config.batch_size) {
                    self.flush(chunk.to_vec());
                }
                break;
            }

            let batch = self.next_batch();
            if !batch.is_empty() {
                self.flush(batch);
            }
        }
        info!(
            readings_written = self.stats.readings_written,
            readings_dead_lettered = self.stats.readings_dead_lettered,
            readings_lost = self.stats.readings_lost,
            "writer stopped"
        );
        self.stats
    }

    /// Collect up to `batch_size` readings. Waits at most one flush interval
    /// for the first reading, and at most one flush interval after it for
    /// the batch to fill.
    fn next_batch(&self) -> Vec<ValidatedReading> {
        let max = self.config.batch_size;
        let interval = self.config.flush_interval;

        let mut batch = self.buffer.dequeue_batch(max, Some(interval));
        if batch.is_empty() {
            return batch;
        }

        let deadline = Instant::now() + interval;
        while batch.len() < max {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            let more = self.buffer.dequeue_batch(max - batch.len(), Some(left));
            if more.is_empty() {
                break;
            }
            batch.extend(more);
        }
        self.metrics.buffer_depth.set(self.buffer.len() as i64);
        batch
    }

    fn flush(&mut self, batch: Vec<ValidatedReading>) {
        if let Err(e) = self.write_batch(&batch) {
            error!(error = %e, readings = batch.len(), "batch routed to dead letter");
        }
    }

    /// Append one batch to the durable sink, retrying transient failures.
    /// After the retries run out the batch goes to the dead-letter sink and
    /// `WriteError::Fatal` is returned; the writer itself keeps running.
    pub fn write_batch(&mut self, batch: &[ValidatedReading]) -> Result<(), WriteError> {
        if batch.is_empty() {
            return Ok(());
        }

        let attempts = self.config.retry.max_retries + 1;
        let mut last_err = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.config.retry.backoff(attempt - 1);
                self.stats.write_retries += 1;
                self.metrics.write_retries.inc();
                thread::sleep(delay);
            }

            match self.sink.append(batch) {
                Ok(()) => {
                    self.stats.batches_written += 1;
                    self.stats.readings_written += batch.len() as u64;
                    self.metrics.batches_written.inc();
                    self.metrics.readings_written.inc_by(batch.len() as u64);
                    debug!(
                        readings = batch.len(),
                        first_seq = batch[0].seq,
                        last_seq = batch[batch.len() - 1].seq,
                        "batch written"
                    );
                    return Ok(());
                }
                Err(e) => {
                    let err = WriteError::Transient(e);
                    warn!(
                        attempt = attempt + 1,
                        of = attempts,
                        error = %err,
                        "write attempt failed"
                    );
                    last_err = Some(err);
                }
            }
        }

        let source = match last_err {
            Some(WriteError::Transient(e)) => e,
            _ => io::Error::other("write failed"),
        };
        self.dead_letter(batch);
        Err(WriteError::Fatal { attempts, source })
    }

    fn dead_letter(&mut self, batch: &[ValidatedReading]) {
        let n = batch.len() as u64;
        match self.dead_letter.append(batch) {
            Ok(()) => {
                self.stats.batches_dead_lettered += 1;
                self.stats.readings_dead_lettered += n;
                self.metrics.readings_dead_lettered.inc_by(n);
            }
            Err(e) => {
                self.stats.readings_lost += n;
                self.metrics.readings_lost.inc_by(n);
                error!(
                    error = %e,
                    readings = n,
                    first_seq = batch[0].seq,
                    "dead-letter write failed, readings lost"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use prometheus::Registry;

    fn reading(seq: u64) -> ValidatedReading {
        ValidatedReading {
            seq,
            device_id: "dev".into(),
            metric: "temperature".into(),
            value: 1.0,
            unit: None,
            timestamp: Utc::now(),
            received_at: Utc::now(),
        }
    }

    fn metrics() -> IngestMetrics {
        IngestMetrics::register(&Registry::new()).unwrap()
    }

    fn fast_config(batch_size: usize) -> WriterConfig {
        WriterConfig {
            batch_size,
            flush_interval: Duration::from_millis(20),
            retry: RetryPolicy {
                max_retries: 2,
                initial_backoff: Duration::ZERO,
                max_backoff: Duration::ZERO,
                backoff_multiplier: 2.0,
            },
        }
    }

    /// Fails the first `failures` appends, then delegates.
    struct FlakySink {
        failures: usize,
        inner: MemorySink,
        batch_sizes: Arc<Mutex<Vec<usize>>>,
    }

    impl FlakySink {
        fn new(failures: usize, inner: MemorySink) -> Self {
            Self {
                failures,
                inner,
                batch_sizes: Arc::default(),
            }
        }
    }

    impl Sink for FlakySink {
        fn append(&mut self, batch: &[ValidatedReading]) -> io::Result<()> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(io::Error::other("disk full"));
            }
            self.batch_sizes.lock().push(batch.len());
            self.inner.append(batch)
        }
    }

    struct BrokenSink;

    impl Sink for BrokenSink {
        fn append(&mut self, _batch: &[ValidatedReading]) -> io::Result<()> {
            Err(io::Error::other("device gone"))
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_millis(1000));
        assert_eq!(policy.backoff(60), Duration::from_millis(1000));
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let store = MemorySink::new();
        let dead = MemorySink::new();
        let mut writer = Writer::new(
            Arc::new(IngestBuffer::new(10)),
            Box::new(FlakySink::new(2, store.clone())),
            Box::new(dead.clone()),
            fast_config(10),
            metrics(),
        );

        writer.write_batch(&[reading(1), reading(2)]).expect("third attempt succeeds");
        assert_eq!(store.len(), 2);
        assert!(dead.is_empty());
        assert_eq!(writer.stats.write_retries, 2);
        assert_eq!(writer.stats.readings_written, 2);
    }

    #[test]
    fn test_exhausted_retries_go_to_dead_letter() {
        let dead = MemorySink::new();
        let m = metrics();
        let mut writer = Writer::new(
            Arc::new(IngestBuffer::new(10)),
            Box::new(BrokenSink),
            Box::new(dead.clone()),
            fast_config(10),
            m.clone(),
        );

        let err = writer.write_batch(&[reading(7), reading(8)]).unwrap_err();
        assert!(matches!(err, WriteError::Fatal { attempts: 3, .. }));
        assert_eq!(
            dead.snapshot().iter().map(|r| r.seq).collect::<Vec<_>>(),
            vec![7, 8]
        );
        assert_eq!(writer.stats.readings_dead_lettered, 2);
        assert_eq!(m.readings_dead_lettered.get(), 2);

        // The writer is still usable afterwards.
        assert!(writer.write_batch(&[reading(9)]).is_err());
        assert_eq!(dead.len(), 3);
    }

    #[test]
    fn test_lost_readings_are_counted_when_dead_letter_fails() {
        let m = metrics();
        let mut writer = Writer::new(
            Arc::new(IngestBuffer::new(10)),
            Box::new(BrokenSink),
            Box::new(BrokenSink),
            fast_config(10),
            m.clone(),
        );
        assert!(writer.write_batch(&[reading(1)]).is_err());
        assert_eq!(writer.stats.readings_lost, 1);
        assert_eq!(m.readings_lost.get(), 1);
    }

    #[test]
    fn test_run_batches_and_drains_on_close() {
        let buffer = Arc::new(IngestBuffer::new(100));
        for seq in 1..=25 {
            buffer.try_enqueue(reading(seq)).unwrap();
        }
        let store = MemorySink::new();
        let sink = FlakySink::new(0, store.clone());
        let sizes = sink.batch_sizes.clone();
        let writer = Writer::new(
            buffer.clone(),
            Box::new(sink),
            Box::new(MemorySink::new()),
            fast_config(10),
            metrics(),
        );

        buffer.close();
        let stats = writer.run();

        assert_eq!(stats.readings_written, 25);
        assert_eq!(*sizes.lock(), vec![10, 10, 5]);
        let seqs: Vec<u64> = store.snapshot().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, (1..=25).collect::<Vec<_>>());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_partial_batch_is_flushed_within_interval() {
        let buffer = Arc::new(IngestBuffer::new(100));
        let store = MemorySink::new();
        let writer = Writer::new(
            buffer.clone(),
            Box::new(store.clone()),
            Box::new(MemorySink::new()),
            fast_config(100),
            metrics(),
        );
        let handle = thread::spawn(move || writer.run());

        buffer.try_enqueue(reading(1)).unwrap();
        let started = Instant::now();
        while store.is_empty() && started.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(5));
        }
        // One reading never fills a batch of 100; the interval flushed it.
        assert_eq!(store.len(), 1);
        assert!(started.elapsed() < Duration::from_secs(1));

        buffer.close();
        let stats = handle.join().unwrap();
        assert_eq!(stats.batches_written, 1);
    }

    #[tokio::test]
    async fn test_spawned_writer_finishes_after_close() {
        let buffer = Arc::new(IngestBuffer::new(10));
        let store = MemorySink::new();
        let handle = Writer::new(
            buffer.clone(),
            Box::new(store.clone()),
            Box::new(MemorySink::new()),
            fast_config(4),
            metrics(),
        )
        .spawn();

        for seq in 1..=6 {
            buffer.try_enqueue(reading(seq)).unwrap();
        }
        buffer.close();
        let stats = handle.await.expect("writer task");
        assert_eq!(stats.readings_written, 6);
        assert_eq!(store.len(), 6);
    }
}
