// Bounded FIFO between request handlers and the single writer loop.
//
// Built on a bounded crossbeam channel. Producers never block: a full
// channel is reported as `BufferError::Full`, which the HTTP layer turns
// into a 503. Admission goes through a small mutex so that sequence
// stamping and enqueueing happen as one step (channel order == sequence
// order) and so that `close` is a hard cut-off for new readings.
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Mutex, MutexGuard};

use crate::error::BufferError;
use crate::reading::ValidatedReading;

pub const DEFAULT_CAPACITY: usize = 10_000;

pub struct IngestBuffer {
    tx: Sender<ValidatedReading>,
    rx: Receiver<ValidatedReading>,
    capacity: usize,
    /// `true` once closed. Held for the duration of an admission.
    closed: Mutex<bool>,
}

/// A reserved slot in the buffer. While a permit is alive no other producer
/// can enqueue, so the slot cannot be taken by someone else.
pub struct EnqueuePermit<'a> {
    _gate: MutexGuard<'a, bool>,
    tx: &'a Sender<ValidatedReading>,
}

impl EnqueuePermit<'_> {
    pub fn send(self, reading: ValidatedReading) -> Result<(), BufferError> {
        self.tx.try_send(reading).map_err(|e| match e {
            TrySendError::Full(_) => BufferError::Full,
            TrySendError::Disconnected(_) => BufferError::Closed,
        })
    }
}

impl IngestBuffer {
    /// Panics if `capacity` is zero; the config layer rejects that earlier.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "buffer capacity must be positive");
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            closed: Mutex::new(false),
        }
    }

    /// Reserve room for one reading. Fails fast, never waits for space.
    pub fn reserve(&self) -> Result<EnqueuePermit<'_>, BufferError> {
        let gate = self.closed.lock();
        if *gate {
            return Err(BufferError::Closed);
        }
        if self.tx.is_full() {
            return Err(BufferError::Full);
        }
        Ok(EnqueuePermit {
            _gate: gate,
            tx: &self.tx,
        })
    }

    pub fn try_enqueue(&self, reading: ValidatedReading) -> Result<(), BufferError> {
        self.reserve()?.send(reading)
    }

    /// Take up to `max` readings in FIFO order.
    ///
    /// With `wait = None` this returns immediately (possibly empty). With
    /// `Some(timeout)` it blocks up to `timeout` for the first reading, then
    /// takes whatever else is already queued without waiting further.
    pub fn dequeue_batch(&self, max: usize, wait: Option<Duration>) -> Vec<ValidatedReading> {
        let mut batch = Vec::new();
        if max == 0 {
            return batch;
        }

        let first = match wait {
            None => self.rx.try_recv().ok(),
            Some(timeout) => match self.rx.recv_timeout(timeout) {
                Ok(r) => Some(r),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
            },
        };

        if let Some(first) = first {
            batch.reserve(max.min(self.rx.len() + 1));
            batch.push(first);
            batch.extend(self.rx.try_iter().take(max - 1));
        }
        batch
    }

    /// Stop admitting readings. Anything already queued stays dequeueable.
    pub fn close(&self) {
        *self.closed.lock() = true;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    /// Everything still queued, in order. Meant for shutdown after `close`.
    pub fn drain(&self) -> Vec<ValidatedReading> {
        self.rx.try_iter().collect()
    }

    /// Close and take the remaining contents in one step.
    pub fn close_and_drain(&self) -> Vec<ValidatedReading> {
        self.close();
        self.drain()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
