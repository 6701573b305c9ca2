//! Definition of a logging stage that keeps recent records in a ring.

use crate::{
    Discard, EncodeError, Encoder, Field, Heap, JsonEncoder, Level, Memory, Record, RingError,
    RingStore, Sink,
};
use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};
use thiserror::Error;

/// Different types of error that can happen when a record is copied into the ring.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Failed to encode record: {0}")]
    Encode(#[from] EncodeError),

    #[error("Failed to write record into ring: {0}")]
    Ring(#[from] RingError),
}

/// Counters of records copied into the ring, shared by every clone of a [`RingCore`].
#[derive(Debug, Default)]
pub struct CaptureStats {
    captured: AtomicUsize,
    encode_failures: AtomicUsize,
    ring_failures: AtomicUsize,
}

impl CaptureStats {
    /// Number of records copied into the ring.
    pub fn captured(&self) -> usize {
        self.captured.load(Ordering::Relaxed)
    }

    /// Number of records that could not be encoded.
    pub fn encode_failures(&self) -> usize {
        self.encode_failures.load(Ordering::Relaxed)
    }

    /// Number of encoded records the ring rejected.
    pub fn ring_failures(&self) -> usize {
        self.ring_failures.load(Ordering::Relaxed)
    }

    fn record(&self, result: &Result<usize, CaptureError>) {
        let counter = match result {
            Ok(_) => &self.captured,
            Err(CaptureError::Encode(_)) => &self.encode_failures,
            Err(CaptureError::Ring(_)) => &self.ring_failures,
        };

        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// A pass-through [`Sink`] that also keeps the most recent records in a [`RingStore`].
///
/// Every record written is encoded into the ring and then forwarded to the
/// next sink. The ring is a best effort copy, failing to capture a record
/// never stops it from reaching the next sink.
///
/// Cores derived with [`Sink::with`] share the ring, the next sink and the
/// capture counters, but each has its own encoder with its own bound fields.
///
/// ```no_run
/// use logring::{Field, Level, Record, RingCore, Sink};
///
/// let core = RingCore::new(10 * 1024 * 1024)?;
/// let request = core.with(&[Field::new("request_id", 42u64)]);
/// request.write(&Record::new(Level::INFO, "app", "hello world!"), &[])?;
///
/// // Dump retained history.
/// let history = core.ring().snapshot();
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug)]
pub struct RingCore<E = JsonEncoder, S = Discard, M = Heap> {
    encoder: E,
    next: Arc<S>,
    ring: Arc<RingStore<M>>,
    stats: Arc<CaptureStats>,
}

impl RingCore {
    /// Create a core with a new ring that retains the last `capacity` bytes.
    ///
    /// Records are encoded with a [`JsonEncoder`] and forwarded to [`Discard`]
    /// until configured otherwise.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of bytes retained.
    pub fn new(capacity: usize) -> Result<Self, RingError> {
        Ok(Self::from_ring(Arc::new(RingStore::with_capacity(capacity)?)))
    }
}

impl<M: Memory> RingCore<JsonEncoder, Discard, M> {
    /// Create a core on top of an existing ring.
    pub fn from_ring(ring: Arc<RingStore<M>>) -> Self {
        Self {
            ring,
            encoder: JsonEncoder::new(),
            next: Arc::new(Discard),
            stats: Arc::default(),
        }
    }
}

impl<E: Encoder, S: Sink, M: Memory> RingCore<E, S, M> {
    /// Forward records to this sink instead.
    pub fn with_next<T: Sink>(self, next: T) -> RingCore<E, T, M> {
        RingCore {
            encoder: self.encoder,
            next: Arc::new(next),
            ring: self.ring,
            stats: self.stats,
        }
    }

    /// Encode records captured into the ring with this encoder instead.
    pub fn with_encoder<F: Encoder>(self, encoder: F) -> RingCore<F, S, M> {
        RingCore {
            encoder,
            next: self.next,
            ring: self.ring,
            stats: self.stats,
        }
    }

    /// Sit in front of next, capturing records with encoder.
    pub fn wrap<T: Sink, F: Encoder>(self, next: T, encoder: F) -> RingCore<F, T, M> {
        self.with_next(next).with_encoder(encoder)
    }

    /// Ring shared by this core and every core derived from it.
    pub fn ring(&self) -> &Arc<RingStore<M>> {
        &self.ring
    }

    /// Sink that every record is forwarded to.
    pub fn next(&self) -> &S {
        &self.next
    }

    /// Encoder used for records captured into the ring, with its bound fields.
    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    /// Capture counters shared with every core derived from this one.
    pub fn stats(&self) -> &CaptureStats {
        &self.stats
    }

    /// Copy a record into the ring without forwarding it.
    ///
    /// Returns number of bytes the record took in the ring.
    ///
    /// # Arguments
    ///
    /// * `record` - Record to capture.
    /// * `fields` - Fields that belong to this record only.
    pub fn capture(&self, record: &Record<'_>, fields: &[Field]) -> Result<usize, CaptureError> {
        let result = self.encode_into_ring(record, fields);
        self.stats.record(&result);
        result
    }

    fn encode_into_ring(&self, record: &Record<'_>, fields: &[Field]) -> Result<usize, CaptureError> {
        let mut buf = Vec::with_capacity(256);
        self.encoder.encode(record, fields, &mut buf)?;

        // Whole record in a single write, so it is never split by another writer.
        Ok(self.ring.write(&buf)?)
    }

    /// Flush and close the shared ring, writes are only forwarded from now on.
    pub fn close(&self) {
        self.ring.close();
    }

    /// Stream retained and future records into out, until the ring is closed.
    ///
    /// # Arguments
    ///
    /// * `out` - Destination for encoded records.
    pub fn write_to<W: io::Write>(&self, out: W) -> Result<u64, RingError> {
        self.ring.write_to(out)
    }
}

impl<E: Clone, S, M> Clone for RingCore<E, S, M> {
    fn clone(&self) -> Self {
        Self {
            encoder: self.encoder.clone(),
            next: self.next.clone(),
            ring: self.ring.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl<E: Encoder, S: Sink, M: Memory> Sink for RingCore<E, S, M> {
    fn enabled(&self, level: Level) -> bool {
        self.next.enabled(level)
    }

    fn with(&self, fields: &[Field]) -> Self {
        let mut core = self.clone();
        for field in fields {
            core.encoder.add_field(field);
        }

        core
    }

    fn write(&self, record: &Record<'_>, fields: &[Field]) -> io::Result<()> {
        // Failures are counted in stats, delivery never depends on the ring.
        let _ = self.capture(record, fields);
        self.next.write(record, fields)
    }

    fn sync(&self) -> io::Result<()> {
        self.next.sync()
    }
}
