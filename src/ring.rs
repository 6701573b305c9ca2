//! Definition of a concurrent byte ring buffer.

use crate::{Heap, Memory, OffHeap};
use parking_lot::{Condvar, Mutex};
use std::{
    cmp::min,
    collections::HashMap,
    io,
    time::{Duration, Instant},
};
use thiserror::Error;

/// Maximum number of bytes a reader copies out while holding the lock.
const DRAIN_CHUNK: usize = 32 * 1024;

/// How long [`RingStore::flush`] waits for streaming readers by default.
const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Different types of error that can happen when interacting with a [`RingStore`].
#[derive(Debug, Error)]
pub enum RingError {
    #[error("Ring capacity must be > 0")]
    InvalidCapacity,

    #[error("Ring is closed for writes")]
    Closed,

    #[error("Reader fell behind, {lost} bytes were overwritten before being read")]
    DataLoss { lost: u64 },

    #[error("Reader {0} is not registered with this ring")]
    UnknownReader(u64),

    #[error("Failed to write drained bytes: {0}")]
    Io(#[from] io::Error),
}

/// Handle to a reader registered with a [`RingStore`].
///
/// Every handle tracks its own read cursor, so readers drain at their own pace.
/// Handles are not [`Clone`], a cursor can only be advanced by one caller at a time.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct ReaderHandle(u64);

impl ReaderHandle {
    /// Identifier of this reader within its ring.
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Configuration for a [`RingStore`], validated on build.
#[derive(Debug, Clone)]
pub struct RingBuilder {
    capacity: usize,
    flush_timeout: Duration,
}

impl RingBuilder {
    /// Upper bound on how long a flush waits for streaming readers.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Maximum time to wait.
    pub fn flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    /// Build a ring backed by memory from the global allocator.
    pub fn build(self) -> Result<RingStore<Heap>, RingError> {
        self.build_in()
    }

    /// Build a ring backed by an anonymous memory map.
    pub fn build_off_heap(self) -> Result<RingStore<OffHeap>, RingError> {
        self.build_in()
    }

    /// Build a ring backed by any kind of [`Memory`].
    pub fn build_in<M: Memory>(self) -> Result<RingStore<M>, RingError> {
        if self.capacity == 0 {
            return Err(RingError::InvalidCapacity);
        }

        tracing::debug!(capacity = self.capacity, "allocating log ring");
        Ok(RingStore {
            capacity: self.capacity,
            flush_timeout: self.flush_timeout,
            state: Mutex::new(State::new(M::alloc(self.capacity)?)),
            readable: Condvar::new(),
            progress: Condvar::new(),
        })
    }
}

/// Position of a single reader.
#[derive(Debug, Clone, Copy)]
struct Cursor {
    // Absolute offset of the next byte this reader will consume.
    position: u64,

    // Reader is inside a streaming drain.
    streaming: bool,
}

/// Everything guarded by the ring lock.
#[derive(Debug)]
struct State<M> {
    // Index where the next write will occur.
    // This will wrap around to 0 when next == capacity.
    next: usize,

    // Number of bytes ever written, also the absolute write cursor.
    written: u64,

    // Once set, writes are rejected and streaming readers end when caught up.
    closed: bool,

    // Identifier handed to the next registered reader.
    next_reader: u64,

    // Cursors of all registered readers.
    readers: HashMap<u64, Cursor>,

    // A pre-allocated memory for ring buffer bytes.
    memory: M,
}

impl<M: Memory> State<M> {
    fn new(memory: M) -> Self {
        Self {
            next: 0,
            written: 0,
            closed: false,
            next_reader: 0,
            readers: HashMap::new(),
            memory,
        }
    }

    fn capacity(&self) -> usize {
        self.memory.as_ref().len()
    }

    /// Absolute offset of the oldest byte still retained.
    fn oldest(&self) -> u64 {
        self.written.saturating_sub(self.capacity() as u64)
    }

    /// Append bytes at the write cursor, overwriting the oldest bytes.
    ///
    /// # Arguments
    ///
    /// * `bytes` - Bytes to append into the ring.
    fn append(&mut self, bytes: &[u8]) {
        let memory = self.memory.as_mut();
        let capacity = memory.len();

        // Bytes beyond capacity would be overwritten by the same write anyway. Skipping
        // them keeps the append at exactly 2 memcpy operations.
        let skipped = bytes.len().saturating_sub(capacity);
        let (_, bytes_kept) = bytes.split_at(skipped);
        let start = (self.next + skipped % capacity) % capacity;

        // One copy from start till the end of memory, another one from index 0.
        let (first, second) = bytes_kept.split_at(min(bytes_kept.len(), capacity - start));
        memory[start..start + first.len()].copy_from_slice(first);
        memory[..second.len()].copy_from_slice(second);

        self.next = (start + bytes_kept.len()) % capacity;
        self.written += bytes.len() as u64;
    }

    /// Copy retained bytes starting at an absolute offset.
    ///
    /// # Invariants
    ///
    /// * oldest() <= from
    /// * from + len <= written
    ///
    /// # Arguments
    ///
    /// * `from` - Absolute offset of the first byte to copy.
    /// * `len` - Number of bytes to copy.
    /// * `buf` - Buffer to extend with the copied bytes.
    fn copy_out(&self, from: u64, len: usize, buf: &mut Vec<u8>) {
        let memory = self.memory.as_ref();
        let capacity = memory.len();

        // Distance from the write cursor is at most capacity, so it fits in usize.
        let behind = (self.written - from) as usize;
        let start = (self.next + capacity - behind) % capacity;

        let first = min(len, capacity - start);
        buf.extend_from_slice(&memory[start..start + first]);
        buf.extend_from_slice(&memory[..len - first]);
    }

    fn cursor(&mut self, id: u64) -> Result<&mut Cursor, RingError> {
        self.readers.get_mut(&id).ok_or(RingError::UnknownReader(id))
    }

    /// Copy the next chunk of unread bytes for a reader, up to `until`.
    ///
    /// Returns absolute offset of the first byte copied into buf. Buf is
    /// left empty when the reader has nothing left to read before `until`.
    fn next_chunk(&mut self, id: u64, until: u64, buf: &mut Vec<u8>) -> Result<u64, RingError> {
        buf.clear();

        let oldest = self.oldest();
        let cursor = self.cursor(id)?;

        // Bytes this reader expected were overwritten. Skip ahead to the oldest
        // retained byte so that the next read can resume from there.
        if cursor.position < oldest {
            let lost = oldest - cursor.position;
            cursor.position = oldest;
            return Err(RingError::DataLoss { lost });
        }

        let start = cursor.position;
        let len = min(until.saturating_sub(start), DRAIN_CHUNK as u64) as usize;
        if len > 0 {
            self.copy_out(start, len, buf);
        }

        Ok(start)
    }

    /// Move a reader past bytes that were delivered to its destination.
    fn commit(&mut self, id: u64, start: u64, len: usize) {
        if let Some(cursor) = self.readers.get_mut(&id) {
            if cursor.position == start {
                cursor.position = start + len as u64;
            }
        }
    }

    /// Number of streaming readers that have not delivered bytes up to target.
    fn lagging(&self, target: u64) -> usize {
        self.readers
            .values()
            .filter(|cursor| cursor.streaming && cursor.position < target)
            .count()
    }
}

/// A fixed size, thread safe ring of bytes.
///
/// * Writes never wait on readers, the oldest bytes are overwritten when full.
/// * Every write is copied in as one contiguous region, concurrent writes never interleave.
/// * Any number of readers, each with an independent cursor.
/// * Readers that fall more than capacity bytes behind get [`RingError::DataLoss`].
#[derive(Debug)]
pub struct RingStore<M = Heap> {
    capacity: usize,
    flush_timeout: Duration,
    state: Mutex<State<M>>,

    // Signalled when bytes are written or the ring is closed.
    readable: Condvar,

    // Signalled when a streaming reader delivers bytes or stops streaming.
    progress: Condvar,
}

impl RingStore {
    /// Create a new ring that holds the last `capacity` bytes written.
    ///
    /// All required memory is allocated during initialization. It is
    /// guaranteed that no allocations happen on the write path.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of bytes this ring retains.
    pub fn with_capacity(capacity: usize) -> Result<Self, RingError> {
        Self::builder(capacity).build()
    }

    /// Start configuring a ring that holds the last `capacity` bytes written.
    pub fn builder(capacity: usize) -> RingBuilder {
        RingBuilder {
            capacity,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
        }
    }
}

impl<M: Memory> RingStore<M> {
    /// Maximum number of bytes this ring retains.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of bytes ever written into this ring.
    pub fn total_written(&self) -> u64 {
        self.state.lock().written
    }

    /// Number of bytes currently retained.
    pub fn len(&self) -> usize {
        min(self.total_written(), self.capacity as u64) as usize
    }

    /// Nothing was ever written into this ring.
    pub fn is_empty(&self) -> bool {
        self.total_written() == 0
    }

    /// Ring no longer accepts writes.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of registered readers.
    pub fn reader_count(&self) -> usize {
        self.state.lock().readers.len()
    }

    /// Append bytes into the ring.
    ///
    /// A write larger than capacity is accepted, only its last capacity bytes
    /// are retained. Returns [`RingError::Closed`] once the ring is closed.
    ///
    /// # Arguments
    ///
    /// * `bytes` - Bytes to append.
    pub fn write(&self, bytes: &[u8]) -> Result<usize, RingError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(RingError::Closed);
        }

        state.append(bytes);
        drop(state);

        self.readable.notify_all();
        Ok(bytes.len())
    }

    /// Copy of every retained byte, oldest first.
    ///
    /// The copy is taken in one go under the ring lock, so writers wait until it
    /// is done. Use a reader with [`RingStore::drain`] to copy large rings while
    /// writers keep going.
    pub fn snapshot(&self) -> Vec<u8> {
        let state = self.state.lock();
        let oldest = state.oldest();
        let len = (state.written - oldest) as usize;

        let mut buf = Vec::with_capacity(len);
        state.copy_out(oldest, len, &mut buf);
        buf
    }

    /// Register a new reader.
    ///
    /// The reader starts at the oldest byte still retained, not at the write cursor.
    pub fn register_reader(&self) -> ReaderHandle {
        let mut state = self.state.lock();

        let id = state.next_reader;
        state.next_reader += 1;

        let position = state.oldest();
        state.readers.insert(
            id,
            Cursor {
                position,
                streaming: false,
            },
        );

        ReaderHandle(id)
    }

    /// Forget a reader and its cursor.
    pub fn unregister_reader(&self, reader: ReaderHandle) {
        self.state.lock().readers.remove(&reader.0);
        self.progress.notify_all();
    }

    /// Number of bytes written that this reader has not consumed yet.
    ///
    /// A value larger than capacity means the reader has already lost data.
    pub fn unread(&self, reader: &ReaderHandle) -> Result<u64, RingError> {
        let mut state = self.state.lock();
        let written = state.written;
        Ok(written - state.cursor(reader.0)?.position)
    }

    /// Drain bytes available to this reader when the call starts.
    ///
    /// Does not wait for new bytes. Returns number of bytes written to out.
    ///
    /// # Arguments
    ///
    /// * `reader` - Reader to drain bytes for.
    /// * `out` - Destination for drained bytes.
    pub fn drain<W: io::Write>(
        &self,
        reader: &mut ReaderHandle,
        mut out: W,
    ) -> Result<u64, RingError> {
        let until = self.state.lock().written;
        let result = self.pump(reader.0, &mut out, Some(until));
        self.trace_loss(reader.0, &result);
        result
    }

    /// Drain bytes for this reader as they are written, until the ring is closed.
    ///
    /// Returns normally once the ring is closed and every byte written before
    /// close was delivered. Returns number of bytes written to out.
    ///
    /// # Arguments
    ///
    /// * `reader` - Reader to drain bytes for.
    /// * `out` - Destination for drained bytes.
    pub fn stream<W: io::Write>(
        &self,
        reader: &mut ReaderHandle,
        mut out: W,
    ) -> Result<u64, RingError> {
        self.state.lock().cursor(reader.0)?.streaming = true;

        let result = self.pump(reader.0, &mut out, None);

        if let Ok(cursor) = self.state.lock().cursor(reader.0) {
            cursor.streaming = false;
        }

        self.progress.notify_all();
        self.trace_loss(reader.0, &result);
        result
    }

    /// Stream every retained and future byte into out, until the ring is closed.
    ///
    /// # Arguments
    ///
    /// * `out` - Destination for drained bytes.
    pub fn write_to<W: io::Write>(&self, out: W) -> Result<u64, RingError> {
        let mut reader = self.register_reader();
        let result = self.stream(&mut reader, out);
        self.unregister_reader(reader);
        result
    }

    /// Wait for streaming readers to deliver everything written so far.
    ///
    /// Only readers currently inside [`RingStore::stream`] are awaited, and never
    /// for longer than the configured flush timeout. Returns true if all of them
    /// caught up.
    pub fn flush(&self) -> bool {
        // Timeouts too large to represent as an instant never expire.
        let deadline = Instant::now().checked_add(self.flush_timeout);

        let mut state = self.state.lock();
        let target = state.written;
        self.readable.notify_all();

        let lagging = loop {
            let lagging = state.lagging(target);
            if lagging == 0 {
                return true;
            }

            match deadline {
                Some(deadline) => {
                    if self.progress.wait_until(&mut state, deadline).timed_out() {
                        break state.lagging(target);
                    }
                }
                None => self.progress.wait(&mut state),
            }
        };

        drop(state);
        if lagging == 0 {
            return true;
        }

        tracing::warn!(lagging, target, "flush timed out waiting for streaming readers");
        false
    }

    /// Flush and permanently close this ring.
    ///
    /// Writes fail afterwards. Streaming readers deliver remaining bytes and end.
    pub fn close(&self) {
        let caught_up = self.flush();

        let mut state = self.state.lock();
        if state.closed {
            return;
        }

        state.closed = true;
        let written = state.written;
        drop(state);

        self.readable.notify_all();
        tracing::debug!(written, caught_up, "log ring closed");
    }

    /// Copy chunks for a reader into out.
    ///
    /// With an upper bound, returns once the reader reaches it. Without one,
    /// waits for new bytes till the ring is closed.
    fn pump<W: io::Write>(&self, id: u64, out: &mut W, until: Option<u64>) -> Result<u64, RingError> {
        let mut scratch = Vec::new();
        let mut delivered = None;
        let mut total = 0;

        loop {
            let mut state = self.state.lock();

            // Commit whatever was written out in the previous iteration.
            if let Some((start, len)) = delivered.take() {
                state.commit(id, start, len);
                self.progress.notify_all();
            }

            let bound = until.unwrap_or(state.written);
            let start = state.next_chunk(id, bound, &mut scratch)?;

            if scratch.is_empty() {
                if until.is_some() || state.closed {
                    return Ok(total);
                }

                self.readable.wait(&mut state);
                continue;
            }

            // Never hold the lock while writing to destination.
            drop(state);
            out.write_all(&scratch)?;

            delivered = Some((start, scratch.len()));
            total += scratch.len() as u64;
        }
    }

    fn trace_loss(&self, id: u64, result: &Result<u64, RingError>) {
        if let Err(RingError::DataLoss { lost }) = result {
            tracing::debug!(reader = id, lost, "reader fell behind the log ring");
        }
    }
}

impl<M: Memory> io::Write for &RingStore<M> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        RingStore::<M>::write(self, buf)
            .map_err(|error| io::Error::new(io::ErrorKind::BrokenPipe, error))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
