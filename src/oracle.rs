//! Reference model of a byte ring with reader cursors.

use std::collections::VecDeque;

/// A ring of bytes backed by [`VecDeque`], with one cursor per reader.
///
/// Readers are addressed by the order they were registered in.
pub(crate) struct Oracle {
    capacity: usize,
    written: u64,
    bytes: VecDeque<u8>,
    readers: Vec<u64>,
}

impl Oracle {
    #[track_caller]
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "Capacity must be > 0");

        Self {
            capacity,
            written: 0,
            bytes: VecDeque::with_capacity(capacity),
            readers: Vec::new(),
        }
    }

    /// Absolute offset of the oldest retained byte.
    fn oldest(&self) -> u64 {
        self.written - self.bytes.len() as u64
    }

    pub(crate) fn written(&self) -> u64 {
        self.written
    }

    pub(crate) fn readers(&self) -> usize {
        self.readers.len()
    }

    /// Append bytes, evicting the oldest ones beyond capacity.
    pub(crate) fn write(&mut self, bytes: &[u8]) {
        self.written += bytes.len() as u64;
        self.bytes.extend(bytes.iter().copied());

        let excess = self.bytes.len().saturating_sub(self.capacity);
        self.bytes.drain(..excess);
    }

    /// Every retained byte, oldest first.
    pub(crate) fn retained(&self) -> Vec<u8> {
        self.bytes.iter().copied().collect()
    }

    /// Register a reader at the oldest retained byte, returns its index.
    pub(crate) fn register(&mut self) -> usize {
        self.readers.push(self.oldest());
        self.readers.len() - 1
    }

    pub(crate) fn unread(&self, reader: usize) -> u64 {
        self.written - self.readers[reader]
    }

    /// Consume everything a reader has not seen yet.
    ///
    /// A reader whose next byte was evicted gets the number of bytes lost
    /// instead, and is moved up to the oldest retained byte.
    pub(crate) fn drain(&mut self, reader: usize) -> Result<Vec<u8>, u64> {
        let oldest = self.oldest();
        let cursor = &mut self.readers[reader];

        if *cursor < oldest {
            let lost = oldest - *cursor;
            *cursor = oldest;
            return Err(lost);
        }

        let skip = (*cursor - oldest) as usize;
        *cursor = self.written;
        Ok(self.bytes.iter().skip(skip).copied().collect())
    }
}
