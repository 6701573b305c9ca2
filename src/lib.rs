//! # Logring
//!
//! Logring keeps the most recent bytes of log history in memory, so that they can be
//! inspected on demand (say, dump the last 10MB of logs on crash) without a file or
//! network sink.
//!
//! ## Ring
//!
//! A [`RingStore`] is a fixed size ring of bytes. Writes from any number of threads are
//! appended as contiguous regions, and once full the oldest bytes are overwritten. Readers
//! register a cursor and drain at their own pace, either a snapshot of what is there right
//! now or a stream that follows new writes until the ring is closed. A reader that falls
//! more than capacity bytes behind is told so with [`RingError::DataLoss`].
//!
//! Memory is allocated once, up front. Either on heap with [`Heap`] or with an anonymous
//! memory map using [`OffHeap`].
//!
//! ## Pipeline
//!
//! A [`RingCore`] sits between a logger and a downstream [`Sink`]. Every record is encoded
//! into the ring with an [`Encoder`] and then forwarded to the next sink, no matter what
//! happened with the ring. [`RingLayer`] does the same for subscribers of the `tracing`
//! ecosystem.

mod adapter;
mod encoder;
mod layer;
mod memory;
mod record;
mod ring;
mod sink;

#[cfg(test)]
mod oracle;

// Externally exposed types.
pub use adapter::{CaptureError, CaptureStats, RingCore};
pub use encoder::{EncodeError, Encoder, JsonEncoder};
pub use layer::RingLayer;
pub use memory::{Heap, Memory, OffHeap};
pub use record::{Field, FieldValue, Level, Record};
pub use ring::{ReaderHandle, RingBuilder, RingError, RingStore};
pub use sink::{CheckedRecord, Discard, Sink, WriterSink};
