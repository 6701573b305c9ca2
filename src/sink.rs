//! Definition of downstream sinks that receive records.

use crate::{Encoder, Field, JsonEncoder, Level, Record};
use parking_lot::Mutex;
use std::{
    fmt,
    io::{self, Write as _},
    sync::Arc,
};

/// A stage of the logging pipeline that records are forwarded to.
pub trait Sink: Send + Sync {
    /// Whether records at this level are accepted.
    fn enabled(&self, level: Level) -> bool;

    /// A sink that attaches fields to every record it writes.
    ///
    /// # Arguments
    ///
    /// * `fields` - Contextual fields to attach.
    fn with(&self, fields: &[Field]) -> Self
    where
        Self: Sized;

    /// Register this sink as a handler for record if it is enabled.
    ///
    /// # Arguments
    ///
    /// * `record` - Record about to be written.
    /// * `checked` - Accumulator of sinks that will receive the record.
    fn check<'a>(&'a self, record: &Record<'_>, checked: CheckedRecord<'a>) -> CheckedRecord<'a>
    where
        Self: Sized,
    {
        if self.enabled(record.level) {
            checked.add_sink(self)
        } else {
            checked
        }
    }

    /// Write a record along with its own fields.
    fn write(&self, record: &Record<'_>, fields: &[Field]) -> io::Result<()>;

    /// Flush anything buffered by this sink.
    fn sync(&self) -> io::Result<()>;
}

/// A record along with every sink that agreed to write it.
///
/// Splitting check from write lets callers skip building fields for records
/// nobody wants.
pub struct CheckedRecord<'a> {
    record: Record<'a>,
    sinks: Vec<&'a dyn Sink>,
}

impl<'a> CheckedRecord<'a> {
    /// Start checking a record, with no sinks registered yet.
    pub fn new(record: Record<'a>) -> Self {
        Self {
            record,
            sinks: Vec::new(),
        }
    }

    /// Add a sink that will receive this record.
    pub fn add_sink(mut self, sink: &'a dyn Sink) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Record being checked.
    pub fn record(&self) -> &Record<'a> {
        &self.record
    }

    /// Number of sinks that will receive this record.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// No sink wants this record.
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Write the record to every registered sink.
    ///
    /// Every sink is written to even if an earlier one fails, the first
    /// error is returned.
    pub fn write(&self, fields: &[Field]) -> io::Result<()> {
        let mut result = Ok(());
        for sink in &self.sinks {
            let written = sink.write(&self.record, fields);
            if result.is_ok() {
                result = written;
            }
        }

        result
    }
}

impl fmt::Debug for CheckedRecord<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckedRecord")
            .field("record", &self.record)
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

/// A sink that accepts every record and drops it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Discard;

impl Sink for Discard {
    fn enabled(&self, _level: Level) -> bool {
        true
    }

    fn with(&self, _fields: &[Field]) -> Self {
        Discard
    }

    fn write(&self, _record: &Record<'_>, _fields: &[Field]) -> io::Result<()> {
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }
}

/// A sink that encodes records into any [`io::Write`].
///
/// Sinks created with [`Sink::with`] share the same writer.
pub struct WriterSink<W, E = JsonEncoder> {
    encoder: E,
    max_level: Level,
    writer: Arc<Mutex<W>>,
}

impl<W: io::Write + Send, E: Encoder> WriterSink<W, E> {
    /// Create a new sink.
    ///
    /// # Arguments
    ///
    /// * `writer` - Destination for encoded records.
    /// * `encoder` - Encoder for records.
    /// * `max_level` - Most verbose level that is accepted.
    pub fn new(writer: W, encoder: E, max_level: Level) -> Self {
        Self {
            encoder,
            max_level,
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    /// Run a closure with exclusive access to the writer.
    pub fn with_writer<T>(&self, f: impl FnOnce(&mut W) -> T) -> T {
        f(&mut self.writer.lock())
    }
}

impl<W: io::Write + Send, E: Encoder> Sink for WriterSink<W, E> {
    fn enabled(&self, level: Level) -> bool {
        level <= self.max_level
    }

    fn with(&self, fields: &[Field]) -> Self {
        let mut encoder = self.encoder.clone();
        for field in fields {
            encoder.add_field(field);
        }

        Self {
            encoder,
            max_level: self.max_level,
            writer: self.writer.clone(),
        }
    }

    fn write(&self, record: &Record<'_>, fields: &[Field]) -> io::Result<()> {
        let mut buf = Vec::new();
        self.encoder
            .encode(record, fields, &mut buf)
            .map_err(io::Error::other)?;

        self.writer.lock().write_all(&buf)
    }

    fn sync(&self) -> io::Result<()> {
        self.writer.lock().flush()
    }
}

impl<W, E: fmt::Debug> fmt::Debug for WriterSink<W, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterSink")
            .field("encoder", &self.encoder)
            .field("max_level", &self.max_level)
            .finish_non_exhaustive()
    }
}
