//! Integration with subscribers from the `tracing` ecosystem.

use crate::{
    CaptureStats, Discard, Encoder, Field, FieldValue, Heap, JsonEncoder, Memory, Record,
    RingCore, RingError, RingStore,
};
use std::{fmt, sync::Arc};
use tracing::{
    Event, Id, Subscriber,
    field::{self, Visit},
    span,
};
use tracing_subscriber::{
    layer::{Context, Layer},
    registry::LookupSpan,
};

/// Fields recorded on a span, kept in span extensions.
struct SpanFields(Vec<Field>);

/// Collects fields of an event or span, message is kept apart.
#[derive(Default)]
struct Collector {
    message: Option<String>,
    fields: Vec<Field>,
}

impl Collector {
    fn push(&mut self, field: &field::Field, value: FieldValue) {
        match value {
            FieldValue::Str(message) if field.name() == "message" => self.message = Some(message),
            value => self.fields.push(Field::new(field.name(), value)),
        }
    }
}

impl Visit for Collector {
    fn record_i64(&mut self, field: &field::Field, value: i64) {
        self.push(field, value.into());
    }

    fn record_u64(&mut self, field: &field::Field, value: u64) {
        self.push(field, value.into());
    }

    fn record_f64(&mut self, field: &field::Field, value: f64) {
        self.push(field, value.into());
    }

    fn record_bool(&mut self, field: &field::Field, value: bool) {
        self.push(field, value.into());
    }

    fn record_str(&mut self, field: &field::Field, value: &str) {
        self.push(field, value.into());
    }

    fn record_debug(&mut self, field: &field::Field, value: &dyn fmt::Debug) {
        self.push(field, FieldValue::Str(format!("{value:?}")));
    }
}

/// A [`Layer`] that keeps the most recent events in a [`RingStore`].
///
/// Every event is encoded along with the fields of the spans it happened in,
/// root span first. Other layers of the subscriber still see every event, so
/// the ring is purely an extra copy.
///
/// ```no_run
/// use logring::RingLayer;
/// use tracing_subscriber::layer::SubscriberExt;
///
/// let layer = RingLayer::new(10 * 1024 * 1024)?;
/// let ring = layer.ring().clone();
/// tracing::subscriber::set_global_default(tracing_subscriber::registry().with(layer))?;
///
/// tracing::info!(user = "alice", "logged in");
/// let history = ring.snapshot();
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug)]
pub struct RingLayer<E = JsonEncoder, M = Heap> {
    core: RingCore<E, Discard, M>,
}

impl RingLayer {
    /// Create a layer with a new ring that retains the last `capacity` bytes.
    pub fn new(capacity: usize) -> Result<Self, RingError> {
        Ok(Self {
            core: RingCore::new(capacity)?,
        })
    }
}

impl<M: Memory> RingLayer<JsonEncoder, M> {
    /// Create a layer on top of an existing ring.
    pub fn from_ring(ring: Arc<RingStore<M>>) -> Self {
        Self {
            core: RingCore::from_ring(ring),
        }
    }
}

impl<E: Encoder, M: Memory> RingLayer<E, M> {
    /// Encode events with this encoder instead.
    pub fn with_encoder<F: Encoder>(self, encoder: F) -> RingLayer<F, M> {
        RingLayer {
            core: self.core.with_encoder(encoder),
        }
    }

    /// Ring that events are captured into.
    pub fn ring(&self) -> &Arc<RingStore<M>> {
        self.core.ring()
    }

    /// Counters of captured and rejected events.
    pub fn stats(&self) -> &CaptureStats {
        self.core.stats()
    }
}

impl<S, E, M> Layer<S> for RingLayer<E, M>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    E: Encoder + 'static,
    M: Memory + 'static,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut collector = Collector::default();
        attrs.record(&mut collector);

        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(SpanFields(collector.fields));
        }
    }

    fn on_record(&self, id: &Id, values: &span::Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };

        let mut collector = Collector::default();
        values.record(&mut collector);

        let mut extensions = span.extensions_mut();
        match extensions.get_mut::<SpanFields>() {
            Some(fields) => fields.0.extend(collector.fields),
            None => extensions.insert(SpanFields(collector.fields)),
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let mut collector = Collector::default();

        if let Some(scope) = ctx.event_scope(event) {
            for span in scope.from_root() {
                if let Some(fields) = span.extensions().get::<SpanFields>() {
                    collector.fields.extend(fields.0.iter().cloned());
                }
            }
        }

        // Event fields come last, so they win over span fields with the same name.
        event.record(&mut collector);

        let metadata = event.metadata();
        let message = collector.message.as_deref().unwrap_or_default();
        let record = Record::new(*metadata.level(), metadata.target(), message);

        // Failures only show up in stats, logging here would re-enter this layer.
        let _ = self.core.capture(&record, &collector.fields);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tracing_subscriber::layer::SubscriberExt;

    fn lines<M: Memory>(ring: &RingStore<M>) -> Vec<Value> {
        ring.snapshot()
            .split(|byte| *byte == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_slice(line).expect("Line should be JSON"))
            .collect()
    }

    #[test]
    fn captures_events_with_span_fields() {
        let layer = RingLayer::new(64 * 1024).expect("Capacity is > 0");
        let ring = layer.ring().clone();

        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("outside");

            let span = tracing::info_span!("request", user = "alice", status = field::Empty);
            let _guard = span.enter();
            tracing::info!(attempt = 2u64, "hello {}", "world");

            span.record("status", 200u64);
            tracing::warn!(user = "bob", "done");
        });

        let lines = lines(&ring);
        assert_eq!(lines.len(), 3);

        assert_eq!(lines[0]["message"], "outside");
        assert!(lines[0].get("user").is_none());

        assert_eq!(lines[1]["level"], "INFO");
        assert_eq!(lines[1]["message"], "hello world");
        assert_eq!(lines[1]["user"], "alice");
        assert_eq!(lines[1]["attempt"], 2);
        assert!(lines[1].get("status").is_none());

        assert_eq!(lines[2]["level"], "WARN");
        assert_eq!(lines[2]["status"], 200);
        assert_eq!(lines[2]["user"], "bob");
    }

    #[test]
    fn closed_ring_is_counted() {
        let layer = RingLayer::new(1024).expect("Capacity is > 0");
        let ring = layer.ring().clone();
        let core = layer.core.clone();

        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("kept");
            ring.close();
            tracing::info!("dropped");
        });

        // Close logs through the same subscriber, that event is rejected too.
        assert_eq!(lines(&ring).len(), 1);
        assert_eq!(core.stats().captured(), 1);
        assert!(core.stats().ring_failures() >= 1);
    }
}
