//! Definition of encoders that turn records into bytes.

use crate::{Field, FieldValue, Record};
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Different types of error that can happen when a record is encoded.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Failed to serialize record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to encode record: {0}")]
    Message(String),
}

/// Serializes records into bytes.
///
/// Clones are independent, fields added to a clone are never visible
/// through the encoder it was cloned from.
pub trait Encoder: Clone + Send + Sync {
    /// Bind a field to every record encoded from now on.
    ///
    /// # Arguments
    ///
    /// * `field` - Field to bind.
    fn add_field(&mut self, field: &Field);

    /// Append encoding of a record to buf.
    ///
    /// # Arguments
    ///
    /// * `record` - Record to encode.
    /// * `fields` - Fields that belong to this record only.
    /// * `buf` - Buffer to append encoded bytes into.
    fn encode(
        &self,
        record: &Record<'_>,
        fields: &[Field],
        buf: &mut Vec<u8>,
    ) -> Result<(), EncodeError>;
}

/// Encodes every record as a single line JSON object.
///
/// ```text
/// {"level":"INFO","message":"hello","target":"app","user":"alice"}
/// ```
///
/// Record fields override bound fields with the same name, and both
/// override the built in keys.
#[derive(Debug, Clone, Default)]
pub struct JsonEncoder {
    timestamps: bool,
    fields: Map<String, Value>,
}

impl JsonEncoder {
    /// Create an encoder without timestamps or bound fields.
    pub fn new() -> Self {
        Self::default()
    }

    /// Include an RFC 3339 `time` key in every record.
    pub fn with_timestamps(mut self) -> Self {
        self.timestamps = true;
        self
    }
}

impl Encoder for JsonEncoder {
    fn add_field(&mut self, field: &Field) {
        self.fields
            .insert(field.key.to_string(), json_value(&field.value));
    }

    fn encode(
        &self,
        record: &Record<'_>,
        fields: &[Field],
        buf: &mut Vec<u8>,
    ) -> Result<(), EncodeError> {
        let mut object = Map::new();

        if self.timestamps {
            let time = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
            object.insert("time".into(), Value::String(time));
        }

        object.insert("level".into(), Value::String(record.level.to_string()));
        object.insert("target".into(), Value::String(record.target.into()));
        object.insert("message".into(), Value::String(record.message.into()));

        for (key, value) in &self.fields {
            object.insert(key.clone(), value.clone());
        }

        for field in fields {
            object.insert(field.key.to_string(), json_value(&field.value));
        }

        serde_json::to_writer(&mut *buf, &Value::Object(object))?;
        buf.push(b'\n');
        Ok(())
    }
}

fn json_value(value: &FieldValue) -> Value {
    match value {
        FieldValue::Bool(value) => Value::Bool(*value),
        FieldValue::I64(value) => Value::Number((*value).into()),
        FieldValue::U64(value) => Value::Number((*value).into()),
        // Not every float has a JSON representation, NaN and infinities become null.
        FieldValue::F64(value) => Number::from_f64(*value).map_or(Value::Null, Value::Number),
        FieldValue::Str(value) => Value::String(value.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Level;

    fn encode_one(encoder: &JsonEncoder, fields: &[Field]) -> Value {
        let record = Record::new(Level::WARN, "app::db", "slow query");

        let mut buf = Vec::new();
        encoder
            .encode(&record, fields, &mut buf)
            .expect("Record should encode");

        assert_eq!(buf.last(), Some(&b'\n'));
        serde_json::from_slice(&buf).expect("Encoded record should be JSON")
    }

    #[test]
    fn encodes_record() {
        let encoder = JsonEncoder::new();
        let fields = [
            Field::new("elapsed_ms", 250u64),
            Field::new("retry", false),
            Field::new("ratio", 0.5),
            Field::new("offset", -3),
            Field::new("table", "users"),
        ];

        let value = encode_one(&encoder, &fields);
        assert_eq!(value["level"], "WARN");
        assert_eq!(value["target"], "app::db");
        assert_eq!(value["message"], "slow query");
        assert_eq!(value["elapsed_ms"], 250);
        assert_eq!(value["retry"], false);
        assert_eq!(value["ratio"], 0.5);
        assert_eq!(value["offset"], -3);
        assert_eq!(value["table"], "users");
        assert!(value.get("time").is_none());
    }

    #[test]
    fn bound_fields_stay_with_clone() {
        let parent = JsonEncoder::new();
        let mut child = parent.clone();
        child.add_field(&Field::new("request_id", 7u64));

        assert_eq!(encode_one(&child, &[])["request_id"], 7);
        assert!(encode_one(&parent, &[]).get("request_id").is_none());

        // Record fields win over bound fields.
        let value = encode_one(&child, &[Field::new("request_id", 8u64)]);
        assert_eq!(value["request_id"], 8);
    }

    #[test]
    fn timestamps() {
        let value = encode_one(&JsonEncoder::new().with_timestamps(), &[]);
        let time = value["time"].as_str().expect("Time should be a string");
        assert!(chrono::DateTime::parse_from_rfc3339(time).is_ok());
    }

    #[test]
    fn non_finite_float_is_null() {
        let value = encode_one(&JsonEncoder::new(), &[Field::new("ratio", f64::NAN)]);
        assert_eq!(value["ratio"], Value::Null);
    }
}
