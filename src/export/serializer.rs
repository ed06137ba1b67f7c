//! Record serialization to JSON Lines
//!
//! Each record becomes one compact JSON object followed by `\n`. Field
//! order follows the BSON document, so output is stable for a given record.
//! BSON-specific types map to their relaxed JSON forms:
//! - ObjectId → 24-char hex string
//! - DateTime → RFC 3339 string
//! - Int64 → number, Decimal128 → string
//! - Binary → base64 string

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use mongodb::bson::{Binary, Bson, DateTime, Document, Timestamp};
use serde_json::{Map, Value as JsonValue, json};

/// Serializer for JSON Lines output
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordSerializer;

impl RecordSerializer {
    pub fn new() -> Self {
        Self
    }

    /// Serialize one record into a newline-terminated JSON line
    pub fn serialize(&self, record: &Document) -> Bytes {
        let value = self.convert_document(record);
        // A serde_json::Value always serializes
        let mut line = serde_json::to_vec(&value).unwrap_or_default();
        line.push(b'\n');
        Bytes::from(line)
    }

    /// Convert a BSON value to its JSON representation
    pub fn convert(&self, value: &Bson) -> JsonValue {
        match value {
            Bson::String(s) => JsonValue::String(s.clone()),
            Bson::Int32(n) => JsonValue::Number((*n).into()),
            Bson::Int64(n) => JsonValue::Number((*n).into()),
            Bson::Double(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Bson::Boolean(b) => JsonValue::Bool(*b),
            Bson::Null | Bson::Undefined => JsonValue::Null,
            Bson::ObjectId(oid) => JsonValue::String(oid.to_hex()),
            Bson::DateTime(dt) => self.convert_datetime(dt),
            Bson::Decimal128(d) => JsonValue::String(d.to_string()),
            Bson::Array(arr) => JsonValue::Array(arr.iter().map(|v| self.convert(v)).collect()),
            Bson::Document(doc) => self.convert_document(doc),
            Bson::Binary(bin) => self.convert_binary(bin),
            Bson::RegularExpression(regex) => {
                JsonValue::String(format!("/{}/{}", regex.pattern, regex.options))
            }
            Bson::Timestamp(ts) => self.convert_timestamp(ts),
            Bson::Symbol(s) => JsonValue::String(s.clone()),
            Bson::JavaScriptCode(code) => JsonValue::String(code.clone()),
            Bson::MinKey => JsonValue::String("MinKey".to_string()),
            Bson::MaxKey => JsonValue::String("MaxKey".to_string()),
            other => JsonValue::String(other.to_string()),
        }
    }

    fn convert_document(&self, doc: &Document) -> JsonValue {
        let map: Map<String, JsonValue> = doc
            .iter()
            .map(|(k, v)| (k.clone(), self.convert(v)))
            .collect();
        JsonValue::Object(map)
    }

    fn convert_datetime(&self, dt: &DateTime) -> JsonValue {
        match dt.try_to_rfc3339_string() {
            Ok(s) => JsonValue::String(s),
            // Outside the RFC 3339 range: keep the raw millis
            Err(_) => JsonValue::Number(dt.timestamp_millis().into()),
        }
    }

    fn convert_binary(&self, bin: &Binary) -> JsonValue {
        JsonValue::String(STANDARD.encode(&bin.bytes))
    }

    fn convert_timestamp(&self, ts: &Timestamp) -> JsonValue {
        json!({ "t": ts.time, "i": ts.increment })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::{doc, oid::ObjectId, spec::BinarySubtype};

    #[test]
    fn test_one_line_per_record() {
        let line = RecordSerializer::new().serialize(&doc! { "name": "Alice", "age": 30 });
        assert_eq!(&line[..], b"{\"name\":\"Alice\",\"age\":30}\n");
    }

    #[test]
    fn test_field_order_is_stable() {
        let serializer = RecordSerializer::new();
        let record = doc! { "z": 1, "a": 2, "m": { "y": 1, "b": 2 } };
        let first = serializer.serialize(&record);
        let second = serializer.serialize(&record);
        assert_eq!(first, second);
        assert_eq!(&first[..], b"{\"z\":1,\"a\":2,\"m\":{\"y\":1,\"b\":2}}\n");
    }

    #[test]
    fn test_opaque_identifier_and_dates() {
        let oid = ObjectId::parse_str("507f1f77bcf86cd799439011").unwrap();
        let record = doc! {
            "_id": oid,
            "at": DateTime::from_millis(0),
            "big": 9_007_199_254_740_993_i64,
        };
        let line = RecordSerializer::new().serialize(&record);
        let value: JsonValue = serde_json::from_slice(&line).unwrap();
        assert_eq!(value["_id"], "507f1f77bcf86cd799439011");
        assert_eq!(value["at"], "1970-01-01T00:00:00Z");
        assert_eq!(value["big"], 9_007_199_254_740_993_i64);
    }

    #[test]
    fn test_binary_and_nan() {
        let record = doc! {
            "blob": Binary { subtype: BinarySubtype::Generic, bytes: vec![1, 2, 3] },
            "nan": f64::NAN,
        };
        let value: JsonValue =
            serde_json::from_slice(&RecordSerializer::new().serialize(&record)).unwrap();
        assert_eq!(value["blob"], "AQID");
        assert!(value["nan"].is_null());
    }

    #[test]
    fn test_strings_with_newlines_stay_on_one_line() {
        let line = RecordSerializer::new().serialize(&doc! { "note": "a\nb" });
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);
    }
}
