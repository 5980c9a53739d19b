use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Content type the producer endpoint expects.
pub const RECORDS_CONTENT_TYPE: &str = "application/vnd.dxl.intel.records.v1+json";

/// Topic routing attached to every record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoutingData {
    pub topic: String,
    #[serde(default)]
    pub sharding_key: String,
}

/// Record envelope: opaque headers plus a base64 payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordMessage {
    #[serde(default)]
    pub headers: HashMap<String, Value>,
    pub payload: String,
}

/// A record as returned by the records endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsumedRecord {
    pub routing_data: RoutingData,
    #[serde(default)]
    pub partition: i32,
    #[serde(default)]
    pub offset: i64,
    pub message: RecordMessage,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ConsumeResponse {
    #[serde(default)]
    pub(crate) records: Vec<ConsumedRecord>,
}

/// A consumed record with its payload decoded, as handed to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedPayload {
    pub topic: String,
    pub sharding_key: String,
    pub partition: i32,
    pub offset: i64,
    pub headers: HashMap<String, Value>,
    pub payload: Value,
}

impl ConsumedRecord {
    pub(crate) fn into_payload(self) -> Result<ConsumedPayload> {
        Ok(ConsumedPayload {
            topic: self.routing_data.topic,
            sharding_key: self.routing_data.sharding_key,
            partition: self.partition,
            offset: self.offset,
            headers: self.message.headers,
            payload: decode_payload(&self.message.payload)?,
        })
    }
}

/// A record to publish via the produce endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRecord {
    pub routing_data: RoutingData,
    pub message: RecordMessage,
}

impl ProduceRecord {
    /// Build a produce record with `value` serialized to JSON and base64
    /// encoded, the shape the consuming side decodes back.
    ///
    /// # Errors
    /// Fails with [`Error::Permanent`] if `value` cannot be serialized.
    pub fn new<T: Serialize + ?Sized>(
        topic: impl Into<String>,
        sharding_key: impl Into<String>,
        value: &T,
    ) -> Result<Self> {
        Ok(Self {
            routing_data: RoutingData {
                topic: topic.into(),
                sharding_key: sharding_key.into(),
            },
            message: RecordMessage {
                headers: HashMap::new(),
                payload: encode_payload(value)?,
            },
        })
    }
}

/// The produce request envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProduceRecords {
    pub records: Vec<ProduceRecord>,
}

impl From<Vec<ProduceRecord>> for ProduceRecords {
    fn from(records: Vec<ProduceRecord>) -> Self {
        Self { records }
    }
}

/// A delivered-but-unacknowledged offset, queued for the next commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitEntry {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct CommitRequest<'a> {
    pub(crate) offsets: &'a [CommitEntry],
}

/// Serialize `value` to JSON and base64 encode it.
///
/// # Errors
/// Fails with [`Error::Permanent`] if `value` cannot be serialized.
pub fn encode_payload<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let json = serde_json::to_vec(value)
        .map_err(|e| Error::permanent(format!("failed to serialize payload: {e}")))?;
    Ok(BASE64.encode(json))
}

/// Decode a base64 payload into structured data.
///
/// # Errors
/// Fails with [`Error::Permanent`] if the payload is not base64 or the
/// decoded bytes are not JSON.
pub fn decode_payload(payload: &str) -> Result<Value> {
    let bytes = BASE64
        .decode(payload)
        .map_err(|e| Error::permanent(format!("record payload is not valid base64: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::permanent(format!("record payload is not valid JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn payload_round_trip_is_structurally_equal() {
        let value = json!({"message": "Hello", "count": 3, "nested": {"ok": true}});
        let encoded = encode_payload(&value).unwrap();
        assert_eq!(decode_payload(&encoded).unwrap(), value);
    }

    #[test]
    fn decode_rejects_bad_base64_and_bad_json() {
        assert!(decode_payload("not-base64!").unwrap_err().is_permanent());
        let not_json = BASE64.encode(b"{truncated");
        assert!(decode_payload(&not_json).unwrap_err().is_permanent());
    }

    #[test]
    fn consumed_record_deserializes_wire_shape() {
        let body = json!({
            "records": [{
                "routingData": {"topic": "t", "shardingKey": "k"},
                "partition": 0,
                "offset": 42,
                "message": {"headers": {}, "payload": encode_payload(&json!({"m": 1})).unwrap()}
            }]
        });
        let response: ConsumeResponse = serde_json::from_value(body).unwrap();
        let payload = response.records[0].clone().into_payload().unwrap();
        assert_eq!(payload.topic, "t");
        assert_eq!(payload.sharding_key, "k");
        assert_eq!(payload.offset, 42);
        assert_eq!(payload.payload, json!({"m": 1}));
    }

    #[test]
    fn produce_record_serializes_camel_case() {
        let record = ProduceRecord::new("topic1", "", &json!({"message": "Hello"})).unwrap();
        let envelope = ProduceRecords::from(vec![record]);
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            wire["records"][0]["routingData"],
            json!({"topic": "topic1", "shardingKey": ""})
        );
        let payload = wire["records"][0]["message"]["payload"].as_str().unwrap();
        assert_eq!(decode_payload(payload).unwrap(), json!({"message": "Hello"}));
    }
}
