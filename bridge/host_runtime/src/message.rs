use crate::codec;
use crate::error::BusResult;
use crate::value::Value;
use indexmap::IndexMap;
use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};

/// Reserved type tag for replies. An empty tag is accepted as a reply too,
/// which is what older peers send.
pub const REPLY_TYPE: &str = "reply";

/// Correlation id meaning "no reply expected".
pub const NO_REPLY: i64 = 0;

/// A typed, ordered key/value record crossing the boundary.
///
/// Field names are unique; re-setting a key overwrites the value in place
/// (the kind may change) and keeps the key's original position so the
/// encoding stays deterministic. Equality ignores field order.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    type_tag: String,
    correlation_id: i64,
    timestamp: f64,
    fields: IndexMap<String, Value>,
}

impl Message {
    pub fn new(type_tag: impl Into<String>) -> Self {
        Self::with_timestamp(type_tag, now_seconds())
    }

    pub fn with_timestamp(type_tag: impl Into<String>, timestamp: f64) -> Self {
        Self {
            type_tag: type_tag.into(),
            correlation_id: NO_REPLY,
            timestamp,
            fields: IndexMap::new(),
        }
    }

    pub fn reply_to(correlation_id: i64) -> Self {
        let mut reply = Self::new(REPLY_TYPE);
        reply.correlation_id = correlation_id;
        reply
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn correlation_id(&self) -> i64 {
        self.correlation_id
    }

    pub fn set_correlation_id(&mut self, correlation_id: i64) -> &mut Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: i64) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn is_reply(&self) -> bool {
        self.type_tag.is_empty() || self.type_tag == REPLY_TYPE
    }

    pub fn expects_reply(&self) -> bool {
        !self.is_reply() && self.correlation_id != NO_REPLY
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.shift_remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn get_long(&self, key: &str) -> i64 {
        self.get(key).and_then(Value::as_i64).unwrap_or(0)
    }

    /// 32-bit view of [`Message::get_long`].
    ///
    /// # Note
    ///
    /// Out-of-range values wrap rather than saturate (`u32::MAX + 2` reads as
    /// `1`), matching how the embedded side narrows the same field. Use
    /// `get_long` when the value may not fit.
    pub fn get_int(&self, key: &str) -> i32 {
        self.get_long(key) as i32
    }

    pub fn get_double(&self, key: &str) -> f64 {
        self.get(key).and_then(Value::as_f64).unwrap_or(0.0)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn get_string(&self, key: &str) -> String {
        self.get(key)
            .and_then(Value::to_display_string)
            .unwrap_or_default()
    }

    pub fn get_bytes(&self, key: &str) -> Vec<u8> {
        self.get(key)
            .and_then(Value::as_bytes)
            .map(<[u8]>::to_vec)
            .unwrap_or_default()
    }

    pub fn get_message(&self, key: &str) -> Option<&Message> {
        self.get(key).and_then(Value::as_message)
    }

    pub fn get_list(&self, key: &str) -> &[Value] {
        self.get(key).and_then(Value::as_list).unwrap_or(&[])
    }

    pub fn encode(&self) -> BusResult<Vec<u8>> {
        let mut out = Vec::with_capacity(64);
        codec::encode_message(self, &mut out)?;
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> BusResult<Self> {
        codec::decode_message(bytes)
    }

    pub(crate) fn from_parts(
        type_tag: String,
        correlation_id: i64,
        timestamp: f64,
        fields: IndexMap<String, Value>,
    ) -> Self {
        Self {
            type_tag,
            correlation_id,
            timestamp,
            fields,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let fields: serde_json::Map<String, serde_json::Value> = self
            .fields
            .iter()
            .map(|(key, value)| (key.clone(), value.to_json()))
            .collect();

        json!({
            "type": self.type_tag,
            "id": self.correlation_id,
            "timestamp": self.timestamp,
            "fields": fields,
        })
    }
}

fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}
