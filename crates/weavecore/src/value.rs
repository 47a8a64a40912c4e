use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;

/// Dynamic value type for node inputs/outputs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Binary(BinaryPayload),
    Json(serde_json::Value),
    Array(Vec<Value>),
    Object(HashMap<String, Value>),
}

/// Kind of data carried along an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    Text,
    Image,
    Audio,
    Response,
    #[default]
    Any,
}

/// Binary payload (image, audio) carried over the same edges as text.
///
/// Bytes are kept raw in memory; the serialized form is the
/// `{kind, value, media_type}` envelope with a base64 `value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryPayload {
    pub kind: DataKind,
    #[serde(rename = "value", with = "base64_bytes")]
    pub data: Vec<u8>,
    pub media_type: String,
}

impl BinaryPayload {
    pub fn new(kind: DataKind, data: Vec<u8>, media_type: impl Into<String>) -> Self {
        Self {
            kind,
            data,
            media_type: media_type.into(),
        }
    }

    /// Build from a base64 string as delivered by the backend.
    pub fn from_base64(
        kind: DataKind,
        encoded: &str,
        media_type: impl Into<String>,
    ) -> Result<Self, base64::DecodeError> {
        let data = BASE64_STANDARD.decode(encoded.trim())?;
        Ok(Self::new(kind, data, media_type))
    }

    pub fn to_base64(&self) -> String {
        BASE64_STANDARD.encode(&self.data)
    }

    /// Envelope as a plain JSON object.
    pub fn to_envelope(&self) -> serde_json::Value {
        json!({
            "kind": self.kind,
            "value": self.to_base64(),
            "media_type": self.media_type,
        })
    }

    /// Recognise a plain JSON envelope produced by [`BinaryPayload::to_envelope`].
    pub fn from_envelope(json: &serde_json::Value) -> Option<Self> {
        let obj = json.as_object()?;
        if obj.len() != 3 {
            return None;
        }
        let kind: DataKind = serde_json::from_value(obj.get("kind")?.clone()).ok()?;
        if !matches!(kind, DataKind::Image | DataKind::Audio) {
            return None;
        }
        let value = obj.get("value")?.as_str()?;
        let media_type = obj.get("media_type")?.as_str()?;
        Self::from_base64(kind, value, media_type).ok()
    }
}

mod base64_bytes {
    use super::BASE64_STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Json(j) => Some(j),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&BinaryPayload> {
        match self {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Render the value as prompt text.
    pub fn to_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            Value::Json(serde_json::Value::String(s)) => s.clone(),
            other => other.to_plain_json().to_string(),
        }
    }

    /// Flat JSON without the enum tagging; binaries become envelopes.
    pub fn to_plain_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => json!(b),
            Value::Number(n) => json!(n),
            Value::String(s) => json!(s),
            Value::Binary(b) => b.to_envelope(),
            Value::Json(j) => j.clone(),
            Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(Value::to_plain_json).collect())
            }
            Value::Object(obj) => {
                let map: serde_json::Map<String, serde_json::Value> = obj
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_plain_json()))
                    .collect();
                serde_json::Value::Object(map)
            }
        }
    }

    /// Inverse of [`Value::to_plain_json`]: envelopes come back as `Binary`.
    pub fn from_plain_json(json: serde_json::Value) -> Value {
        if let Some(binary) = BinaryPayload::from_envelope(&json) {
            return Value::Binary(binary);
        }
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or_default()),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(arr) => {
                Value::Array(arr.into_iter().map(Value::from_plain_json).collect())
            }
            serde_json::Value::Object(obj) => Value::Object(
                obj.into_iter()
                    .map(|(k, v)| (k, Value::from_plain_json(v)))
                    .collect(),
            ),
        }
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<serde_json::Value> for Value {
    fn from(j: serde_json::Value) -> Self {
        Value::Json(j)
    }
}

impl From<BinaryPayload> for Value {
    fn from(b: BinaryPayload) -> Self {
        Value::Binary(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_envelope_survives_serialization() {
        let bytes: Vec<u8> = (0u8..=255).collect();
        let value = Value::Binary(BinaryPayload::new(DataKind::Image, bytes.clone(), "image/png"));

        let json = serde_json::to_string(&value).unwrap();
        assert!(json.contains("\"media_type\":\"image/png\""));
        assert!(!json.contains("[0,1,2"), "bytes must be base64 encoded on the wire");

        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back.as_binary().map(|b| b.data.clone()), Some(bytes));
    }

    #[test]
    fn plain_json_recognises_envelopes() {
        let payload = BinaryPayload::new(DataKind::Audio, vec![1, 2, 3], "audio/wav");
        let plain = Value::Binary(payload.clone()).to_plain_json();
        assert_eq!(plain["kind"], "audio");
        assert_eq!(Value::from_plain_json(plain), Value::Binary(payload));
    }

    #[test]
    fn ordinary_objects_are_not_mistaken_for_envelopes() {
        let plain = json!({"kind": "text", "value": "aGk=", "media_type": "text/plain"});
        assert!(matches!(Value::from_plain_json(plain), Value::Object(_)));
    }

    #[test]
    fn to_text_unwraps_strings() {
        assert_eq!(Value::from("hello").to_text(), "hello");
        assert_eq!(Value::Number(2.5).to_text(), "2.5");
        assert_eq!(Value::Null.to_text(), "");
    }
}
