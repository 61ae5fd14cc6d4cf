//! State namespaces, their defaults and persistence codecs.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{CanvasError, CanvasResult};

/// A named partition of the state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    /// Node records keyed by node id, insertion ordered.
    Nodes,
    /// Edge records keyed by edge id, insertion ordered.
    Edges,
    /// Selected node and edge ids.
    Selection,
    /// Zoom scale and limits.
    Zoom,
    /// Visible area.
    Viewport,
    /// Layout direction and spacing.
    Layout,
    /// Editor toggles.
    Settings,
}

impl Namespace {
    /// Every namespace, in a fixed order.
    pub const ALL: [Self; 7] = [
        Self::Nodes,
        Self::Edges,
        Self::Selection,
        Self::Zoom,
        Self::Viewport,
        Self::Layout,
        Self::Settings,
    ];

    /// Lowercase name used in persistence keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Nodes => "nodes",
            Self::Edges => "edges",
            Self::Selection => "selection",
            Self::Zoom => "zoom",
            Self::Viewport => "viewport",
            Self::Layout => "layout",
            Self::Settings => "settings",
        }
    }

    /// Parse a lowercase name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ns| ns.as_str() == name)
    }

    /// Value the namespace holds after construction or reset.
    #[must_use]
    pub fn default_value(self) -> Value {
        match self {
            Self::Nodes | Self::Edges => json!({}),
            Self::Selection => json!({ "nodes": [], "edges": [] }),
            Self::Zoom => json!({ "scale": 1.0, "min": 0.2, "max": 4.0 }),
            Self::Viewport => json!({ "x": 0, "y": 0, "width": 800, "height": 600 }),
            Self::Layout => json!({ "direction": "LR" }),
            Self::Settings => json!({ "grid": true, "snap": true, "readonly": false }),
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Converts a namespace value to and from its persisted form.
pub trait NamespaceCodec: Send + Sync {
    /// Encode for storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be encoded.
    fn encode(&self, value: &Value) -> CanvasResult<String>;

    /// Decode from storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored form is malformed.
    fn decode(&self, raw: &str) -> CanvasResult<Value>;
}

/// Plain JSON codec. Object key order survives the round trip.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl NamespaceCodec for JsonCodec {
    fn encode(&self, value: &Value) -> CanvasResult<String> {
        Ok(serde_json::to_string(value)?)
    }

    fn decode(&self, raw: &str) -> CanvasResult<Value> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Codec for id-keyed maps stored as `[[id, record], ...]` entry lists.
///
/// Keeps insertion order explicit for backends that sort object keys.
/// Only objects can be encoded.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryListCodec;

impl NamespaceCodec for EntryListCodec {
    fn encode(&self, value: &Value) -> CanvasResult<String> {
        let map = value.as_object().ok_or_else(|| {
            CanvasError::InvalidOperation(format!(
                "entry list codec needs an object, got {}",
                json_kind(value)
            ))
        })?;
        let entries: Vec<(&String, &Value)> = map.iter().collect();
        Ok(serde_json::to_string(&entries)?)
    }

    fn decode(&self, raw: &str) -> CanvasResult<Value> {
        let entries: Vec<(String, Value)> = serde_json::from_str(raw)?;
        Ok(Value::Object(entries.into_iter().collect()))
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trip() {
        for ns in Namespace::ALL {
            assert_eq!(Namespace::parse(ns.as_str()), Some(ns));
        }
        assert_eq!(Namespace::parse("unknown"), None);
    }

    #[test]
    fn test_map_namespaces_default_empty() {
        assert_eq!(Namespace::Nodes.default_value(), json!({}));
        assert_eq!(Namespace::Edges.default_value(), json!({}));
    }

    #[test]
    fn test_entry_list_codec_keeps_order() {
        let mut map = serde_json::Map::new();
        map.insert("z".to_string(), json!(1));
        map.insert("a".to_string(), json!(2));
        let value = Value::Object(map);

        let raw = EntryListCodec.encode(&value).expect("encode");
        assert_eq!(raw, r#"[["z",1],["a",2]]"#);
        let back = EntryListCodec.decode(&raw).expect("decode");
        let keys: Vec<_> = back.as_object().expect("object").keys().cloned().collect();
        assert_eq!(keys, vec!["z", "a"]);
    }

    #[test]
    fn test_entry_list_codec_rejects_non_objects() {
        for value in [json!(["e1", "e2"]), json!(null), json!("e1")] {
            let err = EntryListCodec.encode(&value).expect_err("not an object");
            assert!(matches!(err, CanvasError::InvalidOperation(_)), "{err}");
        }
        assert_eq!(EntryListCodec.encode(&json!({})).expect("empty map"), "[]");
    }

    #[test]
    fn test_json_codec_rejects_garbage() {
        assert!(JsonCodec.decode("{not json").is_err());
    }
}
