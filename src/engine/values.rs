//! Variable snapshot values.
//!
//! The kernel serializes the namespace with the bounds below; `bounded()`
//! re-applies them on the host so values built here obey the same limits
//! and already-bounded values pass through unchanged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const MAX_DEPTH: usize = 3;
pub const MAX_ITEMS: usize = 1000;
pub const MAX_STRING: usize = 10_000;
pub const STRING_MARKER: &str = "... (truncated)";
pub const DICT_MARKER_KEY: &str = "__truncated";

/// One serialized variable.
///
/// `Opaque` stands for anything without a JSON shape and travels as
/// `{"__repr__": ..., "__class__": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Opaque { repr: String, class: String },
}

impl Value {
    /// Apply depth, item and length bounds.
    pub fn bounded(self) -> Value {
        self.bounded_at(0)
    }

    fn bounded_at(self, depth: usize) -> Value {
        match self {
            Value::String(s) => Value::String(clip(s)),
            Value::Float(f) if !f.is_finite() => Value::Opaque {
                repr: float_repr(f),
                class: "builtins.float".to_string(),
            },
            Value::Opaque { repr, class } => Value::Opaque {
                repr: clip(repr),
                class,
            },
            Value::List(_) | Value::Map(_) if depth >= MAX_DEPTH => {
                let class = if matches!(self, Value::List(_)) {
                    "builtins.list"
                } else {
                    "builtins.dict"
                };
                let repr = serde_json::Value::from(self).to_string();
                Value::Opaque {
                    repr: clip(repr),
                    class: class.to_string(),
                }
            }
            Value::List(items) => {
                let total = items.len();
                let mut out: Vec<Value> = items
                    .into_iter()
                    .take(MAX_ITEMS)
                    .map(|v| v.bounded_at(depth + 1))
                    .collect();
                if total > MAX_ITEMS {
                    out.truncate(MAX_ITEMS - 1);
                    out.push(Value::String(format!("... (list truncated, {} items total)", total)));
                }
                Value::List(out)
            }
            Value::Map(entries) => {
                let total = entries.len();
                let limit = if total > MAX_ITEMS { MAX_ITEMS - 1 } else { MAX_ITEMS };
                let mut out: BTreeMap<String, Value> = entries
                    .into_iter()
                    .take(limit)
                    .map(|(k, v)| (k, v.bounded_at(depth + 1)))
                    .collect();
                if total > MAX_ITEMS {
                    out.insert(
                        DICT_MARKER_KEY.to_string(),
                        Value::String(format!("Dict truncated, {} items total", total)),
                    );
                }
                Value::Map(out)
            }
            other => other,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Clip to `MAX_STRING` characters, marker included.
fn clip(text: String) -> String {
    if text.chars().count() <= MAX_STRING {
        return text;
    }
    let keep = MAX_STRING - STRING_MARKER.chars().count();
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(STRING_MARKER);
    out
}

fn float_repr(f: f64) -> String {
    if f.is_nan() {
        "nan".to_string()
    } else if f > 0.0 {
        "inf".to_string()
    } else {
        "-inf".to_string()
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match (n.as_i64(), n.as_u64()) {
                (Some(i), _) => Value::Int(i),
                // Past i64 an integer keeps its digits instead of turning into a float.
                (None, Some(_)) => Value::Opaque {
                    repr: n.to_string(),
                    class: "builtins.int".to_string(),
                },
                (None, None) => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(mut map) => {
                let is_opaque = map.len() == 2
                    && map.get("__repr__").map_or(false, |v| v.is_string())
                    && map.get("__class__").map_or(false, |v| v.is_string());
                if is_opaque {
                    let repr = take_string(&mut map, "__repr__");
                    let class = take_string(&mut map, "__class__");
                    return Value::Opaque { repr, class };
                }
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

fn take_string(map: &mut serde_json::Map<String, serde_json::Value>, key: &str) -> String {
    match map.remove(key) {
        Some(serde_json::Value::String(s)) => s,
        _ => String::new(),
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => b.into(),
            Value::Int(i) => i.into(),
            // Non-finite floats have no JSON form.
            Value::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or_else(|| {
                    serde_json::json!({"__repr__": float_repr(f), "__class__": "builtins.float"})
                }),
            Value::String(s) => s.into(),
            Value::List(items) => {
                serde_json::Value::Array(items.into_iter().map(serde_json::Value::from).collect())
            }
            Value::Map(entries) => serde_json::Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, serde_json::Value::from(v)))
                    .collect(),
            ),
            Value::Opaque { repr, class } => serde_json::json!({"__repr__": repr, "__class__": class}),
        }
    }
}

/// Parse a kernel snapshot into bounded values.
pub fn snapshot_from_json(variables: serde_json::Map<String, serde_json::Value>) -> BTreeMap<String, Value> {
    variables
        .into_iter()
        .filter(|(name, _)| !(name.starts_with("__") && name.ends_with("__")))
        .map(|(name, value)| (name, Value::from(value).bounded()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_opaque_recognized() {
        let value = Value::from(json!({"__repr__": "<Foo>", "__class__": "mod.Foo"}));
        assert_eq!(
            value,
            Value::Opaque {
                repr: "<Foo>".into(),
                class: "mod.Foo".into()
            }
        );
        // A third key makes it an ordinary dict.
        let value = Value::from(json!({"__repr__": "x", "__class__": "y", "z": 1}));
        assert!(matches!(value, Value::Map(_)));
    }

    #[test]
    fn test_long_string_clipped_with_marker() {
        let value = Value::String("a".repeat(MAX_STRING + 50)).bounded();
        let s = value.as_str().unwrap();
        assert_eq!(s.chars().count(), MAX_STRING);
        assert!(s.ends_with(STRING_MARKER));
    }

    #[test]
    fn test_list_truncation() {
        let value = Value::List((0..1500).map(Value::Int).collect()).bounded();
        let Value::List(items) = value else { panic!("expected list") };
        assert_eq!(items.len(), MAX_ITEMS);
        assert_eq!(items[998], Value::Int(998));
        assert_eq!(items[999].as_str(), Some("... (list truncated, 1500 items total)"));
    }

    #[test]
    fn test_dict_truncation() {
        let entries = (0..1200).map(|i| (format!("k{:05}", i), Value::Int(i))).collect();
        let Value::Map(out) = Value::Map(entries).bounded() else { panic!("expected map") };
        assert_eq!(out.len(), MAX_ITEMS);
        assert!(out.contains_key(DICT_MARKER_KEY));
    }

    #[test]
    fn test_depth_bound() {
        let nested = Value::from(json!([[[[1, 2]]]]));
        let Value::List(l1) = nested.bounded() else { panic!() };
        let Value::List(l2) = &l1[0] else { panic!() };
        let Value::List(l3) = &l2[0] else { panic!() };
        assert!(matches!(&l3[0], Value::Opaque { class, .. } if class == "builtins.list"));
    }

    #[test]
    fn test_bounded_is_idempotent() {
        let raw = Value::from(json!({
            "s": "x".repeat(20_000),
            "l": (0..2000).collect::<Vec<_>>(),
            "deep": [[[[["bottom"]]]]],
            "f": 1.5,
        }));
        let once = raw.bounded();
        let twice = once.clone().bounded();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_non_finite_float_becomes_opaque() {
        assert!(matches!(Value::Float(f64::NAN).bounded(), Value::Opaque { .. }));
        assert_eq!(Value::Float(2.5).bounded(), Value::Float(2.5));
    }

    #[test]
    fn test_integers_beyond_i64_keep_their_digits() {
        assert_eq!(Value::from(json!(i64::MIN)), Value::Int(i64::MIN));
        assert_eq!(
            Value::from(json!(u64::MAX)),
            Value::Opaque {
                repr: "18446744073709551615".into(),
                class: "builtins.int".into()
            }
        );

        // 2**80 as the kernel sends it.
        let reply: serde_json::Value =
            serde_json::from_str(r#"{"__repr__": "1208925819614629174706176", "__class__": "builtins.int"}"#).unwrap();
        let value = Value::from(reply).bounded();
        assert!(matches!(&value, Value::Opaque { repr, .. } if repr == "1208925819614629174706176"));
        assert_eq!(
            serde_json::to_string(&value).unwrap(),
            r#"{"__class__":"builtins.int","__repr__":"1208925819614629174706176"}"#
        );
    }

    #[test]
    fn test_snapshot_drops_dunders() {
        let vars = json!({"x": 2, "__name__": "__main__", "_private": 1});
        let serde_json::Value::Object(map) = vars else { panic!() };
        let snapshot = snapshot_from_json(map);
        assert_eq!(snapshot["x"].as_i64(), Some(2));
        assert!(!snapshot.contains_key("__name__"));
        assert!(snapshot.contains_key("_private"));
    }

    #[test]
    fn test_serializes_back_to_kernel_shape() {
        let value = Value::Opaque {
            repr: "<object>".into(),
            class: "builtins.object".into(),
        };
        let text = serde_json::to_string(&value).unwrap();
        assert_eq!(text, r#"{"__class__":"builtins.object","__repr__":"<object>"}"#);
    }
}
