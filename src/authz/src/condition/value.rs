//! Attribute values seen by the condition evaluator
//!
//! An explicit tagged variant instead of raw JSON, so every backend and every
//! attribute source shares one comparison semantics.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value as JsonValue;

/// Attribute bag keyed by attribute name
pub type Attributes = HashMap<String, AttrValue>;

/// A single attribute value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum AttrValue {
    /// Missing attribute; every comparison against it is false
    #[default]
    Undefined,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<AttrValue>),
    Map(BTreeMap<String, AttrValue>),
}

pub(crate) static UNDEFINED: AttrValue = AttrValue::Undefined;

impl AttrValue {
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    /// Follow a dotted path into nested maps; anything missing is `Undefined`.
    pub fn lookup(&self, segments: &[String]) -> &AttrValue {
        let mut current = self;
        for segment in segments {
            current = match current {
                Self::Map(map) => map.get(segment).unwrap_or(&UNDEFINED),
                _ => return &UNDEFINED,
            };
        }
        current
    }

    /// Structural equality; `Undefined` equals nothing, including itself.
    pub fn loosely_equals(&self, other: &AttrValue) -> bool {
        match (self, other) {
            (Self::Undefined, _) | (_, Self::Undefined) => false,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::List(a), Self::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loosely_equals(y))
            }
            (Self::Map(a), Self::Map(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).is_some_and(|w| v.loosely_equals(w)))
            }
            _ => false,
        }
    }

    /// Ordering for number/number and string/string pairs only.
    pub fn partial_order(&self, other: &AttrValue) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a.partial_cmp(b),
            (Self::String(a), Self::String(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Whether `needle` is a member of this value.
    ///
    /// Lists test element equality, maps test key presence for string
    /// needles, strings test substrings.
    pub fn has_member(&self, needle: &AttrValue) -> bool {
        if needle.is_undefined() {
            return false;
        }
        match (self, needle) {
            (Self::List(items), _) => items.iter().any(|item| item.loosely_equals(needle)),
            (Self::Map(map), Self::String(key)) => map.contains_key(key),
            (Self::String(haystack), Self::String(fragment)) => haystack.contains(fragment.as_str()),
            _ => false,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Undefined => JsonValue::Null,
            Self::Bool(b) => JsonValue::Bool(*b),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Self::String(s) => JsonValue::String(s.clone()),
            Self::List(items) => JsonValue::Array(items.iter().map(AttrValue::to_json).collect()),
            Self::Map(map) => JsonValue::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

impl From<&JsonValue> for AttrValue {
    fn from(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Undefined,
            JsonValue::Bool(b) => Self::Bool(*b),
            JsonValue::Number(n) => n.as_f64().map(Self::Number).unwrap_or(Self::Undefined),
            JsonValue::String(s) => Self::String(s.clone()),
            JsonValue::Array(items) => Self::List(items.iter().map(AttrValue::from).collect()),
            JsonValue::Object(obj) => Self::Map(
                obj.iter().map(|(k, v)| (k.clone(), AttrValue::from(v))).collect(),
            ),
        }
    }
}

impl From<JsonValue> for AttrValue {
    fn from(value: JsonValue) -> Self {
        Self::from(&value)
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<i32> for AttrValue {
    fn from(value: i32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl<T: Into<AttrValue>> From<Vec<T>> for AttrValue {
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

/// Convert a JSON object into an attribute bag; non-objects yield an empty bag.
pub fn attributes_from_json(value: &JsonValue) -> Attributes {
    match value {
        JsonValue::Object(obj) => obj
            .iter()
            .map(|(k, v)| (k.clone(), AttrValue::from(v)))
            .collect(),
        _ => Attributes::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json() {
        let value = AttrValue::from(json!({"a": [1, "x", true], "b": null}));
        let AttrValue::Map(map) = &value else {
            panic!("expected map");
        };
        assert_eq!(
            map["a"],
            AttrValue::List(vec![
                AttrValue::Number(1.0),
                AttrValue::String("x".into()),
                AttrValue::Bool(true)
            ])
        );
        assert!(map["b"].is_undefined());
    }

    #[test]
    fn test_lookup() {
        let value = AttrValue::from(json!({"org": {"tier": "gold"}}));
        let path = vec!["org".to_string(), "tier".to_string()];
        assert_eq!(value.lookup(&path), &AttrValue::String("gold".into()));

        let missing = vec!["org".to_string(), "region".to_string()];
        assert!(value.lookup(&missing).is_undefined());

        let through_scalar = vec!["org".to_string(), "tier".to_string(), "x".to_string()];
        assert!(value.lookup(&through_scalar).is_undefined());
    }

    #[test]
    fn test_undefined_never_equal() {
        assert!(!AttrValue::Undefined.loosely_equals(&AttrValue::Undefined));
        assert!(!AttrValue::Undefined.loosely_equals(&AttrValue::from("x")));
        assert!(AttrValue::from(3).loosely_equals(&AttrValue::from(3.0)));
        assert!(!AttrValue::from("3").loosely_equals(&AttrValue::from(3)));
    }

    #[test]
    fn test_membership() {
        let tags = AttrValue::from(vec!["public", "beta"]);
        assert!(tags.has_member(&AttrValue::from("beta")));
        assert!(!tags.has_member(&AttrValue::from("internal")));
        assert!(!tags.has_member(&AttrValue::Undefined));

        let map = AttrValue::from(json!({"admin": true}));
        assert!(map.has_member(&AttrValue::from("admin")));

        assert!(AttrValue::from("engineering").has_member(&AttrValue::from("gine")));
        assert!(!AttrValue::from(5).has_member(&AttrValue::from(5)));
    }

    #[test]
    fn test_ordering() {
        use std::cmp::Ordering;
        assert_eq!(
            AttrValue::from(1).partial_order(&AttrValue::from(2)),
            Some(Ordering::Less)
        );
        assert_eq!(
            AttrValue::from("b").partial_order(&AttrValue::from("a")),
            Some(Ordering::Greater)
        );
        assert_eq!(AttrValue::from(1).partial_order(&AttrValue::from("1")), None);
    }
}
