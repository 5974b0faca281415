//! Structural query keys
//!
//! A [`QueryKey`] is an ordered tuple of JSON-structured parts. Two keys are
//! equal when their parts match positionally; object parts compare
//! structurally with null-valued properties ignored, so `{"a":1}` and
//! `{"a":1,"b":null}` identify the same query. The hash is precomputed at
//! construction and is consistent with equality.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Composite identifier for a query.
#[derive(Clone)]
pub struct QueryKey {
    parts: Vec<Value>,
    hash: u64,
}

impl Serialize for QueryKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.parts.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for QueryKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let parts = Vec::<Value>::deserialize(deserializer)?;
        Ok(Self::new(parts))
    }
}

impl QueryKey {
    /// Create a key from an ordered sequence of parts.
    pub fn new<I, V>(parts: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let parts: Vec<Value> = parts.into_iter().map(Into::into).collect();
        let hash = hash_parts(&parts);
        Self { parts, hash }
    }

    pub fn parts(&self) -> &[Value] {
        &self.parts
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Append a part, rehashing.
    pub fn with_part(mut self, part: impl Into<Value>) -> Self {
        self.parts.push(part.into());
        self.hash = hash_parts(&self.parts);
        self
    }

    /// True iff this key is at least as long as `prefix` and the leading
    /// parts match under key equality.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.parts.len() >= prefix.parts.len()
            && self
                .parts
                .iter()
                .zip(prefix.parts.iter())
                .all(|(a, b)| value_eq(a, b))
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.parts.len() == other.parts.len()
            && self
                .parts
                .iter()
                .zip(other.parts.iter())
                .all(|(a, b)| value_eq(a, b))
    }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Array(self.parts.clone()))
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryKey({self})")
    }
}

impl From<&str> for QueryKey {
    fn from(part: &str) -> Self {
        Self::new([part])
    }
}

impl From<String> for QueryKey {
    fn from(part: String) -> Self {
        Self::new([part])
    }
}

impl From<Vec<Value>> for QueryKey {
    fn from(parts: Vec<Value>) -> Self {
        Self::new(parts)
    }
}

impl<V: Into<Value>, const N: usize> From<[V; N]> for QueryKey {
    fn from(parts: [V; N]) -> Self {
        Self::new(parts)
    }
}

/// Part equality: positional for arrays, structural for objects with
/// null-valued properties ignored, plain equality for leaves.
fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys.iter()).all(|(x, y)| value_eq(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            // Map iteration is key-sorted, so the filtered streams line up.
            let live_x = xs.iter().filter(|(_, v)| !v.is_null());
            let mut live_y = ys.iter().filter(|(_, v)| !v.is_null());
            for (kx, vx) in live_x {
                match live_y.next() {
                    Some((ky, vy)) if kx == ky && value_eq(vx, vy) => {}
                    _ => return false,
                }
            }
            live_y.next().is_none()
        }
        (a, b) => a == b,
    }
}

fn hash_parts(parts: &[Value]) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write_usize(parts.len());
    for part in parts {
        hash_value(part, &mut hasher);
    }
    hasher.finish()
}

/// Hashes a part consistently with [`value_eq`]: null object properties are
/// skipped and object keys are visited in sorted order.
fn hash_value<H: Hasher>(value: &Value, state: &mut H) {
    match value {
        Value::Null => state.write_u8(0),
        Value::Bool(b) => {
            state.write_u8(1);
            b.hash(state);
        }
        Value::Number(n) => {
            state.write_u8(2);
            n.to_string().hash(state);
        }
        Value::String(s) => {
            state.write_u8(3);
            s.hash(state);
        }
        Value::Array(items) => {
            state.write_u8(4);
            state.write_usize(items.len());
            for item in items {
                hash_value(item, state);
            }
        }
        Value::Object(map) => {
            state.write_u8(5);
            for (k, v) in map.iter().filter(|(_, v)| !v.is_null()) {
                k.hash(state);
                hash_value(v, state);
            }
        }
    }
}
