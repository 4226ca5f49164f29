//! Tagged value model for instrumented data.
//!
//! Instrumented programs shuttle structured payloads (prompts, completions,
//! tool arguments) between endpoint calls. Instead of run-time type
//! inspection, values are a small closed set of tagged variants with an
//! explicit fragment extraction rule per variant. Containers hold shared
//! children so a sub-part of a call's output keeps its own identity.

use std::collections::BTreeMap;
use std::sync::RwLock;

use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Stable, unique handle for an in-memory tracked value.
///
/// Issued by the [`ProvenanceRegistry`](crate::registry::ProvenanceRegistry)
/// at import time. A token is reused only after its owning registry entry is
/// explicitly evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u64);

impl std::fmt::Display for ValueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A value participating in provenance tracking.
#[derive(Debug)]
pub struct TrackedValue {
    id: ValueId,
    data: ValueData,
}

/// The closed set of shapes a tracked value can take.
#[derive(Debug)]
pub enum ValueData {
    /// Literal text. The only variant that yields content fragments.
    Text(String),
    /// Ordered sequence of tracked children.
    Seq(RwLock<Vec<Arc<TrackedValue>>>),
    /// Keyed mapping of tracked children.
    Map(RwLock<BTreeMap<String, Arc<TrackedValue>>>),
    /// Anything else (numbers, booleans, null). Yields no fragments.
    Opaque(serde_json::Value),
}

impl TrackedValue {
    /// Assemble a tracked value from an already-issued id and data.
    pub(crate) fn from_parts(id: ValueId, data: ValueData) -> Self {
        Self { id, data }
    }

    /// The identity token of this value.
    pub fn id(&self) -> ValueId {
        self.id
    }

    /// Member access for mapping values. `None` for other variants or a
    /// missing key.
    pub fn member(&self, name: &str) -> Option<Arc<TrackedValue>> {
        match &self.data {
            ValueData::Map(map) => map.read().ok()?.get(name).cloned(),
            _ => None,
        }
    }

    /// Index access for sequence values. `None` for other variants or an
    /// out-of-bounds index.
    pub fn index(&self, idx: usize) -> Option<Arc<TrackedValue>> {
        match &self.data {
            ValueData::Seq(seq) => seq.read().ok()?.get(idx).cloned(),
            _ => None,
        }
    }

    /// Store a child under a key. Returns false when the value is not a
    /// mapping. The stored item keeps its own identity and origins.
    pub fn set_member(&self, name: impl Into<String>, value: Arc<TrackedValue>) -> bool {
        match &self.data {
            ValueData::Map(map) => match map.write() {
                Ok(mut guard) => {
                    guard.insert(name.into(), value);
                    true
                }
                Err(_) => false,
            },
            _ => false,
        }
    }

    /// Replace the child at an index, or append when `idx` equals the
    /// current length. Returns false otherwise.
    pub fn set_index(&self, idx: usize, value: Arc<TrackedValue>) -> bool {
        match &self.data {
            ValueData::Seq(seq) => match seq.write() {
                Ok(mut guard) => {
                    if idx < guard.len() {
                        guard[idx] = value;
                        true
                    } else if idx == guard.len() {
                        guard.push(value);
                        true
                    } else {
                        false
                    }
                }
                Err(_) => false,
            },
            _ => false,
        }
    }

    /// Append a child to a sequence value. Returns false for other variants.
    pub fn push(&self, value: Arc<TrackedValue>) -> bool {
        match &self.data {
            ValueData::Seq(seq) => match seq.write() {
                Ok(mut guard) => {
                    guard.push(value);
                    true
                }
                Err(_) => false,
            },
            _ => false,
        }
    }

    /// Render back to plain JSON.
    pub fn to_json(&self) -> serde_json::Value {
        match &self.data {
            ValueData::Text(s) => serde_json::Value::String(s.clone()),
            ValueData::Seq(seq) => {
                let items = seq
                    .read()
                    .map(|guard| guard.iter().map(|v| v.to_json()).collect())
                    .unwrap_or_default();
                serde_json::Value::Array(items)
            }
            ValueData::Map(map) => {
                let mut object = serde_json::Map::new();
                if let Ok(guard) = map.read() {
                    for (key, value) in guard.iter() {
                        object.insert(key.clone(), value.to_json());
                    }
                }
                serde_json::Value::Object(object)
            }
            ValueData::Opaque(v) => v.clone(),
        }
    }

    /// Collect the literal text fragments of this value, skipping fragments
    /// shorter than `min_len` characters.
    ///
    /// Text leaves are the only fragment source; opaque payloads degrade to
    /// zero candidates.
    pub fn collect_fragments(&self, min_len: usize, out: &mut Vec<String>) {
        match &self.data {
            ValueData::Text(s) => {
                if s.chars().count() >= min_len {
                    out.push(s.clone());
                }
            }
            ValueData::Seq(seq) => {
                if let Ok(guard) = seq.read() {
                    for child in guard.iter() {
                        child.collect_fragments(min_len, out);
                    }
                }
            }
            ValueData::Map(map) => {
                if let Ok(guard) = map.read() {
                    for child in guard.values() {
                        child.collect_fragments(min_len, out);
                    }
                }
            }
            ValueData::Opaque(_) => {}
        }
    }
}

/// Extract the candidate text fragments of a plain JSON payload, using the
/// same rule as [`TrackedValue::collect_fragments`]: string leaves at or
/// above `min_len` characters, in document order.
pub fn json_fragments(value: &serde_json::Value, min_len: usize, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) => {
            if s.chars().count() >= min_len {
                out.push(s.clone());
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                json_fragments(item, min_len, out);
            }
        }
        serde_json::Value::Object(object) => {
            for item in object.values() {
                json_fragments(item, min_len, out);
            }
        }
        _ => {}
    }
}

/// Canonical rendering of a JSON payload: object keys sorted recursively,
/// compact separators. Two structurally equal payloads render identically.
pub fn canonical_json(value: &serde_json::Value) -> String {
    fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(canonicalize).collect())
            }
            serde_json::Value::Object(object) => {
                let sorted: BTreeMap<&String, serde_json::Value> = object
                    .iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect();
                let mut out = serde_json::Map::new();
                for (k, v) in sorted {
                    out.insert(k.clone(), v);
                }
                serde_json::Value::Object(out)
            }
            other => other.clone(),
        }
    }

    serde_json::to_string(&canonicalize(value)).unwrap_or_default()
}

/// Content hash of a structured call input, used as the cache key.
pub fn fingerprint(input: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(input).as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
