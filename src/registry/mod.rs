//! Identity registry for tracked values.
//!
//! A concurrency-safe mapping from a value's identity token to a retained
//! reference plus the set of call events that contributed to it. The registry
//! retains an `Arc` to each registered value so a token cannot be reused by
//! an unrelated live value; tokens are recycled only after an explicit
//! [`clear`](ProvenanceRegistry::clear).
//!
//! Absence is not an error: a value with no entry has no provenance, which is
//! the steady state for the majority of program values. Evicting an entry is
//! a deliberate, documented precision loss.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::value::{TrackedValue, ValueData, ValueId};

/// Session-local sequence number of a recorded call event.
///
/// Edges always point from a lower to a higher node id within a session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct NodeId(pub u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Identifies the call event a value originated from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OriginToken {
    /// Effective session id of the producing call.
    pub session_id: String,
    /// Sequence number of the producing call within that session.
    pub node_id: NodeId,
}

impl OriginToken {
    /// Create a new origin token
    pub fn new(session_id: impl Into<String>, node_id: NodeId) -> Self {
        Self {
            session_id: session_id.into(),
            node_id,
        }
    }
}

struct ProvenanceRecord {
    /// Retained so the identity token stays pinned while registered.
    #[allow(dead_code)]
    value: Arc<TrackedValue>,
    origins: HashSet<OriginToken>,
}

/// Concurrency-safe provenance registry.
///
/// Reads share the lock; insert/merge operations serialize. No operation in
/// this registry blocks on I/O, and none of its methods return errors:
/// lookup of an absent or evicted entry degrades to "no provenance".
pub struct ProvenanceRegistry {
    next_id: AtomicU64,
    entries: RwLock<HashMap<ValueId, ProvenanceRecord>>,
}

impl ProvenanceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn issue_id(&self) -> ValueId {
        ValueId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Import a plain JSON payload into the tracked value model, issuing a
    /// fresh identity token for the value and each of its children.
    ///
    /// Importing alone does not register provenance.
    pub fn import(&self, value: &serde_json::Value) -> Arc<TrackedValue> {
        let data = match value {
            serde_json::Value::String(s) => ValueData::Text(s.clone()),
            serde_json::Value::Array(items) => ValueData::Seq(RwLock::new(
                items.iter().map(|item| self.import(item)).collect(),
            )),
            serde_json::Value::Object(object) => ValueData::Map(RwLock::new(
                object
                    .iter()
                    .map(|(k, v)| (k.clone(), self.import(v)))
                    .collect(),
            )),
            other => ValueData::Opaque(other.clone()),
        };
        Arc::new(TrackedValue::from_parts(self.issue_id(), data))
    }

    /// Wrap a plain string as a tracked text value.
    pub fn text(&self, s: impl Into<String>) -> Arc<TrackedValue> {
        Arc::new(TrackedValue::from_parts(
            self.issue_id(),
            ValueData::Text(s.into()),
        ))
    }

    /// Store or merge origins for a value and return the value unchanged.
    ///
    /// Registering an empty origin set for an unknown value is a no-op, so
    /// unprovenanced values never take up registry space.
    pub fn register(
        &self,
        value: &Arc<TrackedValue>,
        origins: impl IntoIterator<Item = OriginToken>,
    ) -> Arc<TrackedValue> {
        let origins: HashSet<OriginToken> = origins.into_iter().collect();
        if let Ok(mut entries) = self.entries.write() {
            match entries.get_mut(&value.id()) {
                Some(record) => {
                    record.origins.extend(origins);
                }
                None => {
                    if !origins.is_empty() {
                        entries.insert(
                            value.id(),
                            ProvenanceRecord {
                                value: Arc::clone(value),
                                origins,
                            },
                        );
                    }
                }
            }
        }
        Arc::clone(value)
    }

    /// The origin set of a value, or empty if it was never registered.
    pub fn lookup(&self, value: &TrackedValue) -> HashSet<OriginToken> {
        self.lookup_id(value.id())
    }

    /// The origin set behind an identity token, or empty if absent.
    pub fn lookup_id(&self, id: ValueId) -> HashSet<OriginToken> {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(&id).map(|record| record.origins.clone()))
            .unwrap_or_default()
    }

    /// Evict an entry, releasing the retained reference and allowing the
    /// token to be reused. Call only when the value's owning scope has ended.
    pub fn clear(&self, id: ValueId) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(&id);
        }
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    /// Whether the registry holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ProvenanceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
