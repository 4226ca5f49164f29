//! Storage layer for session, call-event, and cache-entry persistence.
//!
//! This module provides SQLite-based storage for instrumented runs: the
//! sessions themselves, the recorded call events (graph nodes), and the
//! content-addressed cache entries that make replay deterministic. Cache
//! entries survive process restarts for the lifetime of the backing store.

mod sqlite;

pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageResult;
use crate::registry::NodeId;

/// An instrumented run that groups recorded calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Root session identifier.
    pub id: String,
    /// Optional human-readable label.
    pub label: Option<String>,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// Optional metadata for the session.
    pub metadata: Option<serde_json::Value>,
}

impl SessionRecord {
    /// Create a new session record with a fresh id
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            label: None,
            created_at: Utc::now(),
            metadata: None,
        }
    }

    /// Set the label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set metadata
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

impl Default for SessionRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// A recorded call to a model/tool endpoint: one node of the session graph.
///
/// Immutable once created; user-driven overrides of input/output live in the
/// corresponding [`CacheEntry`] and produce a logically new effective value
/// without discarding the original recorded one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEvent {
    /// Effective session id of the call.
    pub session_id: String,
    /// Session-local sequence number.
    pub node_id: NodeId,
    /// Model/endpoint identifier.
    pub endpoint: String,
    /// Fingerprint of the input; links the node to its cache lineage.
    pub fingerprint: String,
    /// Structured input as recorded.
    pub input: serde_json::Value,
    /// Structured output, absent for failed calls.
    pub output: Option<serde_json::Value>,
    /// Error marker for failed calls.
    pub error: Option<String>,
    /// Optional display label.
    pub label: Option<String>,
    /// Display color for visualization.
    pub color: Option<String>,
    /// When the call completed.
    pub created_at: DateTime<Utc>,
}

impl CallEvent {
    /// Create a new call event
    pub fn new(
        session_id: impl Into<String>,
        node_id: NodeId,
        endpoint: impl Into<String>,
        fingerprint: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            node_id,
            endpoint: endpoint.into(),
            fingerprint: fingerprint.into(),
            input,
            output: None,
            error: None,
            label: None,
            color: None,
            created_at: Utc::now(),
        }
    }

    /// Set the output
    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }

    /// Mark as failed with an error message
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Set the display label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set the display color
    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }
}

/// A content-addressed cache entry keyed by `(session_id, fingerprint)`.
///
/// Created on first call with a given fingerprint; `output` is populated
/// after a real call completes; the override fields are set by user edits
/// and take precedence over the recorded values without replacing them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Cache namespace (root session id unless subruns are isolated).
    pub session_id: String,
    /// Content hash of the structured input.
    pub fingerprint: String,
    /// Original structured input.
    pub input: serde_json::Value,
    /// User-edited input, used in place of the original for the real call.
    pub input_override: Option<serde_json::Value>,
    /// Output of the most recent real call.
    pub output: Option<serde_json::Value>,
    /// User-edited output; wins over `output` on every lookup.
    pub output_override: Option<serde_json::Value>,
    /// Fingerprint of the effective input that produced `output`. Guards
    /// against a stale output short-circuiting after an input edit.
    pub executed_fingerprint: Option<String>,
    /// When the entry was first reserved.
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    /// The input the next real call should use: override first.
    pub fn effective_input(&self) -> &serde_json::Value {
        self.input_override.as_ref().unwrap_or(&self.input)
    }

    /// The output a lookup should return, if any: override first.
    pub fn effective_output(&self) -> Option<&serde_json::Value> {
        self.output_override.as_ref().or(self.output.as_ref())
    }
}

/// Storage trait for database operations.
///
/// Any backing store qualifies provided it supports atomic upsert keyed by
/// `(session_id, fingerprint)` and arbitrary-length text payloads.
#[async_trait]
pub trait Storage: Send + Sync {
    // Session operations

    /// Create a new session.
    async fn create_session(&self, session: &SessionRecord) -> StorageResult<()>;
    /// Get a session by ID.
    async fn get_session(&self, id: &str) -> StorageResult<Option<SessionRecord>>;

    // Call event operations

    /// Record a completed (or failed) call.
    async fn create_call_event(&self, event: &CallEvent) -> StorageResult<()>;
    /// Get a call event by session and node id.
    async fn get_call_event(
        &self,
        session_id: &str,
        node_id: NodeId,
    ) -> StorageResult<Option<CallEvent>>;
    /// Get all call events in a session, in sequence order.
    async fn get_session_events(&self, session_id: &str) -> StorageResult<Vec<CallEvent>>;

    // Cache entry operations

    /// Reserve an entry: insert a placeholder if none exists, then return the
    /// current entry. The placeholder insert is atomic; a concurrent reserve
    /// for the same key observes a single entry.
    async fn reserve_cache_entry(
        &self,
        session_id: &str,
        fingerprint: &str,
        input: &serde_json::Value,
    ) -> StorageResult<CacheEntry>;
    /// Get a cache entry without reserving.
    async fn get_cache_entry(
        &self,
        session_id: &str,
        fingerprint: &str,
    ) -> StorageResult<Option<CacheEntry>>;
    /// Attach the output of a completed real call to a reserved entry.
    async fn fill_cache_output(
        &self,
        session_id: &str,
        fingerprint: &str,
        output: &serde_json::Value,
        executed_fingerprint: &str,
    ) -> StorageResult<()>;
    /// Set a user input override on an entry.
    async fn set_input_override(
        &self,
        session_id: &str,
        fingerprint: &str,
        input: &serde_json::Value,
    ) -> StorageResult<()>;
    /// Set a user output override on an entry.
    async fn set_output_override(
        &self,
        session_id: &str,
        fingerprint: &str,
        output: &serde_json::Value,
    ) -> StorageResult<()>;
}
