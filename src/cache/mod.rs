//! Cache & replay store.
//!
//! Content-addressable store of `(session, input fingerprint)` to cached
//! output plus user overrides, deciding whether an intercepted call must
//! actually execute or can be short-circuited. Entry creation is split into
//! a fast reserve step and a later fill step so that no database work spans
//! the real call, which may run for seconds.
//!
//! If an execution unit is torn down mid-call, the reserved-but-unfilled
//! entry is left in place and treated as a miss on the next attempt; a
//! partially observed external side effect may already have occurred, so
//! nothing is rolled back.

use std::sync::Arc;

use tracing::debug;

use crate::error::StorageResult;
use crate::storage::{CacheEntry, Storage};
use crate::value::fingerprint;

/// Outcome of a cache consultation for one intercepted call.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheDecision {
    /// The real call must execute, with the (possibly overridden) input.
    Execute {
        /// Lineage key of the entry: fingerprint of the original input.
        fingerprint: String,
        /// Input to send to the endpoint; the override when one is set.
        effective_input: serde_json::Value,
    },
    /// Short-circuit: return the stored output, do not call the endpoint.
    Cached {
        /// Lineage key of the entry.
        fingerprint: String,
        /// Input the node is attributed to; the override when one is set.
        effective_input: serde_json::Value,
        /// Effective output (user override wins over the recorded one).
        output: serde_json::Value,
    },
}

impl CacheDecision {
    /// The entry's lineage fingerprint.
    pub fn fingerprint(&self) -> &str {
        match self {
            CacheDecision::Execute { fingerprint, .. } => fingerprint,
            CacheDecision::Cached { fingerprint, .. } => fingerprint,
        }
    }
}

/// The cache state machine over a persistent backing store.
#[derive(Clone)]
pub struct ReplayCache {
    storage: Arc<dyn Storage>,
}

impl ReplayCache {
    /// Create a replay cache over the given backing store
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Consult the cache for an intercepted call and reserve the entry.
    ///
    /// State machine, keyed by the fingerprint of the original input:
    /// - no entry: reserve a placeholder, execute;
    /// - entry without output: execute, reusing the entry's identity;
    /// - entry with output and no overrides: short-circuit;
    /// - `input_override` set: execute with the override unless the stored
    ///   output was already produced by it;
    /// - `output_override` set: short-circuit with the override, always.
    pub async fn decide(
        &self,
        namespace: &str,
        input: &serde_json::Value,
    ) -> StorageResult<CacheDecision> {
        let key = fingerprint(input);
        let entry = self
            .storage
            .reserve_cache_entry(namespace, &key, input)
            .await?;
        let decision = resolve(entry, key);
        debug!(
            namespace = %namespace,
            fingerprint = %decision.fingerprint(),
            cached = matches!(decision, CacheDecision::Cached { .. }),
            "cache decision"
        );
        Ok(decision)
    }

    /// Attach the output of a completed real call.
    ///
    /// Not called for failed calls: a failure is never cached, so the entry
    /// stays a miss.
    pub async fn fill(
        &self,
        namespace: &str,
        key: &str,
        effective_input: &serde_json::Value,
        output: &serde_json::Value,
    ) -> StorageResult<()> {
        let executed = fingerprint(effective_input);
        self.storage
            .fill_cache_output(namespace, key, output, &executed)
            .await
    }

    /// User edit: replace the input used for future executions of this entry.
    /// The entry remains addressable by its original fingerprint lineage.
    pub async fn override_input(
        &self,
        namespace: &str,
        key: &str,
        input: &serde_json::Value,
    ) -> StorageResult<()> {
        self.storage.set_input_override(namespace, key, input).await
    }

    /// User edit: replace the output returned by future lookups. Takes effect
    /// whether the edit happens before or after the original real call.
    pub async fn override_output(
        &self,
        namespace: &str,
        key: &str,
        output: &serde_json::Value,
    ) -> StorageResult<()> {
        self.storage
            .set_output_override(namespace, key, output)
            .await
    }

    /// Direct entry lookup, without reserving.
    pub async fn entry(
        &self,
        namespace: &str,
        key: &str,
    ) -> StorageResult<Option<CacheEntry>> {
        self.storage.get_cache_entry(namespace, key).await
    }
}

fn resolve(entry: CacheEntry, key: String) -> CacheDecision {
    let effective_input = entry.input_override.unwrap_or(entry.input);

    if let Some(output) = entry.output_override {
        return CacheDecision::Cached {
            fingerprint: key,
            effective_input,
            output,
        };
    }

    let executed = fingerprint(&effective_input);

    if let Some(output) = entry.output {
        // A stored output only short-circuits when it was produced by the
        // current effective input; an input edit invalidates it.
        if entry.executed_fingerprint.as_deref() == Some(executed.as_str()) {
            return CacheDecision::Cached {
                fingerprint: key,
                effective_input,
                output,
            };
        }
    }

    CacheDecision::Execute {
        fingerprint: key,
        effective_input,
    }
}
