//! Content matcher / edge detector.
//!
//! Maintains a per-session registry of previously observed output fragments
//! and infers dataflow edges by verbatim containment: if a fragment of an
//! earlier call's output reappears as a substring of a later call's input,
//! an edge is emitted from the earlier call to the later one.
//!
//! This is deliberately conservative and heuristic. It is a best-effort,
//! zero-instrumentation approximation of dataflow, not a static-analysis
//! grade provenance guarantee: it only sees text that reappears verbatim,
//! and fragments below the configured minimum length are ignored entirely to
//! avoid trivial token matches producing spurious edges.

use std::collections::BTreeSet;

use tracing::debug;

use crate::config::MatcherConfig;
use crate::registry::NodeId;

/// A retained output fragment and the node that produced it.
#[derive(Debug, Clone)]
struct OwnedFragment {
    text: String,
    source: NodeId,
}

/// Per-session fragment registry and containment matcher.
#[derive(Debug)]
pub struct ContentMatcher {
    min_fragment_len: usize,
    outputs: Vec<OwnedFragment>,
}

impl ContentMatcher {
    /// Create a matcher with the given tunables
    pub fn new(config: &MatcherConfig) -> Self {
        Self {
            min_fragment_len: config.min_fragment_len,
            outputs: Vec::new(),
        }
    }

    /// The active minimum fragment length.
    pub fn min_fragment_len(&self) -> usize {
        self.min_fragment_len
    }

    /// Detect which prior calls' outputs are embedded in a new call's input.
    ///
    /// `input_fragments` must be extracted with the same rule as output
    /// fragments (see [`crate::value::json_fragments`]). Every prior source
    /// whose fragment appears verbatim in any input fragment yields an edge;
    /// a single input fragment matching fragments from multiple distinct
    /// sources emits them all. Sources are returned in ascending node order
    /// and never include `node` itself.
    pub fn detect(&self, node: NodeId, input_fragments: &[String]) -> Vec<NodeId> {
        let mut sources = BTreeSet::new();
        for fragment in input_fragments {
            if fragment.chars().count() < self.min_fragment_len {
                continue;
            }
            for owned in &self.outputs {
                if owned.source != node && fragment.contains(&owned.text) {
                    sources.insert(owned.source);
                }
            }
        }
        if !sources.is_empty() {
            debug!(
                node = %node,
                sources = sources.len(),
                "content matcher detected incoming edges"
            );
        }
        sources.into_iter().collect()
    }

    /// Record a completed call's output fragments for future matches.
    ///
    /// Fragments below the minimum length are dropped here, so they can
    /// never appear as an edge source.
    pub fn observe_output(&mut self, node: NodeId, output_fragments: Vec<String>) {
        for text in output_fragments {
            if text.chars().count() < self.min_fragment_len {
                continue;
            }
            self.outputs.push(OwnedFragment { text, source: node });
        }
    }

    /// Number of retained output fragments.
    pub fn fragment_count(&self) -> usize {
        self.outputs.len()
    }
}
