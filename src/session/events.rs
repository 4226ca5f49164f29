//! Graph events emitted to the external transport.
//!
//! Consumers (the visualization UI) receive these over a session-addressed
//! channel with at-least-once delivery. An `edge_created` may arrive before
//! the `node_created` of one of its endpoints; consumers must buffer such
//! edges rather than drop them.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::registry::NodeId;
use crate::storage::CallEvent;

/// An ordered graph update for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GraphEvent {
    /// A session (or replay of one) started.
    SessionStarted {
        /// Root session id.
        session_id: String,
        /// Optional human-readable label.
        label: Option<String>,
    },
    /// A call completed (or failed) and became a graph node.
    NodeCreated {
        /// The recorded call.
        event: CallEvent,
    },
    /// The content matcher detected a dataflow relationship.
    EdgeCreated {
        /// Effective session id both endpoints belong to.
        session_id: String,
        /// Earlier call.
        source: NodeId,
        /// Later call.
        target: NodeId,
    },
    /// A user override changed a node's effective input or output.
    NodeUpdated {
        /// Effective session id of the node.
        session_id: String,
        /// The node affected.
        node_id: NodeId,
        /// Which field changed ("input" or "output").
        field: String,
        /// The new effective value.
        value: serde_json::Value,
    },
    /// Caching is unavailable; the run continues uncached.
    DegradedMode {
        /// Session the degradation was observed in.
        session_id: String,
        /// Human-readable cause.
        message: String,
    },
}

/// Sending half of the transport channel.
pub type EventSender = mpsc::UnboundedSender<GraphEvent>;

/// Receiving half of the transport channel.
pub type EventReceiver = mpsc::UnboundedReceiver<GraphEvent>;

/// Create a transport channel pair
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
