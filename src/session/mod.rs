//! Session coordinator.
//!
//! Ties the registry, content matcher, and replay cache together per logical
//! run, manages nested subrun scoping, and emits graph node/edge events to
//! the external transport. Each execution unit carries its own
//! [`SessionContext`]; the coordinator itself is shared.

mod events;

pub use events::{event_channel, EventReceiver, EventSender, GraphEvent};

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{info, warn};

use crate::cache::{CacheDecision, ReplayCache};
use crate::config::Config;
use crate::error::{AppResult, EndpointError, StorageError};
use crate::matcher::ContentMatcher;
use crate::registry::{NodeId, OriginToken, ProvenanceRegistry};
use crate::storage::{CallEvent, SessionRecord, Storage};
use crate::value::{fingerprint, json_fragments, TrackedValue};

const NODE_COLORS: [&str; 6] = [
    "#4c9aff", "#f97316", "#22c55e", "#a855f7", "#ef4444", "#eab308",
];

/// Per-execution-unit session context: the root session id plus the stack of
/// currently entered subruns.
///
/// Clone (or [`fork`](SessionContext::fork)) a context to hand it to a
/// concurrently running execution unit; each copy evolves its own stack.
#[derive(Debug, Clone)]
pub struct SessionContext {
    root: String,
    stack: Vec<String>,
}

impl SessionContext {
    fn new(root: String) -> Self {
        Self {
            root,
            stack: Vec::new(),
        }
    }

    /// The root session id.
    pub fn root_id(&self) -> &str {
        &self.root
    }

    /// The effective session id: the root id with the subrun path appended.
    pub fn effective_id(&self) -> String {
        if self.stack.is_empty() {
            self.root.clone()
        } else {
            format!("{}:{}", self.root, self.stack.join(":"))
        }
    }

    /// Current subrun nesting depth.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Copy this context for another execution unit. The copy starts with
    /// the same stack and evolves independently.
    pub fn fork(&self) -> SessionContext {
        self.clone()
    }

    /// Enter a named subrun scope.
    ///
    /// The returned guard restores the previous context on every exit path:
    /// normal return, panic, or cancellation of the owning task.
    pub fn enter(&mut self, name: impl Into<String>) -> SubrunScope<'_> {
        self.stack.push(name.into());
        SubrunScope { ctx: self }
    }
}

/// RAII scope for one subrun. Pops the subrun from the stack on drop.
pub struct SubrunScope<'a> {
    ctx: &'a mut SessionContext,
}

impl Deref for SubrunScope<'_> {
    type Target = SessionContext;

    fn deref(&self) -> &Self::Target {
        self.ctx
    }
}

impl DerefMut for SubrunScope<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.ctx
    }
}

impl Drop for SubrunScope<'_> {
    fn drop(&mut self) {
        self.ctx.stack.pop();
    }
}

/// A recorded call, as returned to the interception adapter.
#[derive(Debug, Clone)]
pub struct CallRecorded {
    /// Sequence number assigned to the new node.
    pub node_id: NodeId,
    /// Source nodes of the edges detected into this call, ascending.
    pub sources: Vec<NodeId>,
    /// The call's output as a tracked value, registered with this node as
    /// its origin, for the instrumented program to continue with.
    pub output: Arc<TrackedValue>,
}

/// Per-effective-session in-memory state: node sequence, fragment registry,
/// and the derived edge set.
struct SessionState {
    next_node: u64,
    matcher: ContentMatcher,
    edges: HashSet<(NodeId, NodeId)>,
}

impl SessionState {
    fn new(config: &Config) -> Self {
        Self {
            next_node: 1,
            matcher: ContentMatcher::new(&config.matcher),
            edges: HashSet::new(),
        }
    }
}

/// Coordinates provenance, matching, caching, and event emission for
/// instrumented runs.
///
/// All dependencies are explicitly constructed and owned; nothing here is
/// process-global, so coordinators can be created and torn down in isolation
/// (and in tests).
pub struct SessionCoordinator {
    config: Config,
    registry: Arc<ProvenanceRegistry>,
    storage: Arc<dyn Storage>,
    cache: ReplayCache,
    events: EventSender,
    states: Mutex<HashMap<String, SessionState>>,
    degraded_reported: AtomicBool,
}

impl SessionCoordinator {
    /// Create a coordinator over the given backing store and transport
    pub fn new(config: Config, storage: Arc<dyn Storage>, events: EventSender) -> Self {
        Self {
            config,
            registry: Arc::new(ProvenanceRegistry::new()),
            cache: ReplayCache::new(Arc::clone(&storage)),
            storage,
            events,
            states: Mutex::new(HashMap::new()),
            degraded_reported: AtomicBool::new(false),
        }
    }

    /// The shared provenance registry.
    pub fn registry(&self) -> Arc<ProvenanceRegistry> {
        Arc::clone(&self.registry)
    }

    /// A propagation API handle over this coordinator's registry.
    pub fn propagator(&self) -> crate::propagate::Propagator {
        crate::propagate::Propagator::new(Arc::clone(&self.registry))
    }

    /// Start a new session for an instrumented run.
    pub async fn start_session(&self, label: Option<&str>) -> SessionContext {
        let mut record = SessionRecord::new();
        if let Some(label) = label {
            record = record.with_label(label);
        }

        if let Err(e) = self.storage.create_session(&record).await {
            self.note_degraded(&record.id, &e);
        }

        info!(session = %record.id, label = ?record.label, "session started");
        let _ = self.events.send(GraphEvent::SessionStarted {
            session_id: record.id.clone(),
            label: record.label.clone(),
        });

        SessionContext::new(record.id)
    }

    /// Re-execute an existing session against its populated cache.
    ///
    /// Clears the session's in-memory node/edge state (the persistent cache
    /// is untouched) so node sequence numbers start over. Given the same
    /// call sequence and cache contents, the replay reproduces the identical
    /// sequence of node creations and edges.
    pub async fn begin_replay(&self, root_id: &str) -> SessionContext {
        {
            let mut states = self.lock_states();
            let prefix = format!("{}:", root_id);
            states.retain(|key, _| key != root_id && !key.starts_with(&prefix));
        }

        info!(session = %root_id, "session replay started");
        let _ = self.events.send(GraphEvent::SessionStarted {
            session_id: root_id.to_string(),
            label: None,
        });

        SessionContext::new(root_id.to_string())
    }

    /// Consult the cache for an intercepted call.
    ///
    /// Storage unavailability degrades to uncached live execution: the call
    /// proceeds as a miss and a degraded-mode warning goes to the transport.
    pub async fn begin_call(
        &self,
        ctx: &SessionContext,
        input: &serde_json::Value,
    ) -> CacheDecision {
        let namespace = self.cache_namespace(ctx);
        match self.cache.decide(&namespace, input).await {
            Ok(decision) => decision,
            Err(e) => {
                self.note_degraded(&ctx.effective_id(), &e);
                CacheDecision::Execute {
                    fingerprint: fingerprint(input),
                    effective_input: input.clone(),
                }
            }
        }
    }

    /// Drive one intercepted call end to end: cache decision, real call if
    /// needed, node/edge recording.
    ///
    /// `call` performs the real endpoint call; it runs without any registry
    /// or cache lock held and is skipped entirely on a cache hit. A failed
    /// call is surfaced unchanged, never cached, and (by configuration)
    /// still recorded as an error-marker node.
    pub async fn intercept_call<F, Fut>(
        &self,
        ctx: &SessionContext,
        endpoint: &str,
        label: Option<&str>,
        input: serde_json::Value,
        call: F,
    ) -> Result<CallRecorded, EndpointError>
    where
        F: FnOnce(serde_json::Value) -> Fut,
        Fut: Future<Output = Result<serde_json::Value, EndpointError>>,
    {
        match self.begin_call(ctx, &input).await {
            CacheDecision::Cached {
                fingerprint: key,
                effective_input,
                output,
            } => {
                // Short-circuit: no real call. The node and its edges are
                // recorded from the entry's effective input, so an input
                // override keeps its effect on every subsequent hit.
                Ok(self
                    .record_completion(ctx, endpoint, label, &key, effective_input, output)
                    .await)
            }
            CacheDecision::Execute {
                fingerprint: key,
                effective_input,
            } => match call(effective_input.clone()).await {
                Ok(output) => {
                    let namespace = self.cache_namespace(ctx);
                    if let Err(e) = self
                        .cache
                        .fill(&namespace, &key, &effective_input, &output)
                        .await
                    {
                        self.note_degraded(&ctx.effective_id(), &e);
                    }
                    Ok(self
                        .record_completion(ctx, endpoint, label, &key, effective_input, output)
                        .await)
                }
                Err(err) => {
                    self.record_failure(ctx, endpoint, label, &key, &effective_input, &err)
                        .await;
                    Err(err)
                }
            },
        }
    }

    /// Record a completed call: assign the next node id, detect edges from
    /// prior outputs, persist the event, and emit node/edge events.
    ///
    /// Returns the node id, the detected edge sources, and the output as a
    /// tracked value carrying this node as its origin.
    pub async fn record_completion(
        &self,
        ctx: &SessionContext,
        endpoint: &str,
        label: Option<&str>,
        key: &str,
        input: serde_json::Value,
        output: serde_json::Value,
    ) -> CallRecorded {
        let effective = ctx.effective_id();

        let (node_id, sources) = {
            let mut states = self.lock_states();
            let state = states
                .entry(effective.clone())
                .or_insert_with(|| SessionState::new(&self.config));

            let node_id = NodeId(state.next_node);
            state.next_node += 1;

            let min_len = state.matcher.min_fragment_len();
            let mut input_fragments = Vec::new();
            json_fragments(&input, min_len, &mut input_fragments);
            let sources = state.matcher.detect(node_id, &input_fragments);
            for source in &sources {
                state.edges.insert((*source, node_id));
            }

            let mut output_fragments = Vec::new();
            json_fragments(&output, min_len, &mut output_fragments);
            state.matcher.observe_output(node_id, output_fragments);

            (node_id, sources)
        };

        let mut event = CallEvent::new(effective.clone(), node_id, endpoint, key, input)
            .with_output(output.clone())
            .with_color(color_for(endpoint));
        if let Some(label) = label {
            event = event.with_label(label);
        }

        if let Err(e) = self.storage.create_call_event(&event).await {
            self.note_degraded(&effective, &e);
        }

        info!(
            session = %effective,
            node = %node_id,
            endpoint = %endpoint,
            edges = sources.len(),
            "call recorded"
        );

        let _ = self.events.send(GraphEvent::NodeCreated { event });
        for source in &sources {
            let _ = self.events.send(GraphEvent::EdgeCreated {
                session_id: effective.clone(),
                source: *source,
                target: node_id,
            });
        }

        let value = self.registry.import(&output);
        self.registry
            .register(&value, [OriginToken::new(effective, node_id)]);

        CallRecorded {
            node_id,
            sources,
            output: value,
        }
    }

    /// Record a failed call as an error-marker node, when configured to.
    ///
    /// The failure itself is never cached; the caller surfaces the native
    /// error to the instrumented program unchanged.
    pub async fn record_failure(
        &self,
        ctx: &SessionContext,
        endpoint: &str,
        label: Option<&str>,
        key: &str,
        input: &serde_json::Value,
        error: &EndpointError,
    ) -> Option<NodeId> {
        if !self.config.replay.record_failures {
            return None;
        }

        let effective = ctx.effective_id();
        let (node_id, sources) = {
            let mut states = self.lock_states();
            let state = states
                .entry(effective.clone())
                .or_insert_with(|| SessionState::new(&self.config));

            let node_id = NodeId(state.next_node);
            state.next_node += 1;

            let mut input_fragments = Vec::new();
            json_fragments(input, state.matcher.min_fragment_len(), &mut input_fragments);
            let sources = state.matcher.detect(node_id, &input_fragments);
            for source in &sources {
                state.edges.insert((*source, node_id));
            }
            // No output to observe: failed calls contribute no fragments.

            (node_id, sources)
        };

        let mut event = CallEvent::new(effective.clone(), node_id, endpoint, key, input.clone())
            .with_error(error.to_string())
            .with_color(color_for(endpoint));
        if let Some(label) = label {
            event = event.with_label(label);
        }

        if let Err(e) = self.storage.create_call_event(&event).await {
            self.note_degraded(&effective, &e);
        }

        warn!(
            session = %effective,
            node = %node_id,
            endpoint = %endpoint,
            error = %error,
            "call failed"
        );

        let _ = self.events.send(GraphEvent::NodeCreated { event });
        for source in &sources {
            let _ = self.events.send(GraphEvent::EdgeCreated {
                session_id: effective.clone(),
                source: *source,
                target: node_id,
            });
        }

        Some(node_id)
    }

    /// User edit: override a node's output.
    ///
    /// The edit lands in the node's cache lineage, so subsequent lookups and
    /// replays return it without re-invoking the endpoint; the original
    /// recorded output is retained underneath.
    pub async fn override_output(
        &self,
        effective_session: &str,
        node_id: NodeId,
        value: &serde_json::Value,
    ) -> AppResult<()> {
        let event = self
            .storage
            .get_call_event(effective_session, node_id)
            .await?
            .ok_or_else(|| StorageError::EventNotFound {
                session_id: effective_session.to_string(),
                node_id: node_id.0,
            })?;

        let namespace = self.namespace_of(effective_session);
        self.cache
            .override_output(&namespace, &event.fingerprint, value)
            .await?;

        let _ = self.events.send(GraphEvent::NodeUpdated {
            session_id: effective_session.to_string(),
            node_id,
            field: "output".to_string(),
            value: value.clone(),
        });
        Ok(())
    }

    /// User edit: override a node's input for subsequent replays.
    pub async fn override_input(
        &self,
        effective_session: &str,
        node_id: NodeId,
        value: &serde_json::Value,
    ) -> AppResult<()> {
        let event = self
            .storage
            .get_call_event(effective_session, node_id)
            .await?
            .ok_or_else(|| StorageError::EventNotFound {
                session_id: effective_session.to_string(),
                node_id: node_id.0,
            })?;

        let namespace = self.namespace_of(effective_session);
        self.cache
            .override_input(&namespace, &event.fingerprint, value)
            .await?;

        let _ = self.events.send(GraphEvent::NodeUpdated {
            session_id: effective_session.to_string(),
            node_id,
            field: "input".to_string(),
            value: value.clone(),
        });
        Ok(())
    }

    /// The derived edge set of an effective session, sorted.
    pub fn session_edges(&self, effective_session: &str) -> Vec<(NodeId, NodeId)> {
        let states = self.lock_states();
        let mut edges: Vec<_> = states
            .get(effective_session)
            .map(|state| state.edges.iter().copied().collect())
            .unwrap_or_default();
        edges.sort();
        edges
    }

    fn cache_namespace(&self, ctx: &SessionContext) -> String {
        if self.config.replay.share_subrun_cache {
            ctx.root_id().to_string()
        } else {
            ctx.effective_id()
        }
    }

    fn namespace_of(&self, effective_session: &str) -> String {
        if self.config.replay.share_subrun_cache {
            effective_session
                .split(':')
                .next()
                .unwrap_or(effective_session)
                .to_string()
        } else {
            effective_session.to_string()
        }
    }

    fn lock_states(&self) -> MutexGuard<'_, HashMap<String, SessionState>> {
        match self.states.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn note_degraded(&self, session: &str, error: &StorageError) {
        warn!(session = %session, error = %error, "storage unavailable, running uncached");
        if !self.degraded_reported.swap(true, Ordering::Relaxed) {
            let _ = self.events.send(GraphEvent::DegradedMode {
                session_id: session.to_string(),
                message: error.to_string(),
            });
        }
    }
}

fn color_for(endpoint: &str) -> &'static str {
    let sum: usize = endpoint.bytes().map(|b| b as usize).sum();
    NODE_COLORS[sum % NODE_COLORS.len()]
}
