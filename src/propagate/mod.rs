//! Propagation rules invoked by instrumented user code.
//!
//! The code-transformation tool rewrites user source so that assignments,
//! member/index reads, storing operations, and call sites go through the
//! [`Propagator`] instead of the corresponding plain operations. The rules
//! are pure over the registry and the boundary context; none of them can
//! fail, and a value without provenance simply flows through untouched.

use std::collections::HashSet;
use std::sync::Arc;

use crate::context::BoundaryContext;
use crate::registry::{OriginToken, ProvenanceRegistry};
use crate::value::TrackedValue;

/// Classification of a call site, supplied by the code-transformation tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// A call into user code. Invoked directly: the callee's own
    /// instrumented statements handle propagation internally.
    Instrumented,
    /// A call into uninstrumented code. Origins are carried across the
    /// boundary context and attached to the result.
    Foreign,
}

/// Propagation API over a shared provenance registry.
#[derive(Clone)]
pub struct Propagator {
    registry: Arc<ProvenanceRegistry>,
}

impl Propagator {
    /// Create a propagator over the given registry
    pub fn new(registry: Arc<ProvenanceRegistry>) -> Self {
        Self { registry }
    }

    /// The underlying registry.
    pub fn registry(&self) -> &Arc<ProvenanceRegistry> {
        &self.registry
    }

    /// Rebinding: preserve a value's origin set across assignment.
    ///
    /// Idempotent; assigning twice yields the same origin set as once.
    pub fn assign(&self, value: &Arc<TrackedValue>) -> Arc<TrackedValue> {
        let origins = self.registry.lookup(value);
        if origins.is_empty() {
            Arc::clone(value)
        } else {
            self.registry.register(value, origins)
        }
    }

    /// Member access: `obj.name`.
    ///
    /// If the result already carries its own origins those win; otherwise it
    /// inherits `obj`'s origins. A sub-part of a call's output traces to that
    /// call unless it was independently provenanced.
    pub fn get_member(&self, obj: &Arc<TrackedValue>, name: &str) -> Option<Arc<TrackedValue>> {
        let result = obj.member(name)?;
        Some(self.inherit(obj, result))
    }

    /// Index access: `obj[idx]`. Same inheritance rule as [`get_member`].
    ///
    /// [`get_member`]: Propagator::get_member
    pub fn get_index(&self, obj: &Arc<TrackedValue>, idx: usize) -> Option<Arc<TrackedValue>> {
        let result = obj.index(idx)?;
        Some(self.inherit(obj, result))
    }

    /// Storing operation: `obj.name = value`. Direct pass-through so the
    /// stored item retains its individually-registered origins instead of
    /// collapsing to the container's.
    pub fn set_member(
        &self,
        obj: &Arc<TrackedValue>,
        name: impl Into<String>,
        value: Arc<TrackedValue>,
    ) -> bool {
        obj.set_member(name, value)
    }

    /// Storing operation: `obj[idx] = value`. Direct pass-through.
    pub fn set_index(&self, obj: &Arc<TrackedValue>, idx: usize, value: Arc<TrackedValue>) -> bool {
        obj.set_index(idx, value)
    }

    /// Storing operation: append to a sequence. Direct pass-through.
    pub fn push(&self, obj: &Arc<TrackedValue>, value: Arc<TrackedValue>) -> bool {
        obj.push(value)
    }

    /// Call-site boundary crossing.
    ///
    /// For [`CallKind::Instrumented`] the callee is invoked directly. For
    /// [`CallKind::Foreign`] the union of the receiver's and every argument's
    /// origins is installed in the boundary context for the duration of the
    /// call, and the result inherits that union unless it carries its own
    /// origins. The context slot is cleared on every exit path.
    pub fn call_boundary<F>(
        &self,
        ctx: &mut BoundaryContext,
        kind: CallKind,
        receiver: Option<&Arc<TrackedValue>>,
        args: &[Arc<TrackedValue>],
        callee: F,
    ) -> Arc<TrackedValue>
    where
        F: FnOnce(&mut BoundaryContext) -> Arc<TrackedValue>,
    {
        match kind {
            CallKind::Instrumented => callee(ctx),
            CallKind::Foreign => {
                let union = self.argument_origins(receiver, args);
                let result = {
                    let mut guard = ctx.scope(union.clone());
                    callee(&mut guard)
                };
                self.attach_result_origins(&result, union);
                result
            }
        }
    }

    /// Fallible variant of [`call_boundary`]. The context slot is cleared
    /// whether the callee succeeds or fails, and errors are surfaced
    /// unchanged.
    ///
    /// [`call_boundary`]: Propagator::call_boundary
    pub fn try_call_boundary<F, E>(
        &self,
        ctx: &mut BoundaryContext,
        kind: CallKind,
        receiver: Option<&Arc<TrackedValue>>,
        args: &[Arc<TrackedValue>],
        callee: F,
    ) -> Result<Arc<TrackedValue>, E>
    where
        F: FnOnce(&mut BoundaryContext) -> Result<Arc<TrackedValue>, E>,
    {
        match kind {
            CallKind::Instrumented => callee(ctx),
            CallKind::Foreign => {
                let union = self.argument_origins(receiver, args);
                let result = {
                    let mut guard = ctx.scope(union.clone());
                    callee(&mut guard)
                }?;
                self.attach_result_origins(&result, union);
                Ok(result)
            }
        }
    }

    fn inherit(&self, obj: &Arc<TrackedValue>, result: Arc<TrackedValue>) -> Arc<TrackedValue> {
        if !self.registry.lookup(&result).is_empty() {
            return result;
        }
        let parent_origins = self.registry.lookup(obj);
        if parent_origins.is_empty() {
            result
        } else {
            self.registry.register(&result, parent_origins)
        }
    }

    fn argument_origins(
        &self,
        receiver: Option<&Arc<TrackedValue>>,
        args: &[Arc<TrackedValue>],
    ) -> HashSet<OriginToken> {
        let mut union = HashSet::new();
        if let Some(receiver) = receiver {
            union.extend(self.registry.lookup(receiver));
        }
        for arg in args {
            union.extend(self.registry.lookup(arg));
        }
        union
    }

    fn attach_result_origins(&self, result: &Arc<TrackedValue>, union: HashSet<OriginToken>) {
        // Independent result provenance wins over the argument union.
        if union.is_empty() || !self.registry.lookup(result).is_empty() {
            return;
        }
        self.registry.register(result, union);
    }
}
