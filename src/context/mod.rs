//! Boundary context propagator.
//!
//! A single execution-unit-scoped slot that carries the currently active
//! origin set across calls into uninstrumented code. Ordinary propagation
//! rules must never read this slot; it exists solely so that an adapter
//! wrapping a third-party call can learn the incoming origins and,
//! symmetrically, attach them to the call's result.
//!
//! Each execution unit (thread or task) owns its own `BoundaryContext`, so
//! concurrent boundary crossings never observe each other's origins; under
//! cooperative scheduling the slot follows the logical task because the task
//! owns the object. The slot is cleared on every exit path of a crossing,
//! including panic and cancellation, via the RAII [`BoundaryGuard`].

use std::collections::HashSet;
use std::ops::{Deref, DerefMut};

use crate::registry::OriginToken;

/// Per-execution-unit carrier for origins crossing a library boundary.
#[derive(Debug, Default)]
pub struct BoundaryContext {
    active: HashSet<OriginToken>,
}

impl BoundaryContext {
    /// Create a context with an empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// The origins of the call currently crossing the boundary.
    ///
    /// For use by call-interception adapters only, at the moment they cross
    /// into or out of uninstrumented code.
    pub fn adapter_origins(&self) -> &HashSet<OriginToken> {
        &self.active
    }

    /// Whether the slot is empty. Holds outside of any boundary crossing.
    pub fn is_clear(&self) -> bool {
        self.active.is_empty()
    }

    /// Install origins for the duration of one boundary crossing.
    ///
    /// The returned guard restores the previous origin set when dropped
    /// (empty outside any crossing), so origins never leak across unrelated
    /// calls on the same execution unit even when the crossing unwinds, and
    /// nested crossings see their enclosing scope again on return.
    pub fn scope(&mut self, origins: HashSet<OriginToken>) -> BoundaryGuard<'_> {
        let previous = std::mem::replace(&mut self.active, origins);
        BoundaryGuard {
            ctx: self,
            previous,
        }
    }
}

/// RAII scope for one boundary crossing. Restores the enclosing origin set
/// on drop.
pub struct BoundaryGuard<'a> {
    ctx: &'a mut BoundaryContext,
    previous: HashSet<OriginToken>,
}

impl Deref for BoundaryGuard<'_> {
    type Target = BoundaryContext;

    fn deref(&self) -> &Self::Target {
        self.ctx
    }
}

impl DerefMut for BoundaryGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.ctx
    }
}

impl Drop for BoundaryGuard<'_> {
    fn drop(&mut self) {
        self.ctx.active = std::mem::take(&mut self.previous);
    }
}
