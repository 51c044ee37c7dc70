//! Continuation membership and return-barrier queries.
//!
//! Continuations keep chains of activations outside the ordinary
//! machine stack; the frame at the boundary carries the return-barrier
//! trampoline as its return address. That trampoline value is reused on
//! an unrelated error path, so seeing it alone proves nothing; the
//! walker must confirm membership through this interface before
//! substituting the continuation-bottom sender.

use crate::frame::StackFrame;

/// External continuation machinery consulted by the walker.
pub trait ContinuationSupport {
    /// Whether `pc` is the return-barrier trampoline.
    fn is_return_barrier(&self, pc: usize) -> bool;

    /// Whether `frame` belongs to a mounted continuation.
    fn is_frame_in_continuation(&self, frame: &StackFrame) -> bool;

    /// The sender at the bottom of the continuation that `frame` belongs
    /// to, given the machine-stack sender sp already computed for it.
    fn continuation_bottom_sender(&self, frame: &StackFrame, sender_sp: usize) -> StackFrame;
}

/// Trivial implementation for builds without continuations.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoContinuations;

impl ContinuationSupport for NoContinuations {
    #[inline]
    fn is_return_barrier(&self, _pc: usize) -> bool {
        false
    }

    #[inline]
    fn is_frame_in_continuation(&self, _frame: &StackFrame) -> bool {
        false
    }

    fn continuation_bottom_sender(&self, _frame: &StackFrame, _sender_sp: usize) -> StackFrame {
        unreachable!("no continuation support configured")
    }
}
