//! The walk context: everything one stack walk needs about its target.
//!
//! A context bundles the target thread's stack bounds, memory view and
//! transition anchor with the process-wide code registry and the
//! pluggable continuation / metadata / pointer-auth strategies. It is a
//! plain value threaded through every walk entry point, so walks are
//! reentrant and carry no hidden cross-call state.

use beryl_code::CodeRegistry;

use crate::anchor::FrameAnchor;
use crate::cont::ContinuationSupport;
use crate::layout::DEFAULT_INTERP_FRAME_SLACK;
use crate::meta::MethodOracle;
use crate::pauth::PointerAuth;
use crate::stack::{StackBounds, StackMemory};

/// Borrowed view of a walk's collaborators.
pub struct WalkContext<'a> {
    /// Target thread's stack bounds.
    pub bounds: &'a dyn StackBounds,
    /// Checked access to the target stack's words.
    pub mem: &'a dyn StackMemory,
    /// Target thread's managed-to-native transition anchor.
    pub anchor: &'a FrameAnchor,
    /// Process-wide pc -> code-unit directory.
    pub code: &'a CodeRegistry,
    /// Continuation machinery.
    pub cont: &'a dyn ContinuationSupport,
    /// Method metadata predicates.
    pub methods: &'a dyn MethodOracle,
    /// Return-address signing strategy.
    pub auth: &'a dyn PointerAuth,
    /// Additive slack allowed in the interpreter frame-size plausibility
    /// bound, in bytes. Empirical tuning, not a derived constant.
    pub interp_frame_slack: usize,
}

impl<'a> WalkContext<'a> {
    /// Create a context with the default interpreter frame slack.
    pub fn new(
        bounds: &'a dyn StackBounds,
        mem: &'a dyn StackMemory,
        anchor: &'a FrameAnchor,
        code: &'a CodeRegistry,
        cont: &'a dyn ContinuationSupport,
        methods: &'a dyn MethodOracle,
        auth: &'a dyn PointerAuth,
    ) -> Self {
        Self {
            bounds,
            mem,
            anchor,
            code,
            cont,
            methods,
            auth,
            interp_frame_slack: DEFAULT_INTERP_FRAME_SLACK,
        }
    }

    /// Override the interpreter frame-size slack.
    pub fn with_interp_frame_slack(mut self, bytes: usize) -> Self {
        self.interp_frame_slack = bytes;
        self
    }
}
