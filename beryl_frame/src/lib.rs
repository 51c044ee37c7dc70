//! Stack-frame abstraction and safe sender-chain walking.
//!
//! This crate models the activation records of a mixed interpreter/JIT
//! execution engine and provides two ways of moving down the stack:
//!
//! - **Trusted walking** ([`StackFrame::sender`]): for frames known to
//!   be well formed. Contract violations are fatal.
//! - **Safe probing** ([`StackFrame::is_safe_for_sender`]): for raw
//!   machine state observed asynchronously (profilers, crash handlers).
//!   Never panics, never reads outside the declared stack bounds, and
//!   answers `false` on anything it cannot prove.
//!
//! All stack access goes through the [`stack::StackMemory`] trait, so
//! the same walker runs against live thread stacks and against captured
//! snapshots. Code identity comes from a [`beryl_code::CodeRegistry`];
//! return addresses pass through a [`pauth::PointerAuth`] scheme before
//! use.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod anchor;
pub mod cont;
pub mod context;
pub mod frame;
pub mod layout;
pub mod meta;
pub mod pauth;
pub mod stack;

#[cfg(test)]
mod testkit;

pub use anchor::FrameAnchor;
pub use cont::{ContinuationSupport, NoContinuations};
pub use context::WalkContext;
pub use frame::{walk_stack, DebugWalkCursor, DeoptState, FrameKind, StackFrame};
pub use meta::{MethodOracle, NullMethodOracle};
pub use pauth::{HighBitsAuth, IdentityAuth, PointerAuth};
pub use stack::{LiveStackMemory, SnapshotMemory, StackBounds, StackMemory, StackSegment};
