//! Registered machine-code regions and the pc -> code-unit directory.
//!
//! Every piece of emitted code the runtime can return into (compiled
//! methods, runtime stubs, adapters, the call stub, upcall stubs) is
//! registered here as a [`CodeUnit`]. The stack walker classifies an
//! activation record by resolving its pc through [`CodeRegistry::find`]
//! and never trusts a frame whose pc it cannot account for.
#![deny(unsafe_op_in_unsafe_fn)]

pub mod registry;
pub mod unit;

pub use registry::{CodeRegistry, RegistryStats};
pub use unit::{CodeKind, CodeUnit, CodeUnitRef, CompiledInfo, WORD_SIZE};
