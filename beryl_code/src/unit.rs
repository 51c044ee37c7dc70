//! Code-unit descriptors.
//!
//! A [`CodeUnit`] records the address range of one registered blob of
//! emitted code together with the metadata the stack walker needs to
//! reason about an activation record landing inside it: the blob kind,
//! the fixed machine frame size, and the point in the prologue after
//! which the frame is actually set up.

use std::sync::Arc;

/// Machine word size in bytes. Stack slots and frame sizes are measured
/// in words of this size.
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

// =============================================================================
// Code Kind
// =============================================================================

/// Classification of a registered code blob.
///
/// The set is closed: it is fixed by the calling convention, not
/// extensible at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CodeKind {
    /// JIT-compiled method body.
    CompiledMethod = 0,
    /// Runtime support stub (allocation, arithmetic helpers, ...).
    RuntimeStub = 1,
    /// Calling-convention adapter blob. Adapters never report a complete
    /// frame and are never a legal asynchronous sample point.
    AdapterBlob = 2,
    /// Stub through which external native code calls back into managed
    /// code.
    UpcallStub = 3,
    /// The call stub: the boundary where native runtime code invokes
    /// managed code. A pc inside this blob marks an entry frame.
    CallStub = 4,
    /// Generic buffer blob with no frame metadata of its own.
    BufferBlob = 5,
}

impl CodeKind {
    /// Human-readable blob kind name (used by diagnostics).
    pub const fn name(self) -> &'static str {
        match self {
            CodeKind::CompiledMethod => "compiled method",
            CodeKind::RuntimeStub => "runtime stub",
            CodeKind::AdapterBlob => "adapter blob",
            CodeKind::UpcallStub => "upcall stub",
            CodeKind::CallStub => "call stub",
            CodeKind::BufferBlob => "buffer blob",
        }
    }
}

// =============================================================================
// Compiled-Method Metadata
// =============================================================================

/// Extra metadata carried only by compiled methods.
#[derive(Debug, Clone)]
pub struct CompiledInfo {
    /// Raw reference word for the owning method's metadata. Opaque to
    /// this crate; validated by the method oracle during stack walks.
    pub method: usize,
    /// Code offset of the deoptimization landing pad, if one was emitted.
    pub deopt_entry_offset: Option<u32>,
    /// Code offset of the method-handle deoptimization landing pad.
    pub deopt_mh_entry_offset: Option<u32>,
    /// Word index above `unextended_sp` where the pre-deopt original pc
    /// is stashed when the frame's return address has been redirected.
    pub orig_pc_slot: usize,
    /// Whether the owning method is a method-handle intrinsic. Such
    /// methods are never a legal interior sender.
    pub method_handle_intrinsic: bool,
}

impl CompiledInfo {
    /// Address of the stashed original-pc slot for a frame whose
    /// unextended sp is `unextended_sp`. `None` on address overflow.
    #[inline]
    pub fn orig_pc_addr(&self, unextended_sp: usize) -> Option<usize> {
        self.orig_pc_slot
            .checked_mul(WORD_SIZE)
            .and_then(|b| unextended_sp.checked_add(b))
    }
}

// =============================================================================
// Code Unit
// =============================================================================

/// One registered region of emitted code.
#[derive(Debug, Clone)]
pub struct CodeUnit {
    /// Diagnostic name of the blob.
    name: String,
    /// Blob classification.
    kind: CodeKind,
    /// First byte of the code section.
    code_start: usize,
    /// Code section size in bytes.
    code_size: usize,
    /// Fixed machine frame size in words. Zero means "no frame" and is
    /// always invalid for compiled methods: the return address counts
    /// against the callee's frame by convention.
    frame_size: usize,
    /// Code offset after which the frame is fully set up. `None` means
    /// the frame is never complete (adapters).
    frame_complete_offset: Option<u32>,
    /// Compiled-method metadata, present iff `kind == CompiledMethod`.
    compiled: Option<CompiledInfo>,
}

impl CodeUnit {
    /// Create a new code unit.
    pub fn new(
        name: impl Into<String>,
        kind: CodeKind,
        code_start: usize,
        code_size: usize,
        frame_size: usize,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            code_start,
            code_size,
            frame_size,
            frame_complete_offset: Some(0),
            compiled: None,
        }
    }

    /// Set the frame-complete offset (`None` = never complete).
    pub fn with_frame_complete_offset(mut self, offset: Option<u32>) -> Self {
        self.frame_complete_offset = offset;
        self
    }

    /// Attach compiled-method metadata. Only meaningful for
    /// `CodeKind::CompiledMethod`.
    pub fn with_compiled_info(mut self, info: CompiledInfo) -> Self {
        debug_assert_eq!(self.kind, CodeKind::CompiledMethod);
        self.compiled = Some(info);
        self
    }

    /// Diagnostic name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blob kind.
    #[inline]
    pub fn kind(&self) -> CodeKind {
        self.kind
    }

    /// First byte of the code section.
    #[inline]
    pub fn code_start(&self) -> usize {
        self.code_start
    }

    /// One past the last byte of the code section.
    #[inline]
    pub fn code_end(&self) -> usize {
        self.code_start + self.code_size
    }

    /// Fixed frame size in words.
    #[inline]
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Whether `pc` lies inside this unit's code section.
    #[inline]
    pub fn code_contains(&self, pc: usize) -> bool {
        pc >= self.code_start && pc < self.code_end()
    }

    /// Whether the machine frame is fully set up at `pc`.
    ///
    /// A pc before the frame-complete point is mid-prologue: sp and fp
    /// do not yet describe a frame of this unit's declared size.
    #[inline]
    pub fn is_frame_complete_at(&self, pc: usize) -> bool {
        match self.frame_complete_offset {
            Some(off) => {
                self.code_contains(pc) && pc - self.code_start >= off as usize
            }
            None => false,
        }
    }

    /// Compiled-method metadata, if this unit is a compiled method.
    #[inline]
    pub fn as_compiled(&self) -> Option<&CompiledInfo> {
        self.compiled.as_ref()
    }

    /// Whether this unit is a compiled method.
    #[inline]
    pub fn is_compiled(&self) -> bool {
        self.kind == CodeKind::CompiledMethod
    }

    /// Whether `pc` is this unit's deoptimization landing pad.
    #[inline]
    pub fn is_deopt_entry(&self, pc: usize) -> bool {
        matches!(
            (&self.compiled, self.offset_of(pc)),
            (Some(info), Some(off)) if info.deopt_entry_offset == Some(off)
        )
    }

    /// Whether `pc` is this unit's method-handle deoptimization pad.
    #[inline]
    pub fn is_deopt_mh_entry(&self, pc: usize) -> bool {
        matches!(
            (&self.compiled, self.offset_of(pc)),
            (Some(info), Some(off)) if info.deopt_mh_entry_offset == Some(off)
        )
    }

    /// Code offset of `pc`, if it lies in this unit.
    #[inline]
    fn offset_of(&self, pc: usize) -> Option<u32> {
        if self.code_contains(pc) {
            Some((pc - self.code_start) as u32)
        } else {
            None
        }
    }
}

/// Shared handle to a registered unit.
pub type CodeUnitRef = Arc<CodeUnit>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(kind: CodeKind) -> CodeUnit {
        CodeUnit::new("t", kind, 0x1000, 0x100, 4)
    }

    #[test]
    fn test_code_contains_bounds() {
        let u = unit(CodeKind::RuntimeStub);
        assert!(u.code_contains(0x1000));
        assert!(u.code_contains(0x10ff));
        assert!(!u.code_contains(0x1100));
        assert!(!u.code_contains(0xfff));
    }

    #[test]
    fn test_frame_complete_at() {
        let u = unit(CodeKind::CompiledMethod).with_frame_complete_offset(Some(0x10));
        assert!(!u.is_frame_complete_at(0x1000));
        assert!(!u.is_frame_complete_at(0x100f));
        assert!(u.is_frame_complete_at(0x1010));
        // never complete outside the code range
        assert!(!u.is_frame_complete_at(0x2000));
    }

    #[test]
    fn test_adapter_never_complete() {
        let u = unit(CodeKind::AdapterBlob).with_frame_complete_offset(None);
        assert!(!u.is_frame_complete_at(0x1000));
        assert!(!u.is_frame_complete_at(0x1080));
    }

    #[test]
    fn test_deopt_entry_points() {
        let u = unit(CodeKind::CompiledMethod).with_compiled_info(CompiledInfo {
            method: 0xdead_0000,
            deopt_entry_offset: Some(0x40),
            deopt_mh_entry_offset: Some(0x48),
            orig_pc_slot: 2,
            method_handle_intrinsic: false,
        });
        assert!(u.is_deopt_entry(0x1040));
        assert!(!u.is_deopt_entry(0x1048));
        assert!(u.is_deopt_mh_entry(0x1048));
        assert!(!u.is_deopt_entry(0x1044));
    }

    #[test]
    fn test_orig_pc_addr() {
        let info = CompiledInfo {
            method: 0,
            deopt_entry_offset: None,
            deopt_mh_entry_offset: None,
            orig_pc_slot: 3,
            method_handle_intrinsic: false,
        };
        assert_eq!(info.orig_pc_addr(0x8000), Some(0x8000 + 3 * WORD_SIZE));
        assert_eq!(info.orig_pc_addr(usize::MAX - 1), None);
    }
}
