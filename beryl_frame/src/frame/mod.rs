//! The stack-frame abstraction.
//!
//! A [`StackFrame`] is an immutable snapshot of one activation record's
//! location and classification: a handful of raw machine values (sp,
//! unextended sp, fp, pc) plus the code unit the pc resolved to. It is
//! a transient, non-owning view into live stack memory. Never persist
//! one past the walk that produced it or across a safepoint, since the
//! underlying bytes may be reused by ordinary call/return activity.
//!
//! Classification is a closed dispatch: the kind set is fixed by the
//! calling convention and does not grow at runtime.

mod deopt;
mod dump;
mod safety;
mod sender;

pub use dump::{walk_stack, DebugWalkCursor};

use beryl_code::{CodeKind, CodeUnitRef};

use crate::context::WalkContext;
use crate::layout::{
    offset_addr, ENTRY_FRAME_CALL_WRAPPER_OFFSET, INTERP_BCP_OFFSET, INTERP_CACHE_OFFSET,
    INTERP_EXTENDED_SP_OFFSET, INTERP_LAST_SP_OFFSET, INTERP_LOCALS_OFFSET, INTERP_METHOD_OFFSET,
    INTERP_MONITOR_BLOCK_BOTTOM_OFFSET, INTERP_MONITOR_BLOCK_TOP_OFFSET, INTERP_SENDER_SP_OFFSET,
    LINK_OFFSET, MONITOR_RECORD_WORDS, RETURN_ADDR_OFFSET, SENDER_SP_OFFSET,
    UPCALL_FRAME_DATA_OFFSET, WORD_SIZE,
};
use crate::anchor::FrameAnchor;

// =============================================================================
// Frame Kind
// =============================================================================

/// Classification of an activation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Frame of interpreter-generated code.
    Interpreted = 0,
    /// Frame of a JIT-compiled method.
    Compiled = 1,
    /// Call-stub frame: native runtime code invoked managed code here.
    Entry = 2,
    /// Upcall-stub frame: external native code called back into managed
    /// code.
    Upcall = 3,
    /// Runtime support stub (or generic buffer blob) frame.
    RuntimeStub = 4,
    /// Calling-convention adapter frame.
    Adapter = 5,
    /// No code unit found: assumed ordinary native code following the
    /// universal frame-pointer-chain convention.
    Native = 6,
}

impl FrameKind {
    /// Human-readable kind name.
    pub const fn name(self) -> &'static str {
        match self {
            FrameKind::Interpreted => "interpreted",
            FrameKind::Compiled => "compiled",
            FrameKind::Entry => "entry",
            FrameKind::Upcall => "upcall",
            FrameKind::RuntimeStub => "runtime stub",
            FrameKind::Adapter => "adapter",
            FrameKind::Native => "native",
        }
    }
}

// =============================================================================
// Deopt State
// =============================================================================

/// Whether a frame's return address has been redirected by the
/// deoptimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeoptState {
    /// Return address is the original one.
    NotDeoptimized,
    /// Return address was patched; the frame's logical pc is the stashed
    /// original.
    IsDeoptimized,
    /// Not yet determined.
    Unknown,
}

// =============================================================================
// Stack Frame
// =============================================================================

/// Snapshot of one activation record.
#[derive(Debug, Clone)]
pub struct StackFrame {
    /// Lowest in-use address of the frame's stack allocation.
    sp: usize,
    /// Logical sp as the caller saw it at call time, before callee-side
    /// extension. Equals `sp` except below interpreter/adapter callees.
    unextended_sp: usize,
    /// Saved frame pointer chaining to the sender.
    fp: usize,
    /// Logical program counter (signature already stripped).
    pc: usize,
    /// Code unit the pc resolved to, if any.
    code: Option<CodeUnitRef>,
    /// Classification.
    kind: FrameKind,
    /// Deoptimization state of the return address.
    deopt_state: DeoptState,
    /// Whether the frame lives in a heap-resident continuation chunk
    /// rather than on a machine stack.
    on_heap: bool,
    /// Whether the sp came from a trusted source (frame-anchor
    /// recovery) and re-validation may be skipped.
    sp_trusted: bool,
}

impl StackFrame {
    /// Build a frame from raw sp/fp/pc, resolving its code unit and
    /// deoptimization state.
    pub fn new(ctx: &WalkContext<'_>, sp: usize, fp: usize, pc: usize) -> Self {
        Self::with_unextended_sp(ctx, sp, sp, fp, pc)
    }

    /// Build a frame whose unextended sp differs from its raw sp.
    pub fn with_unextended_sp(
        ctx: &WalkContext<'_>,
        sp: usize,
        unextended_sp: usize,
        fp: usize,
        pc: usize,
    ) -> Self {
        let code = ctx.code.find(pc);
        let kind = Self::classify(ctx, pc, code.as_deref().map(|u| u.kind()));
        let mut frame = Self {
            sp,
            unextended_sp,
            fp,
            pc,
            code,
            kind,
            deopt_state: DeoptState::Unknown,
            on_heap: false,
            sp_trusted: false,
        };
        frame.resolve_deopt_state(ctx);
        frame
    }

    /// Build a frame resident in a heap continuation chunk. Such frames
    /// are immune to concurrent machine-stack reuse.
    pub fn heap_frame(ctx: &WalkContext<'_>, sp: usize, fp: usize, pc: usize) -> Self {
        let mut frame = Self::new(ctx, sp, fp, pc);
        frame.on_heap = true;
        frame
    }

    /// The target thread's topmost managed frame, recovered from its
    /// transition anchor. `None` if no call-out is recorded.
    ///
    /// If the anchor was never made walkable the pc is read from below
    /// the anchored sp without mutating the anchor.
    pub fn last_frame(ctx: &WalkContext<'_>) -> Option<Self> {
        let anchor = ctx.anchor;
        if !anchor.has_last_frame() {
            return None;
        }
        let pc = if anchor.walkable() {
            anchor.last_pc()
        } else {
            ctx.mem.read_word(anchor.last_sp().checked_sub(WORD_SIZE)?)?
        };
        let pc = ctx.auth.strip_verifiable(pc);
        let mut frame = Self::new(ctx, anchor.last_sp(), anchor.last_fp(), pc);
        frame.sp_trusted = true;
        Some(frame)
    }

    /// Classify a pc given its resolved unit kind.
    fn classify(ctx: &WalkContext<'_>, pc: usize, unit_kind: Option<CodeKind>) -> FrameKind {
        if ctx.code.interpreter_contains(pc) {
            return FrameKind::Interpreted;
        }
        match unit_kind {
            None => FrameKind::Native,
            Some(CodeKind::CompiledMethod) => FrameKind::Compiled,
            Some(CodeKind::RuntimeStub) | Some(CodeKind::BufferBlob) => FrameKind::RuntimeStub,
            Some(CodeKind::AdapterBlob) => FrameKind::Adapter,
            Some(CodeKind::UpcallStub) => FrameKind::Upcall,
            Some(CodeKind::CallStub) => FrameKind::Entry,
        }
    }

    /// Settle the deopt state: if the pc is a deopt landing pad, adopt
    /// the stashed original pc as the logical pc.
    fn resolve_deopt_state(&mut self, ctx: &WalkContext<'_>) {
        match self.deopt_original_pc(ctx) {
            Some(original) => {
                self.pc = original;
                self.deopt_state = DeoptState::IsDeoptimized;
            }
            None => self.deopt_state = DeoptState::NotDeoptimized,
        }
    }

    /// The stashed pre-deopt pc, if this frame's pc is a deoptimization
    /// landing pad and the stash slot holds a value.
    pub(crate) fn deopt_original_pc(&self, ctx: &WalkContext<'_>) -> Option<usize> {
        let unit = self.code.as_ref()?;
        if !unit.is_deopt_entry(self.pc) && !unit.is_deopt_mh_entry(self.pc) {
            return None;
        }
        let info = unit.as_compiled()?;
        let original = ctx.mem.read_word(info.orig_pc_addr(self.unextended_sp)?)?;
        // The stashed pc must point back into the owning method's code
        // (or immediately after it); anything else is stack garbage from
        // a frame that was never deoptimized.
        if original == 0 || original < unit.code_start() || original > unit.code_end() {
            return None;
        }
        Some(original)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Stack pointer.
    #[inline]
    pub fn sp(&self) -> usize {
        self.sp
    }

    /// Unextended stack pointer.
    #[inline]
    pub fn unextended_sp(&self) -> usize {
        self.unextended_sp
    }

    /// Frame pointer.
    #[inline]
    pub fn fp(&self) -> usize {
        self.fp
    }

    /// Logical program counter.
    #[inline]
    pub fn pc(&self) -> usize {
        self.pc
    }

    /// Resolved code unit, if any.
    #[inline]
    pub fn code(&self) -> Option<&CodeUnitRef> {
        self.code.as_ref()
    }

    /// Frame classification.
    #[inline]
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    /// Deoptimization state.
    #[inline]
    pub fn deopt_state(&self) -> DeoptState {
        self.deopt_state
    }

    /// Whether the frame lives in a heap continuation chunk.
    #[inline]
    pub fn is_heap_frame(&self) -> bool {
        self.on_heap
    }

    /// Whether the sp came from a trusted source.
    #[inline]
    pub fn sp_is_trusted(&self) -> bool {
        self.sp_trusted
    }

    /// Mark the sp as trusted (frame-anchor recovery).
    #[inline]
    pub fn set_sp_is_trusted(&mut self) {
        self.sp_trusted = true;
    }

    #[inline]
    pub fn is_interpreted_frame(&self) -> bool {
        self.kind == FrameKind::Interpreted
    }

    #[inline]
    pub fn is_compiled_frame(&self) -> bool {
        self.kind == FrameKind::Compiled
    }

    #[inline]
    pub fn is_entry_frame(&self) -> bool {
        self.kind == FrameKind::Entry
    }

    #[inline]
    pub fn is_upcall_stub_frame(&self) -> bool {
        self.kind == FrameKind::Upcall
    }

    #[inline]
    pub fn is_native_frame(&self) -> bool {
        self.kind == FrameKind::Native
    }

    // =========================================================================
    // Slot Access
    // =========================================================================

    /// Address of the fp-relative slot `words` words from fp.
    #[inline]
    pub fn fp_slot_addr(&self, words: isize) -> Option<usize> {
        offset_addr(self.fp, words)
    }

    /// Read the fp-relative slot `words` words from fp.
    #[inline]
    pub fn read_fp_slot(&self, ctx: &WalkContext<'_>, words: isize) -> Option<usize> {
        ctx.mem.read_word(self.fp_slot_addr(words)?)
    }

    /// Write the fp-relative slot `words` words from fp.
    #[inline]
    fn write_fp_slot(&self, ctx: &WalkContext<'_>, words: isize, value: usize) -> bool {
        match self.fp_slot_addr(words) {
            Some(addr) => ctx.mem.write_word(addr, value),
            None => false,
        }
    }

    /// Saved caller fp (the link).
    #[inline]
    pub fn link(&self, ctx: &WalkContext<'_>) -> Option<usize> {
        self.read_fp_slot(ctx, LINK_OFFSET)
    }

    /// Raw value of the return-address slot, possibly signed.
    #[inline]
    pub fn sender_pc_maybe_signed(&self, ctx: &WalkContext<'_>) -> Option<usize> {
        self.read_fp_slot(ctx, RETURN_ADDR_OFFSET)
    }

    /// Return address with any signature stripped, tolerant of signed
    /// and unsigned encodings.
    #[inline]
    pub fn sender_pc(&self, ctx: &WalkContext<'_>) -> Option<usize> {
        Some(ctx.auth.strip_verifiable(self.sender_pc_maybe_signed(ctx)?))
    }

    /// Raw sender sp of a chained frame: the address just past the
    /// saved fp and return address. This is an address, not a load.
    #[inline]
    pub fn chained_sender_sp(&self) -> Option<usize> {
        self.fp_slot_addr(SENDER_SP_OFFSET)
    }

    // =========================================================================
    // Interpreter Frame Slots
    // =========================================================================

    /// Method metadata reference.
    #[inline]
    pub fn interpreter_frame_method(&self, ctx: &WalkContext<'_>) -> Option<usize> {
        self.read_fp_slot(ctx, INTERP_METHOD_OFFSET)
    }

    /// Bytecode position.
    #[inline]
    pub fn interpreter_frame_bcp(&self, ctx: &WalkContext<'_>) -> Option<usize> {
        self.read_fp_slot(ctx, INTERP_BCP_OFFSET)
    }

    /// Constant-pool cache reference.
    #[inline]
    pub fn interpreter_frame_cache(&self, ctx: &WalkContext<'_>) -> Option<usize> {
        self.read_fp_slot(ctx, INTERP_CACHE_OFFSET)
    }

    /// Locals array base. The slot stores an fp-relative word offset.
    #[inline]
    pub fn interpreter_frame_locals(&self, ctx: &WalkContext<'_>) -> Option<usize> {
        let rel = self.read_fp_slot(ctx, INTERP_LOCALS_OFFSET)? as isize;
        offset_addr(self.fp, rel)
    }

    /// The sender's unextended sp as recorded by the interpreter.
    #[inline]
    pub fn interpreter_frame_sender_sp(&self, ctx: &WalkContext<'_>) -> Option<usize> {
        self.read_fp_slot(ctx, INTERP_SENDER_SP_OFFSET)
    }

    /// Record the sender's unextended sp.
    pub fn set_interpreter_frame_sender_sp(&self, ctx: &WalkContext<'_>, sender_sp: usize) -> bool {
        debug_assert!(self.is_interpreted_frame());
        self.write_fp_slot(ctx, INTERP_SENDER_SP_OFFSET, sender_sp)
    }

    /// Record the sp last pushed before a call out of this frame
    /// (relativized against fp; zero clears it).
    pub fn interpreter_frame_set_last_sp(&self, ctx: &WalkContext<'_>, sp: usize) -> bool {
        debug_assert!(self.is_interpreted_frame());
        let rel = if sp == 0 {
            0
        } else {
            (sp as isize - self.fp as isize) / WORD_SIZE as isize
        };
        self.write_fp_slot(ctx, INTERP_LAST_SP_OFFSET, rel as usize)
    }

    /// Record the extended sp after operand-stack growth (relativized).
    pub fn interpreter_frame_set_extended_sp(&self, ctx: &WalkContext<'_>, sp: usize) -> bool {
        debug_assert!(self.is_interpreted_frame());
        let rel = (sp as isize - self.fp as isize) / WORD_SIZE as isize;
        self.write_fp_slot(ctx, INTERP_EXTENDED_SP_OFFSET, rel as usize)
    }

    /// Address of the bottom of the monitor block (grows downward from
    /// here). The records themselves are opaque to the walker.
    #[inline]
    pub fn interpreter_frame_monitor_begin(&self) -> Option<usize> {
        self.fp_slot_addr(INTERP_MONITOR_BLOCK_BOTTOM_OFFSET)
    }

    /// Address one past the last monitor record (relativized slot).
    pub fn interpreter_frame_monitor_end(&self, ctx: &WalkContext<'_>) -> Option<usize> {
        let rel = self.read_fp_slot(ctx, INTERP_MONITOR_BLOCK_TOP_OFFSET)? as isize;
        let end = offset_addr(self.fp, rel)?;
        debug_assert!(end >= self.sp, "monitor end below stack pointer");
        debug_assert!(end < self.fp, "monitor end above frame pointer");
        Some(end)
    }

    /// Number of monitor records currently in the block.
    pub fn interpreter_frame_monitor_count(&self, ctx: &WalkContext<'_>) -> Option<usize> {
        let begin = self.interpreter_frame_monitor_begin()?;
        let end = self.interpreter_frame_monitor_end(ctx)?;
        Some(begin.checked_sub(end)? / (MONITOR_RECORD_WORDS * WORD_SIZE))
    }

    // =========================================================================
    // Entry / Upcall Frames
    // =========================================================================

    /// Address of the entry frame's call-wrapper record.
    pub fn entry_frame_call_wrapper_addr(&self, ctx: &WalkContext<'_>) -> Option<usize> {
        debug_assert!(self.is_entry_frame());
        self.read_fp_slot(ctx, ENTRY_FRAME_CALL_WRAPPER_OFFSET)
    }

    /// The anchor embedded in the entry frame's call-wrapper record.
    pub fn entry_frame_anchor(&self, ctx: &WalkContext<'_>) -> Option<FrameAnchor> {
        let jcw = self.entry_frame_call_wrapper_addr(ctx)?;
        FrameAnchor::load(ctx.mem, jcw)
    }

    /// Whether this entry frame is the outermost managed frame: its
    /// wrapper records no prior managed activation.
    pub fn entry_frame_is_first(&self, ctx: &WalkContext<'_>) -> bool {
        match self.entry_frame_anchor(ctx) {
            Some(anchor) => !anchor.has_last_frame(),
            None => true,
        }
    }

    /// Whether the entry frame's call-wrapper record is internally
    /// consistent: the wrapper lies in the stack above this frame's fp
    /// and its anchored sp, if any, is above this frame.
    pub fn is_entry_frame_valid(&self, ctx: &WalkContext<'_>) -> bool {
        let Some(jcw) = self.entry_frame_call_wrapper_addr(ctx) else {
            return false;
        };
        if !ctx.bounds.is_in_stack_range_excl(jcw, self.fp) {
            return false;
        }
        match FrameAnchor::load(ctx.mem, jcw) {
            Some(anchor) => anchor.last_sp() > self.sp,
            None => false,
        }
    }

    /// Address of an entry frame argument, relative to unextended sp.
    #[inline]
    pub fn entry_frame_argument_at(&self, offset: usize) -> Option<usize> {
        debug_assert!(self.is_entry_frame());
        offset_addr(self.unextended_sp, offset as isize)
    }

    /// The anchor embedded in an upcall stub's frame-data record.
    pub fn upcall_stub_anchor(&self, ctx: &WalkContext<'_>) -> Option<FrameAnchor> {
        debug_assert!(self.is_upcall_stub_frame());
        // unextended_sp, not sp: the raw sp is wrong for interpreter
        // callees of the stub.
        let base = offset_addr(self.unextended_sp, UPCALL_FRAME_DATA_OFFSET)?;
        FrameAnchor::load(ctx.mem, base)
    }

    /// Whether this upcall frame is the first managed activation of its
    /// native caller.
    pub fn upcall_stub_frame_is_first(&self, ctx: &WalkContext<'_>) -> bool {
        match self.upcall_stub_anchor(ctx) {
            Some(anchor) => !anchor.has_last_frame(),
            None => true,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
