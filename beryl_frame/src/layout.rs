//! Fixed stack-frame layout offsets.
//!
//! All offsets are in machine words relative to a frame's fp unless
//! noted otherwise. The stack grows downward: lower addresses are newer.
//! Interpreter frame slots sit below fp (negative offsets); the saved fp
//! and return address sit at and just above fp.
//!
//! ```text
//!           (higher addresses, older frames)
//!   fp + 2  sender sp                 <- compiled sender_sp points here
//!   fp + 1  return address
//!   fp + 0  saved fp (link)
//!   fp - 1  interpreter: sender's unextended sp
//!   fp - 2  interpreter: last sp / monitor block top
//!   fp - 3  interpreter: method reference
//!   ...
//!   fp - 10 interpreter: initial expression-stack sp
//!           (lower addresses, newer frames)
//! ```

/// Machine word size in bytes.
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Size of one interpreter expression-stack element in bytes.
pub const STACK_ELEMENT_SIZE: usize = WORD_SIZE;

// -- generic frame slots (all frame kinds with a chained fp) ------------------

/// Saved caller fp.
pub const LINK_OFFSET: isize = 0;
/// Return address slot.
pub const RETURN_ADDR_OFFSET: isize = 1;
/// The sender's sp is the address of this slot, not its contents.
pub const SENDER_SP_OFFSET: isize = 2;

// -- interpreter frame slots (below fp) ---------------------------------------

/// Sender's unextended sp (sp the caller saw at the call site).
pub const INTERP_SENDER_SP_OFFSET: isize = -1;
/// Last sp pushed before a call out of the frame; doubles as the
/// monitor-block top (relativized against fp).
pub const INTERP_LAST_SP_OFFSET: isize = -2;
/// Method metadata reference.
pub const INTERP_METHOD_OFFSET: isize = -3;
/// Method data / profiling pointer.
pub const INTERP_MDP_OFFSET: isize = -4;
/// Extended sp after operand-stack growth (relativized against fp).
pub const INTERP_EXTENDED_SP_OFFSET: isize = -5;
/// Class mirror keeping the method's holder alive.
pub const INTERP_MIRROR_OFFSET: isize = -6;
/// Constant-pool cache reference.
pub const INTERP_CACHE_OFFSET: isize = -7;
/// Locals array base (relativized against fp).
pub const INTERP_LOCALS_OFFSET: isize = -8;
/// Bytecode position within the method.
pub const INTERP_BCP_OFFSET: isize = -9;
/// Initial expression-stack sp; also the monitor block bottom.
pub const INTERP_INITIAL_SP_OFFSET: isize = -10;
/// Monitor records sit between the initial sp slot and the monitor top.
pub const INTERP_MONITOR_BLOCK_BOTTOM_OFFSET: isize = INTERP_INITIAL_SP_OFFSET;
/// Monitor block top shares the last-sp slot.
pub const INTERP_MONITOR_BLOCK_TOP_OFFSET: isize = INTERP_LAST_SP_OFFSET;

/// Size of one monitor record in words. Its internal shape belongs to
/// the interpreter; the walker only skips over it.
pub const MONITOR_RECORD_WORDS: usize = 2;

// -- entry / upcall frames ----------------------------------------------------

/// Entry frames store a pointer to their call-wrapper record here.
pub const ENTRY_FRAME_CALL_WRAPPER_OFFSET: isize = -8;

/// Word offset of an upcall stub's frame-data record, relative to the
/// frame's unextended sp. The record begins with an in-memory anchor
/// (sp, fp, pc).
pub const UPCALL_FRAME_DATA_OFFSET: isize = 2;

// -- tuning -------------------------------------------------------------------

/// Default additive slack, in bytes, allowed between an interpreter
/// frame's fp and unextended sp beyond the method's declared maximum
/// operand-stack footprint. Empirical, kept configurable on the walk
/// context for other calling conventions.
pub const DEFAULT_INTERP_FRAME_SLACK: usize = 1024;

/// Compute `base + words * WORD_SIZE` with overflow checking.
///
/// Frame arithmetic on unvalidated input must never wrap: a wrapped
/// address would defeat the stack-range checks that follow it.
#[inline]
pub fn offset_addr(base: usize, words: isize) -> Option<usize> {
    let bytes = words.checked_mul(WORD_SIZE as isize)?;
    if bytes >= 0 {
        base.checked_add(bytes as usize)
    } else {
        base.checked_sub(bytes.unsigned_abs())
    }
}
