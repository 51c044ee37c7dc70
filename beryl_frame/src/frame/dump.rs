//! Human-readable frame descriptions for diagnostics.
//!
//! Nothing here is part of the correctness contract: output goes to a
//! caller-supplied text sink and the walker state is an explicit cursor
//! value, so debug walks are reentrant and carry no hidden cross-call
//! state.

use std::fmt::{self, Write};

use smallvec::SmallVec;

use crate::context::WalkContext;
use crate::layout::{
    INTERP_BCP_OFFSET, INTERP_CACHE_OFFSET, INTERP_EXTENDED_SP_OFFSET, INTERP_INITIAL_SP_OFFSET,
    INTERP_LAST_SP_OFFSET, INTERP_LOCALS_OFFSET, INTERP_MDP_OFFSET, INTERP_METHOD_OFFSET,
    INTERP_MIRROR_OFFSET, INTERP_SENDER_SP_OFFSET, LINK_OFFSET, RETURN_ADDR_OFFSET,
};

use super::{FrameKind, StackFrame};

/// Named fp-relative slots of an interpreter frame, dump order.
const INTERP_SLOTS: &[(&str, isize)] = &[
    ("sender_sp", INTERP_SENDER_SP_OFFSET),
    ("last_sp", INTERP_LAST_SP_OFFSET),
    ("method", INTERP_METHOD_OFFSET),
    ("mdp", INTERP_MDP_OFFSET),
    ("extended_sp", INTERP_EXTENDED_SP_OFFSET),
    ("mirror", INTERP_MIRROR_OFFSET),
    ("cache", INTERP_CACHE_OFFSET),
    ("locals", INTERP_LOCALS_OFFSET),
    ("bcp", INTERP_BCP_OFFSET),
    ("initial_sp", INTERP_INITIAL_SP_OFFSET),
];

impl StackFrame {
    /// Write a one-frame description to `out`.
    pub fn describe(&self, ctx: &WalkContext<'_>, out: &mut dyn Write) -> fmt::Result {
        writeln!(
            out,
            "{} frame: sp={:#x} unextended_sp={:#x} fp={:#x} pc={:#x}",
            self.kind().name(),
            self.sp(),
            self.unextended_sp(),
            self.fp(),
            self.pc()
        )?;
        if let Some(unit) = self.code() {
            writeln!(
                out,
                "  code: {} ({}) [{:#x}..{:#x}) frame_size={}",
                unit.name(),
                unit.kind().name(),
                unit.code_start(),
                unit.code_end(),
                unit.frame_size()
            )?;
        }
        if self.is_interpreted_frame() {
            for &(name, offset) in INTERP_SLOTS {
                match (self.fp_slot_addr(offset), self.read_fp_slot(ctx, offset)) {
                    (Some(addr), Some(value)) => {
                        writeln!(out, "  {:#x} {:#018x} {}", addr, value, name)?
                    }
                    _ => writeln!(out, "  <unreadable> {}", name)?,
                }
            }
        }
        if matches!(
            self.kind(),
            FrameKind::Interpreted | FrameKind::Compiled | FrameKind::Native
        ) {
            let ret = self.sender_pc(ctx);
            let link = self.link(ctx);
            let barrier = ret.is_some_and(|pc| ctx.cont.is_return_barrier(pc));
            match ret {
                Some(pc) if barrier => {
                    writeln!(out, "  return address (return barrier): {:#x}", pc)?
                }
                Some(pc) => writeln!(out, "  return address: {:#x}", pc)?,
                None => writeln!(out, "  return address: <unreadable>")?,
            }
            match link {
                Some(fp) => writeln!(out, "  saved fp: {:#x}", fp)?,
                None => writeln!(out, "  saved fp: <unreadable>")?,
            }
        }
        Ok(())
    }
}

// =============================================================================
// Debug Walk Cursor
// =============================================================================

/// Explicit cursor for stepping a stack frame by frame in a debugger or
/// crash handler.
///
/// Frames the walker recognizes are advanced through sender
/// resolution; everything else is assumed to follow the native fp
/// chain. The cursor owns all walk state, so concurrent or interleaved
/// walks cannot interfere with each other.
#[derive(Debug, Clone, Copy)]
pub struct DebugWalkCursor {
    next_sp: usize,
    next_fp: usize,
    next_pc: usize,
}

impl DebugWalkCursor {
    /// Start a walk at the given raw machine state.
    ///
    /// If the pc resolves to a unit with a declared frame size, the fp
    /// is rederived from sp: compiled code does not always chain frame
    /// pointers, preferring fixed sp-relative offsets.
    pub fn start(ctx: &WalkContext<'_>, sp: usize, fp: usize, pc: usize) -> Self {
        let fp = match ctx.code.find(pc) {
            Some(unit) if unit.frame_size() >= 2 => {
                crate::layout::offset_addr(sp, unit.frame_size() as isize - 2).unwrap_or(fp)
            }
            _ => fp,
        };
        Self {
            next_sp: sp,
            next_fp: fp,
            next_pc: pc,
        }
    }

    /// Produce the current frame and advance the cursor to its sender.
    ///
    /// Returns `None` when the chain cannot be followed further.
    pub fn step(&mut self, ctx: &WalkContext<'_>) -> Option<StackFrame> {
        if self.next_fp == 0 || self.next_pc == 0 {
            return None;
        }
        let frame = StackFrame::new(ctx, self.next_sp, self.next_fp, self.next_pc);
        match frame.kind() {
            FrameKind::Interpreted | FrameKind::Compiled => {
                let sender = frame.sender(ctx);
                self.next_sp = sender.unextended_sp();
                self.next_fp = sender.fp();
                self.next_pc = sender.pc();
            }
            _ => {
                // Assume an intact native fp chain.
                self.next_sp = frame.fp_slot_addr(crate::layout::SENDER_SP_OFFSET)?;
                self.next_fp = frame.read_fp_slot(ctx, LINK_OFFSET)?;
                self.next_pc = frame.read_fp_slot(ctx, RETURN_ADDR_OFFSET)?;
            }
        }
        Some(frame)
    }
}

// =============================================================================
// Walk Helper
// =============================================================================

/// Collect up to `max_frames` frames starting at `top`, stopping at the
/// outermost entry frame or the first frame the walker does not
/// recognize. Diagnostics only.
pub fn walk_stack(
    ctx: &WalkContext<'_>,
    top: StackFrame,
    max_frames: usize,
) -> SmallVec<[StackFrame; 16]> {
    let mut frames = SmallVec::new();
    let mut current = top;
    while frames.len() < max_frames {
        let done = match current.kind() {
            FrameKind::Entry => current.entry_frame_is_first(ctx),
            FrameKind::Upcall => current.upcall_stub_frame_is_first(ctx),
            FrameKind::Native => true,
            _ => false,
        };
        frames.push(current.clone());
        if done {
            break;
        }
        current = current.sender(ctx);
    }
    frames
}

// =============================================================================
// Tests
// =============================================================================
