//! Per-kind sender resolution.
//!
//! Resolution is a pure computation over the frame's raw values and
//! fixed slot offsets. It is only legal on frames that are the live top
//! of stack, were certified by the safety validator, or were produced
//! by a prior resolution step; resolving the sender of a frame with no
//! predecessor is a caller error, not a runtime condition: callers
//! must consult `entry_frame_is_first` / `upcall_stub_frame_is_first`
//! first.

use crate::context::WalkContext;
use crate::layout::{offset_addr, LINK_OFFSET, RETURN_ADDR_OFFSET, SENDER_SP_OFFSET, WORD_SIZE};

use super::{FrameKind, StackFrame};

impl StackFrame {
    /// Compute the sender of this frame.
    pub fn sender(&self, ctx: &WalkContext<'_>) -> StackFrame {
        match self.kind() {
            FrameKind::Entry => self.sender_for_entry_frame(ctx),
            FrameKind::Upcall => self.sender_for_upcall_stub_frame(ctx),
            FrameKind::Interpreted => self.sender_for_interpreter_frame(ctx),
            FrameKind::Compiled | FrameKind::RuntimeStub | FrameKind::Adapter => {
                self.sender_for_compiled_frame(ctx)
            }
            FrameKind::Native => self.sender_for_native_frame(ctx),
        }
    }

    /// Sender of an interpreter frame.
    ///
    /// The raw sender sp is the address past this frame's saved fp and
    /// return address; the sender's unextended sp is read from its own
    /// slot. The two differ because the current frame's locals sit
    /// between them.
    fn sender_for_interpreter_frame(&self, ctx: &WalkContext<'_>) -> StackFrame {
        let sender_sp = self
            .fp_slot_addr(SENDER_SP_OFFSET)
            .expect("interpreter frame fp overflow");
        let sender_unextended_sp = self
            .interpreter_frame_sender_sp(ctx)
            .expect("unreadable interpreter sender-sp slot");
        let sender_fp = self.link(ctx).expect("unreadable interpreter link slot");
        // The interpreter signs the return address on targets with
        // return-address protection; strip, no need to authenticate.
        let sender_pc = self
            .sender_pc(ctx)
            .expect("unreadable interpreter return-address slot");

        if ctx.cont.is_return_barrier(sender_pc) {
            return ctx.cont.continuation_bottom_sender(self, sender_sp);
        }

        StackFrame::with_unextended_sp(ctx, sender_sp, sender_unextended_sp, sender_fp, sender_pc)
    }

    /// Sender of a compiled-code frame (also runtime stubs and
    /// adapters, which share the fixed-frame-size convention).
    fn sender_for_compiled_frame(&self, ctx: &WalkContext<'_>) -> StackFrame {
        let unit = self.code().expect("compiled frame without code unit");
        debug_assert!(unit.frame_size() > 0, "frame size never zero");

        let sender_sp = offset_addr(self.unextended_sp(), unit.frame_size() as isize)
            .expect("compiled frame size overflows sender sp");
        // Saved fp and return address sit at fixed offsets below the
        // sender sp: the return address counts against this frame.
        let saved_fp_addr = sender_sp - 2 * WORD_SIZE;
        let sender_pc_addr = sender_sp - WORD_SIZE;
        let sender_fp = ctx
            .mem
            .read_word(saved_fp_addr)
            .expect("unreadable saved-fp slot");
        let sender_pc = ctx.auth.strip_verifiable(
            ctx.mem
                .read_word(sender_pc_addr)
                .expect("unreadable return-address slot"),
        );

        if ctx.cont.is_return_barrier(sender_pc) {
            return ctx.cont.continuation_bottom_sender(self, sender_sp);
        }

        StackFrame::with_unextended_sp(ctx, sender_sp, sender_sp, sender_fp, sender_pc)
    }

    /// Sender of an entry frame: the managed frame recorded in the call
    /// wrapper's anchor. The native frames in between are skipped
    /// wholesale.
    fn sender_for_entry_frame(&self, ctx: &WalkContext<'_>) -> StackFrame {
        let anchor = self
            .entry_frame_anchor(ctx)
            .expect("entry frame without readable call wrapper");
        assert!(
            anchor.has_last_frame(),
            "sender of first entry frame: callers must test entry_frame_is_first"
        );
        debug_assert!(
            anchor.last_sp() > self.sp(),
            "anchored frame must be above the entry frame"
        );

        let mut frame = Self::frame_for_anchor(ctx, &anchor);
        // Anchor-recovered sps skip re-validation.
        frame.set_sp_is_trusted();
        frame
    }

    /// Sender of an upcall-stub frame, recovered from the anchor in the
    /// stub's frame-data record.
    fn sender_for_upcall_stub_frame(&self, ctx: &WalkContext<'_>) -> StackFrame {
        let anchor = self
            .upcall_stub_anchor(ctx)
            .expect("upcall frame without readable frame data");
        assert!(
            anchor.has_last_frame(),
            "sender of first upcall frame: callers must test upcall_stub_frame_is_first"
        );
        debug_assert!(
            anchor.last_sp() > self.sp(),
            "anchored frame must be above the upcall frame"
        );

        Self::frame_for_anchor(ctx, &anchor)
    }

    /// Sender of an unrecognized native frame via the universal
    /// fp-chain convention.
    fn sender_for_native_frame(&self, ctx: &WalkContext<'_>) -> StackFrame {
        let sender_sp = self
            .fp_slot_addr(SENDER_SP_OFFSET)
            .expect("native frame fp overflow");
        let sender_fp = self
            .read_fp_slot(ctx, LINK_OFFSET)
            .expect("unreadable native link slot");
        let sender_pc = ctx.auth.strip_verifiable(
            self.read_fp_slot(ctx, RETURN_ADDR_OFFSET)
                .expect("unreadable native return-address slot"),
        );

        if ctx.cont.is_return_barrier(sender_pc) {
            return ctx.cont.continuation_bottom_sender(self, sender_sp);
        }

        StackFrame::new(ctx, sender_sp, sender_fp, sender_pc)
    }

    /// Materialize the frame an anchor describes. If the anchor was
    /// stacked without a captured pc it is recovered from the word
    /// below the anchored sp, without mutating the anchor record.
    fn frame_for_anchor(ctx: &WalkContext<'_>, anchor: &crate::anchor::FrameAnchor) -> StackFrame {
        let pc = if anchor.walkable() {
            anchor.last_pc()
        } else {
            ctx.mem
                .read_word(anchor.last_sp() - WORD_SIZE)
                .expect("unreadable anchored return-address slot")
        };
        let pc = ctx.auth.strip_verifiable(pc);
        StackFrame::new(ctx, anchor.last_sp(), anchor.last_fp(), pc)
    }
}
