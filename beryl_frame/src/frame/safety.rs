//! The safety validator.
//!
//! Certifies that a frame captured asynchronously (signal context,
//! profiler sample, crash dump) is safe to treat as the live top of
//! stack before a sender is computed from it. The checks are ordered
//! and short-circuiting, never dereference an unchecked address, never
//! block, and tolerate concurrent mutation of the target stack. The
//! guarantee is one-sided: a bad frame is never certified good; a good
//! frame caught mid-transition may still be rejected.

use beryl_code::CodeKind;

use crate::context::WalkContext;
use crate::layout::{offset_addr, RETURN_ADDR_OFFSET, STACK_ELEMENT_SIZE, WORD_SIZE};
use crate::layout::{INTERP_INITIAL_SP_OFFSET, SENDER_SP_OFFSET};

use super::{FrameKind, StackFrame};

impl StackFrame {
    /// Whether this frame may be trusted as the live top of stack.
    pub fn is_safe_for_sender(&self, ctx: &WalkContext<'_>) -> bool {
        // Heap-resident frames are immune to machine-stack reuse.
        if self.is_heap_frame() {
            return true;
        }

        // sp must be within the usable part of the stack (not in guards).
        if !ctx.bounds.is_in_usable_stack(self.sp()) {
            return false;
        }

        // The unextended sp only has to be somewhere in the full stack:
        // interpreter callees legitimately hold addresses below the
        // usable region, and unextended_sp >= sp need not hold either.
        if !ctx.bounds.is_in_full_stack(self.unextended_sp()) {
            return false;
        }

        // fp must sit strictly above sp, and its return-address slot
        // must itself be a readable stack address. Checked arithmetic
        // also rejects the no-frame-pointer sentinel (!0).
        let fp_safe = ctx.bounds.is_in_stack_range_excl(self.fp(), self.sp())
            && matches!(
                offset_addr(self.fp(), RETURN_ADDR_OFFSET),
                Some(slot) if ctx.bounds.is_in_full_stack(slot)
            );

        // No code unit: assume ordinary native code on the universal
        // fp-chain convention. The fp must be trustworthy and the
        // return slot non-null (null marks the oldest frame).
        if self.kind() == FrameKind::Native {
            if !fp_safe {
                return false;
            }
            return matches!(self.read_fp_slot(ctx, RETURN_ADDR_OFFSET), Some(pc) if pc != 0);
        }

        if let Some(unit) = self.code() {
            // A pc before the frame-complete point is a mid-prologue or
            // mid-epilogue landing. Completeness metadata is only
            // reliable for compiled methods, adapters and runtime
            // stubs; other buffer blobs are assumed ok.
            if !unit.is_frame_complete_at(self.pc()) {
                if matches!(
                    unit.kind(),
                    CodeKind::CompiledMethod | CodeKind::AdapterBlob | CodeKind::RuntimeStub
                ) {
                    return false;
                }
            }

            // Could be a random pointer into the blob's data sections.
            if !unit.code_contains(self.pc()) {
                return false;
            }
        }

        // Transition frames do not chain through the machine stack.
        match self.kind() {
            FrameKind::Entry => return fp_safe && self.is_entry_frame_valid(ctx),
            FrameKind::Upcall => return fp_safe,
            _ => {}
        }

        // Compute the candidate sender without trusting it yet.
        let sender_sp;
        let sender_unextended_sp;
        let saved_fp;
        let sender_pc;

        if self.is_interpreted_frame() {
            if !fp_safe {
                return false;
            }
            // The raw sender sp (an address past the saved fp/return
            // pair) differs from the sender's unextended sp: the
            // current frame's locals sit between them.
            sender_sp = match self.fp_slot_addr(SENDER_SP_OFFSET) {
                Some(addr) => addr,
                None => return false,
            };
            sender_unextended_sp = match self.interpreter_frame_sender_sp(ctx) {
                Some(v) => v,
                None => return false,
            };
            saved_fp = match self.link(ctx) {
                Some(v) => v,
                None => return false,
            };
            sender_pc = match self.sender_pc(ctx) {
                Some(v) => v,
                None => return false,
            };
        } else {
            // Some sort of compiled/runtime frame; its fp need not be
            // trustworthy, but the declared frame size must be: zero
            // cannot produce a valid sender pc.
            let unit = match self.code() {
                Some(unit) => unit.clone(),
                None => return false,
            };
            if unit.frame_size() == 0 {
                return false;
            }
            sender_sp = match offset_addr(self.unextended_sp(), unit.frame_size() as isize) {
                Some(addr) => addr,
                None => return false,
            };
            if !ctx.bounds.is_in_full_stack(sender_sp) {
                return false;
            }
            sender_unextended_sp = sender_sp;
            saved_fp = match sender_sp
                .checked_sub(2 * WORD_SIZE)
                .and_then(|a| ctx.mem.read_word(a))
            {
                Some(v) => v,
                None => return false,
            };
            // Authentication may legitimately fail on a broken frame;
            // strip without verifying.
            sender_pc = match sender_sp
                .checked_sub(WORD_SIZE)
                .and_then(|a| ctx.mem.read_word(a))
            {
                Some(v) => ctx.auth.strip_pointer(v),
                None => return false,
            };
        }

        let mut sender_sp = sender_sp;
        let mut sender_pc = sender_pc;

        // The return-barrier trampoline is reused on an unrelated error
        // path, so the value alone proves nothing: confirm membership
        // before substituting the continuation-bottom sender.
        if ctx.cont.is_return_barrier(sender_pc) {
            if !ctx.cont.is_frame_in_continuation(self) {
                return false;
            }
            let bottom = ctx.cont.continuation_bottom_sender(self, sender_sp);
            sender_sp = bottom.sp();
            sender_pc = bottom.pc();
        }

        // An interpreted sender always saves a genuine frame pointer,
        // so we can validate the candidate in depth.
        if ctx.code.interpreter_contains(sender_pc) {
            if !ctx.bounds.is_in_stack_range_excl(saved_fp, sender_sp) {
                return false;
            }
            let sender = StackFrame::with_unextended_sp(
                ctx,
                sender_sp,
                sender_unextended_sp,
                saved_fp,
                sender_pc,
            );
            return sender.is_interpreted_frame_valid(ctx);
        }

        // Otherwise we must be able to account for the sender pc.
        if sender_pc == 0 {
            return false;
        }
        let sender_unit = match ctx.code.find(sender_pc) {
            Some(unit) => unit,
            None => return false,
        };
        if !sender_unit.code_contains(sender_pc) {
            return false;
        }

        // A frame from registered code is never called by an adapter.
        if sender_unit.kind() == CodeKind::AdapterBlob {
            return false;
        }

        if ctx.code.returns_to_call_stub(sender_pc) {
            // Candidate sender is an entry frame: its call-wrapper
            // record must lie within the candidate frame.
            if !ctx.bounds.is_in_stack_range_excl(saved_fp, sender_sp) {
                return false;
            }
            let sender = StackFrame::with_unextended_sp(
                ctx,
                sender_sp,
                sender_unextended_sp,
                saved_fp,
                sender_pc,
            );
            let jcw = match sender.entry_frame_call_wrapper_addr(ctx) {
                Some(addr) => addr,
                None => return false,
            };
            return ctx.bounds.is_in_stack_range_excl(jcw, sender.fp());
        } else if sender_unit.kind() == CodeKind::UpcallStub {
            // Upcall stubs are never an interior sender reached through
            // the machine stack.
            return false;
        }

        if let Some(info) = sender_unit.as_compiled() {
            if sender_unit.is_deopt_mh_entry(sender_pc)
                || sender_unit.is_deopt_entry(sender_pc)
                || info.method_handle_intrinsic
            {
                return false;
            }
        }

        // Every compiled method has a non-zero frame size: the return
        // address counts against the callee's frame.
        if sender_unit.frame_size() == 0 {
            return false;
        }

        // Anything interior calling registered code must itself be an
        // ordinary compiled method; the call stub and the interpreter
        // were covered above.
        sender_unit.is_compiled()
    }

    /// Plausibility check for a frame claiming to be interpreted.
    ///
    /// Applied both to sampled frames and to candidate senders computed
    /// by the validator; all checks are sanity bounds, not proofs.
    pub fn is_interpreted_frame_valid(&self, ctx: &WalkContext<'_>) -> bool {
        if self.fp() == 0 || self.fp() % WORD_SIZE != 0 {
            return false;
        }
        if self.sp() == 0 || self.sp() % WORD_SIZE != 0 {
            return false;
        }
        // The fixed slots below fp must not dip under sp.
        match offset_addr(self.fp(), INTERP_INITIAL_SP_OFFSET) {
            Some(initial_sp) if initial_sp >= self.sp() => {}
            _ => return false,
        }
        if self.fp() <= self.sp() {
            return false;
        }

        let method = match self.interpreter_frame_method(ctx) {
            Some(m) => m,
            None => return false,
        };
        if !ctx.methods.is_valid_method(method) {
            return false;
        }

        // An interpreter frame is never much larger than the method's
        // declared operand-stack footprint plus a fixed slack. The gap
        // is measured against the unextended sp: the raw sp may sit
        // lower because of callee locals.
        let limit = ctx
            .methods
            .max_stack(method)
            .checked_mul(STACK_ELEMENT_SIZE)
            .and_then(|b| b.checked_add(ctx.interp_frame_slack));
        let limit = match limit {
            Some(l) => l,
            None => return false,
        };
        let gap = self.fp().wrapping_sub(self.unextended_sp()) as isize;
        if gap > limit as isize {
            return false;
        }

        let bcp = match self.interpreter_frame_bcp(ctx) {
            Some(b) => b,
            None => return false,
        };
        if ctx.methods.validate_bcp(method, bcp).is_none() {
            return false;
        }

        let cache = match self.interpreter_frame_cache(ctx) {
            Some(c) => c,
            None => return false,
        };
        if !ctx.methods.is_valid_constant_cache(cache) {
            return false;
        }

        let locals = match self.interpreter_frame_locals(ctx) {
            Some(l) => l,
            None => return false,
        };
        ctx.bounds.is_in_stack_range_incl(locals, self.fp())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use beryl_code::{CodeKind, CodeUnit};

    use crate::cont::ContinuationSupport;
    use crate::context::WalkContext;
    use crate::frame::{FrameKind, StackFrame};
    use crate::testkit::{self, chain_env, TestEnv};

    #[test]
    fn test_sp_outside_usable_region_is_unsafe() {
        let env = chain_env();
        let ctx = env.ctx();
        // In the guard region.
        let f = StackFrame::new(&ctx, testkit::STACK_END + 0x10, testkit::C_FP, testkit::C_PC);
        assert!(!f.is_safe_for_sender(&ctx));
        // Entirely outside the stack.
        let f = StackFrame::new(&ctx, 0x4000, testkit::C_FP, testkit::C_PC);
        assert!(!f.is_safe_for_sender(&ctx));
    }

    #[test]
    fn test_compiled_frame_with_interpreted_sender_is_safe() {
        let env = chain_env();
        let ctx = env.ctx();
        let f = StackFrame::new(&ctx, testkit::C_SP, testkit::C_FP, testkit::C_PC);
        assert!(f.is_safe_for_sender(&ctx));
    }

    #[test]
    fn test_interpreted_frame_with_entry_sender_is_safe() {
        let env = chain_env();
        let ctx = env.ctx();
        let f = StackFrame::new(&ctx, testkit::I_SENDER_SP, testkit::I_FP, testkit::I_PC);
        assert!(f.is_safe_for_sender(&ctx));
    }

    #[test]
    fn test_interpreted_frame_with_fp_below_sp_fails_both_checks() {
        let env = chain_env();
        let ctx = env.ctx();
        let f = StackFrame::new(&ctx, testkit::I_FP, testkit::I_FP - 0x40, testkit::I_PC);
        assert!(!f.is_safe_for_sender(&ctx));
        assert!(!f.is_interpreted_frame_valid(&ctx));
    }

    #[test]
    fn test_zero_frame_size_unit_is_unsafe() {
        let env = chain_env();
        env.code.insert(
            9,
            CodeUnit::new("sizeless", CodeKind::CompiledMethod, 0x40_0000, 0x40, 0),
        );
        let ctx = env.ctx();
        let f = StackFrame::new(&ctx, testkit::C_SP, testkit::C_FP, 0x40_0010);
        assert!(!f.is_safe_for_sender(&ctx));
    }

    #[test]
    fn test_pc_before_frame_complete_point_is_unsafe() {
        let env = chain_env();
        env.code.insert(
            9,
            CodeUnit::new("late", CodeKind::CompiledMethod, 0x40_0000, 0x100, 6)
                .with_frame_complete_offset(Some(0x20)),
        );
        let ctx = env.ctx();
        let f = StackFrame::new(&ctx, testkit::C_SP, testkit::C_FP, 0x40_0008);
        assert!(!f.is_safe_for_sender(&ctx));
    }

    #[test]
    fn test_adapter_sender_is_unsafe() {
        let env = chain_env();
        env.code.insert(
            9,
            CodeUnit::new("i2c", CodeKind::AdapterBlob, 0x40_0000, 0x40, 4),
        );
        // Redirect the compiled frame's return address into the adapter.
        env.poke(testkit::I_SENDER_SP - 8, 0x40_0010);
        let ctx = env.ctx();
        let f = StackFrame::new(&ctx, testkit::C_SP, testkit::C_FP, testkit::C_PC);
        assert!(!f.is_safe_for_sender(&ctx));
    }

    #[test]
    fn test_heap_frame_is_always_safe() {
        let env = TestEnv::new();
        let ctx = env.ctx();
        let f = StackFrame::heap_frame(&ctx, 0x4000, 0x4040, testkit::C_PC);
        assert!(f.is_safe_for_sender(&ctx));
    }

    #[test]
    fn test_interpreted_frame_size_bound() {
        let env = chain_env();
        let ctx = env.ctx();
        // Oracle allows 1024 bytes of slack plus 16 stack elements; a
        // gap well past that cannot be a real interpreter frame.
        let far_sp = testkit::I_FP - 0x800;
        let f =
            StackFrame::with_unextended_sp(&ctx, far_sp, far_sp, testkit::I_FP, testkit::I_PC);
        assert!(!f.is_interpreted_frame_valid(&ctx));

        let ctx = env.ctx().with_interp_frame_slack(0x4000);
        let f =
            StackFrame::with_unextended_sp(&ctx, far_sp, far_sp, testkit::I_FP, testkit::I_PC);
        assert!(f.is_interpreted_frame_valid(&ctx));
    }

    /// Continuation mock: one barrier pc, a fixed membership answer and
    /// a pre-built bottom frame handed out on substitution.
    struct MockContinuation {
        barrier_pc: usize,
        member: bool,
        bottom: RefCell<Option<StackFrame>>,
    }

    impl ContinuationSupport for MockContinuation {
        fn is_return_barrier(&self, pc: usize) -> bool {
            pc == self.barrier_pc
        }
        fn is_frame_in_continuation(&self, _frame: &StackFrame) -> bool {
            self.member
        }
        fn continuation_bottom_sender(&self, _frame: &StackFrame, _sender_sp: usize) -> StackFrame {
            self.bottom.borrow().clone().expect("bottom frame unset")
        }
    }

    fn barrier_ctx<'a>(env: &'a TestEnv, cont: &'a MockContinuation) -> WalkContext<'a> {
        WalkContext::new(
            &env.seg,
            &env.mem,
            &env.anchor,
            &env.code,
            cont,
            &env.methods,
            &env.auth,
        )
    }

    #[test]
    fn test_return_barrier_sender_requires_membership() {
        let env = chain_env();
        let barrier_pc = 0xbbbb_0000;
        // The compiled frame now returns to the barrier trampoline.
        env.poke(testkit::I_SENDER_SP - 8, barrier_pc);

        let cont = MockContinuation {
            barrier_pc,
            member: true,
            bottom: RefCell::new(None),
        };
        let ctx = barrier_ctx(&env, &cont);
        let bottom = StackFrame::new(&ctx, testkit::I_FP, testkit::E_FP, testkit::C_PC);
        *cont.bottom.borrow_mut() = Some(bottom);

        let f = StackFrame::new(&ctx, testkit::C_SP, testkit::C_FP, testkit::C_PC);
        assert!(f.is_safe_for_sender(&ctx));

        let sender = f.sender(&ctx);
        assert_eq!(sender.sp(), testkit::I_FP);
        assert_eq!(sender.pc(), testkit::C_PC);
        assert_eq!(sender.kind(), FrameKind::Compiled);
    }

    #[test]
    fn test_return_barrier_without_membership_is_unsafe() {
        let env = chain_env();
        let barrier_pc = 0xbbbb_0000;
        env.poke(testkit::I_SENDER_SP - 8, barrier_pc);

        let cont = MockContinuation {
            barrier_pc,
            member: false,
            bottom: RefCell::new(None),
        };
        let ctx = barrier_ctx(&env, &cont);
        let f = StackFrame::new(&ctx, testkit::C_SP, testkit::C_FP, testkit::C_PC);
        assert!(!f.is_safe_for_sender(&ctx));
    }
}
