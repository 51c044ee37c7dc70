//! The return-address patch protocol.
//!
//! Deoptimization redirects an optimized frame's return address to a
//! landing pad; the pre-deopt pc is stashed in the frame so the logical
//! pc can keep pointing at real code. Two independent deoptimization
//! triggers can race to patch the same frame: patching in the value
//! already there is tolerated; any other mismatch is a fatal invariant
//! violation, since continuing would silently corrupt control flow.

use crate::context::WalkContext;
use crate::layout::WORD_SIZE;

use super::{DeoptState, StackFrame};

impl StackFrame {
    /// Rewrite this frame's stored return address to `new_pc` and
    /// settle the deoptimization state.
    ///
    /// The store is re-signed under the platform's authentication
    /// scheme; the frame's logical pc is the unsigned target. If the
    /// updated pc turns out to be a deopt landing pad, the logical pc
    /// becomes the stashed original instead.
    pub fn patch_pc(&mut self, ctx: &WalkContext<'_>, new_pc: usize) {
        debug_assert_eq!(
            ctx.code.find(new_pc).map(|u| u.code_start()),
            self.code().map(|u| u.code_start()),
            "unexpected pc"
        );

        let pc_addr = self.sp().checked_sub(WORD_SIZE).expect("sp underflow");
        let stored = ctx
            .mem
            .read_word(pc_addr)
            .expect("unreadable return-address slot");
        let pc_old = ctx.auth.strip_verifiable(stored);
        let signed_pc = ctx.auth.sign_return_address(new_pc);

        log::trace!(
            "patch_pc at address {:#x} [{:#x} -> {:#x}] [signed {:#x} -> {:#x}]",
            pc_addr,
            pc_old,
            new_pc,
            stored,
            signed_pc
        );

        assert!(
            !ctx.cont.is_return_barrier(pc_old),
            "patching over a return barrier"
        );
        // Either the return address is the original one or we are
        // patching in the same address that is already there.
        assert!(
            self.pc() == pc_old || new_pc == pc_old || pc_old == 0,
            "return address moved under us: logical {:#x}, stored {:#x}, new {:#x}",
            self.pc(),
            pc_old,
            new_pc
        );

        let old_pc = self.pc;
        let wrote = ctx.mem.write_word(pc_addr, signed_pc);
        assert!(wrote, "unwritable return-address slot");

        // Must be set before the original-pc lookup: the stash query is
        // indexed by the updated pc field.
        self.pc = new_pc;
        match self.deopt_original_pc(ctx) {
            Some(original) => {
                debug_assert_eq!(
                    original, old_pc,
                    "expected original pc to be stashed before patching"
                );
                self.deopt_state = DeoptState::IsDeoptimized;
                self.pc = original;
            }
            None => self.deopt_state = DeoptState::NotDeoptimized,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use crate::context::WalkContext;
    use crate::frame::{DeoptState, StackFrame};
    use crate::pauth::{HighBitsAuth, PointerAuth};
    use crate::stack::StackMemory;
    use crate::testkit::{self, TestEnv};

    const DEOPT_PC: usize = testkit::METHOD_START + 0x80;
    const STASH_ADDR: usize = testkit::C_SP + 4 * 8;

    /// Frame of the compiled method with its return-address slot
    /// holding its own pc, as left by a call into the runtime.
    fn compiled_frame<'a>(env: &'a TestEnv, ctx: &WalkContext<'a>) -> StackFrame {
        env.poke(testkit::C_SP - 8, testkit::C_PC);
        StackFrame::new(ctx, testkit::C_SP, testkit::C_FP, testkit::C_PC)
    }

    #[test]
    fn test_patch_to_ordinary_pc() {
        let env = TestEnv::new();
        let ctx = env.ctx();
        let mut f = compiled_frame(&env, &ctx);
        let new_pc = testkit::METHOD_START + 0x60;

        f.patch_pc(&ctx, new_pc);
        assert_eq!(f.pc(), new_pc);
        assert_eq!(f.deopt_state(), DeoptState::NotDeoptimized);
        assert_eq!(env.mem.read_word(testkit::C_SP - 8), Some(new_pc));
    }

    #[test]
    fn test_patch_to_deopt_landing_pad_restores_original() {
        let env = TestEnv::new();
        // The deoptimizer stashes the pre-patch pc in the frame first.
        env.poke(STASH_ADDR, testkit::C_PC);
        let ctx = env.ctx();
        let mut f = compiled_frame(&env, &ctx);

        f.patch_pc(&ctx, DEOPT_PC);
        // Stored return address is the landing pad; the logical pc
        // stays at real code.
        assert_eq!(env.mem.read_word(testkit::C_SP - 8), Some(DEOPT_PC));
        assert_eq!(f.pc(), testkit::C_PC);
        assert_eq!(f.deopt_state(), DeoptState::IsDeoptimized);
    }

    #[test]
    fn test_repatching_same_value_is_tolerated() {
        let env = TestEnv::new();
        env.poke(STASH_ADDR, testkit::C_PC);
        let ctx = env.ctx();
        let mut f = compiled_frame(&env, &ctx);

        f.patch_pc(&ctx, DEOPT_PC);
        // A second deoptimization trigger racing on the same frame.
        f.patch_pc(&ctx, DEOPT_PC);
        assert_eq!(f.pc(), testkit::C_PC);
        assert_eq!(f.deopt_state(), DeoptState::IsDeoptimized);
    }

    #[test]
    #[should_panic(expected = "return address moved")]
    fn test_patch_over_foreign_value_panics() {
        let env = TestEnv::new();
        let ctx = env.ctx();
        env.poke(testkit::C_SP - 8, testkit::METHOD_START + 0x4c);
        let mut f = StackFrame::new(&ctx, testkit::C_SP, testkit::C_FP, testkit::C_PC);
        f.patch_pc(&ctx, testkit::METHOD_START + 0x60);
    }

    #[test]
    fn test_patch_signs_the_stored_value() {
        let env = TestEnv::new();
        let auth = HighBitsAuth::new(0x7a7a);
        let ctx = WalkContext::new(
            &env.seg,
            &env.mem,
            &env.anchor,
            &env.code,
            &env.cont,
            &env.methods,
            &auth,
        );
        let mut f = compiled_frame(&env, &ctx);
        let new_pc = testkit::METHOD_START + 0x60;

        f.patch_pc(&ctx, new_pc);
        let stored = env.mem.read_word(testkit::C_SP - 8).unwrap();
        assert_ne!(stored, new_pc);
        assert_eq!(auth.strip_pointer(stored), new_pc);
        assert_eq!(f.pc(), new_pc);
    }
}
