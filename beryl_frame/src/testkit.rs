//! Shared scaffolding for the frame-walk unit tests: a synthetic stack
//! image plus table-driven metadata, all at fixed fake addresses.

use std::ops::Range;

use beryl_code::{CodeKind, CodeRegistry, CodeUnit, CompiledInfo};

use crate::anchor::FrameAnchor;
use crate::cont::NoContinuations;
use crate::context::WalkContext;
use crate::meta::MethodOracle;
use crate::pauth::IdentityAuth;
use crate::stack::{SnapshotMemory, StackMemory, StackSegment};

/// Method oracle backed by a single known method.
#[derive(Debug, Clone)]
pub struct TableMethodOracle {
    pub method: usize,
    pub bytecode: Range<usize>,
    pub max_stack: usize,
    pub cache: usize,
}

impl MethodOracle for TableMethodOracle {
    fn is_valid_method(&self, method_ref: usize) -> bool {
        method_ref == self.method
    }

    fn validate_bcp(&self, method_ref: usize, bcp: usize) -> Option<u32> {
        if method_ref == self.method && self.bytecode.contains(&bcp) {
            Some((bcp - self.bytecode.start) as u32)
        } else {
            None
        }
    }

    fn max_stack(&self, _method_ref: usize) -> usize {
        self.max_stack
    }

    fn is_valid_constant_cache(&self, cache_ref: usize) -> bool {
        cache_ref == self.cache
    }
}

/// Fake stack span: `[0x8000, 0x10000)` with a 0x1000-byte guard.
pub const STACK_END: usize = 0x8000;
pub const STACK_BASE: usize = 0x10000;
pub const GUARD_SIZE: usize = 0x1000;

/// Fake code addresses.
pub const INTERP_RANGE: Range<usize> = 0x10_0000..0x10_1000;
pub const METHOD_START: usize = 0x20_0000;
pub const CALL_STUB_START: usize = 0x30_0000;

/// Fake metadata words recognized by [`TableMethodOracle`].
pub const METHOD_REF: usize = 0x5000;
pub const BCP_BASE: usize = 0x6000;
pub const CACHE_REF: usize = 0x7000;

/// One synthetic walk target: bounds, zeroed stack image, registry with
/// an interpreter range, a six-word compiled method and the call stub,
/// plus the trivial strategy implementations.
pub struct TestEnv {
    pub seg: StackSegment,
    pub mem: SnapshotMemory,
    pub anchor: FrameAnchor,
    pub code: CodeRegistry,
    pub cont: NoContinuations,
    pub methods: TableMethodOracle,
    pub auth: IdentityAuth,
}

impl TestEnv {
    pub fn new() -> Self {
        let code = CodeRegistry::new();
        code.set_interpreter_range(INTERP_RANGE);
        code.insert(
            1,
            CodeUnit::new("m", CodeKind::CompiledMethod, METHOD_START, 0x100, 6)
                .with_compiled_info(CompiledInfo {
                    method: METHOD_REF,
                    deopt_entry_offset: Some(0x80),
                    deopt_mh_entry_offset: None,
                    orig_pc_slot: 4,
                    method_handle_intrinsic: false,
                }),
        );
        code.insert(
            2,
            CodeUnit::new("call_stub", CodeKind::CallStub, CALL_STUB_START, 0x40, 4),
        );

        Self {
            seg: StackSegment::new(STACK_BASE, STACK_END, GUARD_SIZE),
            mem: SnapshotMemory::new(STACK_END, (STACK_BASE - STACK_END) / 8),
            anchor: FrameAnchor::unset(),
            code,
            cont: NoContinuations,
            methods: TableMethodOracle {
                method: METHOD_REF,
                bytecode: BCP_BASE..BCP_BASE + 0x100,
                max_stack: 16,
                cache: CACHE_REF,
            },
            auth: IdentityAuth,
        }
    }

    pub fn ctx(&self) -> WalkContext<'_> {
        WalkContext::new(
            &self.seg,
            &self.mem,
            &self.anchor,
            &self.code,
            &self.cont,
            &self.methods,
            &self.auth,
        )
    }

    /// Store `value` at `addr` in the stack image.
    pub fn poke(&self, addr: usize, value: usize) {
        assert!(self.mem.write_word(addr, value), "poke outside image");
    }
}

// =============================================================================
// Canned Frame Chain
// =============================================================================

/// Addresses of the canned chain laid out by [`chain_env`]: a compiled
/// frame on top, called by an interpreter frame, called from native
/// code through the call stub.
pub const C_SP: usize = 0xfa00;
pub const C_FP: usize = 0xfa20;
pub const C_PC: usize = METHOD_START + 0x40;
pub const I_SENDER_SP: usize = C_SP + 6 * 8;
pub const I_FP: usize = 0xfb00;
pub const I_PC: usize = 0x10_0020;
pub const E_FP: usize = 0xfe00;
pub const E_PC: usize = CALL_STUB_START + 0x10;
pub const E_UNEXTENDED_SP: usize = 0xfd00;
pub const E_JCW: usize = 0xff00;

/// Environment pre-populated with the canned three-frame chain.
pub fn chain_env() -> TestEnv {
    let env = TestEnv::new();

    // Compiled frame: saved fp and return address at the top of its
    // fixed-size allocation.
    env.poke(I_SENDER_SP - 16, I_FP);
    env.poke(I_SENDER_SP - 8, I_PC);

    // Interpreter frame slots, fp relative.
    env.poke(I_FP, E_FP);
    env.poke(I_FP + 8, E_PC);
    env.poke(I_FP - 8, E_UNEXTENDED_SP);
    env.poke(I_FP - 24, METHOD_REF);
    env.poke(I_FP - 56, CACHE_REF);
    env.poke(I_FP - 64, 2); // locals, fp-relative words
    env.poke(I_FP - 72, BCP_BASE + 0x10);

    // Entry frame: call-wrapper pointer; the wrapper's anchor stays
    // zeroed, marking the outermost managed activation.
    env.poke(E_FP - 64, E_JCW);

    env
}
