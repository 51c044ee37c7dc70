//! The transition anchor between managed and native execution.
//!
//! When a thread calls out of managed code it records its last managed
//! sp and fp in its anchor; capturing the pc as well on every call-out
//! would cost a store that is wasted unless somebody actually walks the
//! stack, so the pc slot stays empty until [`FrameAnchor::make_walkable`]
//! fills it in on demand.
//!
//! Anchors also appear embedded in target stack memory: the entry
//! frame's call-wrapper record and the upcall stub's frame-data record
//! both begin with one, loaded via [`FrameAnchor::load`].

use crate::layout::{offset_addr, WORD_SIZE};
use crate::stack::StackMemory;

/// Last-managed-frame anchor: `{sp, fp, pc}`, zero meaning unset.
///
/// States: *unset* (no pending call-out, `last_sp == 0`),
/// *set-not-walkable* (`last_pc == 0`), *set-walkable*. The
/// not-walkable -> walkable transition happens exactly once and is not
/// safe for concurrent callers on the same anchor.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameAnchor {
    /// Sp of the last managed frame, 0 if no call-out is pending.
    last_sp: usize,
    /// Fp of the last managed frame.
    last_fp: usize,
    /// Pc of the last managed frame, 0 until captured.
    last_pc: usize,
}

impl FrameAnchor {
    /// An unset anchor.
    pub const fn unset() -> Self {
        Self {
            last_sp: 0,
            last_fp: 0,
            last_pc: 0,
        }
    }

    /// Record a call-out with the pc left uncaptured.
    pub fn set_last_frame(&mut self, sp: usize, fp: usize) {
        self.last_sp = sp;
        self.last_fp = fp;
        self.last_pc = 0;
    }

    /// Record a fully captured last frame.
    pub fn set_last_frame_with_pc(&mut self, sp: usize, fp: usize, pc: usize) {
        self.last_sp = sp;
        self.last_fp = fp;
        self.last_pc = pc;
    }

    /// Clear the anchor when the call-out returns.
    pub fn clear(&mut self) {
        self.last_pc = 0;
        self.last_fp = 0;
        // sp cleared last: a concurrent observer testing has_last_frame
        // must not see a half-cleared anchor as set.
        self.last_sp = 0;
    }

    /// Whether a call-out is recorded.
    #[inline]
    pub fn has_last_frame(&self) -> bool {
        self.last_sp != 0
    }

    /// Whether the pc has been captured.
    #[inline]
    pub fn walkable(&self) -> bool {
        self.last_pc != 0
    }

    /// Sp of the last managed frame (0 when unset).
    #[inline]
    pub fn last_sp(&self) -> usize {
        self.last_sp
    }

    /// Fp of the last managed frame.
    #[inline]
    pub fn last_fp(&self) -> usize {
        self.last_fp
    }

    /// Pc of the last managed frame (0 until captured).
    #[inline]
    pub fn last_pc(&self) -> usize {
        self.last_pc
    }

    /// Capture the last frame's pc from the word below its sp.
    ///
    /// No-op if no call-out is recorded or the pc is already captured;
    /// otherwise reads the stack word exactly once.
    pub fn make_walkable(&mut self, mem: &dyn StackMemory) {
        if !self.has_last_frame() {
            return;
        }
        if self.walkable() {
            return;
        }
        let slot = self
            .last_sp
            .checked_sub(WORD_SIZE)
            .expect("anchor sp underflow");
        self.last_pc = mem
            .read_word(slot)
            .expect("anchor return-address slot unreadable");
        debug_assert!(self.walkable(), "captured pc is null");
    }

    /// Load an anchor record embedded in target memory at `addr`
    /// (layout: sp, fp, pc in consecutive words).
    pub fn load(mem: &dyn StackMemory, addr: usize) -> Option<Self> {
        let sp = mem.read_word(addr)?;
        let fp = mem.read_word(offset_addr(addr, 1)?)?;
        let pc = mem.read_word(offset_addr(addr, 2)?)?;
        Some(Self {
            last_sp: sp,
            last_fp: fp,
            last_pc: pc,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::SnapshotMemory;

    /// Memory wrapper counting reads, to pin down the "touch the stack
    /// word only once" property.
    struct CountingMemory {
        inner: SnapshotMemory,
        reads: std::cell::Cell<usize>,
    }

    impl StackMemory for CountingMemory {
        fn read_word(&self, addr: usize) -> Option<usize> {
            self.reads.set(self.reads.get() + 1);
            self.inner.read_word(addr)
        }
        fn write_word(&self, addr: usize, value: usize) -> bool {
            self.inner.write_word(addr, value)
        }
    }

    #[test]
    fn test_make_walkable_noop_when_unset() {
        let mem = SnapshotMemory::new(0x1000, 8);
        let mut anchor = FrameAnchor::unset();
        anchor.make_walkable(&mem);
        assert!(!anchor.has_last_frame());
        assert!(!anchor.walkable());
    }

    #[test]
    fn test_make_walkable_captures_pc_once() {
        let mem = CountingMemory {
            inner: SnapshotMemory::new(0x1000, 8),
            reads: std::cell::Cell::new(0),
        };
        let sp = 0x1000 + 4 * WORD_SIZE;
        mem.inner.write_word(sp - WORD_SIZE, 0xbeef);

        let mut anchor = FrameAnchor::unset();
        anchor.set_last_frame(sp, sp + 2 * WORD_SIZE);
        assert!(anchor.has_last_frame());
        assert!(!anchor.walkable());

        anchor.make_walkable(&mem);
        assert!(anchor.walkable());
        assert_eq!(anchor.last_pc(), 0xbeef);
        assert_eq!(mem.reads.get(), 1);

        // Idempotent: second call reads nothing and changes nothing.
        anchor.make_walkable(&mem);
        assert_eq!(anchor.last_pc(), 0xbeef);
        assert_eq!(mem.reads.get(), 1);
    }

    #[test]
    fn test_clear_resets_state() {
        let mut anchor = FrameAnchor::unset();
        anchor.set_last_frame_with_pc(0x2000, 0x2040, 0x99);
        assert!(anchor.walkable());
        anchor.clear();
        assert!(!anchor.has_last_frame());
        assert!(!anchor.walkable());
    }

    #[test]
    fn test_load_from_memory() {
        let mem = SnapshotMemory::new(0x1000, 8);
        mem.write_word(0x1000, 0x5000);
        mem.write_word(0x1000 + WORD_SIZE, 0x5040);
        mem.write_word(0x1000 + 2 * WORD_SIZE, 0x77);

        let anchor = FrameAnchor::load(&mem, 0x1000).unwrap();
        assert_eq!(anchor.last_sp(), 0x5000);
        assert_eq!(anchor.last_fp(), 0x5040);
        assert_eq!(anchor.last_pc(), 0x77);
        assert!(FrameAnchor::load(&mem, 0x1000 + 6 * WORD_SIZE).is_none());
    }
}
