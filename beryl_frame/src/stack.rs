//! Thread stack bounds and checked stack-word access.
//!
//! Cross-thread walks read memory the owning thread may be mutating, so
//! every dereference goes through [`StackMemory`], and every address is
//! first vetted against [`StackBounds`]. Reads are best effort: an
//! address the bounds oracle rejects, or that the memory view cannot
//! service, simply yields `None` and the walk path treats the frame as
//! unsafe.

use parking_lot::RwLock;

use crate::layout::WORD_SIZE;

// =============================================================================
// Stack Bounds
// =============================================================================

/// Per-thread address-range predicates over the machine stack.
///
/// "Usable" excludes guard pages; "full" includes them, since interpreter
/// callees legitimately hold addresses a strict usable-region test
/// would reject.
pub trait StackBounds {
    /// Whether `addr` lies in the usable stack region (guards excluded).
    fn is_in_usable_stack(&self, addr: usize) -> bool;

    /// Whether `addr` lies anywhere in the stack, guard pages included.
    fn is_in_full_stack(&self, addr: usize) -> bool;

    /// Whether `addr` lies in the stack strictly above `limit`.
    fn is_in_stack_range_excl(&self, addr: usize, limit: usize) -> bool;

    /// Whether `addr` lies in the stack at or above `limit`.
    fn is_in_stack_range_incl(&self, addr: usize, limit: usize) -> bool;
}

/// Concrete stack segment: `[end, base)` with a guard region of
/// `guard_size` bytes at the low (growth) end.
#[derive(Debug, Clone, Copy)]
pub struct StackSegment {
    /// One past the highest stack address.
    base: usize,
    /// Lowest stack address, including guards.
    end: usize,
    /// Guard region size in bytes at the low end.
    guard_size: usize,
}

impl StackSegment {
    /// Create a segment covering `[end, base)` with the given guard size.
    pub fn new(base: usize, end: usize, guard_size: usize) -> Self {
        debug_assert!(end < base);
        debug_assert!(guard_size <= base - end);
        Self {
            base,
            end,
            guard_size,
        }
    }

    /// One past the highest stack address.
    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    /// Lowest stack address.
    #[inline]
    pub fn end(&self) -> usize {
        self.end
    }
}

impl StackBounds for StackSegment {
    #[inline]
    fn is_in_usable_stack(&self, addr: usize) -> bool {
        addr >= self.end + self.guard_size && addr < self.base
    }

    #[inline]
    fn is_in_full_stack(&self, addr: usize) -> bool {
        addr >= self.end && addr < self.base
    }

    #[inline]
    fn is_in_stack_range_excl(&self, addr: usize, limit: usize) -> bool {
        addr < self.base && addr > limit
    }

    #[inline]
    fn is_in_stack_range_incl(&self, addr: usize, limit: usize) -> bool {
        addr < self.base && addr >= limit
    }
}

// =============================================================================
// Stack Memory
// =============================================================================

/// Checked access to stack words.
///
/// `read_word` returns `None` for any address the view cannot service
/// (misaligned, outside the view). Callers on the validation path treat
/// `None` as "frame not trustworthy"; callers on the trusted sender
/// path treat it as a caller contract violation.
pub trait StackMemory {
    /// Read the word at `addr`.
    fn read_word(&self, addr: usize) -> Option<usize>;

    /// Write the word at `addr`. Returns `false` if the view cannot
    /// service the address.
    fn write_word(&self, addr: usize, value: usize) -> bool;
}

/// Direct access to the live machine stack, for self-walks.
///
/// Carries no range information of its own: the caller must vet every
/// address against the thread's [`StackBounds`] first. The only check
/// performed here is word alignment.
#[derive(Debug, Default, Clone, Copy)]
pub struct LiveStackMemory;

impl StackMemory for LiveStackMemory {
    #[inline]
    fn read_word(&self, addr: usize) -> Option<usize> {
        if addr % WORD_SIZE != 0 {
            return None;
        }
        // SAFETY: the walk discipline requires addr to have passed a
        // stack-bounds check on the current thread's own stack, which is
        // mapped and readable for its entire range.
        Some(unsafe { std::ptr::read_volatile(addr as *const usize) })
    }

    #[inline]
    fn write_word(&self, addr: usize, value: usize) -> bool {
        if addr % WORD_SIZE != 0 {
            return false;
        }
        // SAFETY: as for read_word; patching only ever targets a slot of
        // the current thread's own frame.
        unsafe { std::ptr::write_volatile(addr as *mut usize, value) };
        true
    }
}

/// A copied stack image presented at its original addresses.
///
/// Used when walking a captured stack (crash dump, stopped thread) and
/// as the bounds-checked memory mock in tests: any access outside the
/// captured range yields `None` instead of touching live memory.
#[derive(Debug)]
pub struct SnapshotMemory {
    /// Address the first captured word had in the target.
    start: usize,
    /// Captured words, low address first.
    words: RwLock<Vec<usize>>,
}

impl SnapshotMemory {
    /// Create a zero-filled snapshot of `len` words starting at `start`.
    ///
    /// `start` must be word aligned.
    pub fn new(start: usize, len: usize) -> Self {
        assert_eq!(start % WORD_SIZE, 0, "snapshot start must be aligned");
        Self {
            start,
            words: RwLock::new(vec![0; len]),
        }
    }

    /// Create a snapshot from captured words.
    pub fn from_words(start: usize, words: Vec<usize>) -> Self {
        assert_eq!(start % WORD_SIZE, 0, "snapshot start must be aligned");
        Self {
            start,
            words: RwLock::new(words),
        }
    }

    /// Address of the first captured word.
    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    /// One past the last captured address.
    #[inline]
    pub fn end(&self) -> usize {
        self.start + self.words.read().len() * WORD_SIZE
    }

    /// Index of `addr` within the image, if aligned and in range.
    #[inline]
    fn index_of(&self, addr: usize) -> Option<usize> {
        if addr % WORD_SIZE != 0 || addr < self.start {
            return None;
        }
        let idx = (addr - self.start) / WORD_SIZE;
        if idx < self.words.read().len() {
            Some(idx)
        } else {
            None
        }
    }
}

impl StackMemory for SnapshotMemory {
    #[inline]
    fn read_word(&self, addr: usize) -> Option<usize> {
        let idx = self.index_of(addr)?;
        Some(self.words.read()[idx])
    }

    #[inline]
    fn write_word(&self, addr: usize, value: usize) -> bool {
        match self.index_of(addr) {
            Some(idx) => {
                self.words.write()[idx] = value;
                true
            }
            None => false,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_usable_excludes_guard() {
        let seg = StackSegment::new(0x9000, 0x1000, 0x800);
        assert!(!seg.is_in_usable_stack(0x1000));
        assert!(!seg.is_in_usable_stack(0x17f8));
        assert!(seg.is_in_usable_stack(0x1800));
        assert!(seg.is_in_usable_stack(0x8ff8));
        assert!(!seg.is_in_usable_stack(0x9000));
    }

    #[test]
    fn test_segment_full_includes_guard() {
        let seg = StackSegment::new(0x9000, 0x1000, 0x800);
        assert!(seg.is_in_full_stack(0x1000));
        assert!(seg.is_in_full_stack(0x17f8));
        assert!(!seg.is_in_full_stack(0xff8));
        assert!(!seg.is_in_full_stack(0x9000));
    }

    #[test]
    fn test_segment_range_checks() {
        let seg = StackSegment::new(0x9000, 0x1000, 0);
        assert!(seg.is_in_stack_range_excl(0x2008, 0x2000));
        assert!(!seg.is_in_stack_range_excl(0x2000, 0x2000));
        assert!(seg.is_in_stack_range_incl(0x2000, 0x2000));
        assert!(!seg.is_in_stack_range_excl(0x9000, 0x2000));
    }

    #[test]
    fn test_snapshot_bounds_checked() {
        let mem = SnapshotMemory::new(0x1000, 4);
        assert_eq!(mem.read_word(0x1000), Some(0));
        assert_eq!(mem.read_word(0x1000 + 3 * WORD_SIZE), Some(0));
        assert_eq!(mem.read_word(0x1000 + 4 * WORD_SIZE), None);
        assert_eq!(mem.read_word(0xff8), None);
        // misaligned
        assert_eq!(mem.read_word(0x1001), None);
    }

    #[test]
    fn test_snapshot_write_and_read_back() {
        let mem = SnapshotMemory::new(0x1000, 4);
        assert!(mem.write_word(0x1000 + WORD_SIZE, 0xdead));
        assert_eq!(mem.read_word(0x1000 + WORD_SIZE), Some(0xdead));
        assert!(!mem.write_word(0x2000, 1));
    }

    #[test]
    fn test_live_memory_rejects_misaligned() {
        let mem = LiveStackMemory;
        assert_eq!(mem.read_word(0x1003), None);
        assert!(!mem.write_word(0x1003, 0));
    }
}
