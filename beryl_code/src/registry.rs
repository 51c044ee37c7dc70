//! The pc -> code-unit directory.
//!
//! Units are indexed both by an id (registration handle) and by start
//! address, so that `find(pc)` is a single ordered-map probe rather than
//! a scan. The registry also answers the two "well-known range" queries
//! the stack walker needs: whether a pc lies inside the interpreter's
//! generated code, and whether a return address lands back in the call
//! stub (the signature of an entry frame).

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::unit::{CodeKind, CodeUnit, CodeUnitRef};

// =============================================================================
// Code Registry
// =============================================================================

/// Directory of all registered code units.
///
/// Thread-safe via internal locking. Lookups are lock-for-read only and
/// never block on registration traffic for long: mutation is rare
/// (compile / flush events), lookup is the hot path.
#[derive(Debug, Default)]
pub struct CodeRegistry {
    /// Registered units keyed by id.
    by_id: RwLock<FxHashMap<u64, CodeUnitRef>>,
    /// Units ordered by code start address for pc lookup.
    by_start: RwLock<BTreeMap<usize, CodeUnitRef>>,
    /// Address range of the interpreter's generated code, if any.
    interpreter: RwLock<Option<Range<usize>>>,
    /// Lookup hit counter.
    hits: AtomicU64,
    /// Lookup miss counter.
    misses: AtomicU64,
}

impl CodeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit under `id`. Returns the shared handle.
    ///
    /// Replaces any previous unit with the same id, unregistering its
    /// address range.
    pub fn insert(&self, id: u64, unit: CodeUnit) -> CodeUnitRef {
        let unit = CodeUnitRef::new(unit);
        let mut by_id = self.by_id.write();
        let mut by_start = self.by_start.write();
        if let Some(old) = by_id.insert(id, unit.clone()) {
            by_start.remove(&old.code_start());
        }
        by_start.insert(unit.code_start(), unit.clone());
        log::trace!(
            "code registry: insert id={} {} [{:#x}..{:#x})",
            id,
            unit.kind().name(),
            unit.code_start(),
            unit.code_end()
        );
        unit
    }

    /// Unregister the unit with the given id.
    pub fn remove(&self, id: u64) -> Option<CodeUnitRef> {
        let mut by_id = self.by_id.write();
        let removed = by_id.remove(&id);
        if let Some(ref unit) = removed {
            self.by_start.write().remove(&unit.code_start());
            log::trace!("code registry: remove id={} {}", id, unit.name());
        }
        removed
    }

    /// Resolve `pc` to the unit whose code section contains it.
    pub fn find(&self, pc: usize) -> Option<CodeUnitRef> {
        let by_start = self.by_start.read();
        let found = by_start
            .range(..=pc)
            .next_back()
            .map(|(_, unit)| unit.clone())
            .filter(|unit| unit.code_contains(pc));
        drop(by_start);

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Look up a registered unit by id.
    #[inline]
    pub fn get(&self, id: u64) -> Option<CodeUnitRef> {
        self.by_id.read().get(&id).cloned()
    }

    /// Record the interpreter's generated-code range.
    pub fn set_interpreter_range(&self, range: Range<usize>) {
        *self.interpreter.write() = Some(range);
    }

    /// Whether `pc` lies inside the interpreter's generated code.
    #[inline]
    pub fn interpreter_contains(&self, pc: usize) -> bool {
        self.interpreter
            .read()
            .as_ref()
            .is_some_and(|r| r.contains(&pc))
    }

    /// Whether a return address lands in the call stub, i.e. the frame
    /// returning there is an entry frame.
    #[inline]
    pub fn returns_to_call_stub(&self, pc: usize) -> bool {
        self.find(pc)
            .is_some_and(|unit| unit.kind() == CodeKind::CallStub)
    }

    /// Number of registered units.
    #[inline]
    pub fn len(&self) -> usize {
        self.by_id.read().len()
    }

    /// Whether the registry is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lookup statistics.
    #[inline]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Lookup counters for the registry.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegistryStats {
    /// Lookups that resolved a unit.
    pub hits: u64,
    /// Lookups that found no unit.
    pub misses: u64,
}

impl RegistryStats {
    /// Fraction of lookups that hit.
    #[inline]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn stub(start: usize, size: usize) -> CodeUnit {
        CodeUnit::new("stub", CodeKind::RuntimeStub, start, size, 4)
    }

    #[test]
    fn test_find_resolves_containing_unit() {
        let reg = CodeRegistry::new();
        reg.insert(1, stub(0x1000, 0x100));
        reg.insert(2, stub(0x2000, 0x100));

        assert_eq!(reg.find(0x1050).unwrap().code_start(), 0x1000);
        assert_eq!(reg.find(0x2000).unwrap().code_start(), 0x2000);
        // gap between the units
        assert!(reg.find(0x1a00).is_none());
        // below the lowest unit
        assert!(reg.find(0x500).is_none());
    }

    #[test]
    fn test_insert_replaces_same_id() {
        let reg = CodeRegistry::new();
        reg.insert(7, stub(0x1000, 0x100));
        reg.insert(7, stub(0x3000, 0x100));

        assert_eq!(reg.len(), 1);
        assert!(reg.find(0x1050).is_none());
        assert!(reg.find(0x3050).is_some());
    }

    #[test]
    fn test_remove_unregisters_range() {
        let reg = CodeRegistry::new();
        reg.insert(1, stub(0x1000, 0x100));
        assert!(reg.remove(1).is_some());
        assert!(reg.find(0x1050).is_none());
        assert!(reg.remove(1).is_none());
    }

    #[test]
    fn test_interpreter_range() {
        let reg = CodeRegistry::new();
        assert!(!reg.interpreter_contains(0x4000));
        reg.set_interpreter_range(0x4000..0x5000);
        assert!(reg.interpreter_contains(0x4000));
        assert!(reg.interpreter_contains(0x4fff));
        assert!(!reg.interpreter_contains(0x5000));
    }

    #[test]
    fn test_returns_to_call_stub() {
        let reg = CodeRegistry::new();
        reg.insert(
            1,
            CodeUnit::new("call stub", CodeKind::CallStub, 0x6000, 0x80, 8),
        );
        assert!(reg.returns_to_call_stub(0x6040));
        assert!(!reg.returns_to_call_stub(0x1000));
    }

    #[test]
    fn test_stats_track_hits_and_misses() {
        let reg = CodeRegistry::new();
        reg.insert(1, stub(0x1000, 0x100));
        reg.find(0x1000);
        reg.find(0x9000);
        reg.find(0x9000);
        let stats = reg.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert!((stats.hit_rate() - 1.0 / 3.0).abs() < 1e-9);
    }
}
