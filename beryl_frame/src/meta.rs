//! Method metadata predicates.
//!
//! An interpreter frame holds raw metadata words (method reference,
//! bytecode position, constant-pool cache). The walker never chases
//! them itself; it asks the runtime's metadata tables whether a word it
//! read out of a questionable frame points at anything real.

/// Runtime metadata validity predicates.
pub trait MethodOracle {
    /// Whether `method_ref` is a live, well-formed method reference.
    fn is_valid_method(&self, method_ref: usize) -> bool;

    /// Decode `bcp` to a bytecode index within `method_ref`, or `None`
    /// if it does not fall inside the method's bytecode.
    fn validate_bcp(&self, method_ref: usize, bcp: usize) -> Option<u32>;

    /// The method's declared maximum operand-stack depth, in elements.
    fn max_stack(&self, method_ref: usize) -> usize;

    /// Whether `cache_ref` is a live constant-pool cache reference.
    fn is_valid_constant_cache(&self, cache_ref: usize) -> bool;
}

/// Oracle that recognizes nothing. Suitable when no interpreter frames
/// can occur (pure-native walks, unit tests of other frame kinds).
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMethodOracle;

impl MethodOracle for NullMethodOracle {
    #[inline]
    fn is_valid_method(&self, _method_ref: usize) -> bool {
        false
    }

    #[inline]
    fn validate_bcp(&self, _method_ref: usize, _bcp: usize) -> Option<u32> {
        None
    }

    #[inline]
    fn max_stack(&self, _method_ref: usize) -> usize {
        0
    }

    #[inline]
    fn is_valid_constant_cache(&self, _cache_ref: usize) -> bool {
        false
    }
}
