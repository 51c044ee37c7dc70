//! Return-address pointer-authentication strategy.
//!
//! On targets with return-address signing, a value read out of a return
//! slot carries a signature in its high bits and must be stripped before
//! it can be compared or classified; a value written back must be
//! re-signed. The walker treats this as a swappable strategy applied
//! exactly at the boundary between "word read from possibly-untrusted
//! memory" and "logical pc", so targets without the feature pay nothing.
//!
//! The strategy must be an injective pair: `strip(sign(x)) == x`.

/// Platform return-address signing strategy.
pub trait PointerAuth {
    /// Sign a logical pc for storage in a return-address slot.
    fn sign_return_address(&self, pc: usize) -> usize;

    /// Strip a signature without authenticating. Used on values that may
    /// come from a broken frame, where authentication itself could trap.
    fn strip_pointer(&self, word: usize) -> usize;

    /// Strip a signature from a value expected to be well formed. May
    /// verify the signature in debug builds.
    fn strip_verifiable(&self, word: usize) -> usize {
        self.strip_pointer(word)
    }
}

/// Identity strategy for targets without return-address signing.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityAuth;

impl PointerAuth for IdentityAuth {
    #[inline]
    fn sign_return_address(&self, pc: usize) -> usize {
        pc
    }

    #[inline]
    fn strip_pointer(&self, word: usize) -> usize {
        word
    }
}

/// Strategy that signs by mixing a key into the unused high bits of a
/// canonical address. Suitable for targets that reserve the top 16 bits.
#[derive(Debug, Clone, Copy)]
pub struct HighBitsAuth {
    /// Signing key placed in the top 16 bits.
    key: u16,
}

impl HighBitsAuth {
    const SHIFT: u32 = usize::BITS - 16;
    const ADDR_MASK: usize = usize::MAX >> 16;

    /// Create a strategy with the given signing key.
    pub fn new(key: u16) -> Self {
        Self { key }
    }
}

impl PointerAuth for HighBitsAuth {
    #[inline]
    fn sign_return_address(&self, pc: usize) -> usize {
        (pc & Self::ADDR_MASK) | ((self.key as usize) << Self::SHIFT)
    }

    #[inline]
    fn strip_pointer(&self, word: usize) -> usize {
        word & Self::ADDR_MASK
    }

    #[inline]
    fn strip_verifiable(&self, word: usize) -> usize {
        debug_assert!(
            word >> Self::SHIFT == self.key as usize || word >> Self::SHIFT == 0,
            "return address signature mismatch: {:#x}",
            word
        );
        word & Self::ADDR_MASK
    }
}
