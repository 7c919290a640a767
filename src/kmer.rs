//! Rolling k-mer windows
//!
//! A [`KmerWindow`] accumulates 2-bit base codes one at a time and reports
//! when it holds a full k-mer. Any invalid base resets the window, so a
//! k-mer is only *full* after `len` consecutive valid bases. The packed
//! value is most-significant-first: the last inserted base occupies the
//! low-order bits, matching [`crate::codec::pack_2bit`] and therefore the
//! anchor dictionary encoding.

/// How a k-mer value is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KmerMode {
    /// Forward-strand value only
    #[default]
    Direct,
    /// Minimum of the forward value and its reverse complement
    Canonical,
}

/// A rolling window over `len` bases, packed 2 bits per base.
#[derive(Debug, Clone)]
pub struct KmerWindow {
    len: u32,
    mask: u64,
    mode: KmerMode,
    fwd: u64,
    rc: u64,
    filled: u32,
}

impl KmerWindow {
    /// Creates an empty window for k-mers of `len` bases (1..=32).
    pub fn new(len: u32, mode: KmerMode) -> Self {
        debug_assert!((1..=32).contains(&len));
        let mask = if len == 32 { u64::MAX } else { (1u64 << (2 * len)) - 1 };
        Self {
            len,
            mask,
            mode,
            fwd: 0,
            rc: 0,
            filled: 0,
        }
    }

    /// Shifts a valid base code (0-3) into the window.
    #[inline]
    pub fn insert(&mut self, code: u8) {
        debug_assert!(code < 4);
        self.fwd = ((self.fwd << 2) | u64::from(code)) & self.mask;
        if self.mode == KmerMode::Canonical {
            self.rc = (self.rc >> 2) | (u64::from(3 - code) << (2 * (self.len - 1)));
        }
        if self.filled < self.len {
            self.filled += 1;
        }
    }

    /// Empties the window; called on any invalid base.
    #[inline]
    pub fn reset(&mut self) {
        self.fwd = 0;
        self.rc = 0;
        self.filled = 0;
    }

    /// True once `len` consecutive valid bases have been inserted.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.filled == self.len
    }

    /// The packed k-mer value under the configured mode.
    #[inline]
    pub fn value(&self) -> u64 {
        match self.mode {
            KmerMode::Direct => self.fwd,
            KmerMode::Canonical => self.fwd.min(self.rc),
        }
    }
}
