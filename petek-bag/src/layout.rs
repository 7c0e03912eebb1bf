//! Bag sizing derived from the target's cache geometry.
//!
//! A block's slot array spans whole cache lines so a producer and the
//! stealers working neighbouring blocks do not false-share, and the
//! per-block notify vector is sized from the number of registered
//! threads (one vote bit each).

// x86/x86_64: 64B, aarch64: 128B (Apple M-series / Neoverse), s390x: 256B.
#[cfg(target_arch = "s390x")]
pub(crate) const CACHE_LINE_BYTES: usize = 256;
#[cfg(target_arch = "aarch64")]
pub(crate) const CACHE_LINE_BYTES: usize = 128;
#[cfg(not(any(target_arch = "s390x", target_arch = "aarch64")))]
pub(crate) const CACHE_LINE_BYTES: usize = 64;

/// Per-bag sizing, fixed at construction.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockLayout {
    /// Word slots per block: `line_multiplier` cache lines' worth.
    pub(crate) slots_per_block: usize,
    /// Words of the notify bit-vector covering every registered thread.
    pub(crate) notify_words: usize,
}

impl BlockLayout {
    pub(crate) fn new(num_threads: usize, line_multiplier: usize) -> Self {
        let slots_per_line = CACHE_LINE_BYTES / core::mem::size_of::<usize>();
        Self {
            slots_per_block: slots_per_line * line_multiplier,
            notify_words: num_threads.div_ceil(usize::BITS as usize),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_array_fills_whole_lines() {
        let layout = BlockLayout::new(4, 3);
        assert_eq!(
            layout.slots_per_block * core::mem::size_of::<usize>(),
            3 * CACHE_LINE_BYTES
        );
    }

    #[test]
    fn notify_vector_has_a_bit_per_thread() {
        let bits = usize::BITS as usize;
        assert_eq!(BlockLayout::new(1, 1).notify_words, 1);
        assert_eq!(BlockLayout::new(bits, 1).notify_words, 1);
        assert_eq!(BlockLayout::new(bits + 1, 1).notify_words, 2);
    }
}
