// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Tracks which pages of the arena are checked out. A set bit means the
/// page is in use.
#[derive(Debug)]
pub(crate) struct PageBitset {
    words: Vec<u64>,
    len: u32,
    free: u32,
}

const BITS: u32 = u64::BITS;

impl PageBitset {
    pub(crate) fn new(len: u32) -> Self {
        let n_words = len.div_ceil(BITS) as usize;
        let mut words = vec![0u64; n_words];
        // Bits past the end are permanently "in use".
        let tail = len % BITS;
        if tail != 0 {
            if let Some(last) = words.last_mut() {
                *last = !0u64 << tail;
            }
        }
        Self {
            words,
            len,
            free: len,
        }
    }

    #[inline]
    pub(crate) fn free_count(&self) -> u32 {
        self.free
    }

    #[inline]
    fn is_set(&self, bit: u32) -> bool {
        self.words[(bit / BITS) as usize] & (1 << (bit % BITS)) != 0
    }

    fn set_range(&mut self, start: u32, count: u32, value: bool) {
        for bit in start..start + count {
            let word = &mut self.words[(bit / BITS) as usize];
            let mask = 1u64 << (bit % BITS);
            if value {
                *word |= mask;
            } else {
                *word &= !mask;
            }
        }
    }

    /// Finds the first run of `count` clear bits, marks it used and returns
    /// its first index.
    pub(crate) fn take_range(&mut self, count: u32) -> Option<u32> {
        if count == 0 || count > self.free {
            return None;
        }
        let start = if count == 1 {
            let (idx, word) = self
                .words
                .iter()
                .enumerate()
                .find(|(_, word)| **word != u64::MAX)?;
            idx as u32 * BITS + word.trailing_ones()
        } else {
            self.find_run(count)?
        };
        self.set_range(start, count, true);
        self.free -= count;
        Some(start)
    }

    fn find_run(&self, count: u32) -> Option<u32> {
        let mut run_start = 0;
        let mut run_len = 0;
        let mut bit = 0;
        while bit < self.len {
            // Whole used words cannot contribute to a run.
            if bit % BITS == 0 && self.words[(bit / BITS) as usize] == u64::MAX {
                run_len = 0;
                bit += BITS;
                continue;
            }
            if self.is_set(bit) {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = bit;
                }
                run_len += 1;
                if run_len == count {
                    return Some(run_start);
                }
            }
            bit += 1;
        }
        None
    }

    pub(crate) fn release_range(&mut self, start: u32, count: u32) {
        debug_assert!(start + count <= self.len);
        debug_assert!((start..start + count).all(|bit| self.is_set(bit)));
        self.set_range(start, count, false);
        self.free += count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_bits_are_never_handed_out() {
        let mut bits = PageBitset::new(3);
        assert_eq!(bits.take_range(1), Some(0));
        assert_eq!(bits.take_range(1), Some(1));
        assert_eq!(bits.take_range(1), Some(2));
        assert_eq!(bits.take_range(1), None);
        assert_eq!(bits.free_count(), 0);
    }

    #[test]
    fn runs_skip_fragmented_space() {
        let mut bits = PageBitset::new(130);
        for expected in 0..70 {
            assert_eq!(bits.take_range(1), Some(expected));
        }
        // Leave a one-page hole at 10 and a two-page hole at 20..22.
        bits.release_range(10, 1);
        bits.release_range(20, 2);
        assert_eq!(bits.take_range(3), Some(70));
        assert_eq!(bits.take_range(2), Some(20));
        assert_eq!(bits.take_range(1), Some(10));
        assert_eq!(bits.take_range(57), Some(73));
        assert_eq!(bits.free_count(), 0);
        assert_eq!(bits.take_range(1), None);
    }

    #[test]
    fn counts_stay_consistent() {
        bolero::check!()
            .with_type::<Vec<(u8, bool)>>()
            .for_each(|ops| {
                let mut bits = PageBitset::new(100);
                let mut taken: Vec<(u32, u32)> = Vec::new();
                for (count, release) in ops {
                    if *release {
                        if let Some((start, count)) = taken.pop() {
                            bits.release_range(start, count);
                        }
                    } else {
                        let count = u32::from(*count % 8) + 1;
                        if let Some(start) = bits.take_range(count) {
                            for (other, other_count) in &taken {
                                assert!(start + count <= *other || other + other_count <= start);
                            }
                            taken.push((start, count));
                        }
                    }
                    let used: u32 = taken.iter().map(|(_, c)| c).sum();
                    assert_eq!(bits.free_count(), 100 - used);
                }
            });
    }
}
