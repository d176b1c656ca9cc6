//! Fixed-length bit sets with run iteration.

use std::ops::Range;

use bitvec::vec::BitVec;

/// A fixed-length set of bits.
#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct BitMask {
    bits: BitVec,
}

impl BitMask {
    pub fn new(len: usize) -> Self {
        Self {
            bits: BitVec::repeat(false, len),
        }
    }
    pub fn len(&self) -> usize {
        self.bits.len()
    }
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }
    pub fn get(&self, index: usize) -> bool {
        self.bits[index]
    }
    pub fn set(&mut self, index: usize) {
        self.bits.set(index, true);
    }
    pub fn set_range(&mut self, range: Range<usize>) {
        self.bits[range].fill(true);
    }
    pub fn clear_range(&mut self, range: Range<usize>) {
        self.bits[range].fill(false);
    }
    pub fn clear_all(&mut self) {
        self.bits.fill(false);
    }
    pub fn any(&self) -> bool {
        self.bits.any()
    }
    pub fn count(&self) -> usize {
        self.bits.count_ones()
    }
    pub fn first_set(&self) -> Option<usize> {
        self.bits.first_one()
    }
    pub fn last_set(&self) -> Option<usize> {
        self.bits.last_one()
    }
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }

    /// Maximal runs of consecutive set bits, in ascending order.
    pub fn runs(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        let mut ones = self.bits.iter_ones().peekable();
        std::iter::from_fn(move || {
            let start = ones.next()?;
            let mut end = start + 1;
            while ones.next_if_eq(&end).is_some() {
                end += 1;
            }
            Some(start..end)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_and_last() {
        let mut mask = BitMask::new(40);
        assert_eq!(mask.first_set(), None);
        assert!(!mask.any());
        mask.set(3);
        mask.set(33);
        assert_eq!(mask.first_set(), Some(3));
        assert_eq!(mask.last_set(), Some(33));
        mask.clear_range(0..10);
        assert_eq!(mask.first_set(), Some(33));
        assert_eq!(mask.count(), 1);
    }

    #[test]
    fn runs_coalesce() {
        let mut mask = BitMask::new(16);
        mask.set_range(1..4);
        mask.set(6);
        mask.set_range(9..16);
        let runs: Vec<_> = mask.runs().collect();
        assert_eq!(runs, vec![1..4, 6..7, 9..16]);
        mask.clear_all();
        assert_eq!(mask.runs().count(), 0);
    }
}
