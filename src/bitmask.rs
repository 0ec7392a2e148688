//! A fixed-width set of thread indices. We use one per reduction block, to record which
//! threads wrote force contributions to the atoms in that block.

use std::fmt;

/// The maximum number of threads a mask can hold.
pub const MAX_THREADS: usize = u64::BITS as usize;

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ThreadMask(u64);

impl ThreadMask {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn set(&mut self, thread: usize) {
        debug_assert!(thread < MAX_THREADS);
        self.0 |= 1 << thread;
    }

    pub fn is_set(&self, thread: usize) -> bool {
        thread < MAX_THREADS && self.0 & (1 << thread) != 0
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn union(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn count(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Thread indices in the set, ascending.
    pub fn iter(&self) -> impl Iterator<Item = usize> {
        let mut bits = self.0;
        std::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let i = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            Some(i)
        })
    }
}

impl fmt::Debug for ThreadMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iterates_ascending() {
        let mut m = ThreadMask::empty();
        for t in [63, 0, 5, 17] {
            m.set(t);
        }
        assert_eq!(m.iter().collect::<Vec<_>>(), vec![0, 5, 17, 63]);
        assert_eq!(m.count(), 4);
        assert!(m.is_set(17));
        assert!(!m.is_set(16));
        assert!(!m.is_set(64));
    }

    #[test]
    fn union_and_clear() {
        let mut a = ThreadMask::empty();
        let mut b = ThreadMask::empty();
        a.set(1);
        b.set(2);
        a.union(b);
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![1, 2]);
        a.clear();
        assert!(a.is_empty());
    }
}
