//! # Bits
//!
//! Bitmaps over the concatenated input space. [`AtomicBitmap`] supports
//! concurrent claiming (`set` returns the prior bit, so a `false` return
//! means the caller owns the position). [`RankedBitmap`] is a frozen
//! snapshot with rank-1 queries, used to densify the claimed positions of
//! a closure batch into ids `0..N`.
use std::sync::atomic::{AtomicU64, Ordering};

pub struct AtomicBitmap {
    len: u64,
    words: Vec<AtomicU64>,
}

impl AtomicBitmap {
    pub fn new(len: u64) -> Self {
        let n_words = (len as usize).div_ceil(64);
        AtomicBitmap {
            len,
            words: (0..n_words).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, i: u64) -> bool {
        debug_assert!(i < self.len);
        let mask = 1u64 << (i % 64);
        self.words[(i / 64) as usize].load(Ordering::Relaxed) & mask != 0
    }

    /// Set bit `i` and return its prior value.
    pub fn set(&self, i: u64) -> bool {
        debug_assert!(i < self.len);
        let mask = 1u64 << (i % 64);
        self.words[(i / 64) as usize].fetch_or(mask, Ordering::Relaxed) & mask != 0
    }

    pub fn clear_all(&mut self) {
        for w in &mut self.words {
            *w.get_mut() = 0;
        }
    }

    /// Fold every bit of `other` into `self`.
    pub fn union_with(&mut self, other: &AtomicBitmap) {
        assert_eq!(self.len, other.len);
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w.get_mut() |= o.load(Ordering::Relaxed);
        }
    }

    /// Freeze the current contents into a rank-queryable snapshot.
    pub fn snapshot(&self) -> RankedBitmap {
        let words: Vec<u64> = self.words.iter().map(|w| w.load(Ordering::Relaxed)).collect();
        let mut ranks = Vec::with_capacity(words.len());
        let mut total = 0u64;
        for &w in &words {
            ranks.push(total);
            total += u64::from(w.count_ones());
        }
        RankedBitmap {
            len: self.len,
            words,
            ranks,
            total,
        }
    }
}

pub struct RankedBitmap {
    len: u64,
    words: Vec<u64>,
    ranks: Vec<u64>,
    total: u64,
}

impl RankedBitmap {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, i: u64) -> bool {
        debug_assert!(i < self.len);
        self.words[(i / 64) as usize] & (1u64 << (i % 64)) != 0
    }

    pub fn count_ones(&self) -> u64 {
        self.total
    }

    /// Number of set bits strictly before `i`. For a set bit this is its
    /// dense id among all set bits.
    pub fn rank1(&self, i: u64) -> u64 {
        debug_assert!(i < self.len);
        let word = (i / 64) as usize;
        let below = self.words[word] & ((1u64 << (i % 64)) - 1);
        self.ranks[word] + u64::from(below.count_ones())
    }

    /// Iterate the set bit positions in ascending order.
    pub fn ones(&self) -> impl Iterator<Item = u64> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, &w)| {
            let mut rest = w;
            std::iter::from_fn(move || {
                if rest == 0 {
                    None
                } else {
                    let b = rest.trailing_zeros();
                    rest &= rest - 1;
                    Some(wi as u64 * 64 + u64::from(b))
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_reports_prior_bit() {
        let bv = AtomicBitmap::new(100);
        assert!(!bv.set(70));
        assert!(bv.set(70));
        assert!(bv.get(70));
        assert!(!bv.get(71));
    }

    #[test]
    fn clear_and_union() {
        let mut a = AtomicBitmap::new(130);
        let b = AtomicBitmap::new(130);
        a.set(1);
        b.set(2);
        b.set(129);
        a.union_with(&b);
        assert!(a.get(1) && a.get(2) && a.get(129));
        a.clear_all();
        assert!(!a.get(1) && !a.get(2) && !a.get(129));
    }

    #[test]
    fn rank_and_ones() {
        let bv = AtomicBitmap::new(200);
        for i in [0u64, 3, 64, 65, 199] {
            bv.set(i);
        }
        let snap = bv.snapshot();
        assert_eq!(5, snap.count_ones());
        assert_eq!(vec![0, 3, 64, 65, 199], snap.ones().collect::<Vec<_>>());
        assert_eq!(0, snap.rank1(0));
        assert_eq!(1, snap.rank1(3));
        assert_eq!(2, snap.rank1(64));
        assert_eq!(3, snap.rank1(65));
        assert_eq!(4, snap.rank1(199));
        assert_eq!(4, snap.rank1(100));
    }

    #[test]
    fn concurrent_claims_are_exclusive() {
        use std::sync::atomic::AtomicU64 as Counter;
        let bv = AtomicBitmap::new(1024);
        let claimed = Counter::new(0);
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for i in 0..1024 {
                        if !bv.set(i) {
                            claimed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });
        assert_eq!(1024, claimed.load(Ordering::Relaxed));
    }
}
