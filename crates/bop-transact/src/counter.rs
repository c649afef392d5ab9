//! Leading/trailing ring indices packed into one atomic word.
//!
//! The word holds `leading << 32 | trailing`. Both halves carry a high "empty"
//! bit; a ring is empty when the word has the empty bits set, in which case the
//! masked leading index is where the next element will land. Every transition
//! is a single compare-and-set on the whole word.

use crate::atomic::AtomicWord;
use crate::error::{TransactError, TransactResult};

pub const EMPTY_MASK: u64 = 0x8000_0000_8000_0000;
const INDEX_MASK: u32 = 0x7FFF_FFFF;

const fn pack(leading: u32, trailing: u32) -> u64 {
    ((leading as u64) << 32) | trailing as u64
}

/// Point-in-time view of a [`DualCounter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    raw: u64,
    leading: u32,
    trailing: u32,
    empty: bool,
    count: u32,
}

impl Snapshot {
    fn decode(raw: u64, count: u32) -> TransactResult<Self> {
        let empty = raw & EMPTY_MASK == EMPTY_MASK;
        let leading = ((raw >> 32) as u32) & INDEX_MASK;
        let trailing = (raw as u32) & INDEX_MASK;
        if leading >= count || trailing >= count {
            return Err(TransactError::corruption(format!(
                "ring indices leading={leading} trailing={trailing} exceed capacity {count}"
            )));
        }
        Ok(Self {
            raw,
            leading,
            trailing,
            empty,
            count,
        })
    }

    pub fn raw(&self) -> u64 {
        self.raw
    }

    pub fn leading(&self) -> u32 {
        self.leading
    }

    pub fn trailing(&self) -> u32 {
        self.trailing
    }

    pub fn is_empty(&self) -> bool {
        self.empty
    }

    pub fn is_full(&self) -> bool {
        self.size() == self.count
    }

    pub fn size(&self) -> u32 {
        if self.empty {
            0
        } else if self.leading >= self.trailing {
            self.leading - self.trailing + 1
        } else {
            self.count - self.trailing + self.leading + 1
        }
    }

    pub fn in_range(&self, index: u32) -> bool {
        if self.empty || index >= self.count {
            return false;
        }
        if self.trailing <= self.leading {
            (self.trailing..=self.leading).contains(&index)
        } else {
            index >= self.trailing || index <= self.leading
        }
    }

    /// Valid indices from trailing to leading.
    pub fn range(&self) -> Vec<u32> {
        let size = self.size();
        (0..size)
            .map(|step| (self.trailing + step) % self.count)
            .collect()
    }

    /// Valid indices from leading back to trailing.
    pub fn reverse_range(&self) -> Vec<u32> {
        let mut indices = self.range();
        indices.reverse();
        indices
    }
}

/// Ring indices over `count` slots stored in an [`AtomicWord`].
#[derive(Debug)]
pub struct DualCounter<W> {
    word: W,
    count: u32,
}

impl<W: AtomicWord> DualCounter<W> {
    pub fn new(word: W, count: u32) -> TransactResult<Self> {
        if count == 0 || count > INDEX_MASK {
            return Err(TransactError::invalid_argument(format!(
                "ring capacity {count} out of range"
            )));
        }
        Ok(Self { word, count })
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn max(&self) -> u32 {
        self.count - 1
    }

    pub fn word(&self) -> &W {
        &self.word
    }

    pub fn reset(&self) {
        self.word.set(EMPTY_MASK);
    }

    /// Sets the ring to hold `len` elements starting at slot 0.
    pub fn restore_prefix(&self, len: u32) -> TransactResult<()> {
        if len > self.count {
            return Err(TransactError::invalid_argument(format!(
                "cannot restore {len} elements into a ring of {}",
                self.count
            )));
        }
        if len == 0 {
            self.reset();
        } else {
            self.word.set(pack(len - 1, 0));
        }
        Ok(())
    }

    pub fn snapshot(&self) -> TransactResult<Snapshot> {
        Snapshot::decode(self.word.get(), self.count)
    }

    pub fn is_empty(&self) -> TransactResult<bool> {
        Ok(self.snapshot()?.is_empty())
    }

    pub fn size(&self) -> TransactResult<u32> {
        Ok(self.snapshot()?.size())
    }

    /// Claims the slot after the current leading one and returns its index.
    ///
    /// Fails with [`TransactError::CapacityExhausted`] when the ring is full.
    pub fn increment_leading_and_get(&self) -> TransactResult<u32> {
        loop {
            let snapshot = self.snapshot()?;
            let (next, update) = if snapshot.empty {
                (snapshot.leading, pack(snapshot.leading, snapshot.leading))
            } else {
                let next = (snapshot.leading + 1) % self.count;
                if next == snapshot.trailing {
                    return Err(TransactError::exhausted(format!(
                        "ring of {} slots is full",
                        self.count
                    )));
                }
                (next, pack(next, snapshot.trailing))
            };
            if self.word.compare_and_set(snapshot.raw, update) {
                return Ok(next);
            }
        }
    }

    /// Releases the trailing slot if the ring still matches `snapshot`.
    ///
    /// Releasing the last element leaves the ring empty with the next
    /// allocation landing on the slot after the released one.
    pub fn compare_and_increment_trailing(&self, snapshot: &Snapshot) -> bool {
        if snapshot.empty {
            return false;
        }
        let update = if snapshot.trailing == snapshot.leading {
            let next = (snapshot.trailing + 1) % self.count;
            pack(next, next) | EMPTY_MASK
        } else {
            pack(snapshot.leading, (snapshot.trailing + 1) % self.count)
        };
        self.word.compare_and_set(snapshot.raw, update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU64;

    fn counter(count: u32) -> DualCounter<AtomicU64> {
        let counter = DualCounter::new(AtomicU64::new(0), count).expect("counter");
        counter.reset();
        counter
    }

    #[test]
    fn fills_and_drains_in_order() {
        let ring = counter(3);
        assert!(ring.is_empty().expect("empty"));
        assert_eq!(ring.increment_leading_and_get().expect("first"), 0);
        assert_eq!(ring.increment_leading_and_get().expect("second"), 1);
        assert_eq!(ring.increment_leading_and_get().expect("third"), 2);
        assert!(matches!(
            ring.increment_leading_and_get(),
            Err(TransactError::CapacityExhausted(_))
        ));
        let snapshot = ring.snapshot().expect("snapshot");
        assert!(snapshot.is_full());
        assert_eq!(snapshot.range(), vec![0, 1, 2]);

        assert!(ring.compare_and_increment_trailing(&snapshot));
        assert!(!ring.compare_and_increment_trailing(&snapshot), "stale snapshot");
        assert_eq!(ring.increment_leading_and_get().expect("wrap"), 0);
        let wrapped = ring.snapshot().expect("snapshot");
        assert_eq!(wrapped.range(), vec![1, 2, 0]);
        assert_eq!(wrapped.reverse_range(), vec![0, 2, 1]);
        assert!(wrapped.in_range(0));
        assert!(wrapped.in_range(1));
    }

    #[test]
    fn draining_the_last_element_empties_the_ring() {
        let ring = counter(4);
        ring.increment_leading_and_get().expect("first");
        ring.increment_leading_and_get().expect("second");
        for _ in 0..2 {
            let snapshot = ring.snapshot().expect("snapshot");
            assert!(ring.compare_and_increment_trailing(&snapshot));
        }
        let snapshot = ring.snapshot().expect("snapshot");
        assert!(snapshot.is_empty());
        assert!(!snapshot.in_range(1));
        assert!(!ring.compare_and_increment_trailing(&snapshot));
        assert_eq!(ring.increment_leading_and_get().expect("next"), 2);
    }

    #[test]
    fn out_of_range_word_is_corruption() {
        let ring = DualCounter::new(AtomicU64::new(pack(9, 0)), 4).expect("counter");
        assert!(matches!(ring.snapshot(), Err(TransactError::Corruption(_))));
    }

    #[test]
    fn restore_prefix_places_elements_at_start() {
        let ring = counter(8);
        ring.restore_prefix(3).expect("restore");
        assert_eq!(ring.snapshot().expect("snapshot").range(), vec![0, 1, 2]);
        ring.restore_prefix(0).expect("restore");
        assert!(ring.is_empty().expect("empty"));
    }

    proptest! {
        #[test]
        fn behaves_like_a_bounded_queue(count in 1u32..8, ops in proptest::collection::vec(any::<bool>(), 0..64)) {
            let ring = counter(count);
            let mut model: VecDeque<u32> = VecDeque::new();
            let mut next_slot = 0u32;
            for push in ops {
                if push {
                    match ring.increment_leading_and_get() {
                        Ok(slot) => {
                            prop_assert!(model.len() < count as usize);
                            prop_assert_eq!(slot, next_slot);
                            model.push_back(slot);
                            next_slot = (slot + 1) % count;
                        }
                        Err(err) => {
                            prop_assert!(err.is_retryable());
                            prop_assert_eq!(model.len(), count as usize);
                        }
                    }
                } else {
                    let snapshot = ring.snapshot().unwrap();
                    let popped = ring.compare_and_increment_trailing(&snapshot);
                    prop_assert_eq!(popped, model.pop_front().is_some());
                }
                let snapshot = ring.snapshot().unwrap();
                prop_assert_eq!(snapshot.size() as usize, model.len());
                prop_assert_eq!(snapshot.range(), model.iter().copied().collect::<Vec<_>>());
            }
        }
    }
}
