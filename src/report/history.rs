//! Tick storage: immutable closed ticks in a fixed-length ring.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::dictionary::WordSlice;

/// One closed aggregation slot. Immutable once produced; the word-slices
/// inherited from accepted packet batches keep every referenced dictionary
/// word alive for as long as the tick (or a snapshot holding it) lives.
#[derive(Debug)]
pub struct Tick<T> {
    pub data: T,
    pub wordslices: Vec<Arc<WordSlice>>,
}

/// Collects the word-slices of batches accepted into the current tick.
#[derive(Debug, Default)]
pub struct SliceAccumulator {
    slices: Vec<Arc<WordSlice>>,
}

impl SliceAccumulator {
    pub fn add(&mut self, slice: &Arc<WordSlice>) {
        // a handful per tick at most (one per repacker slice window)
        if !self.slices.iter().any(|s| Arc::ptr_eq(s, slice)) {
            self.slices.push(Arc::clone(slice));
        }
    }

    pub fn take(&mut self) -> Vec<Arc<WordSlice>> {
        std::mem::take(&mut self.slices)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }
}

/// Fixed-length FIFO of past ticks; pushing into a full ring evicts the
/// oldest tick (and returns it, so windowed histories can subtract it).
#[derive(Debug)]
pub struct TickRing<T> {
    ticks: VecDeque<Arc<Tick<T>>>,
    capacity: usize,
}

impl<T> TickRing<T> {
    #[must_use]
    pub fn new(tick_count: u32) -> Self {
        let capacity = tick_count.max(1) as usize;
        Self {
            ticks: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, tick: Arc<Tick<T>>) -> Option<Arc<Tick<T>>> {
        let evicted = if self.ticks.len() == self.capacity {
            self.ticks.pop_front()
        } else {
            None
        };
        self.ticks.push_back(tick);
        evicted
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Tick<T>>> {
        self.ticks.iter()
    }

    /// Shared references for a snapshot to hold.
    #[must_use]
    pub fn ticks(&self) -> Vec<Arc<Tick<T>>> {
        self.ticks.iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    #[must_use]
    pub fn last(&self) -> Option<&Arc<Tick<T>>> {
        self.ticks.back()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(v: u32) -> Arc<Tick<u32>> {
        Arc::new(Tick {
            data: v,
            wordslices: Vec::new(),
        })
    }

    #[test]
    fn test_ring_evicts_oldest_when_full() {
        let mut ring = TickRing::new(3);
        assert!(ring.push(tick(1)).is_none());
        assert!(ring.push(tick(2)).is_none());
        assert!(ring.push(tick(3)).is_none());

        let evicted = ring.push(tick(4)).expect("full ring evicts");
        assert_eq!(evicted.data, 1);
        assert_eq!(ring.len(), 3);
        assert_eq!(
            ring.iter().map(|t| t.data).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
    }

    #[test]
    fn test_slice_accumulator_dedups_by_identity() {
        let a = Arc::new(WordSlice::default());
        let b = Arc::new(WordSlice::default());

        let mut acc = SliceAccumulator::default();
        acc.add(&a);
        acc.add(&b);
        acc.add(&a);
        assert_eq!(acc.len(), 2);

        let taken = acc.take();
        assert_eq!(taken.len(), 2);
        assert!(acc.is_empty());
    }
}
