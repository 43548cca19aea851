//! Indexed binary min-heap used by the route computation
//!
//! Entries are identified by a dense index `0..n`; [`IndexedMinHeap::decrease_key`]
//! moves an entry up in `O(log n)` by tracking each index's position in the
//! heap array. Keys are `Option<Cost>` with `None` ordered after every finite
//! cost (unreached nodes). Equal keys are broken by index so extraction order
//! is deterministic.

use std::cmp::Ordering;

use lsnet_core::Cost;

/// Position marker for indices that are no longer in the heap
const REMOVED: usize = usize::MAX;

#[derive(Debug)]
pub(crate) struct IndexedMinHeap {
    /// Heap array of indices
    heap: Vec<usize>,
    /// `position[i]` is where index `i` sits in `heap`, or `REMOVED`
    position: Vec<usize>,
    keys: Vec<Option<Cost>>,
}

fn cmp_key(a: Option<Cost>, b: Option<Cost>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

impl IndexedMinHeap {
    /// Build a heap holding every index in `0..keys.len()`
    pub(crate) fn from_keys(keys: Vec<Option<Cost>>) -> Self {
        let n = keys.len();
        let mut heap = Self {
            heap: (0..n).collect(),
            position: (0..n).collect(),
            keys,
        };
        for i in (0..n / 2).rev() {
            heap.sift_down(i);
        }
        heap
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Whether `index` is still queued
    pub(crate) fn contains(&self, index: usize) -> bool {
        self.position.get(index).is_some_and(|p| *p != REMOVED)
    }

    /// Current key of `index`
    #[cfg(test)]
    pub(crate) fn key(&self, index: usize) -> Option<Cost> {
        self.keys.get(index).copied().flatten()
    }

    /// Remove and return the index with the smallest key
    pub(crate) fn pop_min(&mut self) -> Option<(usize, Option<Cost>)> {
        if self.heap.is_empty() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.swap(0, last);
        let min = self.heap.pop()?;
        self.position[min] = REMOVED;
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        Some((min, self.keys[min]))
    }

    /// Lower the key of a queued index
    ///
    /// Returns `false` (and changes nothing) if the index is no longer queued
    /// or `key` is not smaller than the current key.
    pub(crate) fn decrease_key(&mut self, index: usize, key: Cost) -> bool {
        if !self.contains(index) || cmp_key(Some(key), self.keys[index]) != Ordering::Less {
            return false;
        }
        self.keys[index] = Some(key);
        self.sift_up(self.position[index]);
        true
    }

    fn less(&self, a: usize, b: usize) -> bool {
        let (ia, ib) = (self.heap[a], self.heap[b]);
        match cmp_key(self.keys[ia], self.keys[ib]) {
            Ordering::Equal => ia < ib,
            ord => ord == Ordering::Less,
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.position[self.heap[a]] = a;
        self.position[self.heap[b]] = b;
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.less(pos, parent) {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let n = self.heap.len();
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut smallest = pos;
            if left < n && self.less(left, smallest) {
                smallest = left;
            }
            if right < n && self.less(right, smallest) {
                smallest = right;
            }
            if smallest == pos {
                break;
            }
            self.swap(pos, smallest);
            pos = smallest;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_order_with_infinity() {
        let mut heap = IndexedMinHeap::from_keys(vec![None, Some(5), Some(1), None, Some(3)]);
        let order: Vec<_> = std::iter::from_fn(|| heap.pop_min()).collect();
        assert_eq!(
            order,
            vec![(2, Some(1)), (4, Some(3)), (1, Some(5)), (0, None), (3, None)]
        );
    }

    #[test]
    fn test_decrease_key() {
        let mut heap = IndexedMinHeap::from_keys(vec![Some(0), None, None]);
        assert_eq!(heap.pop_min(), Some((0, Some(0))));

        assert!(heap.decrease_key(2, 4));
        assert!(heap.decrease_key(1, 7));
        assert!(heap.decrease_key(1, 2));
        // Not an improvement
        assert!(!heap.decrease_key(2, 9));
        assert_eq!(heap.key(1), Some(2));

        assert_eq!(heap.pop_min(), Some((1, Some(2))));
        assert_eq!(heap.pop_min(), Some((2, Some(4))));
        assert!(heap.is_empty());
    }

    #[test]
    fn test_removed_index_ignored() {
        let mut heap = IndexedMinHeap::from_keys(vec![Some(1), Some(2)]);
        heap.pop_min();
        assert!(!heap.contains(0));
        assert!(!heap.decrease_key(0, 0));
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn test_ties_break_by_index() {
        let mut heap = IndexedMinHeap::from_keys(vec![Some(2), Some(2), Some(2)]);
        assert_eq!(heap.pop_min().map(|(i, _)| i), Some(0));
        assert_eq!(heap.pop_min().map(|(i, _)| i), Some(1));
        assert_eq!(heap.pop_min().map(|(i, _)| i), Some(2));
        assert_eq!(heap.pop_min(), None);
    }

    #[test]
    fn test_random_against_sort() {
        let keys: Vec<Option<Cost>> = (0..64u64)
            .map(|i| if i % 7 == 0 { None } else { Some((i * 37) % 23) })
            .collect();
        let mut expected: Vec<(usize, Option<Cost>)> = keys.iter().copied().enumerate().collect();
        expected.sort_by(|a, b| cmp_key(a.1, b.1).then(a.0.cmp(&b.0)));

        let mut heap = IndexedMinHeap::from_keys(keys);
        let order: Vec<_> = std::iter::from_fn(|| heap.pop_min()).collect();
        assert_eq!(order, expected);
    }
}
