// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bounded top-K tracking over frequency estimates.

use hashbrown::HashMap;

/// A key and its estimated access frequency.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Candidate {
    pub key: Vec<u8>,
    pub frequency: u32,
}

/// Tracks the `capacity` keys with the highest reported frequencies.
///
/// A binary min-heap keeps the coldest tracked key at the root so a hotter newcomer can replace it
/// in `O(log K)`. Index 0 of the heap holds a sentinel so that children of `i` sit at `2i` and
/// `2i + 1`. A map from key to heap index lets already-tracked keys be updated in place.
#[derive(Debug)]
pub(crate) struct TopK {
    capacity: usize,
    heap: Vec<Candidate>,
    positions: HashMap<Vec<u8>, usize>,
}

impl TopK {
    pub(crate) fn new(capacity: usize) -> Self {
        let mut heap = Vec::with_capacity(capacity + 1);
        heap.push(Candidate {
            key: Vec::new(),
            frequency: 0,
        });
        Self {
            capacity,
            heap,
            positions: HashMap::with_capacity(capacity),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len() - 1
    }

    /// Reports the latest frequency estimate of `key`.
    ///
    /// Estimates only grow between resets, so an updated key can only move away from the root.
    pub(crate) fn access(&mut self, key: &[u8], frequency: u32) {
        if let Some(&index) = self.positions.get(key) {
            self.heap[index].frequency = frequency;
            self.sift_down(index);
        } else if self.len() < self.capacity {
            self.heap.push(Candidate {
                key: key.to_vec(),
                frequency,
            });
            let index = self.heap.len() - 1;
            self.positions.insert(key.to_vec(), index);
            self.sift_up(index);
        } else if self.capacity > 0 && self.heap[1].frequency < frequency {
            let evicted = std::mem::replace(
                &mut self.heap[1],
                Candidate {
                    key: key.to_vec(),
                    frequency,
                },
            );
            self.positions.remove(&evicted.key);
            self.positions.insert(key.to_vec(), 1);
            self.sift_down(1);
        }
    }

    /// Returns the tracked keys ordered from hottest to coldest.
    pub(crate) fn ranked(&self) -> Vec<Candidate> {
        let mut ranked = self.heap[1..].to_vec();
        ranked.sort_unstable_by(|a, b| b.frequency.cmp(&a.frequency).then_with(|| a.key.cmp(&b.key)));
        ranked
    }

    pub(crate) fn reset(&mut self) {
        self.heap.truncate(1);
        self.positions.clear();
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 1 && self.heap[index].frequency < self.heap[index / 2].frequency {
            self.swap(index, index / 2);
            index /= 2;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        loop {
            let mut child = index * 2;
            if child >= self.heap.len() {
                return;
            }
            if child + 1 < self.heap.len() && self.heap[child + 1].frequency < self.heap[child].frequency {
                child += 1;
            }
            if self.heap[child].frequency >= self.heap[index].frequency {
                return;
            }
            self.swap(index, child);
            index = child;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        for index in [a, b] {
            if let Some(position) = self.positions.get_mut(&self.heap[index].key) {
                *position = index;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(ranked: &[Candidate]) -> Vec<&[u8]> {
        ranked.iter().map(|c| c.key.as_slice()).collect()
    }

    #[test]
    fn keeps_the_hottest_keys() {
        let mut top = TopK::new(3);
        for (key, frequency) in [(b"a", 5), (b"b", 1), (b"c", 9), (b"d", 7), (b"e", 2)] {
            top.access(key, frequency);
        }

        let ranked = top.ranked();
        assert_eq!(keys(&ranked), [b"c".as_slice(), b"d".as_slice(), b"a".as_slice()]);
        assert_eq!(ranked[0].frequency, 9);
    }

    #[test]
    fn evicted_keys_leave_the_index() {
        let mut top = TopK::new(2);
        top.access(b"cold", 1);
        top.access(b"warm", 2);
        top.access(b"hot", 3);

        assert!(!top.positions.contains_key(b"cold".as_slice()));
        assert_eq!(top.positions.len(), 2);

        // A later estimate for the evicted key must enter as a newcomer, not update a stale slot.
        top.access(b"cold", 10);
        assert_eq!(keys(&top.ranked()), [b"cold".as_slice(), b"hot".as_slice()]);
    }

    #[test]
    fn tracked_keys_are_updated_in_place() {
        let mut top = TopK::new(3);
        top.access(b"a", 1);
        top.access(b"b", 2);
        top.access(b"c", 3);
        top.access(b"a", 10);

        assert_eq!(top.len(), 3);
        assert_eq!(keys(&top.ranked()), [b"a".as_slice(), b"c".as_slice(), b"b".as_slice()]);
        for (key, &index) in &top.positions {
            assert_eq!(&top.heap[index].key, key);
        }
    }

    #[test]
    fn colder_newcomers_are_ignored_when_full() {
        let mut top = TopK::new(1);
        top.access(b"a", 5);
        top.access(b"b", 5);
        top.access(b"c", 4);
        assert_eq!(keys(&top.ranked()), [b"a".as_slice()]);
    }

    #[test]
    fn reset_and_zero_capacity() {
        let mut top = TopK::new(2);
        top.access(b"a", 1);
        top.reset();
        assert_eq!(top.len(), 0);
        assert!(top.ranked().is_empty());

        let mut empty = TopK::new(0);
        empty.access(b"a", 100);
        assert!(empty.ranked().is_empty());
    }
}
