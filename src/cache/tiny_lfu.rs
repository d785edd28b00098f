//! W-TinyLFU bounded statement cache.
//!
//! New entries land in a small admission window. When the window overflows,
//! its least-recent entry becomes a candidate for the main area and contests
//! the main area's eviction victim on estimated frequency; the loser is
//! evicted. Frequencies come from a 4-bit count-min sketch that is halved
//! periodically so stale popularity decays.

use std::collections::{HashMap, VecDeque};
use std::hash::{BuildHasher, RandomState};
use std::sync::Arc;

use super::StatementCell;

/// Count-min sketch with 4-bit counters, 16 per word.
#[derive(Debug)]
pub(crate) struct FrequencySketch {
    table: Vec<u64>,
    mask: u64,
    size: u32,
    sample_size: u32,
}

const SEEDS: [u64; 4] = [
    0xc3a5_c85c_97cb_3127,
    0xb492_b66f_be98_f273,
    0x9ae1_6a3b_2f90_404f,
    0xcbf2_9ce4_8422_2325,
];

fn spread(hash: u64, seed: u64) -> u64 {
    let mut h = (hash ^ seed).wrapping_mul(0x9e37_79b9_7f4a_7c15);
    h ^= h >> 29;
    h
}

impl FrequencySketch {
    pub fn new(capacity: usize) -> Self {
        let len = capacity.next_power_of_two().max(8);
        Self {
            table: vec![0; len],
            mask: (len - 1) as u64,
            size: 0,
            sample_size: (capacity as u32).saturating_mul(10).max(10),
        }
    }

    /// Estimated access frequency, the minimum over all hash positions.
    pub fn frequency(&self, hash: u64) -> u8 {
        let mut freq = u8::MAX;
        for seed in SEEDS {
            let h = spread(hash, seed);
            let word = (h & self.mask) as usize;
            let shift = ((h >> 59) & 0xF) * 4;
            let count = ((self.table[word] >> shift) & 0xF) as u8;
            freq = freq.min(count);
        }
        freq
    }

    /// Record one access, halving all counters once the sample is full.
    pub fn increment(&mut self, hash: u64) {
        let mut added = false;
        for seed in SEEDS {
            let h = spread(hash, seed);
            let word = (h & self.mask) as usize;
            let shift = ((h >> 59) & 0xF) * 4;
            if ((self.table[word] >> shift) & 0xF) < 0xF {
                self.table[word] += 1 << shift;
                added = true;
            }
        }
        if added {
            self.size += 1;
            if self.size >= self.sample_size {
                self.reset();
            }
        }
    }

    fn reset(&mut self) {
        for word in &mut self.table {
            *word = (*word >> 1) & 0x7777_7777_7777_7777;
        }
        self.size >>= 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment {
    Window,
    Probation,
    Protected,
}

#[derive(Debug)]
struct Entry {
    cell: StatementCell,
    segment: Segment,
}

/// Bounded cache: admission window plus a probation/protected main area.
pub(crate) struct TinyLfuCache {
    sketch: FrequencySketch,
    hasher: RandomState,
    entries: HashMap<String, Entry>,
    // LRU orders, least recent at the front.
    window: VecDeque<String>,
    probation: VecDeque<String>,
    protected: VecDeque<String>,
    window_capacity: usize,
    main_capacity: usize,
    protected_capacity: usize,
}

impl TinyLfuCache {
    pub fn new(capacity: usize) -> Self {
        let window_capacity = capacity.div_euclid(100).clamp(1, capacity);
        let main_capacity = capacity - window_capacity;
        let protected_capacity = main_capacity.saturating_sub(main_capacity.div_ceil(5));
        Self {
            sketch: FrequencySketch::new(capacity),
            hasher: RandomState::new(),
            entries: HashMap::new(),
            window: VecDeque::new(),
            probation: VecDeque::new(),
            protected: VecDeque::new(),
            window_capacity,
            main_capacity,
            protected_capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Look up `sql`, recording the access and promoting on a hit.
    pub fn get(&mut self, sql: &str) -> Option<StatementCell> {
        let hash = self.hasher.hash_one(sql);
        self.sketch.increment(hash);
        let segment = self.entries.get(sql)?.segment;
        match segment {
            Segment::Window => touch(&mut self.window, sql),
            Segment::Protected => touch(&mut self.protected, sql),
            Segment::Probation => {
                // A second access in probation signals reuse; promote.
                remove(&mut self.probation, sql);
                self.protected.push_back(sql.to_string());
                self.set_segment(sql, Segment::Protected);
                while self.protected.len() > self.protected_capacity {
                    if let Some(demoted) = self.protected.pop_front() {
                        self.set_segment(&demoted, Segment::Probation);
                        self.probation.push_back(demoted);
                    }
                }
            }
        }
        self.entries.get(sql).map(|entry| Arc::clone(&entry.cell))
    }

    /// Insert `sql` into the window, evicting per the admission policy.
    ///
    /// Returns the new entry's cell and the cells of everything evicted,
    /// which may include the new entry itself when it loses admission
    /// immediately.
    pub fn insert(&mut self, sql: &str) -> (StatementCell, Vec<StatementCell>) {
        let cell = StatementCell::default();
        self.entries.insert(
            sql.to_string(),
            Entry {
                cell: Arc::clone(&cell),
                segment: Segment::Window,
            },
        );
        self.window.push_back(sql.to_string());

        let mut evicted = Vec::new();
        while self.window.len() > self.window_capacity {
            let Some(candidate) = self.window.pop_front() else {
                break;
            };
            if self.probation.len() + self.protected.len() < self.main_capacity {
                self.set_segment(&candidate, Segment::Probation);
                self.probation.push_back(candidate);
                continue;
            }
            let victim = self.probation.front().or_else(|| self.protected.front());
            let Some(victim) = victim.cloned() else {
                // No main area at all; the candidate cannot be admitted.
                self.evict(&candidate, &mut evicted);
                continue;
            };
            let candidate_freq = self.sketch.frequency(self.hasher.hash_one(&candidate));
            let victim_freq = self.sketch.frequency(self.hasher.hash_one(&victim));
            if candidate_freq > victim_freq {
                self.evict(&victim, &mut evicted);
                self.set_segment(&candidate, Segment::Probation);
                self.probation.push_back(candidate);
            } else {
                self.evict(&candidate, &mut evicted);
            }
        }
        (cell, evicted)
    }

    /// Whether `sql` is still present and backed by exactly `cell`.
    pub fn contains_cell(&self, sql: &str, cell: &StatementCell) -> bool {
        self.entries
            .get(sql)
            .is_some_and(|entry| Arc::ptr_eq(&entry.cell, cell))
    }

    fn set_segment(&mut self, sql: &str, segment: Segment) {
        if let Some(entry) = self.entries.get_mut(sql) {
            entry.segment = segment;
        }
    }

    fn evict(&mut self, sql: &str, evicted: &mut Vec<StatementCell>) {
        remove(&mut self.window, sql);
        remove(&mut self.probation, sql);
        remove(&mut self.protected, sql);
        if let Some(entry) = self.entries.remove(sql) {
            evicted.push(entry.cell);
        }
    }
}

impl std::fmt::Debug for TinyLfuCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TinyLfuCache")
            .field("len", &self.entries.len())
            .field("window_capacity", &self.window_capacity)
            .field("main_capacity", &self.main_capacity)
            .finish_non_exhaustive()
    }
}

fn touch(order: &mut VecDeque<String>, sql: &str) {
    remove(order, sql);
    order.push_back(sql.to_string());
}

fn remove(order: &mut VecDeque<String>, sql: &str) {
    if let Some(position) = order.iter().position(|key| key == sql) {
        let _ = order.remove(position);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn access(cache: &mut TinyLfuCache, sql: &str) -> Vec<StatementCell> {
        match cache.get(sql) {
            Some(_) => Vec::new(),
            None => cache.insert(sql).1,
        }
    }

    #[test]
    fn cold_entry_evicted_before_hot_ones() {
        let mut cache = TinyLfuCache::new(2);
        // A is hot, B was used once, C is new.
        assert!(access(&mut cache, "A").is_empty());
        for _ in 0..4 {
            assert!(access(&mut cache, "A").is_empty());
        }
        assert!(access(&mut cache, "B").is_empty());
        let evicted = access(&mut cache, "C");
        assert_eq!(evicted.len(), 1);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("A").is_some());
        assert!(cache.get("C").is_some());
        assert!(cache.entries.get("B").is_none());
    }

    #[test]
    fn capacity_is_never_exceeded() {
        let mut cache = TinyLfuCache::new(8);
        for i in 0..100 {
            let _ = access(&mut cache, &format!("SELECT {i}"));
            assert!(cache.len() <= 8);
        }
    }

    #[test]
    fn repeated_use_is_eventually_admitted() {
        let mut cache = TinyLfuCache::new(4);
        for i in 0..4 {
            let _ = access(&mut cache, &format!("filler {i}"));
        }
        // A frequently used key must be resident once its frequency grows,
        // even with the main area already full.
        for _ in 0..16 {
            let _ = access(&mut cache, "hot");
        }
        assert!(cache.entries.contains_key("hot"));
    }

    #[test]
    fn probation_hit_promotes_to_protected() {
        let mut cache = TinyLfuCache::new(200);
        let _ = access(&mut cache, "X");
        // Push X out of the window into probation.
        for i in 0..3 {
            let _ = access(&mut cache, &format!("w{i}"));
        }
        assert_eq!(cache.entries.get("X").map(|e| e.segment), Some(Segment::Probation));
        let _ = access(&mut cache, "X");
        assert_eq!(cache.entries.get("X").map(|e| e.segment), Some(Segment::Protected));
    }

    #[test]
    fn sketch_counts_saturate_and_decay() {
        let mut sketch = FrequencySketch::new(64);
        let hash = 0xDEAD_BEEF;
        for _ in 0..100 {
            sketch.increment(hash);
        }
        assert_eq!(sketch.frequency(hash), 15);
        sketch.reset();
        assert!(sketch.frequency(hash) <= 7);
    }
}
