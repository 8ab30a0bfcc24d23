//! C5 — Timeout List (spec §4.5).
//!
//! Ordered `(fpu_id, opcode, deadline)` set. Deadlines are quantized to
//! 5 ms buckets so that burst traffic — which yields clusters of near-
//! identical deadlines — hits an O(1) path: the list caches the current
//! minimum quantum and how many entries share it; only when that
//! multiplicity drops to zero does `pop`/`remove` fall back to an O(N)
//! rescan.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::command::Opcode;

const QUANTUM: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Quantum(u64);

fn quantize(deadline: Instant, epoch: Instant) -> Quantum {
    let elapsed = deadline.saturating_duration_since(epoch);
    Quantum((elapsed.as_nanos() / QUANTUM.as_nanos()) as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutEntry {
    pub fpu_id: u32,
    pub opcode: Opcode,
    pub deadline: Instant,
}

struct MinCache {
    quantum: Quantum,
    multiplicity: usize,
}

pub struct TimeoutList {
    epoch: Instant,
    // Keyed by quantum for O(1) neighbourhood access; within a quantum,
    // entries are an unordered bag (their exact ordering inside a 5ms
    // bucket carries no semantic weight).
    buckets: BTreeMap<Quantum, Vec<TimeoutEntry>>,
    min_cache: Option<MinCache>,
    len: usize,
}

impl TimeoutList {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            buckets: BTreeMap::new(),
            min_cache: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, entry: TimeoutEntry) {
        let q = quantize(entry.deadline, self.epoch);
        self.buckets.entry(q).or_default().push(entry);
        self.len += 1;
        match &mut self.min_cache {
            Some(cache) if q < cache.quantum => {
                *cache = MinCache { quantum: q, multiplicity: self.buckets[&q].len() };
            }
            Some(cache) if q == cache.quantum => {
                cache.multiplicity += 1;
            }
            Some(_) => {}
            None => {
                self.min_cache = Some(MinCache { quantum: q, multiplicity: self.buckets[&q].len() });
            }
        }
    }

    /// Removes the first entry matching `(fpu_id, opcode)`, if any.
    pub fn remove(&mut self, fpu_id: u32, opcode: Opcode) -> Option<TimeoutEntry> {
        let mut found_quantum = None;
        let mut found_entry = None;
        for (q, bucket) in self.buckets.iter_mut() {
            if let Some(pos) = bucket.iter().position(|e| e.fpu_id == fpu_id && e.opcode == opcode) {
                found_entry = Some(bucket.swap_remove(pos));
                found_quantum = Some(*q);
                break;
            }
        }
        let q = found_quantum?;
        self.len -= 1;
        if self.buckets[&q].is_empty() {
            self.buckets.remove(&q);
        }
        self.on_displace(q);
        found_entry
    }

    /// Smallest-deadline entry's remaining time, for sizing a poll
    /// timeout (spec §4.5, used by the RX thread).
    pub fn next_deadline(&self) -> Option<Instant> {
        self.buckets.values().flatten().map(|e| e.deadline).min()
    }

    /// Removes and returns the entry with the smallest deadline.
    pub fn pop(&mut self) -> Option<TimeoutEntry> {
        let q = *self.buckets.keys().next()?;
        let bucket = self.buckets.get_mut(&q).unwrap();
        // Within a bucket, pop the true minimum deadline (the quantum only
        // coarsens ordering across buckets, not within one).
        let (idx, _) = bucket
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.deadline)
            .unwrap();
        let entry = bucket.swap_remove(idx);
        self.len -= 1;
        if bucket.is_empty() {
            self.buckets.remove(&q);
        }
        self.on_displace(q);
        Some(entry)
    }

    /// Pops every entry whose deadline has passed `now`.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<TimeoutEntry> {
        let mut expired = Vec::new();
        while let Some(deadline) = self.next_deadline() {
            if deadline > now {
                break;
            }
            if let Some(entry) = self.pop() {
                expired.push(entry);
            } else {
                break;
            }
        }
        expired
    }

    fn on_displace(&mut self, displaced_quantum: Quantum) {
        match &mut self.min_cache {
            Some(cache) if cache.quantum == displaced_quantum => {
                cache.multiplicity = cache.multiplicity.saturating_sub(1);
                if cache.multiplicity == 0 {
                    // Full rescan: multiplicity exhausted for the cached
                    // minimum, find the new minimum from scratch.
                    self.min_cache = self.buckets.keys().next().map(|&q| MinCache {
                        quantum: q,
                        multiplicity: self.buckets[&q].len(),
                    });
                }
            }
            _ => {}
        }
    }
}

impl Default for TimeoutList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(fpu_id: u32, deadline: Instant) -> TimeoutEntry {
        TimeoutEntry { fpu_id, opcode: Opcode::PingFpu, deadline }
    }

    #[test]
    fn quantizes_close_deadlines_into_same_bucket() {
        let mut list = TimeoutList::new();
        let now = Instant::now();
        list.insert(entry(0, now + Duration::from_millis(100)));
        list.insert(entry(1, now + Duration::from_millis(103)));
        // both land in the same 5ms quantum
        let q0 = quantize(now + Duration::from_millis(100), list.epoch);
        let q1 = quantize(now + Duration::from_millis(103), list.epoch);
        assert_eq!(q0, q1);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn pop_returns_smallest_deadline_first() {
        let mut list = TimeoutList::new();
        let now = Instant::now();
        list.insert(entry(0, now + Duration::from_millis(500)));
        list.insert(entry(1, now + Duration::from_millis(10)));
        list.insert(entry(2, now + Duration::from_millis(250)));
        assert_eq!(list.pop().unwrap().fpu_id, 1);
        assert_eq!(list.pop().unwrap().fpu_id, 2);
        assert_eq!(list.pop().unwrap().fpu_id, 0);
        assert!(list.pop().is_none());
    }

    #[test]
    fn remove_then_pop_keeps_len_consistent() {
        let mut list = TimeoutList::new();
        let now = Instant::now();
        list.insert(entry(0, now + Duration::from_millis(10)));
        list.insert(TimeoutEntry { fpu_id: 0, opcode: Opcode::ExecuteMotion, deadline: now + Duration::from_millis(20) });
        assert!(list.remove(0, Opcode::PingFpu).is_some());
        assert_eq!(list.len(), 1);
        assert!(list.remove(0, Opcode::PingFpu).is_none());
    }

    #[test]
    fn pop_expired_only_returns_past_deadlines() {
        let mut list = TimeoutList::new();
        let now = Instant::now();
        list.insert(entry(0, now - Duration::from_millis(5)));
        list.insert(entry(1, now + Duration::from_secs(100)));
        let expired = list.pop_expired(now);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].fpu_id, 0);
        assert_eq!(list.len(), 1);
    }
}
