//! Fixed-capacity, slot-addressed ring buffer.
//!
//! Slot index is `sequence % capacity`. The backing vector is allocated once
//! and never grows past `capacity`; a write replaces the slot's contents in
//! place and hands the evicted entry back to the caller for archival.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{RING_CAPACITY_MAX, RING_CAPACITY_MIN};
use crate::model::{DataBlock, SampleKind};

/// One live ring entry. The archive stores the same structure.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Slot<T> {
    /// Per-ring write sequence; determines the slot index.
    pub sequence: u64,
    pub snapshot_id: u64,
    pub captured_at: i64,
    pub payload: T,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RingStats {
    pub writes: u64,
    /// Writes that replaced a live slot.
    pub overwrites: u64,
}

pub struct Ring<T> {
    capacity: usize,
    slots: Vec<Option<Slot<T>>>,
    next_sequence: u64,
    live: usize,
    stats: RingStats,
}

pub fn clamp_capacity(capacity: usize) -> usize {
    capacity.clamp(RING_CAPACITY_MIN, RING_CAPACITY_MAX)
}

impl<T> Ring<T> {
    /// Creates a ring; capacity is clamped to the supported range.
    pub fn new(capacity: usize) -> Self {
        let capacity = clamp_capacity(capacity);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            capacity,
            slots,
            next_sequence: 0,
            live: 0,
            stats: RingStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live slots.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn stats(&self) -> RingStats {
        self.stats
    }

    /// Writes into slot `sequence % capacity`, returning the entry it replaced.
    pub fn write(&mut self, snapshot_id: u64, captured_at: i64, payload: T) -> Option<Slot<T>> {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.stats.writes += 1;

        let index = (sequence % self.capacity as u64) as usize;
        let evicted = self.slots[index].replace(Slot {
            sequence,
            snapshot_id,
            captured_at,
            payload,
        });
        if evicted.is_some() {
            self.stats.overwrites += 1;
        } else {
            self.live += 1;
        }
        evicted
    }

    /// Entry at an absolute sequence, if it is still live.
    pub fn get(&self, sequence: u64) -> Option<&Slot<T>> {
        let index = (sequence % self.capacity as u64) as usize;
        self.slots[index]
            .as_ref()
            .filter(|slot| slot.sequence == sequence)
    }

    /// Up to `n` most recent entries, newest first.
    pub fn read_recent(&self, n: usize) -> Vec<&Slot<T>> {
        let count = n.min(self.len()) as u64;
        (0..count)
            .filter_map(|i| self.get(self.next_sequence - 1 - i))
            .collect()
    }

    /// All live entries, oldest first.
    pub fn iter_chronological(&self) -> impl Iterator<Item = &Slot<T>> {
        let start = self.next_sequence - self.len() as u64;
        (start..self.next_sequence).filter_map(move |seq| self.get(seq))
    }

    /// Changes capacity (clamped) and re-derives every slot position.
    ///
    /// Returns the oldest entries that no longer fit, oldest first.
    pub fn resize(&mut self, new_capacity: usize) -> Vec<Slot<T>> {
        let new_capacity = clamp_capacity(new_capacity);
        if new_capacity == self.capacity {
            return Vec::new();
        }

        let mut live: Vec<Slot<T>> = self.slots.iter_mut().filter_map(Option::take).collect();
        live.sort_by_key(|slot| slot.sequence);
        let overflow = live.len().saturating_sub(new_capacity);
        let dropped: Vec<Slot<T>> = live.drain(..overflow).collect();

        let mut slots = Vec::with_capacity(new_capacity);
        slots.resize_with(new_capacity, || None);
        for slot in live {
            let index = (slot.sequence % new_capacity as u64) as usize;
            slots[index] = Some(slot);
        }
        self.slots = slots;
        self.capacity = new_capacity;
        self.live -= dropped.len();
        dropped
    }

    /// Removes every live entry, oldest first.
    pub fn drain(&mut self) -> Vec<Slot<T>> {
        let mut live: Vec<Slot<T>> = self.slots.iter_mut().filter_map(Option::take).collect();
        live.sort_by_key(|slot| slot.sequence);
        self.live = 0;
        live
    }
}

/// One ring per sample kind.
pub struct RingStore {
    capacity: usize,
    rings: BTreeMap<SampleKind, Ring<DataBlock>>,
}

impl RingStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = clamp_capacity(capacity);
        let rings = SampleKind::ALL
            .into_iter()
            .map(|kind| (kind, Ring::new(capacity)))
            .collect();
        Self { capacity, rings }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ring(&self, kind: SampleKind) -> Option<&Ring<DataBlock>> {
        self.rings.get(&kind)
    }

    /// Writes one block into its kind's ring. Returns the evicted slot.
    pub fn write(
        &mut self,
        snapshot_id: u64,
        captured_at: i64,
        block: DataBlock,
    ) -> Option<Slot<DataBlock>> {
        let capacity = self.capacity;
        self.rings
            .entry(block.kind())
            .or_insert_with(|| Ring::new(capacity))
            .write(snapshot_id, captured_at, block)
    }

    pub fn read_recent(&self, kind: SampleKind, n: usize) -> Vec<Slot<DataBlock>> {
        self.rings
            .get(&kind)
            .map(|ring| ring.read_recent(n).into_iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Live entries of every kind captured within `[from, to]`, cloned.
    pub fn collect_range(&self, from: i64, to: i64) -> Vec<Slot<DataBlock>> {
        self.rings
            .values()
            .flat_map(|ring| ring.iter_chronological())
            .filter(|slot| slot.captured_at >= from && slot.captured_at <= to)
            .cloned()
            .collect()
    }

    /// Resizes every ring, returning entries that no longer fit.
    pub fn resize(&mut self, new_capacity: usize) -> Vec<Slot<DataBlock>> {
        self.capacity = clamp_capacity(new_capacity);
        let capacity = self.capacity;
        self.rings
            .values_mut()
            .flat_map(|ring| ring.resize(capacity))
            .collect()
    }

    pub fn drain(&mut self) -> Vec<Slot<DataBlock>> {
        self.rings.values_mut().flat_map(|ring| ring.drain()).collect()
    }

    /// Live slot count per kind.
    pub fn fill(&self) -> BTreeMap<SampleKind, usize> {
        self.rings.iter().map(|(k, r)| (*k, r.len())).collect()
    }

    pub fn stats(&self) -> RingStats {
        self.rings.values().fold(RingStats::default(), |acc, r| {
            let s = r.stats();
            RingStats {
                writes: acc.writes + s.writes,
                overwrites: acc.overwrites + s.overwrites,
            }
        })
    }
}
