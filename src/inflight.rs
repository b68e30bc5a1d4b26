//! In-Flight Table (C2): a fixed-capacity, open-addressed map from a TD's
//! guest address to the URB it belongs to, so a completion callback landing
//! later can find its way back to the schedule state without re-walking
//! anything.

use crate::urb::UrbRef;

const DEFAULT_CAPACITY: usize = 257;

#[derive(Clone)]
struct Slot {
    td_addr: u64,
    urb: UrbRef,
    submit_frame: u32,
}

/// Fixed-capacity open-addressed hash table keyed by `(td_addr >> 4) mod N`.
/// Collisions probe linearly; a full table drops the oldest entry rather
/// than failing the caller (an unbounded number of in-flight TDs would mean
/// a misbehaving guest, not a real operating condition).
pub struct InFlightTable {
    slots: Vec<Option<Slot>>,
    capacity: usize,
}

impl Default for InFlightTable {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl InFlightTable {
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            slots: vec![None; capacity],
            capacity,
        }
    }

    fn hash(&self, td_addr: u64) -> usize {
        ((td_addr >> 4) % self.capacity as u64) as usize
    }

    /// Inserts a mapping from `td_addr` to `urb`. If the table is full and
    /// every probed slot is occupied, evicts the slot at the home bucket.
    pub fn add(&mut self, td_addr: u64, urb: UrbRef, submit_frame: u32) {
        let home = self.hash(td_addr);
        for i in 0..self.capacity {
            let idx = (home + i) % self.capacity;
            if self.slots[idx].is_none() {
                self.slots[idx] = Some(Slot {
                    td_addr,
                    urb,
                    submit_frame,
                });
                return;
            }
        }
        self.slots[home] = Some(Slot {
            td_addr,
            urb,
            submit_frame,
        });
    }

    fn probe(&self, td_addr: u64) -> Option<usize> {
        let home = self.hash(td_addr);
        for i in 0..self.capacity {
            let idx = (home + i) % self.capacity;
            match &self.slots[idx] {
                Some(slot) if slot.td_addr == td_addr => return Some(idx),
                None => return None,
                _ => continue,
            }
        }
        None
    }

    pub fn find(&self, td_addr: u64) -> Option<UrbRef> {
        self.probe(td_addr).map(|idx| self.slots[idx].as_ref().unwrap().urb.clone())
    }

    /// Removes and returns the entry for `td_addr`, along with the frame
    /// number it was submitted in (used to compute its age for the
    /// stuck-transfer heuristics).
    pub fn remove(&mut self, td_addr: u64) -> Option<(UrbRef, u32)> {
        let idx = self.probe(td_addr)?;
        let slot = self.slots[idx].take().unwrap();
        Some((slot.urb, slot.submit_frame))
    }

    /// Removes every entry whose URB is (pointer-)equal to `urb`. Used when
    /// an ED/QH is unlinked and all its outstanding TDs must be forgotten at
    /// once, even though each TD occupies a different slot.
    pub fn clear_for_urb(&mut self, urb: &UrbRef) {
        for slot in self.slots.iter_mut() {
            if matches!(slot, Some(s) if UrbRef::ptr_eq(&s.urb, urb)) {
                *slot = None;
            }
        }
    }

    /// Alias kept for call sites that think in terms of "forget this URB"
    /// rather than "forget this ED's TDs".
    pub fn remove_urb(&mut self, urb: &UrbRef) {
        self.clear_for_urb(urb);
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Returns a `(td_addr, urb)` pair for every occupied slot. Used by the
    /// frame clock's orphan sweep, which needs to inspect every in-flight
    /// entry once per tick without mutating the table.
    pub fn snapshot(&self) -> Vec<(u64, UrbRef)> {
        self.slots
            .iter()
            .filter_map(|s| s.as_ref().map(|slot| (slot.td_addr, slot.urb.clone())))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::urb::{Direction, TransferType, UrbBuilder};

    fn dummy_urb() -> UrbRef {
        UrbBuilder::new(0x1000, Direction::In, TransferType::Bulk, 1, 1, 0).build()
    }

    #[test]
    fn add_then_find_then_remove() {
        let mut table = InFlightTable::with_capacity(17);
        let urb = dummy_urb();
        table.add(0x2000, urb.clone(), 5);
        assert!(UrbRef::ptr_eq(&table.find(0x2000).unwrap(), &urb));
        let (removed, frame) = table.remove(0x2000).unwrap();
        assert!(UrbRef::ptr_eq(&removed, &urb));
        assert_eq!(frame, 5);
        assert!(table.find(0x2000).is_none());
    }

    #[test]
    fn collisions_probe_linearly() {
        let mut table = InFlightTable::with_capacity(4);
        let urb_a = dummy_urb();
        let urb_b = dummy_urb();
        // both addresses hash to the same bucket under (addr>>4) % 4
        table.add(0x00, urb_a.clone(), 0);
        table.add(0x40, urb_b.clone(), 1);
        assert!(UrbRef::ptr_eq(&table.find(0x00).unwrap(), &urb_a));
        assert!(UrbRef::ptr_eq(&table.find(0x40).unwrap(), &urb_b));
    }

    #[test]
    fn clear_for_urb_removes_all_matching_entries() {
        let mut table = InFlightTable::with_capacity(257);
        let urb = dummy_urb();
        table.add(0x100, urb.clone(), 0);
        table.add(0x200, urb.clone(), 0);
        table.add(0x300, dummy_urb(), 0);
        table.clear_for_urb(&urb);
        assert!(table.find(0x100).is_none());
        assert!(table.find(0x200).is_none());
        assert!(table.find(0x300).is_some());
    }
}
