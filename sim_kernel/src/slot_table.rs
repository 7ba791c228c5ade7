//! Per-cap-group slot table
//!
//! A growable array of slots plus two bitmaps: `slots_bmp` has one bit per
//! slot, `full_slots_bmp` one bit per *word* of `slots_bmp` that is
//! completely used. Free-slot search first skips full words through the
//! summary, then scans a single word.

use crate::object::Object;
use core_types::{CapId, CapRights};
use kernel_api::BITS_PER_LONG;
use std::sync::Arc;

/// One capability: an object reference plus the rights of this slot
#[derive(Debug, Clone)]
pub struct ObjectSlot {
    pub slot_id: CapId,
    pub object: Arc<Object>,
    pub rights: CapRights,
}

#[derive(Debug)]
pub struct SlotTable {
    slots: Vec<Option<ObjectSlot>>,
    slots_bmp: Vec<u64>,
    full_slots_bmp: Vec<u64>,
    max_size: usize,
}

fn words_for(bits: usize) -> usize {
    bits.div_ceil(BITS_PER_LONG)
}

impl SlotTable {
    pub fn new(initial_size: usize, max_size: usize) -> Self {
        let words = words_for(initial_size);
        Self {
            slots: (0..initial_size).map(|_| None).collect(),
            slots_bmp: vec![0; words],
            full_slots_bmp: vec![0; words_for(words)],
            max_size,
        }
    }

    /// Current capacity
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Number of reserved or occupied slots
    pub fn len(&self) -> usize {
        self.slots_bmp.iter().map(|word| word.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserves the lowest free slot id, growing the table if needed
    ///
    /// Returns `None` once the table is at `max_size` and full.
    pub fn alloc_slot_id(&mut self) -> Option<CapId> {
        loop {
            if let Some(index) = self.find_free() {
                self.set_bit(index);
                return Some(CapId::new(index as u32));
            }
            if !self.expand() {
                return None;
            }
        }
    }

    /// Returns a reserved but never installed slot id
    pub fn free_slot_id(&mut self, cap: CapId) {
        let index = cap.slot();
        if self.slots.get(index).map_or(false, Option::is_some) {
            panic!("BUG: freeing id of occupied slot {}", cap);
        }
        self.clear_bit(index);
    }

    /// Fills a slot reserved with [`alloc_slot_id`](Self::alloc_slot_id)
    pub fn install(&mut self, slot: ObjectSlot) {
        let index = slot.slot_id.slot();
        if !self.bit(index) {
            panic!("BUG: installing unreserved slot {}", slot.slot_id);
        }
        match self.slots.get_mut(index) {
            Some(entry @ None) => *entry = Some(slot),
            _ => panic!("BUG: slot {} already installed", slot.slot_id),
        }
    }

    pub fn get(&self, cap: CapId) -> Option<&ObjectSlot> {
        self.slots.get(cap.slot())?.as_ref()
    }

    /// Removes the slot and releases its id
    pub fn take(&mut self, cap: CapId) -> Option<ObjectSlot> {
        let slot = self.slots.get_mut(cap.slot())?.take()?;
        self.clear_bit(cap.slot());
        Some(slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObjectSlot> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    /// Empties the table
    pub fn drain(&mut self) -> Vec<ObjectSlot> {
        let drained: Vec<ObjectSlot> = self.slots.iter_mut().filter_map(Option::take).collect();
        self.slots_bmp.iter_mut().for_each(|word| *word = 0);
        self.full_slots_bmp.iter_mut().for_each(|word| *word = 0);
        drained
    }

    fn find_free(&self) -> Option<usize> {
        for (summary_index, summary) in self.full_slots_bmp.iter().enumerate() {
            if *summary == u64::MAX {
                continue;
            }
            let word_index = summary_index * BITS_PER_LONG + (!summary).trailing_zeros() as usize;
            let word = *self.slots_bmp.get(word_index)?;
            let index = word_index * BITS_PER_LONG + (!word).trailing_zeros() as usize;
            return (index < self.slots.len()).then_some(index);
        }
        None
    }

    fn expand(&mut self) -> bool {
        let size = self.slots.len();
        if size >= self.max_size {
            return false;
        }
        let new_size = (size * 2).clamp(BITS_PER_LONG, self.max_size);
        self.slots.resize_with(new_size, || None);
        let words = words_for(new_size);
        self.slots_bmp.resize(words, 0);
        self.full_slots_bmp.resize(words_for(words), 0);
        true
    }

    fn bit(&self, index: usize) -> bool {
        let word = index / BITS_PER_LONG;
        self.slots_bmp
            .get(word)
            .map_or(false, |w| w & (1u64 << (index % BITS_PER_LONG)) != 0)
    }

    fn set_bit(&mut self, index: usize) {
        let word = index / BITS_PER_LONG;
        self.slots_bmp[word] |= 1 << (index % BITS_PER_LONG);
        if self.slots_bmp[word] == u64::MAX {
            self.full_slots_bmp[word / BITS_PER_LONG] |= 1 << (word % BITS_PER_LONG);
        }
    }

    fn clear_bit(&mut self, index: usize) {
        let word = index / BITS_PER_LONG;
        if let Some(w) = self.slots_bmp.get_mut(word) {
            *w &= !(1u64 << (index % BITS_PER_LONG));
            self.full_slots_bmp[word / BITS_PER_LONG] &= !(1u64 << (word % BITS_PER_LONG));
        }
    }
}
