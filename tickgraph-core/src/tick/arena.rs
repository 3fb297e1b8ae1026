//! Generational arena of tick function records.

use super::function::{TickFunctionId, TickFunctionRecord};

struct Slot {
    generation: u32,
    record: Option<TickFunctionRecord>,
}

/// Owns every tick function record. Freed slots are reused with a bumped
/// generation so old ids never alias new functions.
#[derive(Default)]
pub(crate) struct TickArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl TickArena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, record: TickFunctionRecord) -> TickFunctionId {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.record = Some(record);
            return TickFunctionId::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            record: Some(record),
        });
        TickFunctionId::new(index, 0)
    }

    pub(crate) fn get(&self, id: TickFunctionId) -> Option<&TickFunctionRecord> {
        self.slots
            .get(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.record.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: TickFunctionId) -> Option<&mut TickFunctionRecord> {
        self.slots
            .get_mut(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.record.as_mut())
    }

    pub(crate) fn contains(&self, id: TickFunctionId) -> bool {
        self.get(id).is_some()
    }

    pub(crate) fn remove(&mut self, id: TickFunctionId) -> Option<TickFunctionRecord> {
        let slot = self.slots.get_mut(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        let record = slot.record.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index());
        self.len -= 1;
        Some(record)
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (TickFunctionId, &TickFunctionRecord)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.record
                .as_ref()
                .map(|record| (TickFunctionId::new(index as u32, slot.generation), record))
        })
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (TickFunctionId, &mut TickFunctionRecord)> {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
            let generation = slot.generation;
            slot.record
                .as_mut()
                .map(|record| (TickFunctionId::new(index as u32, generation), record))
        })
    }
}
