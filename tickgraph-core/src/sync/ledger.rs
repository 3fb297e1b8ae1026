//! Work Ledger
//!
//! Per sync point bookkeeping of reserved and requested work.
//!
//! # Overview
//!
//! Every unit of work lives in a slot. A slot is reused after the unit is
//! abandoned or the frame resets, and its generation is bumped each time so
//! handles to the previous occupant go stale.
//!
//! # Design Decisions
//!
//! Execution is two-phase. A pass first snapshots the pending units as
//! `(slot, generation, serial)` tickets, then claims them one at a time. The
//! serial is bumped whenever a unit's request changes, so a reset or abandon
//! that lands between the snapshot and the claim voids the ticket instead of
//! running stale work.

use serde::Serialize;
use tracing::warn;

use crate::error::{Result, TickGraphError};
use crate::task::TaskContext;

/// A unit of requested work. Runs at most once.
pub type SyncWork = Box<dyn FnOnce(&TaskContext) + Send>;

enum UnitState {
    Reserved,
    Requested(SyncWork),
    Executing,
    Executed,
}

struct Slot {
    generation: u32,
    serial: u64,
    unit: Option<UnitState>,
}

/// Claim on a pending unit, taken by an execution pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Ticket {
    slot: usize,
    generation: u32,
    serial: u64,
}

/// Aggregate ledger state for one sync point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerCounts {
    /// Units promised but not yet requested.
    pub reserved: usize,
    /// Units requested and waiting to run.
    pub requested: usize,
    /// Units that have run this frame.
    pub executed: usize,
    /// Times the point was dispatched this frame.
    pub dispatches: usize,
}

impl LedgerCounts {
    pub fn is_idle(&self) -> bool {
        self.reserved == 0 && self.requested == 0
    }
}

#[derive(Default)]
pub(crate) struct WorkLedger {
    slots: Vec<Slot>,
    free: Vec<usize>,
    counts: LedgerCounts,
}

impl WorkLedger {
    pub(crate) fn counts(&self) -> LedgerCounts {
        self.counts
    }

    pub(crate) fn record_dispatch(&mut self) {
        self.counts.dispatches += 1;
    }

    fn occupy(&mut self, state: UnitState) -> (usize, u32) {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    serial: 0,
                    unit: None,
                });
                self.slots.len() - 1
            }
        };
        let entry = &mut self.slots[slot];
        entry.serial += 1;
        entry.unit = Some(state);
        (slot, entry.generation)
    }

    fn live(&mut self, slot: usize, generation: u32) -> Result<&mut Slot> {
        match self.slots.get_mut(slot) {
            Some(entry) if entry.generation == generation && entry.unit.is_some() => Ok(entry),
            _ => Err(TickGraphError::StaleWorkHandle),
        }
    }

    pub(crate) fn reserve(&mut self) -> (usize, u32) {
        self.counts.reserved += 1;
        self.occupy(UnitState::Reserved)
    }

    pub(crate) fn request_new(&mut self, work: SyncWork) -> (usize, u32) {
        self.counts.requested += 1;
        self.occupy(UnitState::Requested(work))
    }

    /// Attach work to a reserved unit.
    ///
    /// Requesting a unit that is already requested replaces its work.
    /// Requesting a unit that has run queues it again.
    pub(crate) fn request(&mut self, slot: usize, generation: u32, work: SyncWork) -> Result<()> {
        let entry = self.live(slot, generation)?;
        entry.serial += 1;
        let previous = entry.unit.replace(UnitState::Requested(work));
        match previous {
            Some(UnitState::Reserved) => {
                self.counts.reserved -= 1;
                self.counts.requested += 1;
            }
            Some(UnitState::Requested(_)) => {
                warn!(slot, "work requested twice; the earlier request is replaced");
            }
            _ => self.counts.requested += 1,
        }
        Ok(())
    }

    /// Drop a unit entirely. Work already running is not interrupted.
    pub(crate) fn abandon(&mut self, slot: usize, generation: u32) -> Result<()> {
        let entry = self.live(slot, generation)?;
        let previous = entry.unit.take();
        entry.generation = entry.generation.wrapping_add(1);
        entry.serial += 1;
        match previous {
            Some(UnitState::Reserved) => self.counts.reserved -= 1,
            Some(UnitState::Requested(_)) => self.counts.requested -= 1,
            _ => {}
        }
        self.free.push(slot);
        Ok(())
    }

    /// Return a unit to the reserved state, discarding any requested work.
    pub(crate) fn reset(&mut self, slot: usize, generation: u32) -> Result<()> {
        let entry = self.live(slot, generation)?;
        entry.serial += 1;
        let previous = entry.unit.replace(UnitState::Reserved);
        match previous {
            Some(UnitState::Reserved) => {}
            Some(UnitState::Requested(_)) => {
                self.counts.requested -= 1;
                self.counts.reserved += 1;
            }
            _ => self.counts.reserved += 1,
        }
        Ok(())
    }

    pub(crate) fn pending(&self) -> Vec<Ticket> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, entry)| matches!(entry.unit, Some(UnitState::Requested(_))))
            .map(|(slot, entry)| Ticket {
                slot,
                generation: entry.generation,
                serial: entry.serial,
            })
            .collect()
    }

    /// Take the work behind `ticket` if nothing has changed since it was
    /// issued.
    pub(crate) fn claim(&mut self, ticket: Ticket) -> Option<SyncWork> {
        let entry = self.slots.get_mut(ticket.slot)?;
        if entry.generation != ticket.generation || entry.serial != ticket.serial {
            return None;
        }
        match entry.unit.take() {
            Some(UnitState::Requested(work)) => {
                entry.unit = Some(UnitState::Executing);
                self.counts.requested -= 1;
                Some(work)
            }
            other => {
                entry.unit = other;
                None
            }
        }
    }

    pub(crate) fn finish(&mut self, ticket: Ticket) {
        self.counts.executed += 1;
        if let Some(entry) = self.slots.get_mut(ticket.slot) {
            if entry.generation == ticket.generation && matches!(entry.unit, Some(UnitState::Executing)) {
                entry.unit = Some(UnitState::Executed);
            }
        }
    }

    /// Forget every unit. Outstanding handles go stale.
    pub(crate) fn clear(&mut self) {
        self.free.clear();
        for (slot, entry) in self.slots.iter_mut().enumerate() {
            entry.unit = None;
            entry.generation = entry.generation.wrapping_add(1);
            entry.serial += 1;
            self.free.push(slot);
        }
        self.counts = LedgerCounts::default();
    }

    #[cfg(test)]
    fn recount(&self) -> (usize, usize) {
        self.slots.iter().fold((0, 0), |(reserved, requested), entry| match entry.unit {
            Some(UnitState::Reserved) => (reserved + 1, requested),
            Some(UnitState::Requested(_)) => (reserved, requested + 1),
            _ => (reserved, requested),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::task::{CompletionHandle, ThreadIdentity};

    fn counting(counter: &Arc<AtomicUsize>) -> SyncWork {
        let counter = counter.clone();
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn run_pass(ledger: &mut WorkLedger) -> usize {
        let handle = CompletionHandle::new(0);
        let context = TaskContext::detached(&handle, ThreadIdentity::External);
        let mut ran = 0;
        for ticket in ledger.pending() {
            if let Some(work) = ledger.claim(ticket) {
                work(&context);
                ledger.finish(ticket);
                ran += 1;
            }
        }
        ran
    }

    fn assert_consistent(ledger: &WorkLedger) {
        let counts = ledger.counts();
        assert_eq!(ledger.recount(), (counts.reserved, counts.requested));
    }

    #[test]
    fn reserve_then_request_moves_the_count() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut ledger = WorkLedger::default();
        let (slot, generation) = ledger.reserve();
        assert_eq!(ledger.counts().reserved, 1);

        ledger.request(slot, generation, counting(&counter)).unwrap();
        assert_eq!((ledger.counts().reserved, ledger.counts().requested), (0, 1));
        assert_consistent(&ledger);

        assert_eq!(run_pass(&mut ledger), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(ledger.counts().executed, 1);
        assert_eq!(run_pass(&mut ledger), 0);
    }

    #[test]
    fn abandon_returns_counts_to_zero() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut ledger = WorkLedger::default();
        let (slot, generation) = ledger.reserve();
        ledger.request(slot, generation, counting(&counter)).unwrap();
        ledger.abandon(slot, generation).unwrap();

        assert!(ledger.counts().is_idle());
        assert_eq!(run_pass(&mut ledger), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(matches!(
            ledger.request(slot, generation, counting(&counter)),
            Err(TickGraphError::StaleWorkHandle)
        ));
        assert_consistent(&ledger);
    }

    #[test]
    fn slots_are_reused_with_new_generations() {
        let mut ledger = WorkLedger::default();
        let (slot, generation) = ledger.reserve();
        ledger.abandon(slot, generation).unwrap();
        let (again, next) = ledger.reserve();
        assert_eq!(again, slot);
        assert_ne!(next, generation);
        assert!(ledger.abandon(slot, generation).is_err());
    }

    #[test]
    fn reset_voids_a_snapshotted_ticket() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut ledger = WorkLedger::default();
        let (slot, generation) = ledger.request_new(counting(&counter));
        let tickets = ledger.pending();

        ledger.reset(slot, generation).unwrap();
        assert_eq!(ledger.counts().reserved, 1);
        assert!(tickets.into_iter().all(|ticket| ledger.claim(ticket).is_none()));

        // re-requesting issues a fresh ticket
        ledger.request(slot, generation, counting(&counter)).unwrap();
        assert_eq!(run_pass(&mut ledger), 1);
        assert_consistent(&ledger);
    }

    #[test]
    fn abandon_voids_a_snapshotted_ticket() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut ledger = WorkLedger::default();
        let (slot, generation) = ledger.request_new(counting(&counter));
        let tickets = ledger.pending();
        ledger.abandon(slot, generation).unwrap();
        // the slot is reused before the stale ticket is presented
        let _ = ledger.request_new(counting(&counter));
        assert!(tickets.into_iter().all(|ticket| ledger.claim(ticket).is_none()));
        assert_eq!(run_pass(&mut ledger), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn replacing_a_request_keeps_one_unit() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let mut ledger = WorkLedger::default();
        let (slot, generation) = ledger.request_new(counting(&first));
        ledger.request(slot, generation, counting(&second)).unwrap();
        assert_eq!(ledger.counts().requested, 1);
        run_pass(&mut ledger);
        assert_eq!((first.load(Ordering::SeqCst), second.load(Ordering::SeqCst)), (0, 1));
    }

    #[test]
    fn clear_stales_every_handle() {
        let mut ledger = WorkLedger::default();
        let (slot, generation) = ledger.reserve();
        ledger.record_dispatch();
        ledger.clear();
        assert_eq!(ledger.counts(), LedgerCounts::default());
        assert!(ledger.reset(slot, generation).is_err());
    }
}
