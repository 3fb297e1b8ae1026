//! Interval Cooldowns
//!
//! Functions waiting out their tick interval live in a list sorted by when
//! they are next due. Each entry stores its cooldown *relative to the entry
//! before it*, so advancing time only ever touches the head of the list.
//!
//! # Per-frame flow
//!
//! 1. Frame start: pending reschedules are merged into the list
//!    ([`CooldownList::schedule`]), then entries whose cumulative cooldown is
//!    below the frame delta are flipped back to enabled
//!    ([`CooldownList::promote`]). The first entry not yet due absorbs the
//!    elapsed time.
//! 2. Queueing: promoted entries are popped from the head and rescheduled for
//!    their interval minus any overrun ([`CooldownList::pop_promoted`]).
//! 3. Frame end: reschedules gathered during the frame are merged again.

use std::collections::VecDeque;

use super::arena::TickArena;
use super::function::{TickFunctionId, TickState};

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct CooldownEntry {
    pub(crate) id: TickFunctionId,
    /// Seconds after the previous entry becomes due.
    pub(crate) relative: f32,
}

/// A request to put a function into the cooldown list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Reschedule {
    pub(crate) id: TickFunctionId,
    pub(crate) cooldown: f32,
}

/// Outcome for one entry of a paused frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct PausedEntry {
    pub(crate) id: TickFunctionId,
    pub(crate) execute: bool,
    pub(crate) cooldown: f32,
}

#[derive(Debug, Default)]
pub(crate) struct CooldownList {
    entries: VecDeque<CooldownEntry>,
}

impl CooldownList {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn contains(&self, id: TickFunctionId) -> bool {
        self.entries.iter().any(|entry| entry.id == id)
    }

    /// Entries paired with the absolute seconds until each is due.
    pub(crate) fn remaining(&self) -> impl Iterator<Item = (TickFunctionId, f32)> + '_ {
        self.entries.iter().scan(0.0_f32, |cumulative, entry| {
            *cumulative += entry.relative;
            Some((entry.id, *cumulative))
        })
    }

    /// Merge `pending` into the list, keeping it sorted by due time.
    ///
    /// Functions disabled (or removed) since the reschedule was requested are
    /// dropped. Everything inserted becomes [`TickState::CoolingDown`].
    pub(crate) fn schedule(&mut self, pending: &mut Vec<Reschedule>, arena: &mut TickArena) {
        if pending.is_empty() {
            return;
        }
        pending.sort_by(|a, b| a.cooldown.total_cmp(&b.cooldown));

        let mut incoming = pending.drain(..).peekable();
        let mut index = 0;
        let mut cumulative = 0.0_f32;

        while index < self.entries.len() {
            let Some(next) = incoming.peek().copied() else {
                break;
            };
            let compared = self.entries[index].relative;
            if cumulative + compared > next.cooldown {
                incoming.next();
                if let Some(record) = arena.get_mut(next.id) {
                    if record.state != TickState::Disabled {
                        record.set_state(TickState::CoolingDown);
                        let relative = next.cooldown - cumulative;
                        self.entries[index].relative -= relative;
                        self.entries.insert(index, CooldownEntry { id: next.id, relative });
                        index += 1;
                        cumulative += relative;
                    }
                }
            } else {
                cumulative += compared;
                index += 1;
            }
        }

        for next in incoming {
            let Some(record) = arena.get_mut(next.id) else {
                continue;
            };
            if record.state == TickState::Disabled {
                continue;
            }
            record.set_state(TickState::CoolingDown);
            let relative = next.cooldown - cumulative;
            self.entries.push_back(CooldownEntry { id: next.id, relative });
            cumulative += relative;
        }
    }

    /// Enable every entry due within `delta`. The first entry left waiting
    /// is charged the elapsed time. Returns how many were enabled.
    pub(crate) fn promote(&mut self, delta: f32, arena: &mut TickArena) -> usize {
        let mut cumulative = 0.0_f32;
        let mut promoted = 0;
        for entry in self.entries.iter_mut() {
            if cumulative + entry.relative >= delta {
                entry.relative -= delta - cumulative;
                break;
            }
            cumulative += entry.relative;
            if let Some(record) = arena.get_mut(entry.id) {
                record.set_state(TickState::Enabled);
            }
            promoted += 1;
        }
        promoted
    }

    /// Pop the head if it was promoted this frame.
    pub(crate) fn pop_promoted(&mut self, arena: &TickArena) -> Option<CooldownEntry> {
        let head = self.entries.front()?;
        let promoted = arena
            .get(head.id)
            .is_some_and(|record| record.state == TickState::Enabled);
        if promoted {
            self.entries.pop_front()
        } else {
            None
        }
    }

    /// Remove `id`. With `credit_next` the following entry inherits its
    /// relative cooldown so everything behind it stays due at the same time.
    pub(crate) fn remove(&mut self, id: TickFunctionId, credit_next: bool) -> bool {
        let Some(index) = self.entries.iter().position(|entry| entry.id == id) else {
            return false;
        };
        let removed = self.entries.remove(index);
        if credit_next {
            if let (Some(removed), Some(next)) = (removed, self.entries.get_mut(index)) {
                next.relative += removed.relative;
            }
        }
        true
    }

    /// Pull out every entry flagged to tick while paused.
    ///
    /// Entries due within `delta` are marked for execution with a cooldown
    /// of their interval minus the overrun; the rest keep their remaining
    /// time. Either way the caller reschedules them.
    pub(crate) fn take_paused(&mut self, delta: f32, arena: &TickArena) -> Vec<PausedEntry> {
        let mut taken = Vec::new();
        let mut cumulative = 0.0_f32;
        let mut index = 0;

        while index < self.entries.len() {
            let entry = self.entries[index];
            cumulative += entry.relative;
            let Some(record) = arena.get(entry.id) else {
                index += 1;
                continue;
            };
            if !record.flags.tick_even_when_paused {
                index += 1;
                continue;
            }

            let execute = cumulative < delta;
            let cooldown = if execute {
                record.interval - (delta - cumulative)
            } else {
                cumulative - delta
            };
            taken.push(PausedEntry {
                id: entry.id,
                execute,
                cooldown,
            });

            self.entries.remove(index);
            if let Some(next) = self.entries.get_mut(index) {
                next.relative += entry.relative;
                cumulative -= entry.relative;
            }
        }
        taken
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = TickFunctionId> + '_ {
        self.entries.iter().map(|entry| entry.id)
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tick::function::{TickFunctionRecord, TickFunctionSpec};

    fn arena_with(count: usize) -> (TickArena, Vec<TickFunctionId>) {
        let mut arena = TickArena::new();
        let ids = (0..count)
            .map(|i| {
                arena.insert(TickFunctionRecord::new(
                    TickFunctionSpec::new(format!("f{i}"), |_| {}).with_interval(1.0),
                ))
            })
            .collect();
        (arena, ids)
    }

    fn due(list: &CooldownList) -> Vec<(TickFunctionId, f32)> {
        list.remaining().collect()
    }

    #[test]
    fn schedule_sorts_by_due_time() {
        let (mut arena, ids) = arena_with(3);
        let mut list = CooldownList::default();
        let mut pending = vec![
            Reschedule { id: ids[0], cooldown: 0.75 },
            Reschedule { id: ids[1], cooldown: 0.25 },
        ];
        list.schedule(&mut pending, &mut arena);
        assert!(pending.is_empty());
        assert_eq!(due(&list), vec![(ids[1], 0.25), (ids[0], 0.75)]);

        let mut pending = vec![Reschedule { id: ids[2], cooldown: 0.5 }];
        list.schedule(&mut pending, &mut arena);
        assert_eq!(due(&list), vec![(ids[1], 0.25), (ids[2], 0.5), (ids[0], 0.75)]);
        assert_eq!(arena.get(ids[2]).unwrap().state, TickState::CoolingDown);
    }

    #[test]
    fn schedule_skips_disabled() {
        let (mut arena, ids) = arena_with(1);
        arena.get_mut(ids[0]).unwrap().set_state(TickState::Disabled);
        let mut list = CooldownList::default();
        list.schedule(&mut vec![Reschedule { id: ids[0], cooldown: 1.0 }], &mut arena);
        assert_eq!(list.len(), 0);
        assert_eq!(arena.get(ids[0]).unwrap().state, TickState::Disabled);
    }

    #[test]
    fn promote_charges_first_waiting_entry() {
        let (mut arena, ids) = arena_with(3);
        let mut list = CooldownList::default();
        list.schedule(
            &mut vec![
                Reschedule { id: ids[0], cooldown: 0.125 },
                Reschedule { id: ids[1], cooldown: 0.25 },
                Reschedule { id: ids[2], cooldown: 1.0 },
            ],
            &mut arena,
        );

        assert_eq!(list.promote(0.5, &mut arena), 2);
        assert_eq!(arena.get(ids[0]).unwrap().state, TickState::Enabled);
        assert_eq!(arena.get(ids[1]).unwrap().state, TickState::Enabled);
        assert_eq!(arena.get(ids[2]).unwrap().state, TickState::CoolingDown);

        let first = list.pop_promoted(&arena).unwrap();
        let second = list.pop_promoted(&arena).unwrap();
        assert_eq!((first.id, first.relative), (ids[0], 0.125));
        assert_eq!((second.id, second.relative), (ids[1], 0.125));
        assert!(list.pop_promoted(&arena).is_none());
        // 1.0 due, 0.5 elapsed
        assert_eq!(due(&list), vec![(ids[2], 0.5)]);
    }

    #[test]
    fn exactly_due_waits_one_more_frame() {
        let (mut arena, ids) = arena_with(1);
        let mut list = CooldownList::default();
        list.schedule(&mut vec![Reschedule { id: ids[0], cooldown: 0.25 }], &mut arena);
        assert_eq!(list.promote(0.25, &mut arena), 0);
        assert_eq!(due(&list), vec![(ids[0], 0.0)]);
        assert_eq!(list.promote(0.25, &mut arena), 1);
    }

    #[test]
    fn remove_credits_the_next_entry() {
        let (mut arena, ids) = arena_with(3);
        let mut list = CooldownList::default();
        list.schedule(
            &mut vec![
                Reschedule { id: ids[0], cooldown: 0.25 },
                Reschedule { id: ids[1], cooldown: 0.5 },
                Reschedule { id: ids[2], cooldown: 0.75 },
            ],
            &mut arena,
        );
        assert!(list.remove(ids[1], true));
        assert_eq!(due(&list), vec![(ids[0], 0.25), (ids[2], 0.75)]);
        assert!(!list.remove(ids[1], true));
        assert!(list.contains(ids[2]));
    }

    #[test]
    fn paused_entries_are_taken_out() {
        let (mut arena, ids) = arena_with(3);
        {
            let record = arena.get_mut(ids[0]).unwrap();
            record.flags.tick_even_when_paused = true;
        }
        {
            let record = arena.get_mut(ids[2]).unwrap();
            record.flags.tick_even_when_paused = true;
        }
        let mut list = CooldownList::default();
        list.schedule(
            &mut vec![
                Reschedule { id: ids[0], cooldown: 0.125 },
                Reschedule { id: ids[1], cooldown: 0.5 },
                Reschedule { id: ids[2], cooldown: 1.0 },
            ],
            &mut arena,
        );

        let taken = list.take_paused(0.25, &arena);
        assert_eq!(
            taken,
            vec![
                PausedEntry { id: ids[0], execute: true, cooldown: 0.875 },
                PausedEntry { id: ids[2], execute: false, cooldown: 0.75 },
            ]
        );
        assert_eq!(due(&list), vec![(ids[1], 0.5)]);
    }
}
