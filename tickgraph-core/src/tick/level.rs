//! Per-level bookkeeping.
//!
//! A level owns the membership lists of its registered functions: enabled,
//! disabled, cooling down and newly spawned. The manager drives each
//! visible level through the frame; hidden levels keep their lists but are
//! skipped entirely.

use indexmap::IndexSet;
use tracing::{debug, error, warn};

use super::arena::TickArena;
use super::cooldown::{CooldownList, Reschedule};
use super::function::{LevelId, TickFunctionId, TickFunctionRecord, TickState};
use super::resolver::Resolver;

pub(crate) struct TickLevel {
    id: LevelId,
    pub(crate) visible: bool,
    enabled: IndexSet<TickFunctionId>,
    disabled: IndexSet<TickFunctionId>,
    /// Enabled functions registered while a frame is in progress.
    newly_spawned: IndexSet<TickFunctionId>,
    cooldowns: CooldownList,
    reschedule: Vec<Reschedule>,
    tick_newly_spawned: bool,
}

impl TickLevel {
    pub(crate) fn new(id: LevelId) -> Self {
        Self {
            id,
            visible: true,
            enabled: IndexSet::new(),
            disabled: IndexSet::new(),
            newly_spawned: IndexSet::new(),
            cooldowns: CooldownList::default(),
            reschedule: Vec::new(),
            tick_newly_spawned: false,
        }
    }

    pub(crate) fn id(&self) -> LevelId {
        self.id
    }

    /// File a function under the list matching its state.
    pub(crate) fn add_function(&mut self, id: TickFunctionId, record: &mut TickFunctionRecord) {
        if record.state == TickState::CoolingDown {
            record.set_state(TickState::Enabled);
        }
        match record.state {
            TickState::Disabled => {
                self.disabled.insert(id);
            }
            _ => {
                self.enabled.insert(id);
                if self.tick_newly_spawned {
                    self.newly_spawned.insert(id);
                }
            }
        }
    }

    pub(crate) fn remove_function(&mut self, id: TickFunctionId, record: &TickFunctionRecord) {
        match record.state {
            TickState::Enabled => {
                // Interval functions promoted this frame are still at the head
                // of the cooldown list. The entry behind them has already
                // been charged for the elapsed time, so it gets no credit.
                if !self.enabled.shift_remove(&id) {
                    self.cooldowns.remove(id, false);
                }
            }
            TickState::Disabled => {
                self.disabled.shift_remove(&id);
            }
            TickState::CoolingDown => {
                if !self.cooldowns.remove(id, true) {
                    warn!(level = %self.id, tick = %record.name, "cooling down function missing from cooldown list");
                }
            }
        }
        self.newly_spawned.shift_remove(&id);
        self.reschedule.retain(|entry| entry.id != id);
    }

    #[cfg(test)]
    pub(crate) fn has_function(&self, id: TickFunctionId) -> bool {
        self.enabled.contains(&id)
            || self.disabled.contains(&id)
            || self.cooldowns.contains(id)
            || self.reschedule.iter().any(|entry| entry.id == id)
    }

    /// Put `id` into the cooldown list at the next merge.
    pub(crate) fn reschedule_for_interval(&mut self, arena: &mut TickArena, id: TickFunctionId, cooldown: f32) {
        if let Some(record) = arena.get_mut(id) {
            record.was_interval = true;
        }
        self.reschedule.push(Reschedule { id, cooldown });
    }

    /// Apply a changed interval to a function already waiting on its old one.
    pub(crate) fn update_reschedule_interval(&mut self, arena: &mut TickArena, id: TickFunctionId, interval: f32) {
        let Some(state) = arena.get(id).map(|record| record.state) else {
            return;
        };
        for entry in self.reschedule.iter_mut().filter(|entry| entry.id == id) {
            entry.cooldown = entry.cooldown.min(interval);
        }
        if state != TickState::CoolingDown {
            return;
        }

        let remaining = self
            .cooldowns
            .remaining()
            .find(|(entry, _)| *entry == id)
            .map(|(_, remaining)| remaining);
        self.cooldowns.remove(id, true);
        if interval > 0.0 {
            let cooldown = remaining.map_or(interval, |remaining| remaining.min(interval));
            self.reschedule_for_interval(arena, id, cooldown);
        } else if let Some(record) = arena.get_mut(id) {
            record.set_state(TickState::Enabled);
            self.enabled.insert(id);
        }
    }

    /// Merge pending cooldowns and enable everything due within `delta`.
    /// Returns how many functions may tick this frame.
    pub(crate) fn start_frame(&mut self, delta: f32, arena: &mut TickArena) -> usize {
        if !self.newly_spawned.is_empty() {
            warn!(
                level = %self.id,
                count = self.newly_spawned.len(),
                "newly spawned functions left over from the previous frame"
            );
            self.newly_spawned.clear();
        }
        self.tick_newly_spawned = true;
        self.cooldowns.schedule(&mut self.reschedule, arena);
        let promoted = self.cooldowns.promote(delta, arena);
        self.enabled.len() + promoted
    }

    /// Queue every function due this frame.
    pub(crate) fn queue_all(&mut self, resolver: &mut Resolver<'_>) {
        let enabled: Vec<TickFunctionId> = self.enabled.iter().copied().collect();
        for id in &enabled {
            resolver.queue(*id);
        }

        let intervals: Vec<(TickFunctionId, f32)> = enabled
            .into_iter()
            .filter_map(|id| {
                resolver
                    .arena
                    .get(id)
                    .filter(|record| record.interval > 0.0)
                    .map(|record| (id, record.interval))
            })
            .collect();
        for (id, interval) in intervals {
            self.enabled.shift_remove(&id);
            self.reschedule_for_interval(resolver.arena, id, interval);
        }

        let delta = resolver.frame.delta_seconds;
        let mut cumulative = 0.0_f32;
        while let Some(entry) = self.cooldowns.pop_promoted(resolver.arena) {
            cumulative += entry.relative;
            resolver.queue(entry.id);
            let interval = resolver.arena.get(entry.id).map_or(0.0, |record| record.interval);
            if interval > 0.0 {
                // Credit the overrun so the cadence does not drift.
                self.reschedule_for_interval(resolver.arena, entry.id, interval - (delta - cumulative));
            } else {
                self.enabled.insert(entry.id);
            }
        }
    }

    /// Queue functions registered since the last pass. Returns how many.
    pub(crate) fn queue_newly_spawned(&mut self, resolver: &mut Resolver<'_>) -> usize {
        let spawned: Vec<TickFunctionId> = self.newly_spawned.drain(..).collect();
        for id in &spawned {
            resolver.queue(*id);
            let interval = resolver
                .arena
                .get(*id)
                .filter(|record| record.state == TickState::Enabled)
                .map_or(0.0, |record| record.interval);
            if interval > 0.0 && self.enabled.shift_remove(id) {
                self.reschedule_for_interval(resolver.arena, *id, interval);
            }
        }
        spawned.len()
    }

    /// Drop what is still waiting in the newly spawned set. The functions
    /// stay registered and tick from next frame on.
    pub(crate) fn discard_runaway(&mut self, arena: &TickArena) {
        for id in self.newly_spawned.drain(..) {
            let name = arena.get(id).map(|record| record.name.clone());
            error!(
                level = %self.id,
                tick = name.as_deref().unwrap_or("<removed>"),
                "runaway tick spawning; discarding newly spawned function for this frame"
            );
        }
    }

    /// Pull out functions that tick while paused. Returns the ones due now,
    /// in list order.
    pub(crate) fn pause_frame(&mut self, delta: f32, arena: &mut TickArena) -> Vec<TickFunctionId> {
        let mut due = Vec::new();
        for entry in self.cooldowns.take_paused(delta, arena) {
            if entry.execute {
                due.push(entry.id);
            }
            self.reschedule_for_interval(arena, entry.id, entry.cooldown);
        }
        for id in &self.enabled {
            let ticks = arena
                .get(*id)
                .is_some_and(|record| record.flags.tick_even_when_paused && record.state == TickState::Enabled);
            if ticks {
                due.push(*id);
            }
        }
        self.cooldowns.schedule(&mut self.reschedule, arena);
        due
    }

    pub(crate) fn end_frame(&mut self, arena: &mut TickArena) {
        self.cooldowns.schedule(&mut self.reschedule, arena);
        self.tick_newly_spawned = false;
        if !self.newly_spawned.is_empty() {
            debug!(
                level = %self.id,
                count = self.newly_spawned.len(),
                "functions registered after the last group will tick next frame"
            );
            self.newly_spawned.clear();
        }
    }

    pub(crate) fn enabled_len(&self) -> usize {
        self.enabled.len()
    }

    pub(crate) fn disabled_len(&self) -> usize {
        self.disabled.len()
    }

    pub(crate) fn cooling_down_len(&self) -> usize {
        self.cooldowns.len()
    }

    #[cfg(test)]
    pub(crate) fn newly_spawned_len(&self) -> usize {
        self.newly_spawned.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.enabled.len() + self.disabled.len() + self.cooldowns.len() + self.reschedule.len()
    }

    /// Seconds until a cooling down function is due again.
    pub(crate) fn cooldown_remaining(&self, id: TickFunctionId) -> Option<f32> {
        self.cooldowns
            .remaining()
            .find(|(entry, _)| *entry == id)
            .map(|(_, remaining)| remaining)
    }

    /// Every function the level holds, in list order.
    pub(crate) fn functions(&self) -> Vec<TickFunctionId> {
        let mut ids: Vec<TickFunctionId> = self.enabled.iter().copied().collect();
        ids.extend(self.cooldowns.ids().filter(|id| !self.enabled.contains(id)));
        ids.extend(self.reschedule.iter().map(|entry| entry.id));
        ids.extend(self.disabled.iter().copied());
        let mut seen = IndexSet::new();
        ids.retain(|id| seen.insert(*id));
        ids
    }

    /// Forget everything. Used when the level is removed.
    pub(crate) fn drain(&mut self) -> Vec<TickFunctionId> {
        let ids = self.functions();
        self.enabled.clear();
        self.disabled.clear();
        self.newly_spawned.clear();
        self.cooldowns.clear();
        self.reschedule.clear();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TickConfig;
    use crate::task::TaskGraph;
    use crate::tick::commands::TickCommands;
    use crate::tick::function::{TickFrameInfo, TickFunctionSpec, TickType, WorldId};
    use crate::tick::manager::FrameContext;
    use crate::tick::sequencer::{FrameOptions, TickSequencer};

    const LEVEL: LevelId = LevelId(0);

    struct Harness {
        graph: TaskGraph,
        arena: TickArena,
        level: TickLevel,
        sequencer: TickSequencer,
        frame: FrameContext,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                graph: TaskGraph::single_threaded(),
                arena: TickArena::new(),
                level: TickLevel::new(LEVEL),
                sequencer: TickSequencer::new(),
                frame: FrameContext::default(),
            }
        }

        fn add(&mut self, spec: TickFunctionSpec) -> TickFunctionId {
            let mut record = TickFunctionRecord::new(spec);
            record.level = Some(LEVEL);
            let id = self.arena.insert(record);
            let record = self.arena.get_mut(id).unwrap();
            self.level.add_function(id, record);
            id
        }

        /// Run the queueing half of one frame. Returns the functions that
        /// were queued.
        fn frame(&mut self, delta: f32) -> Vec<TickFunctionId> {
            self.frame.frame += 1;
            self.frame.delta_seconds = delta;
            self.frame.world_time += f64::from(delta);
            self.sequencer
                .start_frame(FrameOptions::from_config(&TickConfig::default(), true), true);
            self.level.start_frame(delta, &mut self.arena);
            let info = TickFrameInfo {
                frame: self.frame.frame,
                world: WorldId::new(1),
                tick_type: TickType::All,
                log: false,
                commands: TickCommands::new(),
            };
            {
                let mut resolver = Resolver {
                    arena: &mut self.arena,
                    sequencer: &mut self.sequencer,
                    graph: &self.graph,
                    frame: &self.frame,
                    ticking: &[LEVEL],
                    info: &info,
                };
                self.level.queue_all(&mut resolver);
            }
            self.level.end_frame(&mut self.arena);
            let queued = self
                .arena
                .iter()
                .filter(|(_, record)| record.task.is_some())
                .map(|(id, _)| id)
                .collect();
            for (_, record) in self.arena.iter_mut() {
                record.task = None;
            }
            queued
        }
    }

    fn ticking_frames(harness: &mut Harness, id: TickFunctionId, delta: f32, frames: usize) -> Vec<usize> {
        (1..=frames)
            .filter(|_| harness.frame(delta).contains(&id))
            .collect()
    }

    #[test]
    fn interval_cadence_quarter_second_frames() {
        let mut harness = Harness::new();
        let id = harness.add(TickFunctionSpec::new("slow", |_| {}).with_interval(1.0));
        assert_eq!(ticking_frames(&mut harness, id, 0.25, 14), vec![1, 6, 10, 14]);
    }

    #[test]
    fn interval_cadence_with_overrun() {
        let mut harness = Harness::new();
        let id = harness.add(TickFunctionSpec::new("slow", |_| {}).with_interval(1.0));
        assert_eq!(ticking_frames(&mut harness, id, 0.375, 12), vec![1, 4, 7, 10, 12]);
    }

    #[test]
    fn every_frame_functions_stay_enabled() {
        let mut harness = Harness::new();
        let id = harness.add(TickFunctionSpec::new("fast", |_| {}));
        assert_eq!(ticking_frames(&mut harness, id, 0.25, 3), vec![1, 2, 3]);
        assert_eq!(harness.level.enabled_len(), 1);
        assert_eq!(harness.level.cooling_down_len(), 0);
    }

    #[test]
    fn removing_cooling_down_function() {
        let mut harness = Harness::new();
        let id = harness.add(TickFunctionSpec::new("slow", |_| {}).with_interval(1.0));
        harness.frame(0.25);
        assert_eq!(harness.arena.get(id).unwrap().state, TickState::CoolingDown);
        assert!(harness.level.has_function(id));
        assert_eq!(harness.level.cooldown_remaining(id), Some(1.0));

        let record = harness.arena.get(id).unwrap();
        harness.level.remove_function(id, record);
        assert!(!harness.level.has_function(id));
        assert_eq!(harness.level.len(), 0);
    }

    #[test]
    fn disabled_functions_never_queue() {
        let mut harness = Harness::new();
        let id = harness.add(TickFunctionSpec::new("off", |_| {}).start_disabled());
        assert_eq!(harness.level.disabled_len(), 1);
        assert!(harness.frame(0.1).is_empty());
        assert!(harness.level.has_function(id));
    }

    #[test]
    fn late_registrations_become_newly_spawned() {
        let mut harness = Harness::new();
        harness.level.start_frame(0.1, &mut harness.arena);
        let id = harness.add(TickFunctionSpec::new("late", |_| {}));
        assert_eq!(harness.level.newly_spawned_len(), 1);

        harness.level.discard_runaway(&harness.arena);
        assert_eq!(harness.level.newly_spawned_len(), 0);
        assert_eq!(harness.level.enabled_len(), 1);
        harness.level.end_frame(&mut harness.arena);
        assert!(harness.level.has_function(id));
    }

    #[test]
    fn shorter_interval_pulls_cooldown_in() {
        let mut harness = Harness::new();
        let id = harness.add(TickFunctionSpec::new("slow", |_| {}).with_interval(4.0));
        harness.frame(0.5);
        harness.arena.get_mut(id).unwrap().interval = 1.0;
        harness.level.update_reschedule_interval(&mut harness.arena, id, 1.0);
        harness.level.end_frame(&mut harness.arena);
        assert_eq!(harness.level.cooldown_remaining(id), Some(1.0));
    }

    #[test]
    fn paused_frames_tick_flagged_functions_only() {
        let mut harness = Harness::new();
        let hud = harness.add(
            TickFunctionSpec::new("hud", |_| {})
                .tick_even_when_paused()
                .with_interval(0.5),
        );
        let world = harness.add(TickFunctionSpec::new("world", |_| {}).with_interval(0.5));
        let always = harness.add(TickFunctionSpec::new("overlay", |_| {}).tick_even_when_paused());
        harness.frame(0.25);

        let due = harness.level.pause_frame(0.25, &mut harness.arena);
        assert_eq!(due, vec![always]);
        let due = harness.level.pause_frame(0.25, &mut harness.arena);
        assert_eq!(due, vec![always]);
        let due = harness.level.pause_frame(0.25, &mut harness.arena);
        assert_eq!(due, vec![hud, always]);
        assert!(harness.level.cooldown_remaining(world).is_some());
    }
}
