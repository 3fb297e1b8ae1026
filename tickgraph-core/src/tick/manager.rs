//! Tick Task Manager
//!
//! The frame driver facade. Owns every tick function, the levels they are
//! registered in, and the sequencer that releases them group by group.
//!
//! # Overview
//!
//! A frame is driven as:
//!
//! ```text
//! start_frame(world, dt)
//!   for each group G in order:
//!     start_group(G)
//!     end_group(G, block)
//! end_frame()
//! ```
//!
//! [`TickTaskManager::run_frame`] does all of it with the default blocking
//! pattern (every group but `DuringPhysics` blocks).
//!
//! # Design Decisions
//!
//! 1. **Everything is queued at frame start.** All due functions are
//!    resolved and turned into held tasks before the first group is released.
//!    Groups only unlock what was already built.
//!
//! 2. **Late work is bounded.** Functions registered mid-frame are queued
//!    after each blocking group. Once the last group has finished they are
//!    run in extra passes, up to `max_newly_spawned_passes`; anything still
//!    spawning after that is discarded for the frame with an error.
//!
//! 3. **Callbacks never borrow the manager.** Changes from inside a tick go
//!    through [`TickCommands`] and are applied between groups.

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use super::arena::TickArena;
use super::commands::{TickCommand, TickCommands};
use super::function::{
    LevelId, ManualDispatchHandle, TickFrameInfo, TickFunctionId, TickFunctionRecord, TickFunctionSpec, TickState,
    TickType, WorldId,
};
use super::group::TickGroup;
use super::hook::{GroupHookWork, TickGroupHook};
use super::level::TickLevel;
use super::resolver::Resolver;
use super::sequencer::{FrameOptions, TickSequencer};
use crate::config::TickConfig;
use crate::error::{Result, TickGraphError};
use crate::task::{NamedThread, TaskContext, TaskGraph, ThreadBinding, ThreadIdentity};

/// Per-run frame state.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameContext {
    pub(crate) frame: u64,
    pub(crate) world: WorldId,
    pub(crate) world_time: f64,
    pub(crate) unpaused_time: f64,
    pub(crate) delta_seconds: f32,
    pub(crate) tick_type: TickType,
    /// Next group to start, or the group late work is queued against.
    pub(crate) group: TickGroup,
    pub(crate) in_frame: bool,
}

impl FrameContext {
    /// Frames started so far. The first frame is 1.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn world(&self) -> WorldId {
        self.world
    }

    /// Seconds of unpaused frames.
    pub fn world_time(&self) -> f64 {
        self.world_time
    }

    /// Seconds of all frames, paused or not.
    pub fn unpaused_time(&self) -> f64 {
        self.unpaused_time
    }

    pub fn delta_seconds(&self) -> f32 {
        self.delta_seconds
    }

    pub fn tick_type(&self) -> TickType {
        self.tick_type
    }

    pub fn group(&self) -> TickGroup {
        self.group
    }

    pub fn in_frame(&self) -> bool {
        self.in_frame
    }
}

/// Snapshot of one tick function.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickFunctionReport {
    pub id: TickFunctionId,
    pub name: String,
    pub level: Option<LevelId>,
    pub state: TickState,
    pub group: TickGroup,
    pub end_group: TickGroup,
    pub actual_start: TickGroup,
    pub actual_end: TickGroup,
    pub interval: f32,
    pub cooldown_remaining: Option<f32>,
    pub high_priority: bool,
    pub run_on_any_thread: bool,
    pub prerequisites: Vec<String>,
}

pub struct TickTaskManager {
    graph: Arc<TaskGraph>,
    config: TickConfig,
    arena: TickArena,
    levels: IndexMap<LevelId, TickLevel>,
    /// Levels ticking this frame.
    level_list: Vec<LevelId>,
    sequencer: TickSequencer,
    frame: FrameContext,
    /// Group started but not yet ended.
    started: Option<TickGroup>,
    hook: Option<Arc<dyn TickGroupHook>>,
    commands: TickCommands,
    next_level: u32,
}

impl TickTaskManager {
    pub fn new(graph: Arc<TaskGraph>, config: TickConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            graph,
            config,
            arena: TickArena::new(),
            levels: IndexMap::new(),
            level_list: Vec::new(),
            sequencer: TickSequencer::new(),
            frame: FrameContext::default(),
            started: None,
            hook: None,
            commands: TickCommands::new(),
            next_level: 0,
        })
    }

    pub fn with_hook(mut self, hook: Arc<dyn TickGroupHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn set_hook(&mut self, hook: Arc<dyn TickGroupHook>) {
        self.hook = Some(hook);
    }

    pub fn graph(&self) -> &Arc<TaskGraph> {
        &self.graph
    }

    pub fn config(&self) -> &TickConfig {
        &self.config
    }

    pub fn frame(&self) -> &FrameContext {
        &self.frame
    }

    /// A handle for deferred changes, usable from any thread.
    pub fn commands(&self) -> TickCommands {
        self.commands.clone()
    }

    // ------------------------------------------------------------------
    // Levels
    // ------------------------------------------------------------------

    pub fn add_level(&mut self) -> LevelId {
        let id = LevelId(self.next_level);
        self.next_level += 1;
        self.levels.insert(id, TickLevel::new(id));
        debug!(level = %id, "level added");
        id
    }

    /// Remove a level. Its functions stay alive but become unregistered.
    pub fn remove_level(&mut self, level: LevelId) -> Result<()> {
        let mut removed = self
            .levels
            .shift_remove(&level)
            .ok_or(TickGraphError::UnknownLevel(level))?;
        for id in removed.drain() {
            if let Some(record) = self.arena.get_mut(id) {
                Self::reset_registration(record);
            }
        }
        self.level_list.retain(|id| *id != level);
        debug!(level = %level, "level removed");
        Ok(())
    }

    /// Hidden levels keep their functions registered but do not tick.
    /// Takes effect at the next frame.
    pub fn set_level_visible(&mut self, level: LevelId, visible: bool) -> Result<()> {
        let entry = self
            .levels
            .get_mut(&level)
            .ok_or(TickGraphError::UnknownLevel(level))?;
        entry.visible = visible;
        Ok(())
    }

    pub fn is_level_visible(&self, level: LevelId) -> Option<bool> {
        self.levels.get(&level).map(|entry| entry.visible)
    }

    // ------------------------------------------------------------------
    // Tick functions
    // ------------------------------------------------------------------

    /// Create a tick function. It does nothing until registered.
    pub fn add_tick_function(&mut self, spec: TickFunctionSpec) -> Result<TickFunctionId> {
        if spec.group == TickGroup::NewlySpawned {
            return Err(TickGraphError::InvalidTickFunction {
                name: spec.name,
                reason: "NewlySpawned cannot be declared as a tick group".to_string(),
            });
        }
        if !spec.interval.is_finite() {
            return Err(TickGraphError::InvalidTickFunction {
                name: spec.name,
                reason: format!("interval {} is not finite", spec.interval),
            });
        }
        let id = self.arena.insert(TickFunctionRecord::new(spec));
        trace!(tick = %id, "tick function added");
        Ok(id)
    }

    /// Create a tick function and register it with `level`.
    pub fn add_and_register(&mut self, level: LevelId, spec: TickFunctionSpec) -> Result<TickFunctionId> {
        if !self.levels.contains_key(&level) {
            return Err(TickGraphError::UnknownLevel(level));
        }
        let id = self.add_tick_function(spec)?;
        self.register(id, level)?;
        Ok(id)
    }

    /// Register with `level`, moving the function if it is registered
    /// elsewhere. Registering during a frame makes it newly spawned.
    pub fn register(&mut self, id: TickFunctionId, level: LevelId) -> Result<()> {
        if !self.levels.contains_key(&level) {
            return Err(TickGraphError::UnknownLevel(level));
        }
        let record = self
            .arena
            .get_mut(id)
            .ok_or(TickGraphError::UnknownTickFunction(id))?;
        if record.level == Some(level) {
            return Ok(());
        }
        if let Some(previous) = record.level {
            if let Some(old) = self.levels.get_mut(&previous) {
                old.remove_function(id, record);
            }
        }
        record.level = Some(level);
        if let Some(target) = self.levels.get_mut(&level) {
            target.add_function(id, record);
        }
        Ok(())
    }

    /// Take the function out of its level. The record is kept.
    pub fn unregister(&mut self, id: TickFunctionId) -> Result<()> {
        let record = self
            .arena
            .get_mut(id)
            .ok_or(TickGraphError::UnknownTickFunction(id))?;
        let Some(level) = record.level else {
            return Ok(());
        };
        if let Some(entry) = self.levels.get_mut(&level) {
            entry.remove_function(id, record);
        }
        Self::reset_registration(record);
        Ok(())
    }

    fn reset_registration(record: &mut TickFunctionRecord) {
        record.level = None;
        record.shared.disarm();
        record.was_interval = false;
        record.last_tick_time = -1.0;
        if record.state == TickState::CoolingDown {
            record.set_state(TickState::Enabled);
        }
    }

    /// Destroy the function. Its id, and every edge naming it, goes stale.
    pub fn remove(&mut self, id: TickFunctionId) -> Result<()> {
        self.unregister(id)?;
        if let Some(record) = self.arena.remove(id) {
            trace!(tick = %record.name, "tick function removed");
        }
        Ok(())
    }

    pub fn set_enabled(&mut self, id: TickFunctionId, enabled: bool) -> Result<()> {
        let record = self
            .arena
            .get_mut(id)
            .ok_or(TickGraphError::UnknownTickFunction(id))?;
        let target = if enabled { TickState::Enabled } else { TickState::Disabled };
        let changing = enabled == (record.state == TickState::Disabled);
        match record.level.and_then(|level| self.levels.get_mut(&level)) {
            Some(level) if changing => {
                level.remove_function(id, record);
                record.set_state(target);
                level.add_function(id, record);
            }
            Some(_) => {}
            None => record.set_state(target),
        }
        if record.state == TickState::Disabled {
            record.last_tick_time = -1.0;
        }
        Ok(())
    }

    /// Change the interval. A function already cooling down keeps its
    /// current cooldown.
    pub fn set_tick_interval(&mut self, id: TickFunctionId, seconds: f32) -> Result<()> {
        let record = self
            .arena
            .get_mut(id)
            .ok_or(TickGraphError::UnknownTickFunction(id))?;
        record.interval = seconds;
        Ok(())
    }

    /// Change the interval and cap a running cooldown at the new value.
    pub fn update_interval_and_cooldown(&mut self, id: TickFunctionId, seconds: f32) -> Result<()> {
        let record = self
            .arena
            .get_mut(id)
            .ok_or(TickGraphError::UnknownTickFunction(id))?;
        record.interval = seconds;
        let level = record.level;
        if record.state == TickState::Disabled {
            return Ok(());
        }
        if let Some(entry) = level.and_then(|level| self.levels.get_mut(&level)) {
            entry.update_reschedule_interval(&mut self.arena, id, seconds);
        }
        Ok(())
    }

    /// Make `id` wait for `prerequisite` every frame both tick.
    pub fn add_prerequisite(&mut self, id: TickFunctionId, prerequisite: TickFunctionId) -> Result<()> {
        if !self.arena.contains(prerequisite) {
            return Err(TickGraphError::UnknownTickFunction(prerequisite));
        }
        let record = self
            .arena
            .get_mut(id)
            .ok_or(TickGraphError::UnknownTickFunction(id))?;
        if id == prerequisite {
            warn!(tick = %record.name, "ignoring a tick function as its own prerequisite");
            return Ok(());
        }
        if !record.prerequisites.contains(&prerequisite) {
            record.prerequisites.push(prerequisite);
        }
        Ok(())
    }

    pub fn remove_prerequisite(&mut self, id: TickFunctionId, prerequisite: TickFunctionId) -> Result<()> {
        let record = self
            .arena
            .get_mut(id)
            .ok_or(TickGraphError::UnknownTickFunction(id))?;
        record.prerequisites.retain(|p| *p != prerequisite);
        Ok(())
    }

    /// Set the priority of `id` and everything it transitively waits for.
    pub fn set_priority_including_prerequisites(&mut self, id: TickFunctionId, high_priority: bool) -> Result<()> {
        if !self.arena.contains(id) {
            return Err(TickGraphError::UnknownTickFunction(id));
        }
        let mut seen = IndexSet::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if !seen.insert(next) {
                continue;
            }
            if let Some(record) = self.arena.get_mut(next) {
                record.flags.high_priority = high_priority;
                stack.extend(record.prerequisites.iter().copied());
            }
        }
        Ok(())
    }

    /// Release a manually dispatched function queued this frame. Returns
    /// false if it was not waiting.
    pub fn dispatch_manually(&self, id: TickFunctionId) -> Result<bool> {
        Ok(self.manual_dispatch_handle(id)?.dispatch())
    }

    /// A handle that can release the function from any thread.
    pub fn manual_dispatch_handle(&self, id: TickFunctionId) -> Result<ManualDispatchHandle> {
        let record = self.arena.get(id).ok_or(TickGraphError::UnknownTickFunction(id))?;
        if !record.flags.dispatch_manually {
            return Err(TickGraphError::NotManuallyDispatched(record.name.to_string()));
        }
        Ok(ManualDispatchHandle {
            shared: record.shared.clone(),
        })
    }

    pub fn contains(&self, id: TickFunctionId) -> bool {
        self.arena.contains(id)
    }

    pub fn is_registered(&self, id: TickFunctionId) -> bool {
        self.arena.get(id).is_some_and(TickFunctionRecord::is_registered)
    }

    pub fn tick_state(&self, id: TickFunctionId) -> Option<TickState> {
        self.arena.get(id).map(|record| record.state)
    }

    /// Groups the function was resolved into on its last visit.
    pub fn actual_groups(&self, id: TickFunctionId) -> Option<(TickGroup, TickGroup)> {
        self.arena.get(id).map(|record| (record.actual_start, record.actual_end))
    }

    // ------------------------------------------------------------------
    // Frame driving
    // ------------------------------------------------------------------

    /// Advance time and queue everything due this frame.
    pub fn start_frame(&mut self, world: WorldId, delta_seconds: f32) -> Result<()> {
        if self.frame.in_frame {
            return Err(TickGraphError::FrameInProgress);
        }
        self.frame.frame += 1;
        self.frame.world = world;
        self.frame.delta_seconds = delta_seconds;
        self.frame.world_time += f64::from(delta_seconds);
        self.frame.unpaused_time += f64::from(delta_seconds);
        self.frame.tick_type = TickType::All;
        self.frame.group = TickGroup::PrePhysics;
        self.frame.in_frame = true;
        self.started = None;

        if let Some(hook) = self.hook.clone() {
            hook.start_frame(&self.graph, world, delta_seconds);
        }
        self.apply_commands();

        let single_threaded = self.graph.config().single_threaded;
        self.sequencer
            .start_frame(FrameOptions::from_config(&self.config, single_threaded), single_threaded);
        self.fill_level_list();

        let mut due = 0;
        for level in &self.level_list {
            if let Some(entry) = self.levels.get_mut(level) {
                due += entry.start_frame(delta_seconds, &mut self.arena);
            }
        }

        let info = self.frame_info();
        let mut resolver = Resolver {
            arena: &mut self.arena,
            sequencer: &mut self.sequencer,
            graph: self.graph.as_ref(),
            frame: &self.frame,
            ticking: &self.level_list,
            info: &info,
        };
        for level in &self.level_list {
            if let Some(entry) = self.levels.get_mut(level) {
                entry.queue_all(&mut resolver);
            }
        }
        self.sequencer.finish_batching();

        if self.config.log_ticks {
            debug!(frame = self.frame.frame, world = %world, due, "tick frame queued");
        }
        Ok(())
    }

    /// Release `group`. Groups must be started in order.
    pub fn start_group(&mut self, group: TickGroup) -> Result<()> {
        if !self.frame.in_frame {
            return Err(TickGraphError::FrameNotStarted);
        }
        let expected = self.started.unwrap_or(self.frame.group);
        if self.started.is_some() || group != self.frame.group || group == TickGroup::NewlySpawned {
            return Err(TickGraphError::GroupOutOfOrder { expected, got: group });
        }
        self.started = Some(group);

        let mut work = GroupHookWork::default();
        if let Some(hook) = self.hook.clone() {
            hook.start_tick_group(&self.graph, self.frame.world, group, &mut work);
        }
        let clamp = |target: TickGroup| target.max(group).min(TickGroup::LastDemotable);
        for (target, task) in work.gated {
            self.sequencer.add_gate(clamp(target), task);
        }
        for (target, handle) in work.completions {
            self.sequencer.add_group_completion(clamp(target), handle);
        }
        self.sequencer.dispatch_group(group, work.dispatch_now);
        Ok(())
    }

    /// Finish `group`. Blocking waits for everything due by now and then
    /// queues work registered meanwhile. The last group always blocks.
    pub fn end_group(&mut self, group: TickGroup, block: bool) -> Result<()> {
        if self.started != Some(group) {
            return Err(TickGraphError::GroupOutOfOrder {
                expected: self.started.unwrap_or(self.frame.group),
                got: group,
            });
        }
        let block = if group == TickGroup::LastDemotable && !block {
            warn!(group = %group, "the last tick group always blocks");
            true
        } else {
            block
        };

        let _game = self.bind_game_thread();
        self.sequencer.complete_group(&self.graph, group, block, &self.config);
        self.started = None;
        // Late work goes to the next group; this one is already released.
        self.frame.group = group.next().unwrap_or(TickGroup::NewlySpawned);

        if block {
            self.run_newly_spawned();
        }

        if let Some(hook) = self.hook.clone() {
            hook.end_tick_group(&self.graph, self.frame.world, group);
        }
        Ok(())
    }

    fn run_newly_spawned(&mut self) {
        for _ in 0..self.config.max_newly_spawned_passes {
            self.apply_commands();
            let queued = self.queue_newly_spawned();
            if queued == 0 || self.frame.group != TickGroup::NewlySpawned {
                return;
            }
            if self.config.log_ticks {
                debug!(queued, "running newly spawned tick functions");
            }
            self.sequencer.dispatch_group(TickGroup::NewlySpawned, Vec::new());
            self.sequencer
                .complete_group(&self.graph, TickGroup::NewlySpawned, true, &self.config);
        }

        self.apply_commands();
        for level in &self.level_list {
            if let Some(entry) = self.levels.get_mut(level) {
                entry.discard_runaway(&self.arena);
            }
        }
    }

    fn queue_newly_spawned(&mut self) -> usize {
        let info = self.frame_info();
        let mut resolver = Resolver {
            arena: &mut self.arena,
            sequencer: &mut self.sequencer,
            graph: self.graph.as_ref(),
            frame: &self.frame,
            ticking: &self.level_list,
            info: &info,
        };
        let mut queued = 0;
        for level in &self.level_list {
            if let Some(entry) = self.levels.get_mut(level) {
                queued += entry.queue_newly_spawned(&mut resolver);
            }
        }
        queued
    }

    pub fn run_tick_group(&mut self, group: TickGroup, block: bool) -> Result<()> {
        self.start_group(group)?;
        self.end_group(group, block)
    }

    /// Finish the frame. Groups the driver skipped are run, blocking.
    pub fn end_frame(&mut self) -> Result<()> {
        if !self.frame.in_frame {
            return Err(TickGraphError::FrameNotStarted);
        }
        if let Some(group) = self.started {
            warn!(group = %group, "ending a tick group the driver left open");
            self.end_group(group, true)?;
        }
        while self.frame.group != TickGroup::NewlySpawned {
            let group = self.frame.group;
            warn!(group = %group, "running a tick group the driver skipped");
            self.run_tick_group(group, true)?;
        }

        self.sequencer.end_frame();
        for level in &self.level_list {
            if let Some(entry) = self.levels.get_mut(level) {
                entry.end_frame(&mut self.arena);
            }
        }
        if let Some(hook) = self.hook.clone() {
            hook.end_frame(&self.graph, self.frame.world);
        }
        for (_, record) in self.arena.iter_mut() {
            record.task = None;
            record.shared.disarm();
        }
        self.frame.in_frame = false;
        Ok(())
    }

    /// One full frame with the default blocking pattern.
    pub fn run_frame(&mut self, world: WorldId, delta_seconds: f32) -> Result<()> {
        self.start_frame(world, delta_seconds)?;
        for group in TickGroup::DRIVEN {
            self.run_tick_group(group, group.blocks_by_default())?;
        }
        self.end_frame()
    }

    /// A paused frame: only functions flagged to tick while paused run, on
    /// the calling thread, ignoring prerequisites. World time stands still.
    /// Returns how many functions ran.
    pub fn run_pause_frame(&mut self, world: WorldId, delta_seconds: f32) -> Result<usize> {
        if self.frame.in_frame {
            return Err(TickGraphError::FrameInProgress);
        }
        self.frame.frame += 1;
        self.frame.world = world;
        self.frame.delta_seconds = delta_seconds;
        self.frame.unpaused_time += f64::from(delta_seconds);
        self.frame.tick_type = TickType::PauseTick;
        self.apply_commands();
        self.fill_level_list();

        let mut due = Vec::new();
        for level in &self.level_list {
            if let Some(entry) = self.levels.get_mut(level) {
                due.extend(entry.pause_frame(delta_seconds, &mut self.arena));
            }
        }

        let info = self.frame_info();
        let _game = self.bind_game_thread();
        let event = self.graph.create_event();
        let context = TaskContext::detached(&event, self.graph.current_thread());
        for id in &due {
            let Some(record) = self.arena.get_mut(*id) else {
                continue;
            };
            record.task = None;
            let delta = record.delta_for(delta_seconds, self.frame.world_time, self.frame.unpaused_time);
            record.execution(*id, delta).run(&info, &context);
        }
        self.graph.trigger_event(&event);

        self.frame.tick_type = TickType::All;
        Ok(due.len())
    }

    fn fill_level_list(&mut self) {
        self.level_list.clear();
        self.level_list
            .extend(self.levels.values().filter(|level| level.visible).map(TickLevel::id));
    }

    fn frame_info(&self) -> TickFrameInfo {
        TickFrameInfo {
            frame: self.frame.frame,
            world: self.frame.world,
            tick_type: self.frame.tick_type,
            log: self.config.log_ticks,
            commands: self.commands.clone(),
        }
    }

    fn bind_game_thread(&self) -> Option<ThreadBinding> {
        match self.graph.current_thread() {
            ThreadIdentity::Named(NamedThread::Game) => None,
            _ => Some(self.graph.attach_to_thread(NamedThread::Game)),
        }
    }

    /// Apply every queued [`TickCommand`], in order.
    pub fn apply_commands(&mut self) -> usize {
        let commands = self.commands.take();
        let count = commands.len();
        for command in commands {
            let result = match command {
                TickCommand::Spawn { level, spec } => self.add_and_register(level, spec).map(|_| ()),
                TickCommand::SetEnabled { id, enabled } => self.set_enabled(id, enabled),
                TickCommand::AddPrerequisite { id, prerequisite } => self.add_prerequisite(id, prerequisite),
                TickCommand::RemovePrerequisite { id, prerequisite } => self.remove_prerequisite(id, prerequisite),
                TickCommand::Unregister(id) => self.unregister(id),
                TickCommand::Remove(id) => self.remove(id),
            };
            if let Err(err) = result {
                warn!(error = %err, "deferred tick command failed");
            }
        }
        count
    }

    // ------------------------------------------------------------------
    // Reports
    // ------------------------------------------------------------------

    pub fn dump_tick_functions(&self) -> Vec<TickFunctionReport> {
        self.arena
            .iter()
            .map(|(id, record)| TickFunctionReport {
                id,
                name: record.name.to_string(),
                level: record.level,
                state: record.state,
                group: record.group,
                end_group: record.end_group,
                actual_start: record.actual_start,
                actual_end: record.actual_end,
                interval: record.interval,
                cooldown_remaining: record
                    .level
                    .and_then(|level| self.levels.get(&level))
                    .and_then(|level| level.cooldown_remaining(id)),
                high_priority: record.flags.high_priority,
                run_on_any_thread: record.flags.run_on_any_thread,
                prerequisites: record
                    .prerequisites
                    .iter()
                    .map(|p| {
                        self.arena
                            .get(*p)
                            .map_or_else(|| format!("<stale {p}>"), |other| other.name.to_string())
                    })
                    .collect(),
            })
            .collect()
    }

    /// Registered functions that are not disabled.
    pub fn enabled_count(&self) -> usize {
        self.arena
            .iter()
            .filter(|(_, record)| record.is_registered() && record.state != TickState::Disabled)
            .count()
    }

    /// Registered functions.
    pub fn all_count(&self) -> usize {
        self.levels.values().map(TickLevel::len).sum()
    }

    pub fn log_dump(&self) {
        let reports = self.dump_tick_functions();
        info!(
            functions = reports.len(),
            registered = self.all_count(),
            enabled = self.enabled_count(),
            levels = self.levels.len(),
            "tick function dump"
        );
        for report in reports {
            info!(
                tick = %report.name,
                id = %report.id,
                state = ?report.state,
                group = %report.group,
                actual_start = %report.actual_start,
                actual_end = %report.actual_end,
                interval = report.interval,
                cooldown = ?report.cooldown_remaining,
                prerequisites = ?report.prerequisites,
                "tick function"
            );
        }
        for level in self.levels.values() {
            info!(
                level = %level.id(),
                visible = level.visible,
                enabled = level.enabled_len(),
                disabled = level.disabled_len(),
                cooling_down = level.cooling_down_len(),
                "level"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{CompletionHandle, DesiredThread, HeldTask};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WORLD: WorldId = WorldId(1);

    fn manager() -> TickTaskManager {
        manager_with(TickConfig::default())
    }

    fn manager_with(config: TickConfig) -> TickTaskManager {
        TickTaskManager::new(Arc::new(TaskGraph::single_threaded()), config).unwrap()
    }

    fn logging(name: &str, log: &Arc<Mutex<Vec<String>>>) -> TickFunctionSpec {
        let log = log.clone();
        let label = name.to_string();
        TickFunctionSpec::new(name, move |_| log.lock().push(label.clone()))
    }

    fn counting(name: &str, counter: &Arc<AtomicUsize>) -> TickFunctionSpec {
        let counter = counter.clone();
        TickFunctionSpec::new(name, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn prerequisites_order_a_frame() {
        let mut manager = manager();
        let level = manager.add_level();
        let log = Arc::new(Mutex::new(Vec::new()));
        let c = manager.add_and_register(level, logging("c", &log)).unwrap();
        let b = manager.add_and_register(level, logging("b", &log)).unwrap();
        let a = manager.add_and_register(level, logging("a", &log)).unwrap();
        manager.add_prerequisite(b, a).unwrap();
        manager.add_prerequisite(c, b).unwrap();

        manager.run_frame(WORLD, 0.016).unwrap();
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
        assert_eq!(manager.actual_groups(c), Some((TickGroup::PrePhysics, TickGroup::PrePhysics)));
        assert_eq!(manager.frame().frame(), 1);
        assert!(!manager.frame().in_frame());
    }

    #[test]
    fn groups_run_in_declared_order() {
        let mut manager = manager();
        let level = manager.add_level();
        let log = Arc::new(Mutex::new(Vec::new()));
        manager
            .add_and_register(level, logging("post", &log).in_group(TickGroup::PostPhysics))
            .unwrap();
        manager
            .add_and_register(level, logging("last", &log).in_group(TickGroup::LastDemotable))
            .unwrap();
        manager.add_and_register(level, logging("pre", &log)).unwrap();

        manager.run_frame(WORLD, 0.016).unwrap();
        assert_eq!(*log.lock(), vec!["pre", "post", "last"]);
    }

    #[test]
    fn frame_driving_is_checked() {
        let mut manager = manager();
        assert!(matches!(manager.end_frame(), Err(TickGraphError::FrameNotStarted)));
        assert!(matches!(
            manager.start_group(TickGroup::PrePhysics),
            Err(TickGraphError::FrameNotStarted)
        ));

        manager.start_frame(WORLD, 0.016).unwrap();
        assert!(matches!(
            manager.start_frame(WORLD, 0.016),
            Err(TickGraphError::FrameInProgress)
        ));
        assert!(matches!(
            manager.start_group(TickGroup::StartPhysics),
            Err(TickGraphError::GroupOutOfOrder {
                expected: TickGroup::PrePhysics,
                got: TickGroup::StartPhysics
            })
        ));
        manager.start_group(TickGroup::PrePhysics).unwrap();
        assert!(matches!(
            manager.end_group(TickGroup::StartPhysics, true),
            Err(TickGraphError::GroupOutOfOrder { .. })
        ));
        manager.end_group(TickGroup::PrePhysics, true).unwrap();
        manager.end_frame().unwrap();
        assert_eq!(manager.frame().group(), TickGroup::NewlySpawned);
    }

    #[test]
    fn newly_spawned_cannot_be_declared() {
        let mut manager = manager();
        let result = manager.add_tick_function(TickFunctionSpec::new("bad", |_| {}).in_group(TickGroup::NewlySpawned));
        assert!(matches!(result, Err(TickGraphError::InvalidTickFunction { .. })));
    }

    #[test]
    fn hidden_levels_do_not_tick() {
        let mut manager = manager();
        let level = manager.add_level();
        let ran = Arc::new(AtomicUsize::new(0));
        manager.add_and_register(level, counting("f", &ran)).unwrap();

        manager.set_level_visible(level, false).unwrap();
        manager.run_frame(WORLD, 0.016).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        manager.set_level_visible(level, true).unwrap();
        manager.run_frame(WORLD, 0.016).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_functions_go_stale() {
        let mut manager = manager();
        let level = manager.add_level();
        let ran = Arc::new(AtomicUsize::new(0));
        let gone = manager.add_and_register(level, counting("gone", &ran)).unwrap();
        let kept = manager.add_and_register(level, counting("kept", &ran)).unwrap();
        manager.add_prerequisite(kept, gone).unwrap();

        manager.remove(gone).unwrap();
        assert!(!manager.contains(gone));
        assert!(matches!(
            manager.set_enabled(gone, false),
            Err(TickGraphError::UnknownTickFunction(_))
        ));

        manager.run_frame(WORLD, 0.016).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        let report = manager.dump_tick_functions();
        assert_eq!(report.len(), 1);
        assert!(report[0].prerequisites.is_empty());
    }

    #[test]
    fn disabling_and_unregistering() {
        let mut manager = manager();
        let level = manager.add_level();
        let ran = Arc::new(AtomicUsize::new(0));
        let id = manager.add_and_register(level, counting("f", &ran)).unwrap();

        manager.set_enabled(id, false).unwrap();
        manager.run_frame(WORLD, 0.016).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(manager.enabled_count(), 0);
        assert_eq!(manager.all_count(), 1);

        manager.set_enabled(id, true).unwrap();
        manager.run_frame(WORLD, 0.016).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        manager.unregister(id).unwrap();
        assert!(!manager.is_registered(id));
        manager.run_frame(WORLD, 0.016).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(manager.all_count(), 0);
    }

    #[test]
    fn disabling_mid_frame_skips_the_callback() {
        let mut manager = manager();
        let level = manager.add_level();
        let ran = Arc::new(AtomicUsize::new(0));
        let id = manager
            .add_and_register(level, counting("late", &ran).in_group(TickGroup::PostPhysics))
            .unwrap();
        manager.start_frame(WORLD, 0.016).unwrap();
        manager.set_enabled(id, false).unwrap();
        manager.end_frame().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn spawned_functions_tick_in_the_same_frame() {
        let mut manager = manager();
        let level = manager.add_level();
        let ran = Arc::new(AtomicUsize::new(0));
        let frames = Arc::new(Mutex::new(Vec::new()));
        let child_ran = ran.clone();
        let child_frames = frames.clone();
        manager
            .add_and_register(
                level,
                TickFunctionSpec::new("parent", move |args| {
                    if args.frame == 1 {
                        let ran = child_ran.clone();
                        let frames = child_frames.clone();
                        args.commands.spawn(
                            level,
                            TickFunctionSpec::new("child", move |args| {
                                ran.fetch_add(1, Ordering::SeqCst);
                                frames.lock().push(args.frame);
                            }),
                        );
                    }
                }),
            )
            .unwrap();

        manager.run_frame(WORLD, 0.016).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        let child = manager
            .dump_tick_functions()
            .into_iter()
            .find(|report| report.name == "child")
            .unwrap();
        assert_eq!(child.actual_start, TickGroup::DuringPhysics);

        manager.run_frame(WORLD, 0.016).unwrap();
        assert_eq!(*frames.lock(), vec![1, 2]);
    }

    fn spawner(level: LevelId, count: Arc<AtomicUsize>) -> TickFunctionSpec {
        TickFunctionSpec::new("spawner", move |args| {
            count.fetch_add(1, Ordering::SeqCst);
            args.commands.spawn(level, spawner(level, count.clone()));
        })
        .in_group(TickGroup::LastDemotable)
    }

    #[test]
    fn runaway_spawning_is_capped() {
        let mut manager = manager_with(TickConfig {
            max_newly_spawned_passes: 3,
            ..TickConfig::default()
        });
        let level = manager.add_level();
        let count = Arc::new(AtomicUsize::new(0));
        manager.add_and_register(level, spawner(level, count.clone())).unwrap();

        manager.run_frame(WORLD, 0.016).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 4);
        // The last spawn is registered but waits for the next frame.
        assert_eq!(manager.all_count(), 5);
    }

    #[test]
    fn manual_dispatch_releases_gated_function() {
        let mut manager = manager_with(TickConfig {
            stall_idle_iterations: u32::MAX,
            ..TickConfig::default()
        });
        let level = manager.add_level();
        let ran = Arc::new(AtomicUsize::new(0));
        let gated = manager
            .add_and_register(level, counting("gated", &ran).dispatch_manually())
            .unwrap();
        let plain = manager.add_and_register(level, counting("plain", &ran)).unwrap();
        assert!(matches!(
            manager.dispatch_manually(plain),
            Err(TickGraphError::NotManuallyDispatched(_))
        ));

        let handle = manager.manual_dispatch_handle(gated).unwrap();
        assert!(!handle.is_pending());
        manager.start_frame(WORLD, 0.016).unwrap();
        assert!(handle.is_pending());
        assert!(manager.dispatch_manually(gated).unwrap());
        assert!(!manager.dispatch_manually(gated).unwrap());
        manager.end_frame().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn watchdog_runs_forgotten_manual_functions() {
        let mut manager = manager_with(TickConfig {
            stall_idle_iterations: 3,
            ..TickConfig::default()
        });
        let level = manager.add_level();
        let ran = Arc::new(AtomicUsize::new(0));
        manager
            .add_and_register(level, counting("forgotten", &ran).dispatch_manually())
            .unwrap();
        manager.run_frame(WORLD, 0.016).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pause_frames_only_run_flagged_functions() {
        let mut manager = manager();
        let level = manager.add_level();
        let normal = Arc::new(AtomicUsize::new(0));
        let paused = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        manager.add_and_register(level, counting("world", &normal)).unwrap();
        let p = paused.clone();
        let s = seen.clone();
        manager
            .add_and_register(
                level,
                TickFunctionSpec::new("hud", move |args| {
                    p.fetch_add(1, Ordering::SeqCst);
                    s.lock().push(args.tick_type);
                })
                .tick_even_when_paused(),
            )
            .unwrap();

        assert_eq!(manager.run_pause_frame(WORLD, 0.016).unwrap(), 1);
        assert_eq!(normal.load(Ordering::SeqCst), 0);
        assert_eq!(paused.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock(), vec![TickType::PauseTick]);
        assert_eq!(manager.frame().world_time(), 0.0);
        assert!(manager.frame().unpaused_time() > 0.0);
    }

    #[test]
    fn priority_propagates_to_prerequisites() {
        let mut manager = manager();
        let level = manager.add_level();
        let a = manager.add_and_register(level, TickFunctionSpec::new("a", |_| {})).unwrap();
        let b = manager.add_and_register(level, TickFunctionSpec::new("b", |_| {})).unwrap();
        let c = manager.add_and_register(level, TickFunctionSpec::new("c", |_| {})).unwrap();
        manager.add_prerequisite(c, b).unwrap();
        manager.add_prerequisite(b, a).unwrap();
        manager.add_prerequisite(a, c).unwrap();
        manager.set_priority_including_prerequisites(c, true).unwrap();
        assert!(manager.dump_tick_functions().iter().all(|report| report.high_priority));
    }

    #[test]
    fn self_prerequisite_is_ignored() {
        let mut manager = manager();
        let a = manager.add_tick_function(TickFunctionSpec::new("a", |_| {})).unwrap();
        manager.add_prerequisite(a, a).unwrap();
        assert!(manager.dump_tick_functions()[0].prerequisites.is_empty());
    }

    #[derive(Default)]
    struct RecordingHook {
        events: Mutex<Vec<String>>,
        extra: Mutex<Option<CompletionHandle>>,
    }

    impl TickGroupHook for RecordingHook {
        fn start_frame(&self, _graph: &TaskGraph, world: WorldId, _delta_seconds: f32) {
            self.events.lock().push(format!("start {world}"));
        }

        fn start_tick_group(&self, graph: &TaskGraph, _world: WorldId, group: TickGroup, work: &mut GroupHookWork) {
            if group == TickGroup::PostPhysics {
                let task: HeldTask = graph.create_held(|_| {}, &[], DesiredThread::game());
                *self.extra.lock() = Some(task.completion());
                work.dispatch_now(task.clone());
                work.wait_in(TickGroup::PostPhysics, task.completion());
            }
        }

        fn end_tick_group(&self, _graph: &TaskGraph, _world: WorldId, group: TickGroup) {
            self.events.lock().push(format!("end {group}"));
        }

        fn end_frame(&self, _graph: &TaskGraph, _world: WorldId) {
            self.events.lock().push("end frame".to_string());
        }
    }

    #[test]
    fn hooks_see_every_group() {
        let hook = Arc::new(RecordingHook::default());
        let mut manager = manager().with_hook(hook.clone());
        manager.run_frame(WORLD, 0.016).unwrap();

        let events = hook.events.lock().clone();
        assert_eq!(events.first().map(String::as_str), Some("start world#1"));
        assert_eq!(events.last().map(String::as_str), Some("end frame"));
        assert_eq!(events.len(), 2 + TickGroup::DRIVEN.len());
        let extra = hook.extra.lock().clone().unwrap();
        assert!(extra.is_complete());
    }

    #[test]
    fn reports_serialize() {
        let mut manager = manager();
        let level = manager.add_level();
        let a = manager.add_and_register(level, TickFunctionSpec::new("a", |_| {})).unwrap();
        let b = manager
            .add_and_register(level, TickFunctionSpec::new("b", |_| {}).with_interval(1.0))
            .unwrap();
        manager.add_prerequisite(b, a).unwrap();
        manager.run_frame(WORLD, 0.25).unwrap();

        let reports = manager.dump_tick_functions();
        let b_report = reports.iter().find(|report| report.id == b).unwrap();
        assert_eq!(b_report.prerequisites, vec!["a".to_string()]);
        assert_eq!(b_report.state, TickState::CoolingDown);
        assert_eq!(b_report.cooldown_remaining, Some(1.0));
        let json = serde_json::to_string(&reports).unwrap();
        assert!(json.contains("\"CoolingDown\""));
        manager.log_dump();
    }
}
