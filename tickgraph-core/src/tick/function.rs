//! Tick Functions
//!
//! A tick function is a named per-frame callback plus the scheduling facts
//! the resolver needs: declared groups, thread affinity, priority, interval
//! and prerequisites.
//!
//! # Overview
//!
//! Callers describe a function with a [`TickFunctionSpec`] and hand it to the
//! manager, which stores a [`TickFunctionRecord`] in its arena and returns a
//! [`TickFunctionId`]. The record never leaves the manager. What a running
//! task needs (callback, name, enabled flag, delta) is copied into a
//! [`TickExecution`] when the function is queued, so callbacks can run on any
//! thread without touching manager state.
//!
//! # Design Decisions
//!
//! 1. Ids carry a generation. Removing a function bumps its slot's generation,
//!    so a prerequisite edge or a handle held elsewhere goes stale instead of
//!    silently pointing at a new function.
//!
//! 2. The enabled flag lives in an `Arc` shared with queued tasks. Disabling a
//!    function after it was queued skips its callback when the task runs.
//!
//! 3. Callbacks cannot borrow the manager. Structural changes made from inside
//!    a tick go through [`TickCommands`] and are applied between groups.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, trace};

use super::commands::TickCommands;
use super::group::TickGroup;
use crate::task::{CompletionHandle, HeldTask, TaskContext};

/// Stable handle to a tick function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TickFunctionId {
    index: u32,
    generation: u32,
}

impl TickFunctionId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for TickFunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tick#{}.{}", self.index, self.generation)
    }
}

/// A bucket of tick functions that is shown or hidden as a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LevelId(pub(crate) u32);

impl LevelId {
    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for LevelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "level#{}", self.0)
    }
}

/// Identifies the world a frame is ticking. Sync point batches are kept per
/// world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct WorldId(pub u64);

impl WorldId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "world#{}", self.0)
    }
}

/// Scheduling state of a registered function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TickState {
    Enabled,
    Disabled,
    /// Waiting out its interval in the level's cooldown list.
    CoolingDown,
}

/// What kind of frame is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TickType {
    #[default]
    All,
    /// Only functions flagged to tick while paused run.
    PauseTick,
}

/// Body of a tick function.
pub type TickCallback = Arc<dyn Fn(&TickArgs<'_>) + Send + Sync>;

/// What a tick callback receives.
pub struct TickArgs<'a> {
    /// Seconds since this function last ticked. Equal to the frame delta for
    /// functions without an interval.
    pub delta_seconds: f32,
    pub tick_type: TickType,
    pub frame: u64,
    pub world: WorldId,
    pub id: TickFunctionId,
    pub name: &'a str,
    /// The task running this tick. Use it to attach nested work.
    pub task: &'a TaskContext<'a>,
    /// Deferred structural changes, applied between groups.
    pub commands: &'a TickCommands,
}

/// Description of a tick function to add.
#[derive(Clone)]
pub struct TickFunctionSpec {
    pub(crate) name: String,
    pub(crate) callback: TickCallback,
    pub(crate) group: TickGroup,
    pub(crate) end_group: TickGroup,
    pub(crate) flags: TickFlags,
    pub(crate) start_enabled: bool,
    pub(crate) interval: f32,
}

impl TickFunctionSpec {
    /// A function ticking in `PrePhysics` on the game thread every frame.
    pub fn new<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&TickArgs<'_>) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            callback: Arc::new(callback),
            group: TickGroup::PrePhysics,
            end_group: TickGroup::PrePhysics,
            flags: TickFlags::default(),
            start_enabled: true,
            interval: 0.0,
        }
    }

    pub fn in_group(mut self, group: TickGroup) -> Self {
        self.group = group;
        self
    }

    /// Allow the function to still be running as late as `group`.
    pub fn ending_in(mut self, group: TickGroup) -> Self {
        self.end_group = group;
        self
    }

    pub fn high_priority(mut self) -> Self {
        self.flags.high_priority = true;
        self
    }

    pub fn run_on_any_thread(mut self) -> Self {
        self.flags.run_on_any_thread = true;
        self
    }

    pub fn allow_batching(mut self) -> Self {
        self.flags.allow_batching = true;
        self
    }

    /// Queue the function held. It runs only when dispatched explicitly (or
    /// by the stall watchdog).
    pub fn dispatch_manually(mut self) -> Self {
        self.flags.dispatch_manually = true;
        self
    }

    pub fn tick_even_when_paused(mut self) -> Self {
        self.flags.tick_even_when_paused = true;
        self
    }

    pub fn start_disabled(mut self) -> Self {
        self.start_enabled = false;
        self
    }

    /// Minimum seconds between ticks. Zero or less ticks every frame.
    pub fn with_interval(mut self, seconds: f32) -> Self {
        self.interval = seconds;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> TickGroup {
        self.group
    }
}

impl fmt::Debug for TickFunctionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TickFunctionSpec")
            .field("name", &self.name)
            .field("group", &self.group)
            .field("end_group", &self.end_group)
            .field("flags", &self.flags)
            .field("start_enabled", &self.start_enabled)
            .field("interval", &self.interval)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct TickFlags {
    pub(crate) high_priority: bool,
    pub(crate) run_on_any_thread: bool,
    pub(crate) allow_batching: bool,
    pub(crate) dispatch_manually: bool,
    pub(crate) tick_even_when_paused: bool,
}

/// State shared between a record and the tasks queued for it.
pub(crate) struct TickShared {
    name: Arc<str>,
    enabled: AtomicBool,
    /// The held task of a manually dispatched function, armed while it is
    /// queued and not yet released.
    manual: Mutex<Option<HeldTask>>,
}

impl TickShared {
    pub(crate) fn new(name: Arc<str>, enabled: bool) -> Self {
        Self {
            name,
            enabled: AtomicBool::new(enabled),
            manual: Mutex::new(None),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub(crate) fn arm(&self, task: HeldTask) {
        *self.manual.lock() = Some(task);
    }

    pub(crate) fn disarm(&self) {
        self.manual.lock().take();
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.manual.lock().is_some()
    }

    /// Release the armed task. False if there was nothing to release.
    pub(crate) fn dispatch(&self) -> bool {
        let task = self.manual.lock().take();
        match task {
            Some(task) => task.unlock(),
            None => false,
        }
    }
}

/// Releases a manually dispatched tick function from any thread.
///
/// Obtained from the manager. Dispatching is idempotent within a frame and a
/// no-op while the function is not queued.
#[derive(Clone)]
pub struct ManualDispatchHandle {
    pub(crate) shared: Arc<TickShared>,
}

impl ManualDispatchHandle {
    /// Returns true if this call released the task.
    pub fn dispatch(&self) -> bool {
        let released = self.shared.dispatch();
        if released {
            trace!(tick = self.shared.name(), "dispatched manually");
        }
        released
    }

    /// Whether the function is queued and waiting for [`Self::dispatch`].
    pub fn is_pending(&self) -> bool {
        self.shared.is_armed()
    }
}

impl fmt::Debug for ManualDispatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualDispatchHandle")
            .field("tick", &self.shared.name())
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// Arena entry for one tick function.
pub(crate) struct TickFunctionRecord {
    pub(crate) name: Arc<str>,
    pub(crate) callback: TickCallback,
    pub(crate) group: TickGroup,
    pub(crate) end_group: TickGroup,
    pub(crate) flags: TickFlags,
    pub(crate) interval: f32,
    pub(crate) prerequisites: SmallVec<[TickFunctionId; 2]>,
    pub(crate) level: Option<LevelId>,
    pub(crate) state: TickState,
    /// Set once the function has been rescheduled by its interval.
    pub(crate) was_interval: bool,
    /// World time of the last interval tick, negative when not tracked.
    pub(crate) last_tick_time: f64,
    pub(crate) visited_frame: u64,
    pub(crate) queued_frame: u64,
    pub(crate) actual_start: TickGroup,
    pub(crate) actual_end: TickGroup,
    /// Completion of this frame's task, if one was queued.
    pub(crate) task: Option<CompletionHandle>,
    pub(crate) shared: Arc<TickShared>,
}

impl TickFunctionRecord {
    pub(crate) fn new(spec: TickFunctionSpec) -> Self {
        let name: Arc<str> = Arc::from(spec.name);
        let state = if spec.start_enabled {
            TickState::Enabled
        } else {
            TickState::Disabled
        };
        Self {
            shared: Arc::new(TickShared::new(name.clone(), spec.start_enabled)),
            name,
            callback: spec.callback,
            group: spec.group,
            end_group: spec.end_group,
            flags: spec.flags,
            interval: spec.interval,
            prerequisites: SmallVec::new(),
            level: None,
            state,
            was_interval: false,
            last_tick_time: -1.0,
            visited_frame: 0,
            queued_frame: 0,
            actual_start: spec.group,
            actual_end: spec.group,
            task: None,
        }
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.level.is_some()
    }

    pub(crate) fn set_state(&mut self, state: TickState) {
        self.state = state;
        self.shared.set_enabled(state != TickState::Disabled);
    }

    /// Delta to report for this frame, updating interval bookkeeping.
    pub(crate) fn delta_for(&mut self, frame_delta: f32, world_time: f64, unpaused_time: f64) -> f32 {
        if !self.was_interval {
            self.last_tick_time = -1.0;
            return frame_delta;
        }
        let now = if self.flags.tick_even_when_paused {
            unpaused_time
        } else {
            world_time
        };
        let delta = if self.last_tick_time >= 0.0 {
            (now - self.last_tick_time) as f32
        } else {
            frame_delta
        };
        self.last_tick_time = now;
        delta
    }

    pub(crate) fn execution(&self, id: TickFunctionId, delta: f32) -> TickExecution {
        TickExecution {
            id,
            name: self.name.clone(),
            callback: self.callback.clone(),
            shared: self.shared.clone(),
            delta_seconds: delta,
        }
    }
}

/// Frame-wide facts every queued tick task carries.
#[derive(Clone)]
pub(crate) struct TickFrameInfo {
    pub(crate) frame: u64,
    pub(crate) world: WorldId,
    pub(crate) tick_type: TickType,
    pub(crate) log: bool,
    pub(crate) commands: TickCommands,
}

/// One callback invocation, detached from the arena.
pub(crate) struct TickExecution {
    pub(crate) id: TickFunctionId,
    pub(crate) name: Arc<str>,
    pub(crate) callback: TickCallback,
    pub(crate) shared: Arc<TickShared>,
    pub(crate) delta_seconds: f32,
}

impl TickExecution {
    pub(crate) fn run(&self, frame: &TickFrameInfo, task: &TaskContext<'_>) {
        if frame.log {
            debug!(
                tick = %self.name,
                frame = frame.frame,
                thread = %task.current_thread(),
                "tick"
            );
        }
        if !self.shared.is_enabled() {
            trace!(tick = %self.name, "skipping tick disabled after queueing");
            return;
        }
        let args = TickArgs {
            delta_seconds: self.delta_seconds,
            tick_type: frame.tick_type,
            frame: frame.frame,
            world: frame.world,
            id: self.id,
            name: &self.name,
            task,
            commands: &frame.commands,
        };
        (self.callback)(&args);
    }
}
