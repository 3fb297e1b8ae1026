//! Frame hooks.
//!
//! A [`TickGroupHook`] observes the frame driver and can inject work at the
//! start of every group. The sync point layer is built on it.

use crate::task::{CompletionHandle, HeldTask, TaskGraph};

use super::function::WorldId;
use super::group::TickGroup;

/// Callbacks the tick manager makes while driving a frame.
///
/// All methods run on the thread driving the frame. The defaults do nothing.
pub trait TickGroupHook: Send + Sync {
    fn start_frame(&self, _graph: &TaskGraph, _world: WorldId, _delta_seconds: f32) {}

    /// Called before `group`'s tasks are released.
    fn start_tick_group(&self, _graph: &TaskGraph, _world: WorldId, _group: TickGroup, _work: &mut GroupHookWork) {}

    /// Called after `group` has been completed (or handed off, when not
    /// blocking).
    fn end_tick_group(&self, _graph: &TaskGraph, _world: WorldId, _group: TickGroup) {}

    fn end_frame(&self, _graph: &TaskGraph, _world: WorldId) {}
}

/// Work a hook hands to the group being started.
#[derive(Debug, Default)]
pub struct GroupHookWork {
    pub(crate) dispatch_now: Vec<HeldTask>,
    pub(crate) gated: Vec<(TickGroup, HeldTask)>,
    pub(crate) completions: Vec<(TickGroup, CompletionHandle)>,
}

impl GroupHookWork {
    /// Unlock `task` together with this group's tick tasks.
    pub fn dispatch_now(&mut self, task: HeldTask) {
        self.dispatch_now.push(task);
    }

    /// Make `group` wait for `task`. Nothing unlocks it automatically except
    /// the stall watchdog, so the owner is expected to unlock it.
    pub fn gate(&mut self, group: TickGroup, task: HeldTask) {
        self.gated.push((group, task));
    }

    /// Make `group` wait for `handle`.
    pub fn wait_in(&mut self, group: TickGroup, handle: CompletionHandle) {
        self.completions.push((group, handle));
    }

    pub fn is_empty(&self) -> bool {
        self.dispatch_now.is_empty() && self.gated.is_empty() && self.completions.is_empty()
    }
}
