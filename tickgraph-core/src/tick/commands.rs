//! Deferred structural changes requested from inside running ticks.
//!
//! Tick callbacks run on tasks, possibly on worker threads, while the manager
//! is borrowed by the frame driver. They record what they want here and the
//! manager applies the queue between groups, in submission order.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::function::{LevelId, TickFunctionId, TickFunctionSpec};

/// One queued change.
#[derive(Debug)]
pub enum TickCommand {
    /// Add and register a new function. Spawned during a frame, it joins the
    /// newly spawned set.
    Spawn { level: LevelId, spec: TickFunctionSpec },
    SetEnabled { id: TickFunctionId, enabled: bool },
    AddPrerequisite { id: TickFunctionId, prerequisite: TickFunctionId },
    RemovePrerequisite { id: TickFunctionId, prerequisite: TickFunctionId },
    Unregister(TickFunctionId),
    Remove(TickFunctionId),
}

/// Cloneable, thread-safe command queue.
#[derive(Clone, Default)]
pub struct TickCommands {
    queue: Arc<Mutex<Vec<TickCommand>>>,
}

impl TickCommands {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, command: TickCommand) {
        self.queue.lock().push(command);
    }

    pub fn spawn(&self, level: LevelId, spec: TickFunctionSpec) {
        self.push(TickCommand::Spawn { level, spec });
    }

    pub fn set_enabled(&self, id: TickFunctionId, enabled: bool) {
        self.push(TickCommand::SetEnabled { id, enabled });
    }

    pub fn add_prerequisite(&self, id: TickFunctionId, prerequisite: TickFunctionId) {
        self.push(TickCommand::AddPrerequisite { id, prerequisite });
    }

    pub fn remove_prerequisite(&self, id: TickFunctionId, prerequisite: TickFunctionId) {
        self.push(TickCommand::RemovePrerequisite { id, prerequisite });
    }

    pub fn unregister(&self, id: TickFunctionId) {
        self.push(TickCommand::Unregister(id));
    }

    pub fn remove(&self, id: TickFunctionId) {
        self.push(TickCommand::Remove(id));
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub(crate) fn take(&self) -> Vec<TickCommand> {
        std::mem::take(&mut *self.queue.lock())
    }
}

impl fmt::Debug for TickCommands {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TickCommands").field("queued", &self.len()).finish()
    }
}
