//! Prerequisite resolution.
//!
//! Turns declared groups plus prerequisite edges into actual start and end
//! groups, then hands each enabled function to the sequencer. Prerequisites
//! are resolved depth first, so by the time a function is queued every
//! prerequisite it depends on already has a completion handle.
//!
//! A function's actual start group is the latest of:
//!
//! - its declared group,
//! - the group currently being queued for (`NewlySpawned` for late work),
//! - the actual end group of every relevant prerequisite.
//!
//! With optimized prerequisites a prerequisite that is guaranteed to have
//! finished before the dependent's declared group starts adds no edge at all.
//! `DuringPhysics` is never guaranteed finished, since that group is not
//! waited on until `EndPhysics`.

use smallvec::SmallVec;
use tracing::warn;

use super::arena::TickArena;
use super::function::{LevelId, TickFrameInfo, TickFunctionId, TickState};
use super::group::TickGroup;
use super::manager::FrameContext;
use super::sequencer::TickSequencer;
use crate::task::{CompletionHandle, TaskGraph};

pub(crate) struct Resolver<'a> {
    pub(crate) arena: &'a mut TickArena,
    pub(crate) sequencer: &'a mut TickSequencer,
    pub(crate) graph: &'a TaskGraph,
    pub(crate) frame: &'a FrameContext,
    /// Levels ticking this frame.
    pub(crate) ticking: &'a [LevelId],
    pub(crate) info: &'a TickFrameInfo,
}

impl Resolver<'_> {
    /// Resolve `id` and its prerequisites and queue whatever is enabled.
    /// Visiting the same function twice in a frame does nothing.
    pub(crate) fn queue(&mut self, id: TickFunctionId) {
        let frame = self.frame.frame;
        let Some(record) = self.arena.get_mut(id) else {
            return;
        };
        if record.visited_frame == frame {
            return;
        }
        record.visited_frame = frame;
        record.task = None;

        if record.state != TickState::Disabled {
            self.resolve(id);
        }

        if let Some(record) = self.arena.get_mut(id) {
            record.queued_frame = frame;
        }
    }

    fn resolve(&mut self, id: TickFunctionId) {
        let frame = self.frame.frame;
        let optimized = self.sequencer.options().optimized_prerequisites;
        let Some(record) = self.arena.get(id) else {
            return;
        };
        let declared = record.group;
        let declared_end = record.end_group;
        let name = record.name.clone();
        let prerequisites = record.prerequisites.clone();

        let mut start = declared.max(self.frame.group);
        let mut handles: SmallVec<[(TickFunctionId, CompletionHandle); 4]> = SmallVec::new();
        let mut stale: SmallVec<[TickFunctionId; 2]> = SmallVec::new();

        for prerequisite in prerequisites {
            let level = match self.arena.get(prerequisite) {
                None => {
                    warn!(tick = %name, prerequisite = %prerequisite, "dropping stale prerequisite");
                    stale.push(prerequisite);
                    continue;
                }
                Some(other) => other.level,
            };
            // Unregistered, or parked in a level that is not ticking.
            let Some(level) = level else {
                continue;
            };
            if !self.ticking.contains(&level) {
                continue;
            }

            self.queue(prerequisite);

            let Some(other) = self.arena.get(prerequisite) else {
                continue;
            };
            if other.queued_frame != frame {
                warn!(
                    tick = %name,
                    prerequisite = %other.name,
                    "prerequisite cycle detected; ignoring the edge for this frame"
                );
                continue;
            }
            let Some(task) = other.task.clone() else {
                continue;
            };
            let relevant =
                !optimized || other.actual_end >= declared || other.actual_end == TickGroup::DuringPhysics;
            if relevant {
                start = start.max(other.actual_end);
                handles.push((prerequisite, task));
            }
        }

        let Some(record) = self.arena.get_mut(id) else {
            return;
        };
        if !stale.is_empty() {
            record.prerequisites.retain(|p| !stale.contains(p));
        }

        if start != declared {
            start = start.demoted();
        }
        let mut end = start;
        for group in TickGroup::range(start, declared_end.max(start)).skip(1) {
            if group.can_host_demoted() {
                end = group;
            }
        }
        record.actual_start = start;
        record.actual_end = end;

        if record.state == TickState::Enabled {
            let delta = record.delta_for(self.frame.delta_seconds, self.frame.world_time, self.frame.unpaused_time);
            let execution = record.execution(id, delta);
            self.sequencer
                .queue_or_batch(self.graph, id, record, &handles, execution, self.info);
        }
    }
}
