//! Tick Group Sequencer
//!
//! Owns the tasks queued for the current frame and releases them group by
//! group.
//!
//! # Overview
//!
//! Every tick task is built held, as soon as its prerequisites are known,
//! and filed under its `(start, end)` group pair. Its completion handle goes
//! into the completion list of its end group.
//!
//! - **Dispatch(G)** unlocks every task whose start group is G, high priority
//!   first.
//! - **Block(G)** waits for the completion lists of every group not yet
//!   waited on, up to G. Cross-group ordering comes from the prerequisite
//!   handles attached at queue time, so a non-blocking group simply lets its
//!   work overlap later groups.
//! - **Reset(G)** clears that group's bookkeeping once it has been waited on.
//!
//! Manually dispatched tasks are never unlocked by Dispatch. They sit in a
//! per-group gate list; if a block stops making progress for long enough
//! the watchdog releases whatever is still gated.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use super::function::{TickExecution, TickFrameInfo, TickFunctionId, TickFunctionRecord, TickShared};
use super::group::TickGroup;
use crate::config::TickConfig;
use crate::task::{
    CompletionHandle, DesiredThread, HeldTask, NamedThread, ProcessTasksOperation, TaskGraph, TaskPriority,
    ThreadPriority,
};

const GROUPS: usize = TickGroup::COUNT;

/// Settings latched at frame start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct FrameOptions {
    pub(crate) allow_concurrent: bool,
    pub(crate) allow_batching: bool,
    pub(crate) optimized_prerequisites: bool,
    pub(crate) log_ticks: bool,
}

impl FrameOptions {
    pub(crate) fn from_config(config: &TickConfig, single_threaded: bool) -> Self {
        Self {
            allow_concurrent: config.allow_concurrent_ticks && !single_threaded,
            allow_batching: config.allow_batched_ticks,
            optimized_prerequisites: config.allow_optimized_prerequisites,
            log_ticks: config.log_ticks,
        }
    }
}

/// Something the watchdog may release.
pub(crate) enum ManualGate {
    Tick(Arc<TickShared>),
    Task(HeldTask),
}

impl ManualGate {
    fn force(&self) -> bool {
        match self {
            ManualGate::Tick(shared) => shared.dispatch(),
            ManualGate::Task(task) => task.unlock(),
        }
    }

    fn disarm(&self) {
        if let ManualGate::Tick(shared) = self {
            shared.disarm();
        }
    }

    fn describe(&self) -> String {
        match self {
            ManualGate::Tick(shared) => shared.name().to_string(),
            ManualGate::Task(task) => task.id().to_string(),
        }
    }
}

/// Several game-thread ticks sharing one task.
struct TickBatch {
    start: TickGroup,
    end: TickGroup,
    prerequisites: SmallVec<[TickFunctionId; 4]>,
    members: SmallVec<[TickFunctionId; 8]>,
    executions: Arc<Mutex<Vec<TickExecution>>>,
    completion: CompletionHandle,
}

impl TickBatch {
    /// Same groups, and every prerequisite of the candidate is already a
    /// prerequisite of the batch rather than one of its members.
    fn accepts(&self, record: &TickFunctionRecord, prerequisites: &[(TickFunctionId, CompletionHandle)]) -> bool {
        self.start == record.actual_start
            && self.end == record.actual_end
            && prerequisites
                .iter()
                .all(|(id, _)| self.prerequisites.contains(id) && !self.members.contains(id))
    }
}

pub(crate) struct TickSequencer {
    tick_tasks: [[Vec<HeldTask>; GROUPS]; GROUPS],
    high_priority_tasks: [[Vec<HeldTask>; GROUPS]; GROUPS],
    completion_events: [Vec<CompletionHandle>; GROUPS],
    manual_dispatch: [Vec<ManualGate>; GROUPS],
    batches: Vec<TickBatch>,
    /// First group whose completions have not been waited on yet.
    wait_for_group: TickGroup,
    options: FrameOptions,
    single_threaded: bool,
}

impl TickSequencer {
    pub(crate) fn new() -> Self {
        Self {
            tick_tasks: std::array::from_fn(|_| std::array::from_fn(|_| Vec::new())),
            high_priority_tasks: std::array::from_fn(|_| std::array::from_fn(|_| Vec::new())),
            completion_events: std::array::from_fn(|_| Vec::new()),
            manual_dispatch: std::array::from_fn(|_| Vec::new()),
            batches: Vec::new(),
            wait_for_group: TickGroup::PrePhysics,
            options: FrameOptions::default(),
            single_threaded: false,
        }
    }

    pub(crate) fn start_frame(&mut self, options: FrameOptions, single_threaded: bool) {
        if options.log_ticks {
            debug!("tick sequencer: start frame");
        }
        for group in 0..GROUPS {
            if !self.completion_events[group].is_empty() {
                warn!(
                    group = %TickGroup::ALL[group],
                    pending = self.completion_events[group].len(),
                    "discarding completions left over from the previous frame"
                );
            }
            self.completion_events[group].clear();
            for gate in self.manual_dispatch[group].drain(..) {
                gate.disarm();
            }
            for end in 0..GROUPS {
                self.tick_tasks[group][end].clear();
                self.high_priority_tasks[group][end].clear();
            }
        }
        self.batches.clear();
        self.wait_for_group = TickGroup::PrePhysics;
        self.options = options;
        self.single_threaded = single_threaded;
    }

    pub(crate) fn options(&self) -> FrameOptions {
        self.options
    }

    /// Batching only applies to the frame's main queueing pass.
    pub(crate) fn finish_batching(&mut self) {
        self.options.allow_batching = false;
    }

    fn desired_thread(&self, record: &TickFunctionRecord) -> DesiredThread {
        let high = record.flags.high_priority;
        // Work moved out of its declared group stays on the game thread.
        if record.flags.run_on_any_thread && self.options.allow_concurrent && record.actual_start == record.group {
            if high {
                DesiredThread::any_with(ThreadPriority::High)
            } else {
                DesiredThread::any()
            }
        } else {
            let priority = if high { TaskPriority::High } else { TaskPriority::Normal };
            DesiredThread::game().with_task_priority(priority)
        }
    }

    fn can_batch(record: &TickFunctionRecord) -> bool {
        !record.flags.run_on_any_thread && !record.flags.high_priority && record.actual_start == record.actual_end
    }

    /// Build the task for a resolved function, or add it to a compatible
    /// batch. Sets `record.task`.
    pub(crate) fn queue_or_batch(
        &mut self,
        graph: &TaskGraph,
        id: TickFunctionId,
        record: &mut TickFunctionRecord,
        prerequisites: &[(TickFunctionId, CompletionHandle)],
        execution: TickExecution,
        info: &TickFrameInfo,
    ) {
        let batchable = self.options.allow_batching
            && record.flags.allow_batching
            && !record.flags.dispatch_manually
            && Self::can_batch(record);
        if !batchable {
            self.queue_task(graph, record, prerequisites, execution, info);
            return;
        }

        let index = match self.batches.iter().position(|batch| batch.accepts(record, prerequisites)) {
            Some(index) => index,
            None => self.start_batch(graph, record, prerequisites, info),
        };
        let batch = &mut self.batches[index];
        batch.members.push(id);
        batch.executions.lock().push(execution);
        record.task = Some(batch.completion.clone());
        if self.options.log_ticks {
            trace!(tick = %record.name, batch = index, "added to batch");
        }
    }

    fn start_batch(
        &mut self,
        graph: &TaskGraph,
        record: &TickFunctionRecord,
        prerequisites: &[(TickFunctionId, CompletionHandle)],
        info: &TickFrameInfo,
    ) -> usize {
        let executions: Arc<Mutex<Vec<TickExecution>>> = Arc::new(Mutex::new(Vec::new()));
        let handles: SmallVec<[CompletionHandle; 4]> = prerequisites.iter().map(|(_, handle)| handle.clone()).collect();
        let payload_executions = executions.clone();
        let info = info.clone();
        let task = graph.create_held(
            move |task| {
                let batch = std::mem::take(&mut *payload_executions.lock());
                for execution in &batch {
                    execution.run(&info, task);
                }
            },
            &handles,
            self.desired_thread(record),
        );

        let completion = task.completion();
        self.add_completion(record.actual_start, record.actual_end, task, false);
        self.batches.push(TickBatch {
            start: record.actual_start,
            end: record.actual_end,
            prerequisites: prerequisites.iter().map(|(id, _)| *id).collect(),
            members: SmallVec::new(),
            executions,
            completion,
        });
        self.batches.len() - 1
    }

    fn queue_task(
        &mut self,
        graph: &TaskGraph,
        record: &mut TickFunctionRecord,
        prerequisites: &[(TickFunctionId, CompletionHandle)],
        execution: TickExecution,
        info: &TickFrameInfo,
    ) {
        let handles: SmallVec<[CompletionHandle; 4]> = prerequisites.iter().map(|(_, handle)| handle.clone()).collect();
        let info = info.clone();
        let task = graph.create_held(
            move |task| execution.run(&info, task),
            &handles,
            self.desired_thread(record),
        );
        record.task = Some(task.completion());

        if record.flags.dispatch_manually {
            let end = record.actual_end.index();
            self.completion_events[end].push(task.completion());
            record.shared.arm(task);
            self.manual_dispatch[end].push(ManualGate::Tick(record.shared.clone()));
        } else {
            self.add_completion(record.actual_start, record.actual_end, task, record.flags.high_priority);
        }
    }

    fn add_completion(&mut self, start: TickGroup, end: TickGroup, task: HeldTask, high_priority: bool) {
        self.completion_events[end.index()].push(task.completion());
        if high_priority {
            self.high_priority_tasks[start.index()][end.index()].push(task);
        } else {
            self.tick_tasks[start.index()][end.index()].push(task);
        }
    }

    /// Gate an externally created held task on `group`. It is waited on at
    /// that group's block and released by the watchdog if nothing else does.
    pub(crate) fn add_gate(&mut self, group: TickGroup, task: HeldTask) {
        self.completion_events[group.index()].push(task.completion());
        self.manual_dispatch[group.index()].push(ManualGate::Task(task));
    }

    /// Make `group`'s block also wait for `handle`.
    pub(crate) fn add_group_completion(&mut self, group: TickGroup, handle: CompletionHandle) {
        self.completion_events[group.index()].push(handle);
    }

    /// First group whose completions are still outstanding.
    pub(crate) fn wait_for_group(&self) -> TickGroup {
        self.wait_for_group
    }

    /// Unlock every task starting in `group`, then `dispatch_now`.
    pub(crate) fn dispatch_group(&mut self, group: TickGroup, dispatch_now: Vec<HeldTask>) {
        if self.options.log_ticks {
            debug!(group = %group, "release tick group");
        }
        let row = group.index();
        for end in 0..GROUPS {
            if end < row && !self.high_priority_tasks[row][end].is_empty() {
                warn!(group = %group, "tasks filed with an end group before their start group");
            }
            for task in self.high_priority_tasks[row][end].drain(..) {
                task.unlock();
            }
        }
        for end in 0..GROUPS {
            for task in self.tick_tasks[row][end].drain(..) {
                task.unlock();
            }
        }
        for task in dispatch_now {
            if !task.unlock() {
                trace!(task = %task.id(), "task dispatched at group start was already unlocked");
            }
        }
    }

    /// Finish `group`: wait for everything due by now when blocking,
    /// otherwise run what the game thread already has and move on.
    pub(crate) fn complete_group(&mut self, graph: &TaskGraph, group: TickGroup, block: bool, config: &TickConfig) {
        if !(block || self.single_threaded) {
            graph.process_thread_until_idle(NamedThread::Game);
            return;
        }

        for waited in TickGroup::range(self.wait_for_group, group) {
            if self.completion_events[waited.index()].is_empty() {
                continue;
            }
            if config.idle_task_work_ms >= 0.0 {
                self.wait_with_watchdog(graph, waited, config);
            } else {
                graph.wait_until_tasks_complete(&self.completion_events[waited.index()]);
            }
            self.reset_group(waited);
        }

        // The newly spawned group is released repeatedly within a frame.
        if group != TickGroup::NewlySpawned {
            if let Some(next) = group.next() {
                self.wait_for_group = next;
            }
        }
    }

    fn wait_with_watchdog(&self, graph: &TaskGraph, group: TickGroup, config: &TickConfig) {
        let events = &self.completion_events[group.index()];
        let gates = &self.manual_dispatch[group.index()];

        let budget = Duration::from_secs_f64(config.idle_task_work_ms.max(0.0) / 1000.0);
        let mut idle_work = config.idle_task_work_ms > 0.0;
        let mut idle_deadline: Option<Instant> = None;
        let mut deadlock_check = !gates.is_empty();
        let mut previous_remaining = events.len();
        let mut stalled: u32 = 0;

        graph.process_until_tasks_complete(events, |remaining| {
            if idle_work {
                match idle_deadline {
                    None => idle_deadline = Some(Instant::now() + budget),
                    Some(deadline) if Instant::now() > deadline => idle_work = false,
                    Some(_) => {}
                }
            }

            if deadlock_check {
                if remaining == previous_remaining {
                    stalled += 1;
                    if stalled > config.stall_idle_iterations {
                        Self::force_gates(group, gates);
                        deadlock_check = false;
                    }
                } else {
                    previous_remaining = remaining;
                    stalled = 0;
                }
            }

            if idle_work {
                ProcessTasksOperation::ProcessOneOtherTask
            } else if deadlock_check {
                ProcessTasksOperation::ProcessNamedThreadTasks
            } else {
                ProcessTasksOperation::WaitUntilComplete
            }
        });
    }

    fn force_gates(group: TickGroup, gates: &[ManualGate]) {
        for gate in gates {
            if gate.force() {
                warn!(
                    group = %group,
                    gated = %gate.describe(),
                    "no progress while blocking; force-dispatching manually gated work"
                );
            }
        }
    }

    fn reset_group(&mut self, group: TickGroup) {
        self.completion_events[group.index()].clear();
        for gate in self.manual_dispatch[group.index()].drain(..) {
            gate.disarm();
        }
    }

    pub(crate) fn end_frame(&mut self) {
        if self.options.log_ticks {
            debug!("tick sequencer: end frame");
        }
        self.batches.clear();
    }

    #[cfg(test)]
    /// Completions still outstanding for `group`.
    pub(crate) fn pending_completions(&self, group: TickGroup) -> usize {
        self.completion_events[group.index()].len()
    }

    #[cfg(test)]
    /// Held tasks waiting for `group` to be dispatched.
    pub(crate) fn held_in(&self, group: TickGroup) -> usize {
        let row = group.index();
        (0..GROUPS)
            .map(|end| self.tick_tasks[row][end].len() + self.high_priority_tasks[row][end].len())
            .sum()
    }

    #[cfg(test)]
    pub(crate) fn batch_count(&self) -> usize {
        self.batches.len()
    }
}

impl Default for TickSequencer {
    fn default() -> Self {
        Self::new()
    }
}
