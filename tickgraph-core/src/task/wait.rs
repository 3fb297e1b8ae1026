//! Waiting on Completion Handles
//!
//! Three strategies, from cheapest to most cooperative:
//!
//! 1. **Retraction**: run awaited tasks that are queued but not started
//!    directly on the calling thread. On a named thread any remainder is
//!    handled by queueing a "return" task behind the awaited handles and
//!    draining the thread's own queue until it runs. Elsewhere the caller
//!    blocks.
//! 2. **Block**: wait on one aggregate handle that fires when all the
//!    awaited handles have fired.
//! 3. **Pump**: spend a time budget running unrelated ready work between
//!    completion checks, then fall back to (1).
//!
//! The pump is built on [`TaskGraph::process_until_tasks_complete`], a small
//! state machine driven by a caller-supplied closure that picks the next
//! operation. The tick sequencer uses the same entry point for its idle work
//! budget and its stall watchdog.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use smallvec::SmallVec;

use super::graph::TaskGraph;
use super::handle::CompletionHandle;
use super::node::fire_when_all_complete;
use super::thread::{DesiredThread, TaskPriority, ThreadIdentity};

/// Upper bound on a single no-progress sleep inside the pump.
const PUMP_IDLE_SLEEP: Duration = Duration::from_micros(500);

/// How a caller wants to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStrategy {
    Retract,
    Block,
    Pump { budget: Duration },
}

/// Next step for [`TaskGraph::process_until_tasks_complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessTasksOperation {
    /// Drain the calling named thread's queue until it is empty.
    ProcessNamedThreadTasks,
    /// Retract every awaited task, then drain the named queue.
    ProcessAllOtherTasks,
    /// Run a single task: an awaited one if possible, otherwise any ready work.
    ProcessOneOtherTask,
    /// Stop cooperating and wait for completion.
    WaitUntilComplete,
    /// Give up; the handles may still be pending.
    StopProcessing,
}

type Pending = SmallVec<[CompletionHandle; 8]>;

fn incomplete(handles: &[CompletionHandle]) -> Pending {
    handles.iter().filter(|h| !h.is_complete()).cloned().collect()
}

impl TaskGraph {
    /// Try to run the task behind `handle` on the calling thread.
    pub fn try_retract_and_execute(&self, handle: &CompletionHandle) -> bool {
        if handle.is_complete() {
            return false;
        }
        match handle.task() {
            Some(task) => task.try_retract(self.current_thread(), 0),
            None => false,
        }
    }

    /// A handle that fires once all of `handles` have fired.
    pub fn trigger_event_when_tasks_complete(&self, handles: &[CompletionHandle]) -> CompletionHandle {
        let event = self.create_event();
        fire_when_all_complete(&event, handles.iter().cloned());
        event
    }

    /// Wait using retraction first, then the strategy appropriate for the
    /// calling thread.
    ///
    /// A named thread waiting on work that only it can run keeps running
    /// that work. A named thread waiting on work queued for a *different*
    /// named thread that nobody drains never returns.
    pub fn wait_until_tasks_complete(&self, handles: &[CompletionHandle]) {
        for handle in handles {
            self.try_retract_and_execute(handle);
        }
        let remaining = incomplete(handles);
        if remaining.is_empty() {
            return;
        }

        match self.current_thread() {
            ThreadIdentity::Named(thread) => {
                let done = Arc::new(AtomicBool::new(false));
                let flag = done.clone();
                self.launch(
                    move |_| flag.store(true, Ordering::Release),
                    &remaining,
                    DesiredThread::named(thread).with_task_priority(TaskPriority::High),
                );
                self.shared()
                    .named(thread)
                    .process_until(self.shared(), &|| done.load(Ordering::Acquire));
            }
            _ => self.block_until_complete(&remaining),
        }
    }

    /// Wait with an explicit strategy.
    pub fn wait_with(&self, handles: &[CompletionHandle], strategy: WaitStrategy) {
        match strategy {
            WaitStrategy::Retract => self.wait_until_tasks_complete(handles),
            WaitStrategy::Block => self.block_until_complete(&incomplete(handles)),
            WaitStrategy::Pump { budget } => {
                let start = Instant::now();
                self.process_until_tasks_complete(handles, |_| {
                    if start.elapsed() < budget {
                        ProcessTasksOperation::ProcessOneOtherTask
                    } else {
                        ProcessTasksOperation::WaitUntilComplete
                    }
                });
            }
        }
    }

    fn block_until_complete(&self, handles: &[CompletionHandle]) {
        if handles.is_empty() {
            return;
        }
        let gathered = self.trigger_event_when_tasks_complete(handles);
        if !self.shared().is_single_threaded() {
            gathered.wait();
            return;
        }
        // Nobody else runs pool work, so help until the gather fires.
        let identity = self.current_thread();
        while !gathered.is_complete() {
            if self.shared().is_shutting_down() {
                return;
            }
            if !self.shared().run_one_pool_task(identity) {
                gathered.wait_timeout(self.shared().idle_wait());
            }
        }
    }

    /// Cooperative executor.
    ///
    /// Before each step `update` is told how many handles are still pending
    /// and returns the next operation. Returns true once every handle has
    /// fired, false if `update` chose to stop first.
    pub fn process_until_tasks_complete<F>(&self, handles: &[CompletionHandle], mut update: F) -> bool
    where
        F: FnMut(usize) -> ProcessTasksOperation,
    {
        let identity = self.current_thread();

        loop {
            let remaining = incomplete(handles);
            if remaining.is_empty() {
                return true;
            }

            let made_progress = match update(remaining.len()) {
                ProcessTasksOperation::ProcessNamedThreadTasks => match identity {
                    ThreadIdentity::Named(thread) => self.shared().named(thread).process_until_idle() > 0,
                    _ => false,
                },
                ProcessTasksOperation::ProcessAllOtherTasks => {
                    let mut ran = false;
                    for handle in &remaining {
                        ran |= self.try_retract_and_execute(handle);
                    }
                    if let ThreadIdentity::Named(thread) = identity {
                        ran |= self.shared().named(thread).process_until_idle() > 0;
                    }
                    ran
                }
                ProcessTasksOperation::ProcessOneOtherTask => self.process_one_task(&remaining, identity),
                ProcessTasksOperation::WaitUntilComplete => {
                    self.wait_until_tasks_complete(&remaining);
                    return true;
                }
                ProcessTasksOperation::StopProcessing => return false,
            };

            if !made_progress {
                self.idle_briefly(identity);
            }
        }
    }

    fn process_one_task(&self, awaited: &[CompletionHandle], identity: ThreadIdentity) -> bool {
        if awaited.iter().any(|handle| self.try_retract_and_execute(handle)) {
            return true;
        }
        if let ThreadIdentity::Named(thread) = identity {
            if self.shared().named(thread).process_one() {
                return true;
            }
        }
        self.shared().run_one_pool_task(identity)
    }

    fn idle_briefly(&self, identity: ThreadIdentity) {
        match identity {
            ThreadIdentity::Named(thread) => {
                self.shared()
                    .named(thread)
                    .queue()
                    .event()
                    .wait_timeout(PUMP_IDLE_SLEEP.min(self.shared().idle_wait()));
            }
            _ => std::thread::sleep(PUMP_IDLE_SLEEP),
        }
    }
}
