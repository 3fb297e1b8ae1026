//! Named thread queues and drain loops.
//!
//! Each named thread has exactly one consumer: the OS thread currently bound
//! to that identity. Anyone may push.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::trace;

use super::graph::GraphShared;
use super::queue::TaskQueue;
use super::thread::{NamedThread, ThreadIdentity};

pub(crate) struct NamedThreadState {
    thread: NamedThread,
    queue: TaskQueue,
    return_requested: AtomicBool,
}

impl NamedThreadState {
    pub(crate) fn new(thread: NamedThread) -> Self {
        Self {
            thread,
            queue: TaskQueue::new(),
            return_requested: AtomicBool::new(false),
        }
    }

    pub(crate) fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    fn identity(&self) -> ThreadIdentity {
        ThreadIdentity::Named(self.thread)
    }

    /// Run queued tasks until the queue is empty. Returns how many ran.
    pub(crate) fn process_until_idle(&self) -> usize {
        let identity = self.identity();
        let mut executed = 0;
        while let Some(task) = self.queue.pop() {
            if task.try_execute(identity) {
                executed += 1;
            }
        }
        executed
    }

    /// Run at most one queued task.
    pub(crate) fn process_one(&self) -> bool {
        let identity = self.identity();
        while let Some(task) = self.queue.pop() {
            if task.try_execute(identity) {
                return true;
            }
        }
        false
    }

    /// Drain loop: run tasks, sleeping on the wake event when idle, until
    /// `stop` returns true or the graph shuts down.
    pub(crate) fn process_until(&self, shared: &GraphShared, stop: &dyn Fn() -> bool) -> usize {
        let identity = self.identity();
        let mut executed = 0;
        loop {
            if stop() || shared.is_shutting_down() {
                return executed;
            }
            if let Some(task) = self.queue.pop() {
                if task.try_execute(identity) {
                    executed += 1;
                }
                continue;
            }
            // Nobody else will run pool work in single-threaded mode.
            if shared.is_single_threaded() && shared.run_one_pool_task(identity) {
                executed += 1;
                continue;
            }
            self.queue.event().wait_timeout(shared.idle_wait());
        }
    }

    pub(crate) fn process_until_request_return(&self, shared: &GraphShared) -> usize {
        let executed = self.process_until(shared, &|| self.return_requested.swap(false, Ordering::AcqRel));
        trace!(thread = %self.thread, executed, "named thread returned from drain loop");
        executed
    }

    pub(crate) fn request_return(&self) {
        self.return_requested.store(true, Ordering::Release);
        self.queue.event().trigger();
    }
}
