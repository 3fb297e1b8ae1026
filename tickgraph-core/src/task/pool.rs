//! Worker Pool
//!
//! Fungible worker threads split into banks by thread priority. Every bank
//! has its own two-lane queue; a bank without workers forwards its work to
//! the normal bank. In single-threaded mode no bank has workers and the
//! normal bank's queue is drained only by waiting or pumping callers.

use std::sync::Arc;

use tracing::{debug, trace};

use super::context::ThreadBinding;
use super::graph::GraphShared;
use super::node::TaskNode;
use super::queue::TaskQueue;
use super::thread::{TaskPriority, ThreadIdentity, ThreadPriority};

pub(crate) struct WorkerBank {
    priority: ThreadPriority,
    queue: TaskQueue,
    workers: usize,
}

impl WorkerBank {
    pub(crate) fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub(crate) fn workers(&self) -> usize {
        self.workers
    }
}

pub(crate) struct WorkerPool {
    banks: [WorkerBank; ThreadPriority::COUNT],
}

impl WorkerPool {
    pub(crate) fn new(per_bank: usize, high_priority_bank: bool, background_bank: bool) -> Self {
        let bank = |priority: ThreadPriority, enabled: bool| WorkerBank {
            priority,
            queue: TaskQueue::new(),
            workers: if enabled { per_bank } else { 0 },
        };
        Self {
            banks: [
                bank(ThreadPriority::Background, background_bank),
                bank(ThreadPriority::Normal, true),
                bank(ThreadPriority::High, high_priority_bank),
            ],
        }
    }

    pub(crate) fn bank(&self, priority: ThreadPriority) -> &WorkerBank {
        &self.banks[priority.index()]
    }

    /// The bank that actually services `priority`.
    fn route(&self, priority: ThreadPriority) -> &WorkerBank {
        let bank = self.bank(priority);
        if bank.workers == 0 && priority != ThreadPriority::Normal {
            self.bank(ThreadPriority::Normal)
        } else {
            bank
        }
    }

    pub(crate) fn push(&self, node: Arc<TaskNode>, thread_priority: ThreadPriority, task_priority: TaskPriority) {
        let bank = self.route(thread_priority);
        trace!(task = %node.id(), bank = bank.priority.name(), "queued on worker bank");
        bank.queue.push(node, task_priority);
    }

    /// Pop from the most urgent non-empty bank.
    pub(crate) fn pop_any(&self) -> Option<Arc<TaskNode>> {
        self.banks.iter().rev().find_map(|bank| bank.queue.pop())
    }

    pub(crate) fn queued(&self) -> usize {
        self.banks.iter().map(|bank| bank.queue.len()).sum()
    }

    pub(crate) fn wake_all(&self) {
        for bank in &self.banks {
            bank.queue.event().trigger();
        }
    }

    pub(crate) fn drain(&self) -> usize {
        self.banks.iter().map(|bank| bank.queue.drain().len()).sum()
    }
}

/// Body of one worker thread.
pub(crate) fn worker_main(shared: Arc<GraphShared>, priority: ThreadPriority, index: usize) {
    let identity = ThreadIdentity::Worker { bank: priority, index };
    let _binding = ThreadBinding::enter(shared.id(), identity);
    let bank = shared.pool().bank(priority);
    debug!(worker = %identity, "worker started");

    loop {
        if shared.is_shutting_down() {
            break;
        }
        if let Some(task) = bank.queue.pop() {
            task.try_execute(identity);
            continue;
        }
        bank.queue.event().wait_timeout(shared.idle_wait());
    }

    debug!(worker = %identity, "worker stopped");
}
