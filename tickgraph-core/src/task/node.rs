//! Graph Task Nodes
//!
//! A node owns the payload closure and counts the things still standing
//! between it and execution: one per unfired prerequisite, one setup
//! reference released after all prerequisites are registered, and one hold
//! reference for tasks created in the held state. When the count reaches zero
//! the node is pushed onto the queue matching its desired thread.
//!
//! # States
//!
//! `Waiting -> Queued -> Running -> Done`. The `Queued -> Running` edge is a
//! compare-and-swap, which is what makes retraction safe: whichever thread
//! wins the swap runs the task, and the queue entry left behind is skipped
//! when popped.

use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{error, warn};

use super::graph::GraphShared;
use super::handle::{CompletionHandle, Subsequent, TaskId};
use super::thread::{DesiredThread, ThreadIdentity};

/// Boxed task body.
pub(crate) type Payload = Box<dyn FnOnce(&TaskContext) + Send>;

const WAITING: u8 = 0;
const QUEUED: u8 = 1;
const RUNNING: u8 = 2;
const DONE: u8 = 3;

/// Retraction follows unfired prerequisites at most this deep.
const MAX_RETRACT_DEPTH: usize = 16;

pub(crate) struct TaskNode {
    handle: CompletionHandle,
    desired: DesiredThread,
    payload: Mutex<Option<Payload>>,
    prerequisites: Mutex<SmallVec<[CompletionHandle; 4]>>,
    pending: AtomicUsize,
    state: AtomicU8,
    held: AtomicBool,
    shared: Weak<GraphShared>,
}

impl TaskNode {
    /// Build a node and wire it to its prerequisites.
    ///
    /// Prerequisites created by a different graph are dropped with a warning,
    /// as is the new task's own handle. A non-held node with no outstanding
    /// prerequisites is queued before this returns.
    pub(crate) fn spawn(
        shared: &Weak<GraphShared>,
        graph_id: u64,
        payload: Payload,
        prerequisites: &[CompletionHandle],
        desired: DesiredThread,
        held: bool,
    ) -> Arc<TaskNode> {
        let handle = CompletionHandle::new(graph_id);
        let mut accepted: SmallVec<[CompletionHandle; 4]> = SmallVec::new();
        for prerequisite in prerequisites {
            if prerequisite.graph_id() != graph_id {
                warn!(
                    task = %handle.id(),
                    prerequisite = %prerequisite.id(),
                    "dropping prerequisite from another task graph"
                );
                continue;
            }
            if accepted.iter().any(|p| p.ptr_eq(prerequisite)) {
                continue;
            }
            accepted.push(prerequisite.clone());
        }

        // prerequisites + setup reference + optional hold
        let pending = accepted.len() + 1 + usize::from(held);
        let node = Arc::new(TaskNode {
            handle: handle.clone(),
            desired,
            payload: Mutex::new(Some(payload)),
            prerequisites: Mutex::new(accepted.clone()),
            pending: AtomicUsize::new(pending),
            state: AtomicU8::new(WAITING),
            held: AtomicBool::new(held),
            shared: shared.clone(),
        });
        handle.attach_task(&node);

        if let Some(shared) = shared.upgrade() {
            shared.record_launch();
        }

        for prerequisite in accepted {
            if prerequisite.add_subsequent(Subsequent::Task(node.clone())).is_err() {
                node.prerequisite_completed();
            }
        }
        node.prerequisite_completed();
        node
    }

    pub(crate) fn handle(&self) -> &CompletionHandle {
        &self.handle
    }

    pub(crate) fn id(&self) -> TaskId {
        self.handle.id()
    }

    pub(crate) fn desired(&self) -> DesiredThread {
        self.desired
    }

    pub(crate) fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    pub(crate) fn is_queued(&self) -> bool {
        self.state.load(Ordering::Acquire) == QUEUED
    }

    pub(crate) fn prerequisite_completed(self: &Arc<Self>) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.make_ready();
        }
    }

    /// Release the hold reference. Only the first call has any effect.
    pub(crate) fn unlock(self: &Arc<Self>) -> bool {
        if self.held.swap(false, Ordering::AcqRel) {
            self.prerequisite_completed();
            true
        } else {
            false
        }
    }

    fn make_ready(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(WAITING, QUEUED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        match self.shared.upgrade() {
            Some(shared) if !shared.is_shutting_down() => shared.enqueue(self.clone()),
            _ => {
                warn!(task = %self.id(), "task graph has shut down, running task inline");
                self.try_execute(ThreadIdentity::External);
            }
        }
    }

    /// Run the task here if it is queued and nobody else got to it first.
    pub(crate) fn try_execute(self: &Arc<Self>, thread: ThreadIdentity) -> bool {
        if self
            .state
            .compare_exchange(QUEUED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.execute(thread);
        true
    }

    fn execute(self: &Arc<Self>, thread: ThreadIdentity) {
        let payload = self.payload.lock().take();
        self.prerequisites.lock().clear();

        let context = TaskContext {
            handle: &self.handle,
            thread,
            shared: self.shared.clone(),
            graph_id: self.handle.graph_id(),
            nested: RefCell::new(SmallVec::new()),
        };
        if let Some(payload) = payload {
            if catch_unwind(AssertUnwindSafe(|| payload(&context))).is_err() {
                error!(task = %self.id(), thread = %thread, "task payload panicked; completing anyway");
            }
        }
        let nested = context.nested.into_inner();

        self.state.store(DONE, Ordering::Release);
        if let Some(shared) = self.shared.upgrade() {
            shared.record_execution();
        }
        fire_when_all_complete(&self.handle, nested.into_iter());
    }

    /// Try to run this task, or the unfired prerequisites holding it back,
    /// on the calling thread.
    pub(crate) fn try_retract(self: &Arc<Self>, thread: ThreadIdentity, depth: usize) -> bool {
        if !thread.can_run(&self.desired) {
            return false;
        }
        match self.state.load(Ordering::Acquire) {
            QUEUED => self.try_execute(thread),
            WAITING => {
                if depth >= MAX_RETRACT_DEPTH || self.is_held() {
                    return false;
                }
                let prerequisites = self.prerequisites.lock().clone();
                for prerequisite in prerequisites.iter().filter(|p| !p.is_complete()) {
                    if let Some(task) = prerequisite.task() {
                        task.try_retract(thread, depth + 1);
                    }
                }
                self.is_queued() && self.try_execute(thread)
            }
            _ => false,
        }
    }
}

/// Fire `target` once every handle in `sources` has fired.
///
/// `target` itself is skipped if it appears among the sources.
pub(crate) fn fire_when_all_complete(
    target: &CompletionHandle,
    sources: impl Iterator<Item = CompletionHandle>,
) {
    let pending: SmallVec<[CompletionHandle; 4]> = sources
        .filter(|source| {
            if source.ptr_eq(target) {
                warn!(task = %target.id(), "task cannot wait on its own completion; ignoring");
                return false;
            }
            !source.is_complete()
        })
        .collect();

    if pending.is_empty() {
        target.dispatch_subsequents();
        return;
    }

    let remaining = Arc::new(AtomicUsize::new(pending.len()));
    for source in pending {
        let remaining = remaining.clone();
        let target = target.clone();
        source.on_complete(move || {
            if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                target.dispatch_subsequents();
            }
        });
    }
}

/// What a running payload can see and do.
pub struct TaskContext<'a> {
    handle: &'a CompletionHandle,
    thread: ThreadIdentity,
    shared: Weak<GraphShared>,
    graph_id: u64,
    nested: RefCell<SmallVec<[CompletionHandle; 2]>>,
}

impl<'a> TaskContext<'a> {
    /// This task's own completion handle.
    pub fn completion(&self) -> &CompletionHandle {
        self.handle
    }

    pub fn current_thread(&self) -> ThreadIdentity {
        self.thread
    }

    /// Delay this task's completion until `handle` fires as well.
    pub fn dont_complete_until(&self, handle: CompletionHandle) {
        self.nested.borrow_mut().push(handle);
    }

    /// Launch unrelated follow-up work on the same graph.
    pub fn launch<F>(&self, payload: F, prerequisites: &[CompletionHandle], desired: DesiredThread) -> CompletionHandle
    where
        F: FnOnce(&TaskContext) + Send + 'static,
    {
        TaskNode::spawn(&self.shared, self.graph_id, Box::new(payload), prerequisites, desired, false)
            .handle()
            .clone()
    }

    /// Launch sub-work this task's completion waits for.
    pub fn launch_nested<F>(
        &self,
        payload: F,
        prerequisites: &[CompletionHandle],
        desired: DesiredThread,
    ) -> CompletionHandle
    where
        F: FnOnce(&TaskContext) + Send + 'static,
    {
        let handle = self.launch(payload, prerequisites, desired);
        self.dont_complete_until(handle.clone());
        handle
    }

    /// A context for running work that did not come from a queue.
    pub(crate) fn detached(handle: &'a CompletionHandle, thread: ThreadIdentity) -> Self {
        Self {
            handle,
            thread,
            shared: Weak::new(),
            graph_id: handle.graph_id(),
            nested: RefCell::new(SmallVec::new()),
        }
    }
}

/// A task built in the held state.
///
/// It registers on its prerequisites immediately but cannot be queued until
/// [`HeldTask::unlock`] is called.
#[derive(Clone)]
pub struct HeldTask {
    node: Arc<TaskNode>,
}

impl HeldTask {
    pub(crate) fn new(node: Arc<TaskNode>) -> Self {
        Self { node }
    }

    pub fn id(&self) -> TaskId {
        self.node.id()
    }

    pub fn completion(&self) -> CompletionHandle {
        self.node.handle().clone()
    }

    /// Allow the task to run once its prerequisites have fired.
    ///
    /// Returns false if it was already unlocked.
    pub fn unlock(&self) -> bool {
        self.node.unlock()
    }

    pub fn is_unlocked(&self) -> bool {
        !self.node.is_held()
    }
}

impl std::fmt::Debug for HeldTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeldTask")
            .field("id", &self.node.id())
            .field("unlocked", &self.is_unlocked())
            .field("complete", &self.node.handle().is_complete())
            .finish()
    }
}
