//! Completion Handles
//!
//! A [`CompletionHandle`] is the shared token for one unit of work. It fires
//! exactly once; everything registered on it before that point (dependent
//! tasks, gather callbacks, blocked threads, async waiters) is released when
//! it does. Registering on an already fired handle is refused so the caller
//! can account for it immediately.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use tokio::sync::Notify;

use super::node::TaskNode;

/// Unique identifier for a task or manual event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Something waiting for a handle to fire.
pub(crate) enum Subsequent {
    Task(Arc<TaskNode>),
    Callback(Box<dyn FnOnce() + Send>),
}

impl Subsequent {
    fn fire(self) {
        match self {
            Subsequent::Task(node) => node.prerequisite_completed(),
            Subsequent::Callback(callback) => callback(),
        }
    }
}

struct HandleState {
    completed: bool,
    subsequents: SmallVec<[Subsequent; 2]>,
}

struct HandleInner {
    id: TaskId,
    /// Identity of the task graph that created this handle.
    graph_id: u64,
    completed: AtomicBool,
    state: Mutex<HandleState>,
    cond: Condvar,
    notify: Notify,
    /// Backing task, for retraction. Empty for manual events.
    task: Mutex<Weak<TaskNode>>,
}

/// Ref-counted completion token for a task.
///
/// Cloning is cheap; every clone observes the same completion.
#[derive(Clone)]
pub struct CompletionHandle {
    inner: Arc<HandleInner>,
}

impl CompletionHandle {
    pub(crate) fn new(graph_id: u64) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: TaskId::next(),
                graph_id,
                completed: AtomicBool::new(false),
                state: Mutex::new(HandleState {
                    completed: false,
                    subsequents: SmallVec::new(),
                }),
                cond: Condvar::new(),
                notify: Notify::new(),
                task: Mutex::new(Weak::new()),
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn is_complete(&self) -> bool {
        self.inner.completed.load(Ordering::Acquire)
    }

    pub fn ptr_eq(&self, other: &CompletionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Block the calling thread until the handle fires.
    ///
    /// This is the bare block: it neither retracts nor processes other
    /// work. Prefer [`TaskGraph::wait_until_tasks_complete`] on named threads.
    ///
    /// [`TaskGraph::wait_until_tasks_complete`]: super::TaskGraph::wait_until_tasks_complete
    pub fn wait(&self) {
        let mut state = self.inner.state.lock();
        while !state.completed {
            self.inner.cond.wait(&mut state);
        }
    }

    /// Block for at most `timeout`. Returns whether the handle fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while !state.completed {
            if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                return state.completed;
            }
        }
        true
    }

    /// Resolve once the handle fires.
    pub async fn completed(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_complete() {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn graph_id(&self) -> u64 {
        self.inner.graph_id
    }

    pub(crate) fn attach_task(&self, node: &Arc<TaskNode>) {
        *self.inner.task.lock() = Arc::downgrade(node);
    }

    pub(crate) fn task(&self) -> Option<Arc<TaskNode>> {
        self.inner.task.lock().upgrade()
    }

    /// Register work to release when this handle fires.
    ///
    /// Hands the subsequent back if the handle already fired.
    pub(crate) fn add_subsequent(&self, subsequent: Subsequent) -> Result<(), Subsequent> {
        let mut state = self.inner.state.lock();
        if state.completed {
            return Err(subsequent);
        }
        state.subsequents.push(subsequent);
        Ok(())
    }

    /// Run `callback` once this handle fires, immediately if it already has.
    pub(crate) fn on_complete(&self, callback: impl FnOnce() + Send + 'static) {
        if let Err(Subsequent::Callback(callback)) = self.add_subsequent(Subsequent::Callback(Box::new(callback))) {
            callback();
        }
    }

    /// Fire the handle. Returns false if it had already fired.
    pub(crate) fn dispatch_subsequents(&self) -> bool {
        let subsequents = {
            let mut state = self.inner.state.lock();
            if state.completed {
                return false;
            }
            state.completed = true;
            self.inner.completed.store(true, Ordering::Release);
            std::mem::take(&mut state.subsequents)
        };
        self.inner.cond.notify_all();
        self.inner.notify.notify_waiters();
        for subsequent in subsequents {
            subsequent.fire();
        }
        // The backing task is done; let it drop.
        *self.inner.task.lock() = Weak::new();
        true
    }

    /// Number of subsequents still registered. Diagnostic only.
    pub fn pending_subsequents(&self) -> usize {
        self.inner.state.lock().subsequents.len()
    }
}

impl fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("id", &self.inner.id)
            .field("complete", &self.is_complete())
            .finish()
    }
}

impl PartialEq for CompletionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for CompletionHandle {}
