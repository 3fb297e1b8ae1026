//! Task Graph
//!
//! The owned scheduler context. A [`TaskGraph`] owns its worker threads and
//! any named threads it was asked to spawn; dropping it shuts them down.
//! There is no global instance: everything that launches work holds a
//! reference (usually an `Arc<TaskGraph>`).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::context::ThreadBinding;
use super::handle::CompletionHandle;
use super::named::NamedThreadState;
use super::node::{HeldTask, TaskContext, TaskNode};
use super::pool::{worker_main, WorkerPool};
use super::thread::{DesiredThread, NamedThread, ThreadIdentity, ThreadPriority};
use crate::config::TaskGraphConfig;
use crate::error::{Result, TickGraphError};

/// State shared by the owner, the worker threads and every task node.
pub(crate) struct GraphShared {
    id: u64,
    named: [NamedThreadState; NamedThread::COUNT],
    pool: WorkerPool,
    shutting_down: AtomicBool,
    single_threaded: bool,
    idle_wait: Duration,
    launched: AtomicU64,
    executed: AtomicU64,
}

impl GraphShared {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub(crate) fn named(&self, thread: NamedThread) -> &NamedThreadState {
        &self.named[thread.index()]
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub(crate) fn is_single_threaded(&self) -> bool {
        self.single_threaded
    }

    pub(crate) fn idle_wait(&self) -> Duration {
        self.idle_wait
    }

    pub(crate) fn record_launch(&self) {
        self.launched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_execution(&self) {
        self.executed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn enqueue(&self, node: Arc<TaskNode>) {
        match node.desired() {
            DesiredThread::Named { thread, priority } => self.named(thread).queue().push(node, priority),
            DesiredThread::Any {
                thread_priority,
                task_priority,
            } => self.pool.push(node, thread_priority, task_priority),
        }
    }

    /// Run one queued pool task on the calling thread.
    pub(crate) fn run_one_pool_task(&self, identity: ThreadIdentity) -> bool {
        while let Some(task) = self.pool.pop_any() {
            if task.try_execute(identity) {
                return true;
            }
        }
        false
    }
}

/// Counters for diagnostics and benchmarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaskGraphStats {
    pub launched: u64,
    pub executed: u64,
    pub queued: usize,
}

/// The task graph scheduler.
pub struct TaskGraph {
    shared: Arc<GraphShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    config: TaskGraphConfig,
}

impl TaskGraph {
    /// Build a graph and start its threads.
    pub fn new(config: TaskGraphConfig) -> Result<Self> {
        config.validate()?;
        let graph = Self::build(config);
        graph.spawn_threads()?;
        info!(
            graph = graph.id(),
            workers_per_bank = graph.config.resolved_worker_threads(),
            single_threaded = graph.config.single_threaded,
            "task graph started"
        );
        Ok(graph)
    }

    /// A graph with no threads of its own.
    ///
    /// Any-thread work runs only when a caller waits on it or pumps.
    pub fn single_threaded() -> Self {
        Self::build(TaskGraphConfig::single_threaded())
    }

    fn build(config: TaskGraphConfig) -> Self {
        static GRAPH_IDS: AtomicU64 = AtomicU64::new(1);

        let per_bank = config.resolved_worker_threads();
        let shared = Arc::new(GraphShared {
            id: GRAPH_IDS.fetch_add(1, Ordering::Relaxed),
            named: NamedThread::ALL.map(NamedThreadState::new),
            pool: WorkerPool::new(per_bank, config.high_priority_bank, config.background_bank),
            shutting_down: AtomicBool::new(false),
            single_threaded: config.single_threaded,
            idle_wait: config.idle_wait(),
            launched: AtomicU64::new(0),
            executed: AtomicU64::new(0),
        });
        Self {
            shared,
            threads: Mutex::new(Vec::new()),
            config,
        }
    }

    fn spawn_threads(&self) -> Result<()> {
        let mut threads = self.threads.lock();

        for priority in ThreadPriority::ALL {
            for index in 0..self.shared.pool.bank(priority).workers() {
                let name = format!("tickgraph-worker-{}-{}", priority.name(), index);
                let shared = self.shared.clone();
                let handle = std::thread::Builder::new()
                    .name(name.clone())
                    .spawn(move || worker_main(shared, priority, index))
                    .map_err(|source| TickGraphError::ThreadSpawn { name, source })?;
                threads.push(handle);
            }
        }

        let spawned = [
            (NamedThread::Render, self.config.spawn_render_thread),
            (NamedThread::Rhi, self.config.spawn_rhi_thread),
        ];
        for (thread, enabled) in spawned {
            if !enabled {
                continue;
            }
            let name = format!("tickgraph-{}", thread.name());
            let shared = self.shared.clone();
            let handle = std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    let _binding = ThreadBinding::enter(shared.id(), ThreadIdentity::Named(thread));
                    shared.named(thread).process_until(&shared, &|| false);
                })
                .map_err(|source| TickGraphError::ThreadSpawn { name, source })?;
            threads.push(handle);
        }
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn config(&self) -> &TaskGraphConfig {
        &self.config
    }

    pub(crate) fn shared(&self) -> &Arc<GraphShared> {
        &self.shared
    }

    /// Launch `payload` once every prerequisite has fired.
    pub fn launch<F>(&self, payload: F, prerequisites: &[CompletionHandle], desired: DesiredThread) -> CompletionHandle
    where
        F: FnOnce(&TaskContext) + Send + 'static,
    {
        self.spawn(Box::new(payload), prerequisites, desired, false)
            .handle()
            .clone()
    }

    /// Build a task that registers on its prerequisites now but only runs
    /// after [`HeldTask::unlock`].
    pub fn create_held<F>(&self, payload: F, prerequisites: &[CompletionHandle], desired: DesiredThread) -> HeldTask
    where
        F: FnOnce(&TaskContext) + Send + 'static,
    {
        HeldTask::new(self.spawn(Box::new(payload), prerequisites, desired, true))
    }

    fn spawn(
        &self,
        payload: super::node::Payload,
        prerequisites: &[CompletionHandle],
        desired: DesiredThread,
        held: bool,
    ) -> Arc<TaskNode> {
        TaskNode::spawn(&Arc::downgrade(&self.shared), self.shared.id, payload, prerequisites, desired, held)
    }

    /// A handle with no task behind it, fired by [`TaskGraph::trigger_event`].
    pub fn create_event(&self) -> CompletionHandle {
        CompletionHandle::new(self.shared.id)
    }

    /// Fire a handle from [`TaskGraph::create_event`]. Returns false if it
    /// had already fired.
    pub fn trigger_event(&self, event: &CompletionHandle) -> bool {
        if event.task().is_some() {
            warn!(task = %event.id(), "refusing to trigger a handle owned by a task");
            return false;
        }
        event.dispatch_subsequents()
    }

    /// Bind the calling OS thread to a named identity until the guard drops.
    pub fn attach_to_thread(&self, thread: NamedThread) -> ThreadBinding {
        debug!(graph = self.id(), thread = %thread, "attached to named thread");
        ThreadBinding::enter(self.shared.id, ThreadIdentity::Named(thread))
    }

    pub fn current_thread(&self) -> ThreadIdentity {
        ThreadBinding::current(self.shared.id)
    }

    fn require_named(&self, thread: NamedThread) -> bool {
        let current = self.current_thread();
        if current != ThreadIdentity::Named(thread) {
            warn!(thread = %thread, current = %current, "only the bound thread may drain a named queue");
            return false;
        }
        true
    }

    /// Run everything queued for `thread` and return. Must be called from
    /// that thread.
    pub fn process_thread_until_idle(&self, thread: NamedThread) -> usize {
        if !self.require_named(thread) {
            return 0;
        }
        self.shared.named(thread).process_until_idle()
    }

    /// Drain `thread`'s queue until [`TaskGraph::request_return`] is called
    /// for it. Must be called from that thread.
    pub fn process_thread_until_request_return(&self, thread: NamedThread) -> usize {
        if !self.require_named(thread) {
            return 0;
        }
        self.shared.named(thread).process_until_request_return(&self.shared)
    }

    pub fn request_return(&self, thread: NamedThread) {
        self.shared.named(thread).request_return();
    }

    pub fn worker_count(&self, bank: ThreadPriority) -> usize {
        self.shared.pool.bank(bank).workers()
    }

    pub fn stats(&self) -> TaskGraphStats {
        let named: usize = NamedThread::ALL
            .iter()
            .map(|thread| self.shared.named(*thread).queue().len())
            .sum();
        TaskGraphStats {
            launched: self.shared.launched.load(Ordering::Relaxed),
            executed: self.shared.executed.load(Ordering::Relaxed),
            queued: named + self.shared.pool.queued(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.is_shutting_down()
    }

    /// Stop and join every thread this graph spawned. Idempotent.
    ///
    /// Work still queued is discarded; its handles never fire.
    pub fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.pool.wake_all();
        for thread in NamedThread::ALL {
            self.shared.named(thread).queue().event().trigger();
        }

        let current = std::thread::current().id();
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!(graph = self.id(), "task graph thread panicked during shutdown");
            }
        }

        let mut discarded = self.shared.pool.drain();
        for thread in NamedThread::ALL {
            discarded += self.shared.named(thread).queue().drain().len();
        }
        if discarded > 0 {
            warn!(graph = self.id(), discarded, "discarded queued tasks at shutdown");
        }
        info!(graph = self.id(), "task graph shut down");
    }
}

impl Drop for TaskGraph {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn small_graph() -> TaskGraph {
        TaskGraph::new(TaskGraphConfig {
            worker_threads: 2,
            ..TaskGraphConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn launches_on_workers() {
        let graph = small_graph();
        assert_eq!(graph.worker_count(ThreadPriority::Normal), 2);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let handle = graph.launch(
            move |ctx| {
                assert!(matches!(ctx.current_thread(), ThreadIdentity::Worker { .. }));
                h.fetch_add(1, Ordering::SeqCst);
            },
            &[],
            DesiredThread::any(),
        );
        assert!(handle.wait_timeout(Duration::from_secs(5)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn named_work_waits_for_its_thread() {
        let graph = TaskGraph::single_threaded();
        let _game = graph.attach_to_thread(NamedThread::Game);
        let handle = graph.launch(|_| {}, &[], DesiredThread::game());
        assert!(!handle.is_complete());
        assert_eq!(graph.process_thread_until_idle(NamedThread::Game), 1);
        assert!(handle.is_complete());
    }

    #[test]
    fn draining_another_threads_queue_is_refused() {
        let graph = TaskGraph::single_threaded();
        graph.launch(|_| {}, &[], DesiredThread::named(NamedThread::Render));
        assert_eq!(graph.process_thread_until_idle(NamedThread::Render), 0);
        assert_eq!(graph.stats().queued, 1);
    }

    #[test]
    fn spawned_render_thread_drains_its_queue() {
        let graph = TaskGraph::new(TaskGraphConfig {
            worker_threads: 1,
            spawn_render_thread: true,
            ..TaskGraphConfig::default()
        })
        .unwrap();
        let handle = graph.launch(
            |ctx| assert_eq!(ctx.current_thread(), ThreadIdentity::Named(NamedThread::Render)),
            &[],
            DesiredThread::named(NamedThread::Render),
        );
        assert!(handle.wait_timeout(Duration::from_secs(5)));
    }

    #[test]
    fn request_return_ends_drain_loop() {
        let graph = Arc::new(TaskGraph::single_threaded());
        let _game = graph.attach_to_thread(NamedThread::Game);
        let remote = graph.clone();
        graph.launch(move |_| remote.request_return(NamedThread::Game), &[], DesiredThread::game());
        assert_eq!(graph.process_thread_until_request_return(NamedThread::Game), 1);
    }

    #[test]
    fn manual_events() {
        let graph = TaskGraph::single_threaded();
        let event = graph.create_event();
        let task = graph.launch(|_| {}, &[], DesiredThread::any());
        assert!(!graph.trigger_event(&task));
        assert!(graph.trigger_event(&event));
        assert!(!graph.trigger_event(&event));
    }

    #[test]
    fn shutdown_is_idempotent_and_counts() {
        let graph = small_graph();
        let handle = graph.launch(|_| {}, &[], DesiredThread::any());
        assert!(handle.wait_timeout(Duration::from_secs(5)));
        graph.shutdown();
        graph.shutdown();
        assert!(graph.is_shutting_down());
        let stats = graph.stats();
        assert_eq!(stats.launched, 1);
        assert_eq!(stats.executed, 1);
    }
}
