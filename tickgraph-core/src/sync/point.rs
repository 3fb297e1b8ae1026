//! Sync Point State
//!
//! One registered rendezvous as seen by one world for one frame.
//!
//! # Lifecycle
//!
//! ```text
//! TaskNotCreated ──first group──▶ TaskCreated ─┬─▶ DispatchWaitingForTrigger ─┐
//!                                              ├─▶ DispatchWaitingForWork ────┤
//!                                              └──────────────────────────────┴─▶ Dispatched ─▶ Executing ─▶ ExecutionComplete
//! ```
//!
//! Points that activate for any work bounce between `Dispatched`,
//! `Executing` and `WaitingForMoreWork` until their last group ends. Every
//! point returns to `TaskNotCreated` at frame end.
//!
//! Tasks are created held and unlocked only after the point's lock has been
//! released, so a payload never contends with the code that dispatched it.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::error::{Result, TickGraphError};
use crate::task::{CompletionHandle, HeldTask, TaskContext, TaskGraph};
use crate::tick::{GroupHookWork, TickGroup, WorldId};

use super::description::{ActivationRule, SyncPointDescription, SyncPointStatus};
use super::ledger::{LedgerCounts, SyncWork, WorkLedger};

/// Handle to one unit of work on one sync point.
///
/// Goes stale when the work is abandoned, when the frame ends, or when the
/// point is unregistered.
#[derive(Clone)]
pub struct WorkHandle {
    point: Weak<SyncPoint>,
    name: Arc<str>,
    world: WorldId,
    slot: usize,
    generation: u32,
}

impl WorkHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn world(&self) -> WorldId {
        self.world
    }

    pub(crate) fn point(&self) -> Result<Arc<SyncPoint>> {
        self.point
            .upgrade()
            .ok_or_else(|| TickGraphError::UnknownSyncPoint(self.name.to_string()))
    }
}

impl fmt::Debug for WorkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkHandle")
            .field("point", &self.name)
            .field("world", &self.world)
            .field("slot", &self.slot)
            .field("generation", &self.generation)
            .finish()
    }
}

struct PointState {
    status: SyncPointStatus,
    ledger: WorkLedger,
    task: Option<HeldTask>,
    completion: Option<CompletionHandle>,
    prerequisites: Vec<CompletionHandle>,
    dispatches: Vec<CompletionHandle>,
    triggered: bool,
    closed: bool,
    passes: usize,
}

impl PointState {
    fn new() -> Self {
        Self {
            status: SyncPointStatus::TaskNotCreated,
            ledger: WorkLedger::default(),
            task: None,
            completion: None,
            prerequisites: Vec::new(),
            dispatches: Vec::new(),
            triggered: false,
            closed: false,
            passes: 0,
        }
    }
}

pub(crate) struct SyncPoint {
    me: Weak<SyncPoint>,
    description: Arc<SyncPointDescription>,
    name: Arc<str>,
    world: WorldId,
    graph: Arc<TaskGraph>,
    state: Mutex<PointState>,
}

impl SyncPoint {
    pub(crate) fn new(description: Arc<SyncPointDescription>, world: WorldId, graph: Arc<TaskGraph>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            name: Arc::from(description.name.as_str()),
            description,
            world,
            graph,
            state: Mutex::new(PointState::new()),
        })
    }

    pub(crate) fn description(&self) -> &SyncPointDescription {
        &self.description
    }

    pub(crate) fn status(&self) -> SyncPointStatus {
        self.state.lock().status
    }

    pub(crate) fn counts(&self) -> LedgerCounts {
        self.state.lock().ledger.counts()
    }

    /// Handle dependents can wait on, once the point has one this frame.
    pub(crate) fn completion(&self) -> Option<CompletionHandle> {
        self.state.lock().completion.clone()
    }

    /// Handle a dependent starting in `group` waits on.
    ///
    /// Before the point's task exists this is an event, fired when that task
    /// completes or when the point finishes the frame without one. `None`
    /// when the point's groups have already passed without it starting.
    pub(crate) fn completion_for_dependent(&self, group: TickGroup) -> Option<CompletionHandle> {
        let mut state = self.state.lock();
        if let Some(handle) = &state.completion {
            return Some(handle.clone());
        }
        let event = self.graph.create_event();
        match state.status {
            SyncPointStatus::ExecutionComplete => {
                self.graph.trigger_event(&event);
            }
            SyncPointStatus::TaskNotCreated if group > self.description.last_group => return None,
            _ => {}
        }
        trace!(point = %self.name, world = %self.world, group = %group, "completion promised to a dependent");
        state.completion = Some(event.clone());
        Some(event)
    }

    /// Release anything waiting on this point. Used when it is unregistered
    /// mid-frame and will never reach its last group.
    pub(crate) fn retire(&self) {
        let completion = self.state.lock().completion.clone();
        if let Some(completion) = completion {
            if completion.task().is_none() && self.graph.trigger_event(&completion) {
                warn!(point = %self.name, world = %self.world, "released dependents of an unregistered sync point");
            }
        }
    }

    fn rule(&self) -> ActivationRule {
        self.description.activation_rule
    }

    fn ensure_carries_work(&self) -> Result<()> {
        if self.description.event_type.carries_work() {
            Ok(())
        } else {
            Err(TickGraphError::InvalidSyncPoint {
                name: self.name.to_string(),
                reason: "simple events carry no work".to_string(),
            })
        }
    }

    fn ensure_open(&self, state: &PointState) -> Result<()> {
        if state.closed || state.status == SyncPointStatus::ExecutionComplete {
            Err(TickGraphError::SyncPointComplete(self.name.to_string()))
        } else {
            Ok(())
        }
    }

    fn handle(&self, (slot, generation): (usize, u32)) -> WorkHandle {
        WorkHandle {
            point: self.me.clone(),
            name: self.name.clone(),
            world: self.world,
            slot,
            generation,
        }
    }

    pub(crate) fn reserve(&self) -> Result<WorkHandle> {
        self.ensure_carries_work()?;
        let mut state = self.state.lock();
        self.ensure_open(&state)?;
        let unit = state.ledger.reserve();
        trace!(point = %self.name, world = %self.world, "work reserved");
        Ok(self.handle(unit))
    }

    pub(crate) fn request(&self, handle: &WorkHandle, work: SyncWork) -> Result<()> {
        let release = {
            let mut state = self.state.lock();
            self.ensure_open(&state)?;
            state.ledger.request(handle.slot, handle.generation, work)?;
            self.poll_dispatch(&mut state)
        };
        Self::release(release);
        Ok(())
    }

    pub(crate) fn request_new(&self, work: SyncWork) -> Result<WorkHandle> {
        self.ensure_carries_work()?;
        let (handle, release) = {
            let mut state = self.state.lock();
            self.ensure_open(&state)?;
            let unit = state.ledger.request_new(work);
            (self.handle(unit), self.poll_dispatch(&mut state))
        };
        Self::release(release);
        Ok(handle)
    }

    pub(crate) fn abandon(&self, handle: &WorkHandle) -> Result<()> {
        let release = {
            let mut state = self.state.lock();
            state.ledger.abandon(handle.slot, handle.generation)?;
            self.poll_dispatch(&mut state)
        };
        Self::release(release);
        Ok(())
    }

    pub(crate) fn reset(&self, handle: &WorkHandle) -> Result<()> {
        self.state.lock().ledger.reset(handle.slot, handle.generation)
    }

    /// Explicitly activate the point. Returns whether anything was
    /// dispatched right away.
    pub(crate) fn trigger(&self) -> Result<bool> {
        let release = {
            let mut state = self.state.lock();
            self.ensure_open(&state)?;
            match (self.rule(), state.status) {
                (ActivationRule::AlwaysActivate, _) => None,
                (ActivationRule::ActivateForAnyWork, _) => self.poll_dispatch(&mut state),
                (_, SyncPointStatus::TaskNotCreated) => {
                    debug!(point = %self.name, world = %self.world, "triggered before its first group");
                    state.triggered = true;
                    None
                }
                (_, SyncPointStatus::DispatchWaitingForTrigger | SyncPointStatus::DispatchWaitingForWork) => {
                    Self::take_dispatch(&mut state)
                }
                _ => None,
            }
        };
        Ok(Self::release(release))
    }

    fn release(task: Option<HeldTask>) -> bool {
        task.map(|task| task.unlock()).unwrap_or(false)
    }

    fn take_dispatch(state: &mut PointState) -> Option<HeldTask> {
        let task = state.task.clone()?;
        state.status = SyncPointStatus::Dispatched;
        state.ledger.record_dispatch();
        Some(task)
    }

    /// Dispatch if the point's rule is now satisfied. The returned task must
    /// be unlocked after the state lock is released.
    fn poll_dispatch(&self, state: &mut PointState) -> Option<HeldTask> {
        let counts = state.ledger.counts();
        match self.rule() {
            ActivationRule::WaitForAllWork
                if state.status == SyncPointStatus::DispatchWaitingForWork && counts.reserved == 0 =>
            {
                Self::take_dispatch(state)
            }
            ActivationRule::ActivateForAnyWork
                if !state.closed
                    && counts.requested > 0
                    && matches!(
                        state.status,
                        SyncPointStatus::DispatchWaitingForWork | SyncPointStatus::WaitingForMoreWork
                    ) =>
            {
                let pass = self.create_task(&state.prerequisites);
                state.dispatches.push(pass.completion());
                state.status = SyncPointStatus::Dispatched;
                state.ledger.record_dispatch();
                Some(pass)
            }
            _ => None,
        }
    }

    fn create_task(&self, prerequisites: &[CompletionHandle]) -> HeldTask {
        let point = self.me.clone();
        self.graph.create_held(
            move |context: &TaskContext<'_>| {
                if let Some(point) = point.upgrade() {
                    point.execute(context);
                }
            },
            prerequisites,
            self.description.event_type.desired_thread(),
        )
    }

    /// Run every requested unit, including work requested while the pass is
    /// running.
    fn execute(&self, context: &TaskContext<'_>) {
        let mut state = self.state.lock();
        state.passes += 1;
        state.status = SyncPointStatus::Executing;
        loop {
            let tickets = state.ledger.pending();
            if tickets.is_empty() {
                break;
            }
            drop(state);
            for ticket in tickets {
                let work = self.state.lock().ledger.claim(ticket);
                let Some(work) = work else { continue };
                if catch_unwind(AssertUnwindSafe(|| work(context))).is_err() {
                    error!(point = %self.name, world = %self.world, "sync point work panicked");
                }
                self.state.lock().ledger.finish(ticket);
            }
            state = self.state.lock();
        }
        state.passes -= 1;
        if state.passes == 0 {
            state.status = if self.rule().is_single_shot() || state.closed {
                SyncPointStatus::ExecutionComplete
            } else {
                SyncPointStatus::WaitingForMoreWork
            };
        }
    }

    /// Create this frame's task or event when a group in range starts.
    pub(crate) fn start_group(&self, group: TickGroup, prerequisites: Vec<CompletionHandle>, work: &mut GroupHookWork) {
        if !self.description.covers(group) {
            return;
        }
        let last = self.description.last_group;
        let mut state = self.state.lock();

        if self.rule() == ActivationRule::ActivateForAnyWork {
            if state.status == SyncPointStatus::TaskNotCreated {
                if state.completion.is_none() {
                    state.completion = Some(self.graph.create_event());
                }
                state.prerequisites = prerequisites;
                state.status = SyncPointStatus::DispatchWaitingForWork;
                debug!(point = %self.name, world = %self.world, group = %group, "sync point opened");
            }
            if let Some(pass) = self.poll_dispatch(&mut state) {
                work.dispatch_now(pass);
            }
            return;
        }

        if state.status != SyncPointStatus::TaskNotCreated {
            return;
        }
        if self.rule() == ActivationRule::WaitForAllWork && state.ledger.counts().is_idle() && !state.triggered {
            if group == last {
                state.status = SyncPointStatus::ExecutionComplete;
                trace!(point = %self.name, world = %self.world, "no work this frame");
                let promised = state.completion.clone();
                drop(state);
                if let Some(promised) = promised {
                    self.graph.trigger_event(&promised);
                }
            }
            return;
        }

        let task = self.create_task(&prerequisites);
        match state.completion.clone() {
            Some(promised) => task.completion().on_complete(move || {
                promised.dispatch_subsequents();
            }),
            None => state.completion = Some(task.completion()),
        }
        state.task = Some(task.clone());
        state.status = SyncPointStatus::TaskCreated;
        work.gate(last, task);

        let dispatch = match self.rule() {
            ActivationRule::AlwaysActivate => true,
            ActivationRule::WaitForTrigger => {
                state.status = SyncPointStatus::DispatchWaitingForTrigger;
                state.triggered
            }
            _ => {
                state.status = SyncPointStatus::DispatchWaitingForWork;
                state.triggered || state.ledger.counts().reserved == 0
            }
        };
        if dispatch {
            if let Some(task) = Self::take_dispatch(&mut state) {
                work.dispatch_now(task);
            }
        }
        debug!(point = %self.name, world = %self.world, group = %group, status = %state.status, "sync point task created");
    }

    /// Close the point when its last group has finished.
    pub(crate) fn end_group(&self, group: TickGroup) {
        if group != self.description.last_group {
            return;
        }
        let (dispatches, event, drain) = {
            let mut state = self.state.lock();
            if self.rule() == ActivationRule::ActivateForAnyWork {
                state.closed = true;
                (std::mem::take(&mut state.dispatches), state.completion.clone(), true)
            } else if state.status == SyncPointStatus::TaskNotCreated {
                // Registered after its last group had started, so no task was
                // ever created for this frame.
                let drain = state.ledger.counts().requested > 0;
                if !drain {
                    state.status = SyncPointStatus::ExecutionComplete;
                }
                (Vec::new(), state.completion.clone(), drain)
            } else {
                return;
            }
        };
        if !drain {
            if let Some(promised) = event {
                self.graph.trigger_event(&promised);
            }
            return;
        }

        self.graph.wait_until_tasks_complete(&dispatches);
        let event = event.unwrap_or_else(|| self.graph.create_event());
        if self.counts().requested > 0 {
            debug!(point = %self.name, world = %self.world, "draining late work on the frame thread");
        }
        self.execute(&TaskContext::detached(&event, self.graph.current_thread()));
        self.graph.trigger_event(&event);
    }

    /// Forget this frame. Outstanding handles go stale.
    pub(crate) fn end_frame(&self) {
        let mut state = self.state.lock();
        let counts = state.ledger.counts();
        if counts.reserved > 0 || counts.requested > 0 {
            warn!(
                point = %self.name,
                world = %self.world,
                reserved = counts.reserved,
                requested = counts.requested,
                "frame ended with unfinished sync point work; discarding it"
            );
        }
        if state.task.as_ref().is_some_and(|task| !task.is_unlocked()) {
            warn!(point = %self.name, world = %self.world, status = %state.status, "sync point never dispatched this frame");
        }
        state.ledger.clear();
        state.task = None;
        state.completion = None;
        state.prerequisites.clear();
        state.dispatches.clear();
        state.triggered = false;
        state.closed = false;
        state.status = SyncPointStatus::TaskNotCreated;
    }
}
