//! Task Graph Scheduler
//!
//! A generic executor for closures with dependencies.
//!
//! # Overview
//!
//! - **Named threads** (game, render, RHI) each own a two-lane queue with a
//!   single consumer: whichever OS thread is bound to that identity.
//! - **The worker pool** is split into banks by thread priority (background,
//!   normal, high). Each bank has its own queue and workers.
//! - **Tasks** carry a payload, a desired thread and a set of prerequisite
//!   [`CompletionHandle`]s. A task is queued only after all of them fire.
//! - **Completion handles** are ref-counted tokens. They can be waited on,
//!   awaited, or used as prerequisites for more work.
//!
//! # Design Decisions
//!
//! 1. The scheduler is an owned value ([`TaskGraph`]), never a global. Code
//!    that launches work is handed a reference.
//!
//! 2. Payloads are boxed `FnOnce` closures stored behind one node type.
//!
//! 3. Prerequisites from a different graph are dropped with a warning
//!    instead of failing the launch. A task always runs eventually, possibly
//!    without that ordering.
//!
//! 4. A payload that panics is logged and its handle still fires, so one bad
//!    closure cannot wedge every dependent.

mod context;
mod event;
mod graph;
mod handle;
mod named;
mod node;
mod pool;
mod queue;
mod thread;
mod wait;

pub use context::ThreadBinding;
pub use graph::{TaskGraph, TaskGraphStats};
pub use handle::{CompletionHandle, TaskId};
pub use node::{HeldTask, TaskContext};
pub use thread::{DesiredThread, NamedThread, TaskPriority, ThreadIdentity, ThreadPriority};
pub use wait::{ProcessTasksOperation, WaitStrategy};

pub(crate) use node::fire_when_all_complete;
