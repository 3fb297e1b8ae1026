//! Tickgraph Core
//!
//! A frame scheduler for simulation loops. It implements:
//!
//! - A task graph: held tasks, completion handles, named threads and a
//!   prioritized worker pool
//! - Tick functions ordered by tick groups and explicit prerequisites
//! - Sync points that gather work from many producers and run it at a fixed
//!   place in the frame
//!
//! # Architecture
//!
//! - `task`: the task graph every other layer schedules onto
//! - `tick`: tick functions, levels and the per-frame sequencer
//! - `sync`: named sync points driven from the tick manager's group hooks
//! - `config`: JSON-loadable settings for all of the above
//! - `logging`: `tracing` subscriber setup
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tickgraph_core::{SchedulerConfig, TaskGraph, TickFunctionSpec, TickTaskManager, WorldId};
//!
//! let config = SchedulerConfig::from_path("scheduler.json")?;
//! let graph = Arc::new(TaskGraph::new(config.task_graph)?);
//! let mut ticks = TickTaskManager::new(graph, config.tick)?;
//!
//! let level = ticks.add_level();
//! ticks.add_and_register(level, TickFunctionSpec::new("ai", |args| think(args.delta_seconds)))?;
//!
//! loop {
//!     ticks.run_frame(WorldId::new(1), 1.0 / 60.0)?;
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod sync;
pub mod task;
pub mod tick;

pub use config::{SchedulerConfig, TaskGraphConfig, TickConfig};
pub use error::{Result, TickGraphError};
pub use sync::{ActivationRule, SyncManager, SyncPointDescription, SyncPointEventType, SyncPointStatus, WorkHandle};
pub use task::{CompletionHandle, DesiredThread, HeldTask, NamedThread, TaskContext, TaskGraph};
pub use tick::{TickFunctionId, TickFunctionSpec, TickGroup, TickTaskManager, WorldId};
