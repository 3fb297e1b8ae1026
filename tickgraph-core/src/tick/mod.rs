//! Tick Scheduling
//!
//! Per-frame update functions on top of the task graph.
//!
//! # Overview
//!
//! - **Tick groups** split a frame into ordered phases.
//! - **Tick functions** declare a group, optional prerequisites, an optional
//!   interval and thread affinity.
//! - **Levels** bucket functions so they can be hidden and shown together.
//! - **The manager** resolves every due function at frame start into held
//!   tasks, then releases and completes them group by group.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tickgraph_core::config::TickConfig;
//! use tickgraph_core::task::TaskGraph;
//! use tickgraph_core::tick::{TickFunctionSpec, TickGroup, TickTaskManager, WorldId};
//!
//! let graph = Arc::new(TaskGraph::single_threaded());
//! let mut ticks = TickTaskManager::new(graph, TickConfig::default())?;
//! let level = ticks.add_level();
//!
//! let physics = ticks.add_and_register(
//!     level,
//!     TickFunctionSpec::new("physics", |args| step(args.delta_seconds)).in_group(TickGroup::StartPhysics),
//! )?;
//! let camera = ticks.add_and_register(level, TickFunctionSpec::new("camera", |_| follow()))?;
//! ticks.add_prerequisite(camera, physics)?;
//!
//! ticks.run_frame(WorldId::new(1), 1.0 / 60.0)?;
//! ```

mod arena;
mod commands;
mod cooldown;
mod function;
mod group;
mod hook;
mod level;
mod manager;
mod resolver;
mod sequencer;

pub use commands::{TickCommand, TickCommands};
pub use function::{
    LevelId, ManualDispatchHandle, TickArgs, TickCallback, TickFunctionId, TickFunctionSpec, TickState, TickType,
    WorldId,
};
pub use group::TickGroup;
pub use hook::{GroupHookWork, TickGroupHook};
pub use manager::{FrameContext, TickFunctionReport, TickTaskManager};
