//! Sync Points
//!
//! Named rendezvous that gather work from many producers and run it at a
//! well-defined place in the frame.
//!
//! # Overview
//!
//! A sync point is registered once with a [`SyncPointDescription`]: what it
//! runs, when it activates and which tick groups it spans. The
//! [`SyncManager`] then keeps one instance per world and drives it from the
//! tick manager's group hooks:
//!
//! - when the point's first group starts its task is created;
//! - producers reserve and request work from any thread;
//! - the activation rule decides when the task is dispatched;
//! - the point's last group waits for it;
//! - at frame end everything resets and outstanding handles go stale.
//!
//! # Example
//!
//! ```rust,ignore
//! let sync = Arc::new(SyncManager::new(graph.clone()));
//! sync.register_sync_point(
//!     SyncPointDescription::new("gather")
//!         .with_event_type(SyncPointEventType::WorkerThreadTask)
//!         .with_activation_rule(ActivationRule::WaitForAllWork)
//!         .in_groups(TickGroup::PrePhysics, TickGroup::PostPhysics),
//! )?;
//! let mut ticks = TickTaskManager::new(graph, TickConfig::default())?.with_hook(sync.clone());
//!
//! let slot = sync.reserve_work(world, "gather")?;
//! // later, from any thread
//! sync.request_work(&slot, |_| flush())?;
//! ```

mod description;
mod ledger;
mod manager;
mod point;

pub use description::{ActivationRule, SyncPointDescription, SyncPointEventType, SyncPointStatus};
pub use ledger::{LedgerCounts, SyncWork};
pub use manager::SyncManager;
pub use point::WorkHandle;
