//! Sync Manager
//!
//! Registry of sync points plus the per-world batches that track them frame
//! by frame.
//!
//! # Locking
//!
//! The registry sits behind a read/write lock and the batches behind a
//! concurrent map. Lock order is registry, then batch map, then a single
//! point. Batch guards are always dropped before a point's own lock is taken,
//! and no operation holds two point locks at once.

use std::sync::Arc;

use dashmap::DashMap;
use indexmap::{IndexMap, IndexSet};
use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::error::{Result, TickGraphError};
use crate::task::{CompletionHandle, TaskContext, TaskGraph};
use crate::tick::{GroupHookWork, TickGroup, TickGroupHook, WorldId};

use super::description::{ActivationRule, SyncPointDescription, SyncPointStatus};
use super::ledger::LedgerCounts;
use super::point::{SyncPoint, WorkHandle};

type Batch = IndexMap<String, Arc<SyncPoint>>;

/// Coordinates named sync points across tick groups.
///
/// Install it on a [`TickTaskManager`](crate::tick::TickTaskManager) as its
/// hook. Work can be reserved and requested from any thread.
pub struct SyncManager {
    graph: Arc<TaskGraph>,
    registry: RwLock<IndexMap<String, Arc<SyncPointDescription>>>,
    batches: DashMap<WorldId, Batch>,
}

impl SyncManager {
    pub fn new(graph: Arc<TaskGraph>) -> Self {
        Self {
            graph,
            registry: RwLock::new(IndexMap::new()),
            batches: DashMap::new(),
        }
    }

    pub fn graph(&self) -> &Arc<TaskGraph> {
        &self.graph
    }

    /// Register a sync point. Every world picks it up immediately.
    pub fn register_sync_point(&self, description: SyncPointDescription) -> Result<()> {
        if let Err(e) = description.validate() {
            error!(point = %description.name, error = %e, "rejected sync point");
            return Err(e);
        }
        let mut registry = self.registry.write();
        if registry.contains_key(&description.name) {
            error!(point = %description.name, "sync point already registered");
            return Err(TickGraphError::DuplicateSyncPoint(description.name));
        }
        if let Err(e) = check_prerequisites(&registry, &description) {
            error!(point = %description.name, error = %e, "rejected sync point");
            return Err(e);
        }
        for prerequisite in &description.prerequisites {
            if !registry.contains_key(prerequisite) {
                warn!(point = %description.name, prerequisite = %prerequisite, "prerequisite is not registered yet");
            }
        }

        let description = Arc::new(description);
        registry.insert(description.name.clone(), description.clone());
        for mut batch in self.batches.iter_mut() {
            let world = *batch.key();
            batch.insert(
                description.name.clone(),
                SyncPoint::new(description.clone(), world, self.graph.clone()),
            );
        }
        info!(
            point = %description.name,
            rule = ?description.activation_rule,
            first = %description.first_group,
            last = %description.last_group,
            "sync point registered"
        );
        Ok(())
    }

    /// Remove a sync point. Outstanding work handles for it go stale.
    pub fn unregister_sync_point(&self, name: &str) -> Result<()> {
        let mut registry = self.registry.write();
        if registry.shift_remove(name).is_none() {
            return Err(TickGraphError::UnknownSyncPoint(name.to_string()));
        }
        let removed: Vec<_> = self
            .batches
            .iter_mut()
            .filter_map(|mut batch| batch.shift_remove(name))
            .collect();
        drop(registry);
        for point in removed {
            point.retire();
        }
        info!(point = %name, "sync point unregistered");
        Ok(())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.registry.read().contains_key(name)
    }

    pub fn description(&self, name: &str) -> Option<SyncPointDescription> {
        self.registry.read().get(name).map(|d| (**d).clone())
    }

    /// Registered names in registration order.
    pub fn registered_names(&self) -> Vec<String> {
        self.registry.read().keys().cloned().collect()
    }

    fn build_batch(&self, world: WorldId, registry: &IndexMap<String, Arc<SyncPointDescription>>) -> Batch {
        registry
            .iter()
            .map(|(name, description)| (name.clone(), SyncPoint::new(description.clone(), world, self.graph.clone())))
            .collect()
    }

    fn ensure_batch(&self, world: WorldId) {
        if self.batches.contains_key(&world) {
            return;
        }
        let registry = self.registry.read();
        self.batches
            .entry(world)
            .or_insert_with(|| self.build_batch(world, &registry));
    }

    fn point(&self, world: WorldId, name: &str) -> Result<Arc<SyncPoint>> {
        self.ensure_batch(world);
        self.batches
            .get(&world)
            .and_then(|batch| batch.get(name).cloned())
            .ok_or_else(|| TickGraphError::UnknownSyncPoint(name.to_string()))
    }

    fn points(&self, world: WorldId) -> Vec<Arc<SyncPoint>> {
        self.ensure_batch(world);
        self.batches
            .get(&world)
            .map(|batch| batch.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Promise a unit of work that will be requested later.
    pub fn reserve_work(&self, world: WorldId, name: &str) -> Result<WorkHandle> {
        self.point(world, name)?.reserve()
    }

    /// Fill a reservation, or replace the work of an earlier request.
    pub fn request_work<F>(&self, handle: &WorkHandle, work: F) -> Result<()>
    where
        F: FnOnce(&TaskContext) + Send + 'static,
    {
        handle.point()?.request(handle, Box::new(work))
    }

    /// Reserve and request in one step.
    pub fn request_new_work<F>(&self, world: WorldId, name: &str, work: F) -> Result<WorkHandle>
    where
        F: FnOnce(&TaskContext) + Send + 'static,
    {
        self.point(world, name)?.request_new(Box::new(work))
    }

    /// Drop a unit of work. The handle goes stale.
    pub fn abandon_work(&self, handle: &WorkHandle) -> Result<()> {
        handle.point()?.abandon(handle)
    }

    /// Return a requested unit to the reserved state.
    pub fn reset_work(&self, handle: &WorkHandle) -> Result<()> {
        handle.point()?.reset(handle)
    }

    /// Activate a point explicitly. Returns whether work was dispatched
    /// immediately; a trigger that arrives before the point's first group is
    /// remembered until then.
    pub fn trigger(&self, world: WorldId, name: &str) -> Result<bool> {
        self.point(world, name)?.trigger()
    }

    pub fn status(&self, world: WorldId, name: &str) -> SyncPointStatus {
        self.point(world, name)
            .map(|point| point.status())
            .unwrap_or(SyncPointStatus::TaskNotRegistered)
    }

    pub fn ledger_counts(&self, world: WorldId, name: &str) -> Option<LedgerCounts> {
        self.point(world, name).ok().map(|point| point.counts())
    }

    /// Fires when the point finishes this frame. `None` until the point's
    /// first group has started or a dependent has started waiting on it.
    pub fn completion_handle(&self, world: WorldId, name: &str) -> Option<CompletionHandle> {
        self.point(world, name).ok().and_then(|point| point.completion())
    }

    /// Completion handles of `point`'s prerequisites for a point starting in
    /// `group`.
    fn prerequisite_handles(&self, world: WorldId, group: TickGroup, point: &SyncPoint) -> Vec<CompletionHandle> {
        let description = point.description();
        let mut handles = Vec::with_capacity(description.prerequisites.len());
        for name in &description.prerequisites {
            match self.point(world, name) {
                Ok(prerequisite) => match prerequisite.completion_for_dependent(group) {
                    Some(handle) => handles.push(handle),
                    None => warn!(
                        point = %description.name,
                        prerequisite = %name,
                        group = %group,
                        "prerequisite missed its groups this frame; dropping the edge"
                    ),
                },
                Err(_) => warn!(point = %description.name, prerequisite = %name, "dropping unknown prerequisite"),
            }
        }
        handles
    }

    fn check_graph(&self, graph: &TaskGraph) {
        if graph.id() != self.graph.id() {
            warn!(
                expected = self.graph.id(),
                got = graph.id(),
                "sync manager driven by a different task graph"
            );
        }
    }
}

impl TickGroupHook for SyncManager {
    fn start_frame(&self, graph: &TaskGraph, world: WorldId, _delta_seconds: f32) {
        self.check_graph(graph);
        self.ensure_batch(world);
    }

    fn start_tick_group(&self, _graph: &TaskGraph, world: WorldId, group: TickGroup, work: &mut GroupHookWork) {
        let starting = self
            .points(world)
            .into_iter()
            .filter(|point| point.description().covers(group))
            .collect();
        for point in in_prerequisite_order(starting) {
            let prerequisites = self.prerequisite_handles(world, group, &point);
            point.start_group(group, prerequisites, work);
        }
    }

    fn end_tick_group(&self, _graph: &TaskGraph, world: WorldId, group: TickGroup) {
        for point in self.points(world) {
            point.end_group(group);
        }
    }

    fn end_frame(&self, _graph: &TaskGraph, world: WorldId) {
        for point in self.points(world) {
            point.end_frame();
        }
    }
}

/// Reject prerequisite edges that could stall a frame, in either direction
/// between `description` and the points already registered.
///
/// A dependent's task is awaited by the end of its last group, so every
/// prerequisite must finish by then. Points that activate for any work only
/// fire after their last group ends and must finish a group earlier.
fn check_prerequisites(
    registry: &IndexMap<String, Arc<SyncPointDescription>>,
    description: &SyncPointDescription,
) -> Result<()> {
    let invalid = |reason: String| TickGraphError::InvalidSyncPoint {
        name: description.name.clone(),
        reason,
    };

    for name in &description.prerequisites {
        if let Some(prerequisite) = registry.get(name) {
            check_edge(description, prerequisite).map_err(invalid)?;
        }
    }
    for dependent in registry.values() {
        if dependent.prerequisites.contains(&description.name) {
            check_edge(dependent, description).map_err(invalid)?;
        }
    }

    // The registry is acyclic, so a new cycle has to pass through this point.
    let mut stack: Vec<&str> = description.prerequisites.iter().map(String::as_str).collect();
    let mut seen = IndexSet::new();
    while let Some(name) = stack.pop() {
        if name == description.name {
            return Err(invalid("prerequisites form a cycle".to_string()));
        }
        if !seen.insert(name) {
            continue;
        }
        if let Some(next) = registry.get(name) {
            stack.extend(next.prerequisites.iter().map(String::as_str));
        }
    }
    Ok(())
}

fn check_edge(dependent: &SyncPointDescription, prerequisite: &SyncPointDescription) -> std::result::Result<(), String> {
    if prerequisite.last_group > dependent.last_group {
        return Err(format!(
            "prerequisite {} finishes in {}, after {} ends in {}",
            prerequisite.name, prerequisite.last_group, dependent.name, dependent.last_group
        ));
    }
    if prerequisite.activation_rule == ActivationRule::ActivateForAnyWork && prerequisite.last_group == dependent.last_group
    {
        return Err(format!(
            "prerequisite {} only finishes once {} has ended, which {} has to wait out",
            prerequisite.name, prerequisite.last_group, dependent.name
        ));
    }
    Ok(())
}

/// `points` with every prerequisite ahead of its dependents.
fn in_prerequisite_order(points: Vec<Arc<SyncPoint>>) -> Vec<Arc<SyncPoint>> {
    fn visit<'a>(
        name: &'a str,
        by_name: &IndexMap<&'a str, &'a Arc<SyncPoint>>,
        visited: &mut IndexSet<&'a str>,
        ordered: &mut Vec<Arc<SyncPoint>>,
    ) {
        let Some(&point) = by_name.get(name) else { return };
        if !visited.insert(name) {
            return;
        }
        for prerequisite in &point.description().prerequisites {
            visit(prerequisite, by_name, visited, ordered);
        }
        ordered.push(point.clone());
    }

    let by_name: IndexMap<&str, &Arc<SyncPoint>> = points
        .iter()
        .map(|point| (point.description().name.as_str(), point))
        .collect();
    let mut visited = IndexSet::new();
    let mut ordered = Vec::with_capacity(points.len());
    for &name in by_name.keys() {
        visit(name, &by_name, &mut visited, &mut ordered);
    }
    ordered
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("graph", &self.graph.id())
            .field("points", &self.registered_names())
            .field("worlds", &self.batches.len())
            .finish()
    }
}
