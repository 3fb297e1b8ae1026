//! Sync point descriptions and their validation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TickGraphError};
use crate::task::{DesiredThread, TaskPriority, ThreadPriority};
use crate::tick::TickGroup;

/// What runs when a sync point activates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SyncPointEventType {
    /// A bare event. Carries no work; dependents only wait for it to fire.
    #[default]
    SimpleEvent,
    GameThreadTask,
    WorkerThreadTask,
    GameThreadTaskHighPriority,
    WorkerThreadTaskHighPriority,
}

impl SyncPointEventType {
    pub fn carries_work(self) -> bool {
        self != SyncPointEventType::SimpleEvent
    }

    /// Where the point's task runs.
    pub fn desired_thread(self) -> DesiredThread {
        match self {
            SyncPointEventType::SimpleEvent | SyncPointEventType::WorkerThreadTask => DesiredThread::any(),
            SyncPointEventType::WorkerThreadTaskHighPriority => DesiredThread::any_with(ThreadPriority::High),
            SyncPointEventType::GameThreadTask => DesiredThread::game(),
            SyncPointEventType::GameThreadTaskHighPriority => {
                DesiredThread::game().with_task_priority(TaskPriority::High)
            }
        }
    }
}

/// When a sync point dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ActivationRule {
    /// As soon as its first group starts.
    #[default]
    AlwaysActivate,
    /// Only when triggered explicitly.
    WaitForTrigger,
    /// Once work has been requested and no reservation is left unfilled.
    WaitForAllWork,
    /// Every time work is requested, as often as needed, until its last
    /// group ends.
    ActivateForAnyWork,
}

impl ActivationRule {
    /// Rules that dispatch exactly once per frame.
    pub fn is_single_shot(self) -> bool {
        self != ActivationRule::ActivateForAnyWork
    }
}

/// A registered rendezvous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPointDescription {
    pub name: String,
    #[serde(default)]
    pub event_type: SyncPointEventType,
    #[serde(default)]
    pub activation_rule: ActivationRule,
    /// Group in which the point's task is created.
    #[serde(default)]
    pub first_group: TickGroup,
    /// Group whose completion waits for the point.
    #[serde(default)]
    pub last_group: TickGroup,
    /// Names of points whose completion this point's work waits for.
    #[serde(default)]
    pub prerequisites: Vec<String>,
}

impl SyncPointDescription {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            event_type: SyncPointEventType::default(),
            activation_rule: ActivationRule::default(),
            first_group: TickGroup::PrePhysics,
            last_group: TickGroup::PrePhysics,
            prerequisites: Vec::new(),
        }
    }

    pub fn with_event_type(mut self, event_type: SyncPointEventType) -> Self {
        self.event_type = event_type;
        self
    }

    pub fn with_activation_rule(mut self, rule: ActivationRule) -> Self {
        self.activation_rule = rule;
        self
    }

    pub fn in_groups(mut self, first: TickGroup, last: TickGroup) -> Self {
        self.first_group = first;
        self.last_group = last;
        self
    }

    pub fn with_prerequisite(mut self, name: impl Into<String>) -> Self {
        self.prerequisites.push(name.into());
        self
    }

    pub fn covers(&self, group: TickGroup) -> bool {
        self.first_group <= group && group <= self.last_group
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| TickGraphError::InvalidSyncPoint {
            name: self.name.clone(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name is empty".to_string()));
        }
        if !self.event_type.carries_work()
            && matches!(
                self.activation_rule,
                ActivationRule::WaitForAllWork | ActivationRule::ActivateForAnyWork
            )
        {
            return Err(invalid(format!(
                "{:?} carries no work, so {:?} can never activate it",
                self.event_type, self.activation_rule
            )));
        }
        if self.first_group > self.last_group {
            return Err(invalid(format!(
                "first group {} comes after last group {}",
                self.first_group, self.last_group
            )));
        }
        if self.last_group == TickGroup::NewlySpawned {
            return Err(invalid("NewlySpawned is not a driven group".to_string()));
        }
        if self.prerequisites.iter().any(|p| *p == self.name) {
            return Err(invalid("a sync point cannot be its own prerequisite".to_string()));
        }
        Ok(())
    }
}

/// Where a sync point is in its frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncPointStatus {
    TaskNotRegistered,
    TaskNotCreated,
    TaskCreated,
    DispatchWaitingForTrigger,
    DispatchWaitingForWork,
    Dispatched,
    Executing,
    WaitingForMoreWork,
    ExecutionComplete,
}

impl SyncPointStatus {
    /// Whether the point has a task or event this frame.
    pub fn is_active(self) -> bool {
        !matches!(
            self,
            SyncPointStatus::TaskNotRegistered | SyncPointStatus::TaskNotCreated | SyncPointStatus::ExecutionComplete
        )
    }
}

impl fmt::Display for SyncPointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason(description: &SyncPointDescription) -> String {
        match description.validate() {
            Err(TickGraphError::InvalidSyncPoint { reason, .. }) => reason,
            other => panic!("expected an invalid sync point, got {other:?}"),
        }
    }

    #[test]
    fn defaults_are_valid() {
        assert!(SyncPointDescription::new("physics").validate().is_ok());
    }

    #[test]
    fn simple_events_reject_work_rules() {
        for rule in [ActivationRule::WaitForAllWork, ActivationRule::ActivateForAnyWork] {
            let description = SyncPointDescription::new("p").with_activation_rule(rule);
            assert!(reason(&description).contains("carries no work"));
        }
        let triggered = SyncPointDescription::new("p").with_activation_rule(ActivationRule::WaitForTrigger);
        assert!(triggered.validate().is_ok());
    }

    #[test]
    fn rejects_malformed_descriptions() {
        assert!(reason(&SyncPointDescription::new("  ")).contains("empty"));
        let backwards = SyncPointDescription::new("p").in_groups(TickGroup::PostPhysics, TickGroup::PrePhysics);
        assert!(reason(&backwards).contains("after"));
        let own = SyncPointDescription::new("p").with_prerequisite("p");
        assert!(reason(&own).contains("own prerequisite"));
        let spawned = SyncPointDescription::new("p").in_groups(TickGroup::PrePhysics, TickGroup::NewlySpawned);
        assert!(reason(&spawned).contains("NewlySpawned"));
    }

    #[test]
    fn event_types_pick_threads() {
        assert_eq!(
            SyncPointEventType::GameThreadTask.desired_thread(),
            DesiredThread::game()
        );
        assert_eq!(
            SyncPointEventType::WorkerThreadTaskHighPriority.desired_thread(),
            DesiredThread::any_with(ThreadPriority::High)
        );
        assert!(!SyncPointEventType::SimpleEvent.carries_work());
    }

    #[test]
    fn descriptions_load_from_json() {
        let description: SyncPointDescription = serde_json::from_str(
            r#"{ "name": "gather", "event_type": "WorkerThreadTask", "activation_rule": "WaitForAllWork",
                 "first_group": "PrePhysics", "last_group": "PostPhysics" }"#,
        )
        .unwrap();
        assert_eq!(description.activation_rule, ActivationRule::WaitForAllWork);
        assert!(description.covers(TickGroup::DuringPhysics));
        assert!(!description.covers(TickGroup::LastDemotable));
        assert!(description.prerequisites.is_empty());
    }
}
