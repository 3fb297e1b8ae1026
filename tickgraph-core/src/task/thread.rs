//! Thread Classification
//!
//! Every task declares where it wants to run: either on one of the fixed
//! named threads, or on "any thread" in the worker pool. Pool work is further
//! split by thread priority (which bank of workers) and task priority (which
//! queue inside that bank).

use std::fmt;

use serde::{Deserialize, Serialize};

/// A fixed logical execution identity with its own work queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NamedThread {
    Game,
    Render,
    Rhi,
}

impl NamedThread {
    pub const COUNT: usize = 3;
    pub const ALL: [NamedThread; Self::COUNT] = [NamedThread::Game, NamedThread::Render, NamedThread::Rhi];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            NamedThread::Game => "game",
            NamedThread::Render => "render",
            NamedThread::Rhi => "rhi",
        }
    }
}

impl fmt::Display for NamedThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Worker bank selection for any-thread work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ThreadPriority {
    Background,
    Normal,
    High,
}

impl ThreadPriority {
    pub const COUNT: usize = 3;
    pub const ALL: [ThreadPriority; Self::COUNT] =
        [ThreadPriority::Background, ThreadPriority::Normal, ThreadPriority::High];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            ThreadPriority::Background => "bg",
            ThreadPriority::Normal => "np",
            ThreadPriority::High => "hp",
        }
    }
}

/// Queue selection inside a named thread or worker bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskPriority {
    Normal,
    High,
}

/// Where a task wants to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DesiredThread {
    Named {
        thread: NamedThread,
        priority: TaskPriority,
    },
    Any {
        thread_priority: ThreadPriority,
        task_priority: TaskPriority,
    },
}

impl DesiredThread {
    /// Game thread, normal task priority.
    pub fn game() -> Self {
        Self::named(NamedThread::Game)
    }

    pub fn named(thread: NamedThread) -> Self {
        DesiredThread::Named {
            thread,
            priority: TaskPriority::Normal,
        }
    }

    /// Any worker, normal thread and task priority.
    pub fn any() -> Self {
        DesiredThread::Any {
            thread_priority: ThreadPriority::Normal,
            task_priority: TaskPriority::Normal,
        }
    }

    pub fn any_with(thread_priority: ThreadPriority) -> Self {
        DesiredThread::Any {
            thread_priority,
            task_priority: TaskPriority::Normal,
        }
    }

    pub fn with_task_priority(self, priority: TaskPriority) -> Self {
        match self {
            DesiredThread::Named { thread, .. } => DesiredThread::Named { thread, priority },
            DesiredThread::Any { thread_priority, .. } => DesiredThread::Any {
                thread_priority,
                task_priority: priority,
            },
        }
    }

    pub fn named_thread(&self) -> Option<NamedThread> {
        match self {
            DesiredThread::Named { thread, .. } => Some(*thread),
            DesiredThread::Any { .. } => None,
        }
    }

    pub fn task_priority(&self) -> TaskPriority {
        match self {
            DesiredThread::Named { priority, .. } => *priority,
            DesiredThread::Any { task_priority, .. } => *task_priority,
        }
    }
}

impl Default for DesiredThread {
    fn default() -> Self {
        Self::any()
    }
}

/// What the calling OS thread is, as far as one task graph is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadIdentity {
    Named(NamedThread),
    Worker { bank: ThreadPriority, index: usize },
    /// A thread the graph knows nothing about.
    External,
}

impl ThreadIdentity {
    pub fn named_thread(&self) -> Option<NamedThread> {
        match self {
            ThreadIdentity::Named(thread) => Some(*thread),
            _ => None,
        }
    }

    /// Whether a task with this desired thread may run here.
    pub fn can_run(&self, desired: &DesiredThread) -> bool {
        match desired.named_thread() {
            Some(thread) => *self == ThreadIdentity::Named(thread),
            None => true,
        }
    }
}

impl fmt::Display for ThreadIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadIdentity::Named(thread) => write!(f, "{thread}"),
            ThreadIdentity::Worker { bank, index } => write!(f, "worker-{}-{}", bank.name(), index),
            ThreadIdentity::External => f.write_str("external"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_tasks_only_run_on_their_thread() {
        let game = DesiredThread::game();
        assert!(ThreadIdentity::Named(NamedThread::Game).can_run(&game));
        assert!(!ThreadIdentity::Named(NamedThread::Render).can_run(&game));
        assert!(!ThreadIdentity::External.can_run(&game));

        let any = DesiredThread::any();
        assert!(ThreadIdentity::External.can_run(&any));
        assert!(ThreadIdentity::Worker { bank: ThreadPriority::High, index: 0 }.can_run(&any));
    }

    #[test]
    fn task_priority_override_keeps_target() {
        let desired = DesiredThread::any_with(ThreadPriority::Background).with_task_priority(TaskPriority::High);
        assert_eq!(
            desired,
            DesiredThread::Any {
                thread_priority: ThreadPriority::Background,
                task_priority: TaskPriority::High,
            }
        );
        assert_eq!(DesiredThread::game().with_task_priority(TaskPriority::High).named_thread(), Some(NamedThread::Game));
    }
}
