//! Scheduler Configuration
//!
//! All knobs are plain serde structs with per-field defaults, so a config
//! file only needs to mention what it changes:
//!
//! ```json
//! {
//!   "task_graph": { "worker_threads": 4, "background_bank": false },
//!   "tick": { "allow_batched_ticks": true, "idle_task_work_ms": 0.5 }
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TickGraphError};

/// Upper bound on workers per bank.
pub const MAX_WORKERS_PER_BANK: usize = 64;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub task_graph: TaskGraphConfig,
    pub tick: TickConfig,
}

impl SchedulerConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.task_graph.validate()?;
        self.tick.validate()
    }
}

/// Worker pool and named thread setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskGraphConfig {
    /// Workers per bank. 0 means "available parallelism minus one".
    pub worker_threads: usize,

    /// Create a dedicated bank for high thread-priority work.
    pub high_priority_bank: bool,

    /// Create a dedicated bank for background work.
    pub background_bank: bool,

    /// Spawn no workers at all. Any-thread work then only runs when a caller
    /// waits on it or pumps the graph.
    pub single_threaded: bool,

    /// Give the render thread its own OS thread.
    pub spawn_render_thread: bool,

    /// Give the RHI thread its own OS thread.
    pub spawn_rhi_thread: bool,

    /// How long an idle drain loop sleeps before re-checking its queue.
    pub idle_wait_ms: u64,
}

impl Default for TaskGraphConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            high_priority_bank: true,
            background_bank: true,
            single_threaded: false,
            spawn_render_thread: false,
            spawn_rhi_thread: false,
            idle_wait_ms: 10,
        }
    }
}

impl TaskGraphConfig {
    /// A config with no worker threads, useful for deterministic tests.
    pub fn single_threaded() -> Self {
        Self {
            single_threaded: true,
            ..Self::default()
        }
    }

    /// Resolve the per-bank worker count.
    pub fn resolved_worker_threads(&self) -> usize {
        if self.single_threaded {
            return 0;
        }
        let requested = if self.worker_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get().saturating_sub(1))
                .unwrap_or(1)
        } else {
            self.worker_threads
        };
        requested.clamp(1, MAX_WORKERS_PER_BANK)
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms.max(1))
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_threads > MAX_WORKERS_PER_BANK {
            return Err(TickGraphError::Config(format!(
                "worker_threads = {} exceeds the limit of {}",
                self.worker_threads, MAX_WORKERS_PER_BANK
            )));
        }
        Ok(())
    }
}

/// Tick scheduler switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TickConfig {
    /// Let `run_on_any_thread` functions go to the worker pool.
    pub allow_concurrent_ticks: bool,

    /// Merge compatible game-thread functions into one task.
    pub allow_batched_ticks: bool,

    /// Ignore prerequisites that provably finish in an earlier group.
    pub allow_optimized_prerequisites: bool,

    /// Emit a debug line per executed tick function.
    pub log_ticks: bool,

    /// Budget for unrelated work while blocking on a group.
    ///
    /// Greater than zero pumps for that many milliseconds, zero keeps
    /// processing game-thread work until blocked, negative waits outright.
    pub idle_task_work_ms: f64,

    /// Idle iterations with no progress before manually gated work is
    /// force-dispatched.
    pub stall_idle_iterations: u32,

    /// Passes over newly spawned functions before the rest are discarded.
    pub max_newly_spawned_passes: u32,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            allow_concurrent_ticks: true,
            allow_batched_ticks: false,
            allow_optimized_prerequisites: true,
            log_ticks: false,
            idle_task_work_ms: 0.0,
            stall_idle_iterations: 10,
            max_newly_spawned_passes: 101,
        }
    }
}

impl TickConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.idle_task_work_ms.is_finite() {
            return Err(TickGraphError::Config(
                "idle_task_work_ms must be finite".to_string(),
            ));
        }
        if self.max_newly_spawned_passes == 0 {
            return Err(TickGraphError::Config(
                "max_newly_spawned_passes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = SchedulerConfig::from_json_str("{}").unwrap();
        assert_eq!(config, SchedulerConfig::default());
        assert_eq!(config.tick.stall_idle_iterations, 10);
        assert_eq!(config.tick.max_newly_spawned_passes, 101);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = SchedulerConfig::from_json_str(
            r#"{ "task_graph": { "worker_threads": 3 }, "tick": { "allow_batched_ticks": true } }"#,
        )
        .unwrap();
        assert_eq!(config.task_graph.worker_threads, 3);
        assert!(config.task_graph.high_priority_bank);
        assert!(config.tick.allow_batched_ticks);
        assert!(config.tick.allow_optimized_prerequisites);
    }

    #[test]
    fn rejects_invalid_values() {
        let err = SchedulerConfig::from_json_str(r#"{ "task_graph": { "worker_threads": 1000 } }"#);
        assert!(matches!(err, Err(TickGraphError::Config(_))));

        let err = SchedulerConfig::from_json_str(r#"{ "tick": { "max_newly_spawned_passes": 0 } }"#);
        assert!(matches!(err, Err(TickGraphError::Config(_))));

        let err = SchedulerConfig::from_json_str("{ not json");
        assert!(matches!(err, Err(TickGraphError::Json(_))));
    }

    #[test]
    fn resolved_workers() {
        assert_eq!(TaskGraphConfig::single_threaded().resolved_worker_threads(), 0);

        let fixed = TaskGraphConfig {
            worker_threads: 5,
            ..TaskGraphConfig::default()
        };
        assert_eq!(fixed.resolved_worker_threads(), 5);

        let auto = TaskGraphConfig::default().resolved_worker_threads();
        assert!(auto >= 1 && auto <= MAX_WORKERS_PER_BANK);
    }
}
