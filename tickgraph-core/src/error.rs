//! Crate-wide error type.
//!
//! Scheduling anomalies (cycles, stale prerequisites, watchdog force
//! dispatches, runaway spawning) are never errors: they are logged and the
//! frame carries on. The variants below cover API misuse and configuration.

use thiserror::Error;

use crate::tick::{LevelId, TickFunctionId, TickGroup};

#[derive(Error, Debug)]
pub enum TickGraphError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to spawn thread `{name}`: {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid tick function `{name}`: {reason}")]
    InvalidTickFunction { name: String, reason: String },

    #[error("tick function {0} does not exist")]
    UnknownTickFunction(TickFunctionId),

    #[error("level {0} does not exist")]
    UnknownLevel(LevelId),

    #[error("tick function `{0}` is not registered with a level")]
    NotRegistered(String),

    #[error("tick function `{0}` is not flagged for manual dispatch")]
    NotManuallyDispatched(String),

    #[error("tick group {got} started out of order, expected {expected}")]
    GroupOutOfOrder { expected: TickGroup, got: TickGroup },

    #[error("no frame is in progress")]
    FrameNotStarted,

    #[error("a frame is already in progress")]
    FrameInProgress,

    #[error("sync point `{0}` is not registered")]
    UnknownSyncPoint(String),

    #[error("sync point `{0}` is already registered")]
    DuplicateSyncPoint(String),

    #[error("invalid sync point `{name}`: {reason}")]
    InvalidSyncPoint { name: String, reason: String },

    #[error("work handle is stale or was abandoned")]
    StaleWorkHandle,

    #[error("sync point `{0}` has already completed this frame")]
    SyncPointComplete(String),
}

pub type Result<T> = std::result::Result<T, TickGraphError>;
