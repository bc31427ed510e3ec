//! Execution bridge and error contract for podgate.
//!
//! This crate turns blocking container-engine calls into bounded,
//! classifiable operations: the `Bridge` worker pool enforces a concurrency
//! ceiling and per-call deadlines, `normalize` maps every failure onto the
//! five-kind `ErrorKind` taxonomy, and the `Dispatcher` validates requests,
//! serializes work per container name, and ties the two together.

pub mod bridge;
pub mod concurrency;
pub mod config;
pub mod dispatch;
pub mod lifecycle;
pub mod model;
pub mod normalize;

pub use bridge::{Bridge, BridgeStats, PoolState, ShutdownOutcome};
pub use concurrency::{install_signal_handler, shutdown_requested, NameGuard, NameLocks};
pub use config::Config;
pub use dispatch::Dispatcher;
pub use lifecycle::{require_running, LifecycleOp};
pub use model::{
    ContainerLogs, CreateRequest, ExecRequest, ExecutionResult, FileRequest, FileWritten,
    HealthReport, LifecycleAck, MetricsReport, RemovedContainer, UserCreated, UserRequest,
};
pub use normalize::{classify_fault_text, normalize, ApiError, ErrorKind, OpContext};

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("{operation} panicked: {message}")]
    Panicked {
        operation: &'static str,
        message: String,
    },
    #[error("worker pool is shutting down")]
    ShuttingDown,
    #[error("{operation} was dropped by the worker pool")]
    Lost { operation: &'static str },
    #[error("worker pool needs at least one worker")]
    NoWorkers,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Everything that can go wrong between submitting an operation and getting
/// its payload back.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error(transparent)]
    Engine(#[from] podgate_engine::EngineError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("`{command}` exited with status {exit_code}: {output}")]
    CommandFailed {
        command: String,
        exit_code: i64,
        output: String,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}
