use podgate_engine::{ContainerInfo, ContainerStatus, EngineError};
use std::fmt;

/// State-changing operations on an existing container. Removal has its own
/// path because it carries the `force` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOp {
    Start,
    Stop,
}

impl LifecycleOp {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }

    /// Status string reported back to the caller once the operation succeeded.
    pub const fn ack_status(self) -> &'static str {
        match self {
            Self::Start => "started",
            Self::Stop => "stopped",
        }
    }
}

impl fmt::Display for LifecycleOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// In-container operations (exec, user and file management) need a running
/// container. The engine owns the state machine; this only reads it.
pub fn require_running(name: &str, info: &ContainerInfo) -> Result<(), EngineError> {
    if info.status == ContainerStatus::Running {
        Ok(())
    } else {
        Err(EngineError::NotRunning(name.to_owned()))
    }
}
