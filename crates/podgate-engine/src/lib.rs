//! Container engine adapters for podgate.
//!
//! This crate is the leaf of the workspace: a synchronous `EngineClient` trait
//! covering the capability set the service needs (ping, create, start, stop,
//! remove, inspect, list, logs, exec, copy-in), a `podman` backend that drives
//! the podman CLI, an in-memory `mock` backend, and the tar helpers used to
//! inject files into a container.

pub mod archive;
pub mod backend;
pub mod mock;
pub mod podman;

pub use backend::{
    select_backend, short_id, ContainerInfo, ContainerSpec, ContainerStatus, EngineClient,
    ExecOutput, ExecSpec, VolumeBind,
};
pub use mock::MockEngine;
pub use podman::PodmanCli;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("container engine unavailable: {0}")]
    Unavailable(String),
    #[error("no such container: {0}")]
    NotFound(String),
    #[error("container '{0}' is not running")]
    NotRunning(String),
    #[error("container name '{0}' is already in use")]
    NameInUse(String),
    #[error("unknown engine backend '{0}'")]
    UnknownBackend(String),
    #[error("engine command failed: {0}")]
    Command(String),
    #[error("unexpected engine output: {0}")]
    Parse(String),
    #[error("invalid destination path: {0}")]
    InvalidPath(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_error_display_not_found() {
        let e = EngineError::NotFound("demo".to_owned());
        assert_eq!(e.to_string(), "no such container: demo");
    }

    #[test]
    fn engine_error_display_not_running() {
        let e = EngineError::NotRunning("demo".to_owned());
        assert!(e.to_string().contains("is not running"));
    }
}
