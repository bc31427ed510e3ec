use crate::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Length of the short container identifier shown to callers.
pub const SHORT_ID_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Exited,
    Unknown,
}

impl ContainerStatus {
    /// Map an engine-reported state string onto the four states podgate tracks.
    pub fn from_engine(state: &str) -> Self {
        match state.trim().to_ascii_lowercase().as_str() {
            "created" | "configured" | "initialized" => Self::Created,
            "running" => Self::Running,
            "exited" | "stopped" | "dead" => Self::Exited,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Live view of a container as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub status: ContainerStatus,
    pub image: String,
}

pub fn short_id(id: &str) -> String {
    id.chars().take(SHORT_ID_LEN).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeBind {
    pub bind: String,
    #[serde(default = "default_volume_mode")]
    pub mode: String,
}

fn default_volume_mode() -> String {
    "rw".to_owned()
}

/// Everything the engine needs to create a container.
///
/// `ports` maps a container port (`"80/tcp"`) to a host port; `volumes` maps a
/// host path to its bind target inside the container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: BTreeMap<String, u16>,
    #[serde(default)]
    pub volumes: BTreeMap<String, VolumeBind>,
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecSpec {
    pub command: Vec<String>,
    pub user: Option<String>,
    pub stdin: Option<Vec<u8>>,
}

impl ExecSpec {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            user: None,
            stdin: None,
        }
    }

    /// Run `line` through `sh -c` inside the container.
    pub fn shell(line: &str) -> Self {
        Self::new(vec!["sh".to_owned(), "-c".to_owned(), line.to_owned()])
    }

    #[must_use]
    pub fn with_user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    #[must_use]
    pub fn with_stdin(mut self, data: Vec<u8>) -> Self {
        self.stdin = Some(data);
        self
    }
}

/// Exit code plus stdout and stderr merged into one text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: String,
}

/// Synchronous facade over a container engine.
///
/// Every call blocks for as long as the engine takes. Implementations report
/// `NotFound`, `NotRunning` and `Unavailable` when they can tell; anything else
/// comes back as an opaque `Command` failure carrying the engine's own text.
pub trait EngineClient: Send + Sync {
    fn name(&self) -> &str;

    /// Cheap connectivity check used by health checks.
    fn ping(&self) -> Result<(), EngineError>;

    /// Create (but do not start) a container. Returns the engine identifier.
    fn create(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    fn start(&self, name: &str) -> Result<(), EngineError>;

    fn stop(&self, name: &str) -> Result<(), EngineError>;

    fn remove(&self, name: &str, force: bool) -> Result<(), EngineError>;

    fn inspect(&self, name: &str) -> Result<ContainerInfo, EngineError>;

    fn list(&self, all: bool) -> Result<Vec<ContainerInfo>, EngineError>;

    fn logs(&self, name: &str, tail: Option<usize>) -> Result<String, EngineError>;

    fn exec(&self, name: &str, spec: &ExecSpec) -> Result<ExecOutput, EngineError>;

    /// Extract a tar archive into `dest_dir` inside the container.
    fn copy_in(&self, name: &str, dest_dir: &str, archive: &[u8]) -> Result<(), EngineError>;
}

pub fn select_backend(
    name: &str,
    podman_binary: &str,
) -> Result<Box<dyn EngineClient>, EngineError> {
    match name {
        "podman" => Ok(Box::new(crate::podman::PodmanCli::with_binary(
            podman_binary,
        ))),
        "mock" => Ok(Box::new(crate::mock::MockEngine::new())),
        other => Err(EngineError::UnknownBackend(other.to_owned())),
    }
}

/// Keep only the last `tail` lines of `text`.
pub(crate) fn tail_lines(text: &str, tail: Option<usize>) -> String {
    let Some(n) = tail else {
        return text.to_owned();
    };
    if n == 0 {
        return String::new();
    }
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= n {
        return text.to_owned();
    }
    let mut out = lines[lines.len() - n..].join("\n");
    if text.ends_with('\n') {
        out.push('\n');
    }
    out
}
