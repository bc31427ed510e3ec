use crate::backend::{
    short_id, ContainerInfo, ContainerSpec, ContainerStatus, EngineClient, ExecOutput, ExecSpec,
};
use crate::EngineError;
use serde::Deserialize;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use tracing::debug;

/// Exit status podman itself uses when the failure is podman's, not the
/// command's (for example an unknown container name). A command inside the
/// container may exit with it too, so it only counts together with podman's
/// `Error:` line on stderr.
const PODMAN_ERROR_EXIT: i32 = 125;

/// Backend that drives the `podman` command line.
pub struct PodmanCli {
    binary: PathBuf,
}

impl Default for PodmanCli {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("podman"),
        }
    }
}

impl PodmanCli {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn run(&self, args: &[String], stdin: Option<&[u8]>) -> Result<Output, EngineError> {
        debug!("{} {}", self.binary.display(), args.join(" "));
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EngineError::Unavailable(format!("{} not found: {e}", self.binary.display()))
            } else {
                EngineError::Io(e)
            }
        })?;

        let Some(data) = stdin else {
            return Ok(child.wait_with_output()?);
        };
        let mut pipe = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Command("stdin pipe not available".to_owned()))?;
        // Feed stdin from a separate thread so a chatty child cannot fill its
        // stdout pipe while we are still writing.
        std::thread::scope(|s| {
            let writer = s.spawn(move || pipe.write_all(data));
            let output = child.wait_with_output();
            match writer.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Ok(Err(e)) => return Err(EngineError::Io(e)),
                Err(_) => return Err(EngineError::Command("stdin writer panicked".to_owned())),
            }
            Ok(output?)
        })
    }

    fn run_checked(&self, args: &[String], stdin: Option<&[u8]>) -> Result<Vec<u8>, EngineError> {
        let output = self.run(args, stdin)?;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(command_failure(args, &output))
        }
    }
}

fn command_failure(args: &[String], output: &Output) -> EngineError {
    let verb = args.first().map_or("podman", String::as_str);
    let stderr = String::from_utf8_lossy(&output.stderr);
    EngineError::Command(format!("podman {verb}: {}", stderr.trim()))
}

fn podman_refused(output: &Output) -> bool {
    output.status.code() == Some(PODMAN_ERROR_EXIT)
        && String::from_utf8_lossy(&output.stderr)
            .lines()
            .any(|line| line.trim_start().starts_with("Error:"))
}

fn owned(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| (*s).to_owned()).collect()
}

pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = owned(&["create", "--name", spec.name.as_str()]);
    for (key, value) in &spec.environment {
        args.push("--env".to_owned());
        args.push(format!("{key}={value}"));
    }
    for (container_port, host_port) in &spec.ports {
        args.push("--publish".to_owned());
        args.push(format!("{host_port}:{container_port}"));
    }
    for (host_path, bind) in &spec.volumes {
        args.push("--volume".to_owned());
        args.push(format!("{host_path}:{}:{}", bind.bind, bind.mode));
    }
    if let Some(ref user) = spec.user {
        args.push("--user".to_owned());
        args.push(user.clone());
    }
    args.push(spec.image.clone());
    if let Some(ref command) = spec.command {
        args.extend(split_command(command));
    }
    args
}

pub fn exec_args(name: &str, spec: &ExecSpec) -> Vec<String> {
    let mut args = owned(&["exec"]);
    if spec.stdin.is_some() {
        args.push("--interactive".to_owned());
    }
    if let Some(ref user) = spec.user {
        args.push("--user".to_owned());
        args.push(user.clone());
    }
    args.push(name.to_owned());
    args.extend(spec.command.iter().cloned());
    args
}

/// Split a command line into words, honouring single and double quotes and
/// backslash escapes outside single quotes.
pub fn split_command(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some('\''), '\'') | (Some('"'), '"') => quote = None,
            (Some('"') | None, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                in_word = true;
            }
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectRecord {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    state: InspectState,
    #[serde(default)]
    image_name: String,
    #[serde(default)]
    config: InspectConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    status: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    image: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsRecord {
    id: String,
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    state: String,
    #[serde(default)]
    image: String,
}

pub fn parse_inspect(json: &[u8]) -> Result<ContainerInfo, EngineError> {
    let records: Vec<InspectRecord> =
        serde_json::from_slice(json).map_err(|e| EngineError::Parse(format!("inspect: {e}")))?;
    let record = records
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::Parse("inspect returned no records".to_owned()))?;
    let image = if record.image_name.is_empty() {
        record.config.image
    } else {
        record.image_name
    };
    Ok(ContainerInfo {
        id: short_id(&record.id),
        name: record.name.trim_start_matches('/').to_owned(),
        status: ContainerStatus::from_engine(&record.state.status),
        image,
    })
}

pub fn parse_ps(json: &[u8]) -> Result<Vec<ContainerInfo>, EngineError> {
    if json.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let records: Vec<PsRecord> =
        serde_json::from_slice(json).map_err(|e| EngineError::Parse(format!("ps: {e}")))?;
    Ok(records
        .into_iter()
        .map(|r| ContainerInfo {
            id: short_id(&r.id),
            name: r
                .names
                .first()
                .map(|n| n.trim_start_matches('/').to_owned())
                .unwrap_or_default(),
            status: ContainerStatus::from_engine(&r.state),
            image: r.image,
        })
        .collect())
}

impl EngineClient for PodmanCli {
    fn name(&self) -> &'static str {
        "podman"
    }

    fn ping(&self) -> Result<(), EngineError> {
        let args = owned(&["ps", "--all", "--quiet", "--last", "1"]);
        self.run_checked(&args, None).map(|_| ())
    }

    fn create(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let stdout = self.run_checked(&create_args(spec), None)?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_owned())
    }

    fn start(&self, name: &str) -> Result<(), EngineError> {
        self.run_checked(&owned(&["start", name]), None).map(|_| ())
    }

    fn stop(&self, name: &str) -> Result<(), EngineError> {
        self.run_checked(&owned(&["stop", name]), None).map(|_| ())
    }

    fn remove(&self, name: &str, force: bool) -> Result<(), EngineError> {
        let args = if force {
            owned(&["rm", "--force", name])
        } else {
            owned(&["rm", name])
        };
        self.run_checked(&args, None).map(|_| ())
    }

    fn inspect(&self, name: &str) -> Result<ContainerInfo, EngineError> {
        let stdout = self.run_checked(&owned(&["container", "inspect", name]), None)?;
        parse_inspect(&stdout)
    }

    fn list(&self, all: bool) -> Result<Vec<ContainerInfo>, EngineError> {
        let args = if all {
            owned(&["ps", "--all", "--format", "json"])
        } else {
            owned(&["ps", "--format", "json"])
        };
        let stdout = self.run_checked(&args, None)?;
        parse_ps(&stdout)
    }

    /// Podman hands back the container's stdout and stderr on separate pipes,
    /// so their relative order is lost. Stdout comes first, then stderr, each
    /// already limited to `tail` lines by podman.
    fn logs(&self, name: &str, tail: Option<usize>) -> Result<String, EngineError> {
        let mut args = owned(&["logs"]);
        if let Some(n) = tail {
            args.push("--tail".to_owned());
            args.push(n.to_string());
        }
        args.push(name.to_owned());
        let output = self.run(&args, None)?;
        if !output.status.success() {
            return Err(command_failure(&args, &output));
        }
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }

    fn exec(&self, name: &str, spec: &ExecSpec) -> Result<ExecOutput, EngineError> {
        let args = exec_args(name, spec);
        let output = self.run(&args, spec.stdin.as_deref())?;
        if podman_refused(&output) {
            return Err(command_failure(&args, &output));
        }
        let code = output.status.code().unwrap_or(-1);
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(ExecOutput {
            exit_code: i64::from(code),
            output: text,
        })
    }

    fn copy_in(&self, name: &str, dest_dir: &str, archive: &[u8]) -> Result<(), EngineError> {
        let args = owned(&["cp", "-", format!("{name}:{dest_dir}").as_str()]);
        self.run_checked(&args, Some(archive)).map(|_| ())
    }
}
