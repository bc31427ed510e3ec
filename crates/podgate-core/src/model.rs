//! Request and response shapes exchanged with the transport.
//!
//! Requests arrive with every field optional so a missing field surfaces as a
//! `Validation` error naming it, rather than as a JSON decoding failure.

use crate::bridge::BridgeStats;
use crate::normalize::ApiError;
use podgate_engine::archive::entry_path;
use podgate_engine::{ContainerSpec, ExecSpec, VolumeBind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MAX_NAME_LEN: usize = 128;
pub const MAX_USERNAME_LEN: usize = 32;
pub const DEFAULT_SHELL: &str = "/bin/sh";

fn present(value: Option<&String>) -> bool {
    value.is_some_and(|v| !v.trim().is_empty())
}

/// Fail with one `Validation` error listing every absent or blank field.
pub fn require(fields: &[(&'static str, Option<&String>)]) -> Result<(), ApiError> {
    let missing: Vec<&str> = fields
        .iter()
        .filter(|(_, value)| !present(*value))
        .map(|(key, _)| *key)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ApiError::missing_fields(&missing))
    }
}

pub fn validate_container_name(name: &str) -> Result<(), ApiError> {
    let mut chars = name.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if name.len() > MAX_NAME_LEN || !first_ok || !rest_ok {
        return Err(ApiError::validation(format!(
            "invalid container name '{name}': use letters, digits, '_', '.', '-' \
             (first character alphanumeric, at most {MAX_NAME_LEN} characters)"
        )));
    }
    Ok(())
}

pub fn validate_username(username: &str) -> Result<(), ApiError> {
    let mut chars = username.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if username.len() > MAX_USERNAME_LEN || !first_ok || !rest_ok {
        return Err(ApiError::validation(format!(
            "invalid username '{username}'"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CreateRequest {
    pub image: Option<String>,
    pub name: Option<String>,
    pub command: Option<String>,
    pub environment: BTreeMap<String, String>,
    pub ports: BTreeMap<String, u16>,
    pub volumes: BTreeMap<String, VolumeBind>,
    pub user: Option<String>,
}

impl CreateRequest {
    pub fn into_spec(self) -> Result<ContainerSpec, ApiError> {
        require(&[("image", self.image.as_ref()), ("name", self.name.as_ref())])?;
        let name = self.name.unwrap_or_default().trim().to_owned();
        validate_container_name(&name)?;

        for port in self.ports.keys() {
            let number = port.split('/').next().unwrap_or_default();
            if number.parse::<u16>().is_err() {
                return Err(ApiError::validation(format!("invalid container port '{port}'")));
            }
        }
        for (host, bind) in &self.volumes {
            if host.is_empty() || bind.bind.is_empty() {
                return Err(ApiError::validation("volume paths must not be empty"));
            }
        }

        Ok(ContainerSpec {
            image: self.image.unwrap_or_default().trim().to_owned(),
            name,
            command: self.command.filter(|c| !c.trim().is_empty()),
            environment: self.environment,
            ports: self.ports,
            volumes: self.volumes,
            user: self.user.filter(|u| !u.trim().is_empty()),
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExecRequest {
    pub command: Option<String>,
    pub user: Option<String>,
}

impl ExecRequest {
    pub fn into_spec(self) -> Result<ExecSpec, ApiError> {
        require(&[("command", self.command.as_ref())])?;
        let line = self.command.unwrap_or_default();
        Ok(ExecSpec::shell(&line).with_user(self.user.filter(|u| !u.trim().is_empty())))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UserRequest {
    pub username: Option<String>,
    pub password: Option<String>,
    pub shell: Option<String>,
}

/// A validated user-provisioning request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub username: String,
    pub password: Option<String>,
    pub shell: String,
}

impl NewUser {
    pub fn useradd(&self) -> ExecSpec {
        ExecSpec::new(vec![
            "useradd".to_owned(),
            "-m".to_owned(),
            "-s".to_owned(),
            self.shell.clone(),
            self.username.clone(),
        ])
    }

    /// `chpasswd` reading `user:password` from stdin.
    pub fn chpasswd(&self) -> Option<ExecSpec> {
        let password = self.password.as_ref()?;
        let line = format!("{}:{password}\n", self.username);
        Some(ExecSpec::new(vec!["chpasswd".to_owned()]).with_stdin(line.into_bytes()))
    }
}

impl UserRequest {
    pub fn validate(self) -> Result<NewUser, ApiError> {
        require(&[("username", self.username.as_ref())])?;
        let username = self.username.unwrap_or_default().trim().to_owned();
        validate_username(&username)?;

        let shell = self
            .shell
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SHELL.to_owned());
        if !shell.starts_with('/') || shell.chars().any(char::is_whitespace) {
            return Err(ApiError::validation(format!(
                "shell must be an absolute path, got '{shell}'"
            )));
        }

        let password = self.password.filter(|p| !p.is_empty());
        if password
            .as_deref()
            .is_some_and(|p| p.contains(['\n', '\r']))
        {
            return Err(ApiError::validation("password must not contain line breaks"));
        }

        Ok(NewUser {
            username,
            password,
            shell,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileRequest {
    pub dest_path: Option<String>,
    pub content: Option<String>,
}

impl FileRequest {
    /// Returns the destination path and the file bytes.
    pub fn validate(self) -> Result<(String, Vec<u8>), ApiError> {
        let content_present = self.content.as_ref().is_some_and(|c| !c.is_empty());
        let mut missing = Vec::new();
        if !present(self.dest_path.as_ref()) {
            missing.push("dest_path");
        }
        if !content_present {
            missing.push("content");
        }
        if !missing.is_empty() {
            return Err(ApiError::missing_fields(&missing));
        }

        let dest_path = self.dest_path.unwrap_or_default();
        entry_path(&dest_path)
            .map_err(|_| ApiError::validation(format!("invalid destination path '{dest_path}'")))?;
        Ok((dest_path, self.content.unwrap_or_default().into_bytes()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleAck {
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovedContainer {
    pub name: String,
    pub removed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerLogs {
    pub name: String,
    pub logs: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub exit_code: i64,
    pub output: String,
    pub success: bool,
}

impl ExecutionResult {
    pub fn new(exit_code: i64, output: String) -> Self {
        Self {
            exit_code,
            output,
            success: exit_code == 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserCreated {
    pub username: String,
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileWritten {
    pub dest_path: String,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: String,
    pub engine: String,
    pub backend: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsReport {
    pub uptime_seconds: u64,
    pub uptime_human: String,
    pub started_at: String,
    #[serde(flatten)]
    pub pool: BridgeStats,
}

/// `3725` seconds becomes `"1h 2m 5s"`.
pub fn format_uptime(total_secs: u64) -> String {
    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = total_secs % 60;
    if days > 0 {
        format!("{days}d {hours}h {minutes}m {seconds}s")
    } else if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::ErrorKind;

    fn create(json: &str) -> Result<ContainerSpec, ApiError> {
        serde_json::from_str::<CreateRequest>(json).unwrap().into_spec()
    }

    #[test]
    fn create_minimal() {
        let spec = create(r#"{"image":"alpine:latest","name":"demo"}"#).unwrap();
        assert_eq!(spec.image, "alpine:latest");
        assert_eq!(spec.name, "demo");
        assert!(spec.command.is_none());
    }

    #[test]
    fn create_full() {
        let spec = create(
            r#"{"image":"nginx","name":"web","command":"nginx -g 'daemon off;'",
                "environment":{"A":"1"},"ports":{"80/tcp":8080},
                "volumes":{"/srv":{"bind":"/usr/share/nginx/html","mode":"ro"}},
                "user":"www"}"#,
        )
        .unwrap();
        assert_eq!(spec.ports["80/tcp"], 8080);
        assert_eq!(spec.volumes["/srv"].mode, "ro");
        assert_eq!(spec.user.as_deref(), Some("www"));
    }

    #[test]
    fn create_missing_name_lists_field() {
        let err = create(r#"{"image":"alpine:latest"}"#).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert_eq!(err.code, 400);
        assert!(err.message.contains("name"));
        assert!(!err.message.contains("image"));
    }

    #[test]
    fn create_blank_fields_are_missing() {
        let err = create(r#"{"image":"  ","name":""}"#).unwrap_err();
        assert_eq!(err.message, "missing required fields: image, name");
    }

    #[test]
    fn create_rejects_bad_name_and_port() {
        assert!(create(r#"{"image":"alpine","name":"-bad"}"#).is_err());
        assert!(create(r#"{"image":"alpine","name":"a b"}"#).is_err());
        assert!(create(r#"{"image":"alpine","name":"ok","ports":{"http":80}}"#).is_err());
    }

    #[test]
    fn container_name_rules() {
        assert!(validate_container_name("demo-1.test_x").is_ok());
        assert!(validate_container_name("9lives").is_ok());
        assert!(validate_container_name("").is_err());
        assert!(validate_container_name("_hidden").is_err());
        assert!(validate_container_name("x/y").is_err());
        assert!(validate_container_name(&"a".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn exec_request_uses_shell() {
        let spec = serde_json::from_str::<ExecRequest>(r#"{"command":"echo hi && ls"}"#)
            .unwrap()
            .into_spec()
            .unwrap();
        assert_eq!(spec.command, vec!["sh", "-c", "echo hi && ls"]);
        assert!(spec.user.is_none());
    }

    #[test]
    fn exec_request_requires_command() {
        let err = ExecRequest::default().into_spec().unwrap_err();
        assert_eq!(err.message, "missing required fields: command");
    }

    #[test]
    fn user_request_defaults_shell() {
        let user = UserRequest {
            username: Some("alice".into()),
            ..UserRequest::default()
        }
        .validate()
        .unwrap();
        assert_eq!(user.shell, DEFAULT_SHELL);
        assert!(user.chpasswd().is_none());
        assert_eq!(
            user.useradd().command,
            vec!["useradd", "-m", "-s", "/bin/sh", "alice"]
        );
    }

    #[test]
    fn password_goes_through_stdin() {
        let user = UserRequest {
            username: Some("alice".into()),
            password: Some("s3cret; rm -rf /".into()),
            shell: Some("/bin/bash".into()),
        }
        .validate()
        .unwrap();
        let passwd = user.chpasswd().unwrap();
        assert_eq!(passwd.command, vec!["chpasswd"]);
        assert_eq!(passwd.stdin.unwrap(), b"alice:s3cret; rm -rf /\n");
    }

    #[test]
    fn user_request_rejections() {
        let bad = |username: &str, password: Option<&str>, shell: Option<&str>| {
            UserRequest {
                username: Some(username.into()),
                password: password.map(Into::into),
                shell: shell.map(Into::into),
            }
            .validate()
            .is_err()
        };
        assert!(bad("1alice", None, None));
        assert!(bad("alice;id", None, None));
        assert!(bad("alice", Some("a\nroot:x"), None));
        assert!(bad("alice", None, Some("bash")));
        assert!(UserRequest::default().validate().is_err());
    }

    #[test]
    fn file_request_validation() {
        let (path, bytes) = FileRequest {
            dest_path: Some("/tmp/hello.txt".into()),
            content: Some("hi\n".into()),
        }
        .validate()
        .unwrap();
        assert_eq!(path, "/tmp/hello.txt");
        assert_eq!(bytes, b"hi\n");

        let err = FileRequest::default().validate().unwrap_err();
        assert_eq!(err.message, "missing required fields: dest_path, content");

        let err = FileRequest {
            dest_path: Some("/tmp/../etc/passwd".into()),
            content: Some("x".into()),
        }
        .validate()
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[test]
    fn execution_result_success_flag() {
        assert!(ExecutionResult::new(0, String::new()).success);
        assert!(!ExecutionResult::new(2, String::new()).success);
    }

    #[test]
    fn uptime_formatting() {
        assert_eq!(format_uptime(5), "5s");
        assert_eq!(format_uptime(65), "1m 5s");
        assert_eq!(format_uptime(3725), "1h 2m 5s");
        assert_eq!(format_uptime(90_061), "1d 1h 1m 1s");
    }
}
