//! Service configuration.
//!
//! Layered lowest to highest: built-in defaults, an optional TOML file,
//! `PODGATE_*` environment variables, then command-line flags applied by the
//! binary. The result is validated once at startup and never changes after.

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const ENV_PREFIX: &str = "PODGATE_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub max_workers: usize,
    pub request_timeout_secs: u64,
    pub drain_timeout_secs: u64,
    pub bind: String,
    pub http_threads: usize,
    pub backend: String,
    pub podman_binary: String,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: 10,
            request_timeout_secs: 30,
            drain_timeout_secs: 10,
            bind: "0.0.0.0:5000".to_owned(),
            http_threads: 8,
            backend: "podman".to_owned(),
            podman_binary: "podman".to_owned(),
            debug: false,
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key: key.to_owned(),
        reason: format!("cannot parse '{value}'"),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key: key.to_owned(),
            reason: format!("expected a boolean, got '{value}'"),
        }),
    }
}

impl Config {
    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_toml_str(&std::fs::read_to_string(p)?)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(input)?)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(std::env::vars())
    }

    /// Apply `PODGATE_*` pairs; keys without the prefix are ignored.
    pub fn apply_overrides<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(field) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match field {
                "WORKERS" | "MAX_WORKERS" => self.max_workers = parse_value(&key, &value)?,
                "REQUEST_TIMEOUT" | "REQUEST_TIMEOUT_SECS" => {
                    self.request_timeout_secs = parse_value(&key, &value)?;
                }
                "DRAIN_TIMEOUT" | "DRAIN_TIMEOUT_SECS" => {
                    self.drain_timeout_secs = parse_value(&key, &value)?;
                }
                "BIND" => self.bind = value.trim().to_owned(),
                "HTTP_THREADS" => self.http_threads = parse_value(&key, &value)?,
                "BACKEND" => self.backend = value.trim().to_owned(),
                "PODMAN_BINARY" => self.podman_binary = value.trim().to_owned(),
                "DEBUG" => self.debug = parse_bool(&key, &value)?,
                // PODGATE_LOG belongs to the log filter.
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("max_workers", self.max_workers as u64),
            ("request_timeout_secs", self.request_timeout_secs),
            ("http_threads", self.http_threads as u64),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key: key.to_owned(),
                    reason: "must be greater than zero".to_owned(),
                });
            }
        }
        if self.bind.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "bind".to_owned(),
                reason: "must not be empty".to_owned(),
            });
        }
        if self.backend.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "backend".to_owned(),
                reason: "must not be empty".to_owned(),
            });
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}
