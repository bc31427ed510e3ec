use crate::bridge::{Bridge, PoolState, ShutdownOutcome};
use crate::config::Config;
use crate::lifecycle::{require_running, LifecycleOp};
use crate::model::{
    format_uptime, validate_container_name, ContainerLogs, CreateRequest, ExecRequest,
    ExecutionResult, FileRequest, FileWritten, HealthReport, LifecycleAck, MetricsReport,
    RemovedContainer, UserCreated, UserRequest,
};
use crate::normalize::{normalize, ApiError, OpContext};
use crate::{BridgeError, OperationError};
use chrono::{DateTime, Utc};
use podgate_engine::archive::single_file_archive;
use podgate_engine::{ContainerInfo, EngineClient, ExecSpec};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Number of log lines returned when the caller does not ask for a count.
pub const DEFAULT_LOG_TAIL: usize = 100;

/// Validates requests, runs them on the worker pool, and normalizes the
/// outcome. Every public operation returns either its payload or exactly one
/// [`ApiError`].
pub struct Dispatcher {
    engine: Arc<dyn EngineClient>,
    bridge: Bridge,
    request_timeout: Duration,
    drain_timeout: Duration,
    started_at: Instant,
    started_wall: DateTime<Utc>,
}

/// Run an in-container command and turn a non-zero exit into a failure.
fn exec_checked(
    engine: &dyn EngineClient,
    name: &str,
    label: &str,
    spec: &ExecSpec,
) -> Result<(), OperationError> {
    let out = engine.exec(name, spec)?;
    if out.exit_code == 0 {
        Ok(())
    } else {
        Err(OperationError::CommandFailed {
            command: label.to_owned(),
            exit_code: out.exit_code,
            output: out.output,
        })
    }
}

fn ensure_running(engine: &dyn EngineClient, name: &str) -> Result<(), OperationError> {
    let info = engine.inspect(name)?;
    require_running(name, &info)?;
    Ok(())
}

impl Dispatcher {
    pub fn new(engine: Arc<dyn EngineClient>, config: &Config) -> Result<Self, BridgeError> {
        let bridge = Bridge::new(config.max_workers)?;
        info!(
            "dispatcher ready: backend={}, workers={}, timeout={}s",
            engine.name(),
            config.max_workers,
            config.request_timeout_secs
        );
        Ok(Self {
            engine,
            bridge,
            request_timeout: config.request_timeout(),
            drain_timeout: config.drain_timeout(),
            started_at: Instant::now(),
            started_wall: Utc::now(),
        })
    }

    /// Override the per-request deadline (sub-second values included).
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_drain_timeout(mut self, grace: Duration) -> Self {
        self.drain_timeout = grace;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn backend_name(&self) -> &str {
        self.engine.name()
    }

    pub fn pool_state(&self) -> PoolState {
        self.bridge.state()
    }

    fn reject(operation: &'static str, target: &str, err: ApiError) -> ApiError {
        warn!("{operation} '{target}' rejected: {}", err.message);
        err
    }

    fn checked_name(operation: &'static str, name: &str) -> Result<(), ApiError> {
        validate_container_name(name).map_err(|e| Self::reject(operation, name, e))
    }

    fn run<T, F>(&self, operation: &'static str, target: &str, op: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn EngineClient) -> Result<T, OperationError> + Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        let started = Instant::now();
        let outcome = self
            .bridge
            .submit(operation, self.request_timeout, move || op(engine.as_ref()))
            .unwrap_or_else(|e| Err(OperationError::Bridge(e)));
        Self::settle(operation, target, started, outcome)
    }

    /// Like `run`, but never concurrently with another operation on `name`.
    /// The pool only hands the unit to a worker once the name is free.
    fn run_locked<T, F>(&self, operation: &'static str, name: &str, op: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn EngineClient, &str) -> Result<T, OperationError> + Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        let owned = name.to_owned();
        let started = Instant::now();
        let outcome = self
            .bridge
            .submit_exclusive(operation, name, self.request_timeout, move || {
                op(engine.as_ref(), &owned)
            })
            .unwrap_or_else(|e| Err(OperationError::Bridge(e)));
        Self::settle(operation, name, started, outcome)
    }

    fn settle<T>(
        operation: &'static str,
        target: &str,
        started: Instant,
        outcome: Result<T, OperationError>,
    ) -> Result<T, ApiError> {
        let elapsed = started.elapsed();
        outcome
            .inspect(|_| debug!("{operation} '{target}' completed in {elapsed:?}"))
            .map_err(|e| {
                normalize(
                    &e,
                    &OpContext {
                        operation,
                        target,
                        elapsed,
                    },
                )
            })
    }

    /// Create and start a container, then report its live state.
    pub fn create(&self, request: CreateRequest) -> Result<ContainerInfo, ApiError> {
        let spec = request
            .into_spec()
            .map_err(|e| Self::reject("create", "", e))?;
        let name = spec.name.clone();
        info!("creating container '{name}' from {}", spec.image);

        self.run_locked("create", &name, move |engine, name| {
            let id = engine.create(&spec)?;
            debug!("created {name} ({})", podgate_engine::short_id(&id));
            if let Err(e) = engine.start(name) {
                if let Err(cleanup) = engine.remove(name, true) {
                    warn!("cleanup of '{name}' after failed start also failed: {cleanup}");
                }
                return Err(e.into());
            }
            Ok(engine.inspect(name)?)
        })
    }

    pub fn lifecycle(&self, op: LifecycleOp, name: &str) -> Result<LifecycleAck, ApiError> {
        let label = op.label();
        Self::checked_name(label, name)?;
        info!("{label} container '{name}'");
        self.run_locked(label, name, move |engine, name| {
            match op {
                LifecycleOp::Start => engine.start(name)?,
                LifecycleOp::Stop => engine.stop(name)?,
            }
            Ok(LifecycleAck {
                name: name.to_owned(),
                status: op.ack_status().to_owned(),
            })
        })
    }

    pub fn start(&self, name: &str) -> Result<LifecycleAck, ApiError> {
        self.lifecycle(LifecycleOp::Start, name)
    }

    /// Stopping an already stopped container succeeds.
    pub fn stop(&self, name: &str) -> Result<LifecycleAck, ApiError> {
        self.lifecycle(LifecycleOp::Stop, name)
    }

    /// Removing an absent container is `NotFound`.
    pub fn remove(&self, name: &str, force: bool) -> Result<RemovedContainer, ApiError> {
        Self::checked_name("remove", name)?;
        info!("remove container '{name}' (force={force})");
        self.run_locked("remove", name, move |engine, name| {
            engine.remove(name, force)?;
            Ok(RemovedContainer {
                name: name.to_owned(),
                removed: true,
            })
        })
    }

    pub fn list(&self, all: bool) -> Result<Vec<ContainerInfo>, ApiError> {
        self.run("list", "", move |engine| Ok(engine.list(all)?))
    }

    pub fn logs(&self, name: &str, tail: Option<usize>) -> Result<ContainerLogs, ApiError> {
        Self::checked_name("logs", name)?;
        let tail = tail.unwrap_or(DEFAULT_LOG_TAIL);
        let owned = name.to_owned();
        self.run("logs", name, move |engine| {
            let logs = engine.logs(&owned, Some(tail))?;
            Ok(ContainerLogs { name: owned, logs })
        })
    }

    pub fn exec(&self, name: &str, request: ExecRequest) -> Result<ExecutionResult, ApiError> {
        Self::checked_name("exec", name)?;
        let spec = request
            .into_spec()
            .map_err(|e| Self::reject("exec", name, e))?;
        debug!("exec in '{name}': {:?}", spec.command);

        self.run_locked("exec", name, move |engine, name| {
            ensure_running(engine, name)?;
            let out = engine.exec(name, &spec)?;
            Ok(ExecutionResult::new(out.exit_code, out.output))
        })
    }

    pub fn add_user(&self, name: &str, request: UserRequest) -> Result<UserCreated, ApiError> {
        Self::checked_name("add-user", name)?;
        let user = request
            .validate()
            .map_err(|e| Self::reject("add-user", name, e))?;
        info!("adding user '{}' to container '{name}'", user.username);

        self.run_locked("add-user", name, move |engine, name| {
            ensure_running(engine, name)?;
            exec_checked(engine, name, "useradd", &user.useradd())?;
            if let Some(passwd) = user.chpasswd() {
                exec_checked(engine, name, "chpasswd", &passwd)?;
            }
            Ok(UserCreated {
                username: user.username,
                created: true,
            })
        })
    }

    pub fn add_file(&self, name: &str, request: FileRequest) -> Result<FileWritten, ApiError> {
        Self::checked_name("add-file", name)?;
        let (dest_path, content) = request
            .validate()
            .map_err(|e| Self::reject("add-file", name, e))?;
        let archive = single_file_archive(&dest_path, &content).map_err(|e| {
            Self::reject(
                "add-file",
                name,
                ApiError::validation(format!("cannot package '{dest_path}': {e}")),
            )
        })?;
        let size = content.len();
        info!("writing {size} bytes to {dest_path} in container '{name}'");

        self.run_locked("add-file", name, move |engine, name| {
            ensure_running(engine, name)?;
            engine.copy_in(name, "/", &archive)?;
            Ok(FileWritten { dest_path, size })
        })
    }

    /// Ping the engine on the calling thread so a saturated pool cannot
    /// delay the answer.
    pub fn health(&self) -> Result<HealthReport, ApiError> {
        if self.bridge.state() != PoolState::Active {
            return Err(ApiError::unavailable("service is shutting down"));
        }
        let started = Instant::now();
        match self.engine.ping() {
            Ok(()) => Ok(HealthReport {
                status: "healthy".to_owned(),
                engine: "connected".to_owned(),
                backend: self.engine.name().to_owned(),
            }),
            Err(e) => {
                warn!("health check failed after {:?}: {e}", started.elapsed());
                Err(ApiError::unavailable("container engine unavailable"))
            }
        }
    }

    pub fn metrics(&self) -> MetricsReport {
        let uptime = self.started_at.elapsed().as_secs();
        MetricsReport {
            uptime_seconds: uptime,
            uptime_human: format_uptime(uptime),
            started_at: self.started_wall.to_rfc3339(),
            pool: self.bridge.stats(),
        }
    }

    /// Stop taking work and drain the pool for at most the drain timeout.
    pub fn shutdown(&self) -> ShutdownOutcome {
        let outcome = self.bridge.shutdown(self.drain_timeout);
        info!("dispatcher shutdown: {outcome:?}");
        outcome
    }
}
