use clap::Parser;
use podgate_core::{install_signal_handler, Config, Dispatcher};
use podgate_engine::{select_backend, EngineClient};
use podgate_server::{HttpService, ServerError};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "podgate",
    version,
    about = "HTTP gateway for container lifecycle and in-container operations"
)]
struct Cli {
    /// TOML configuration file.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Address to listen on (host:port).
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on, keeping the configured host.
    #[arg(long)]
    port: Option<u16>,

    /// Engine backend: `podman` or `mock`.
    #[arg(long)]
    backend: Option<String>,

    /// Maximum concurrent engine operations.
    #[arg(long)]
    workers: Option<usize>,

    /// Per-request timeout in seconds.
    #[arg(long)]
    timeout: Option<u64>,

    /// Number of HTTP acceptor threads.
    #[arg(long)]
    http_threads: Option<usize>,

    /// Log at debug level (overrides PODGATE_LOG).
    #[arg(long, short)]
    verbose: bool,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(bind) = &self.bind {
            config.bind.clone_from(bind);
        }
        if let Some(port) = self.port {
            let host = config
                .bind
                .rsplit_once(':')
                .map_or("0.0.0.0", |(host, _)| host);
            config.bind = format!("{host}:{port}");
        }
        if let Some(backend) = &self.backend {
            config.backend.clone_from(backend);
        }
        if let Some(workers) = self.workers {
            config.max_workers = workers;
        }
        if let Some(timeout) = self.timeout {
            config.request_timeout_secs = timeout;
        }
        if let Some(threads) = self.http_threads {
            config.http_threads = threads;
        }
        if self.verbose {
            config.debug = true;
        }
    }
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("PODGATE_LOG").unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run(config: &Config) -> Result<(), ServerError> {
    config.validate()?;

    let engine: Arc<dyn EngineClient> =
        Arc::from(select_backend(&config.backend, &config.podman_binary)?);
    if let Err(e) = engine.ping() {
        warn!("container engine not reachable at startup: {e}");
    }

    let dispatcher = Arc::new(Dispatcher::new(engine, config)?);
    let service = HttpService::bind(&config.bind, Arc::clone(&dispatcher), config.http_threads)?;
    let stop = service.stop_handle();
    install_signal_handler(move || stop.stop());

    info!("podgate listening on {}", config.bind);
    service.run();

    let outcome = dispatcher.shutdown();
    info!("shutdown complete: {outcome:?}");
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("podgate: {e}");
            return ExitCode::FAILURE;
        }
    };
    cli.apply(&mut config);
    init_tracing(config.debug);

    match run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
