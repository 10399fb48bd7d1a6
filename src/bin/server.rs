use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use runner_sandbox::{build_router, AppState, RunnerConfig, ShellMode};
use runner_sandbox::{DEFAULT_HTTP_PORT, DEFAULT_NODE_IMAGE, DEFAULT_PYTHON_IMAGE, DEFAULT_SHELL};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "runnerd", author, version)]
struct Options {
    /// Address the HTTP server binds to
    #[arg(long, default_value = "0.0.0.0", env = "RUNNER_BIND")]
    bind: String,

    /// Port for the HTTP and WebSocket server
    #[arg(long, default_value_t = DEFAULT_HTTP_PORT, env = "RUNNER_PORT")]
    port: u16,

    /// Directory holding project files and the project registry
    #[arg(long, default_value = "/var/lib/runner", env = "RUNNER_DATA_DIR")]
    data_dir: PathBuf,

    /// Directory with one subdirectory per project template
    #[arg(long, default_value = "/var/lib/runner/templates", env = "RUNNER_TEMPLATES_DIR")]
    templates_dir: PathBuf,

    /// Directory used for logs
    #[arg(long, default_value = "/var/log/runner", env = "RUNNER_LOG_DIR")]
    log_dir: PathBuf,

    /// Where shells run
    #[arg(long, value_enum, default_value_t = ShellMode::Docker, env = "RUNNER_SHELL_MODE")]
    shell_mode: ShellMode,

    /// Shell started for every session
    #[arg(long, default_value = DEFAULT_SHELL, env = "RUNNER_SHELL")]
    shell: String,

    /// Image for python projects
    #[arg(long, default_value = DEFAULT_PYTHON_IMAGE, env = "RUNNER_PYTHON_IMAGE")]
    python_image: String,

    /// Image for node projects
    #[arg(long, default_value = DEFAULT_NODE_IMAGE, env = "RUNNER_NODE_IMAGE")]
    node_image: String,

    /// Memory limit per sandbox container
    #[arg(long, default_value = "512m", env = "RUNNER_MEMORY")]
    memory: String,

    /// Relative CPU weight per sandbox container
    #[arg(long, default_value_t = 512, env = "RUNNER_CPU_SHARES")]
    cpu_shares: u32,
}

impl Options {
    fn runner_config(&self, data_dir: PathBuf) -> RunnerConfig {
        let mut config = RunnerConfig::new(data_dir, self.templates_dir.clone())
            .with_shell_mode(self.shell_mode);
        config.shell = self.shell.clone();
        config.python_image = self.python_image.clone();
        config.node_image = self.node_image.clone();
        config.memory_limit = self.memory.clone();
        config.cpu_shares = self.cpu_shares;
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    let _guard = init_tracing(&options.log_dir);
    run_server(options).await
}

fn init_tracing(log_dir: &Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);

    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!(
            "Failed to create log directory {:?}: {}. Logging to file disabled.",
            log_dir, e
        );
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .init();
        return None;
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, "runnerd.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    Some(guard)
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {error}");
    }
    tracing::info!("shutdown signal received");
}

async fn run_server(options: Options) -> anyhow::Result<()> {
    std::fs::create_dir_all(&options.data_dir)
        .with_context(|| format!("failed to create data dir {}", options.data_dir.display()))?;
    // Bind mounts need an absolute source path.
    let data_dir = std::fs::canonicalize(&options.data_dir)
        .with_context(|| format!("failed to resolve data dir {}", options.data_dir.display()))?;

    let config = options.runner_config(data_dir);
    tracing::info!(
        data_dir = %config.data_dir.display(),
        templates_dir = %config.templates_dir.display(),
        shell_mode = ?config.shell_mode,
        "starting runnerd"
    );

    let state = AppState::from_config(config)
        .await
        .context("failed to initialize services")?;
    let app = build_router(state.clone());

    let addr = SocketAddr::new(parse_bind_ip(&options.bind), options.port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("runnerd listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Sessions cut off by the shutdown never ran their teardown.
    state.reconcile().await;
    tracing::info!("server shut down gracefully");
    Ok(())
}

fn parse_bind_ip(bind: &str) -> IpAddr {
    match bind.parse() {
        Ok(ip) => ip,
        Err(error) => {
            tracing::error!(
                ?error,
                %bind,
                "invalid bind address; defaulting to 0.0.0.0"
            );
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }
    }
}
