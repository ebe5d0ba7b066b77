use std::path::PathBuf;

use clap::Parser;
use color_eyre::{Result, eyre::Context};
use tracing_error::ErrorLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flash_worker::{handler::Handler, logs, server, unpack};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Start the worker's HTTP server
    Serve(ServeConfig),

    /// Execute a single job envelope and print the response
    RunJob(RunJobConfig),
}

#[derive(Parser, Debug)]
struct ServeConfig {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "8000")]
    port: u16,

    /// Host to bind to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,
}

#[derive(Parser, Debug)]
struct RunJobConfig {
    /// Path to a job envelope JSON file; reads stdin when omitted
    #[arg(long)]
    file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with(logs::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_target(true)
                .pretty(),
        )
        .with(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(
                    tracing_subscriber::filter::LevelFilter::from_level(logs::requested_level())
                        .into(),
                )
                .from_env_lossy(),
        )
        .init();

    match cli.command {
        Command::Serve(config) => serve(config).await,
        Command::RunJob(config) => run_job(config).await,
    }
}

async fn serve(config: ServeConfig) -> Result<()> {
    materialize_code().await?;

    tracing::info!("constructing application router...");
    let state = server::AppState::new(Handler::new());
    let router = server::router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    // Graceful shutdown: wait for SIGTERM or SIGINT, then allow in-flight
    // requests to complete.
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server shutdown complete");
    Ok(())
}

async fn run_job(config: RunJobConfig) -> Result<()> {
    materialize_code().await?;

    let raw = match &config.file {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("read job file: {}", path.display()))?,
        None => {
            use tokio::io::AsyncReadExt as _;
            let mut buffer = String::new();
            tokio::io::stdin()
                .read_to_string(&mut buffer)
                .await
                .context("read job from stdin")?;
            buffer
        }
    };

    let payload = serde_json::from_str::<serde_json::Value>(&raw).context("parse job JSON")?;
    let handler = Handler::new();
    let response = handler.handle_envelope(payload).await;

    // A failed job is still a delivered response, not a process failure.
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

/// Materialize pre-deployed code before taking any traffic. Failures here
/// are startup failures: the worker exits non-zero rather than serving
/// requests it cannot honor.
async fn materialize_code() -> Result<()> {
    unpack::maybe_unpack()
        .await
        .context("unpack build artifact")?;
    unpack::load_network_tarball()
        .await
        .context("load network tarball")?;
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT (Ctrl+C), starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        },
    }
}
