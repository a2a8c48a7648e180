use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};
use votegate_core::{AppResult, VerificationService};
use votegate_server::{router, AppState};

#[derive(Debug, Parser)]
#[command(
    name = "votegate-server",
    about = "Serve the votegate verification API over HTTP",
    version
)]
struct Args {
    /// Configuration file (defaults to /etc/votegate/config.toml, then /usr/local/etc/votegate/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Increase verbosity (may be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "votegate-server stopped");
            err.exit_code()
        }
    }
}

async fn run(args: Args) -> AppResult<()> {
    let loaded = votegate_config::load_resolved_config_with(args.config.as_deref())?;
    match &loaded.source {
        Some(source) => info!(target: "config", "Loaded configuration from {}", source.display()),
        None => info!(target: "config", "No config file found; using built-in defaults"),
    }
    let config = loaded.resolved;

    let service = VerificationService::bootstrap(&config)?;
    let app = router(AppState::new(Arc::new(service)), &config.allowed_origins);

    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "votegate-server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("votegate-server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "cannot listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(env_filter);

    let registry = tracing_subscriber::registry().with(fmt_layer);
    if tracing::subscriber::set_global_default(registry).is_err() {
        // Already initialised (tests).
    }
}
