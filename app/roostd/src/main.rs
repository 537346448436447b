//! Roost daemon entry point.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod cron;

use config::Config;

#[derive(Parser)]
#[command(name = "roostd", about = "Per-node control plane for game server containers")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Enable debug logging regardless of the configuration.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("failed to load configuration")?;

    let filter = if cli.debug || config.debug {
        "roostd=debug,roost_server=debug,roost_env=debug,roost_fs=debug"
    } else {
        "roostd=info,roost_server=info,roost_env=info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting roost daemon");

    for dir in [
        &config.system.data_directory,
        &config.system.backup_directory,
        &config.system.log_directory,
        &config.system.tmp_directory,
    ] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let docker = roost_env::docker::connect().context("failed to create docker client")?;
    docker
        .ping()
        .await
        .context("docker daemon is not reachable")?;

    let remote: Arc<dyn roost_remote::RemoteClient> = Arc::new(roost_remote::HttpClient::new(
        &config.remote.url,
        &config.remote.token_id,
        &config.remote.token,
    ));

    let activity = Arc::new(
        roost_server::activity::ActivityStore::open(&config.activity_db_path())
            .context("failed to open activity store")?,
    );

    let manager = roost_server::Manager::new(
        Arc::clone(&remote),
        docker,
        config.docker_settings(),
        Arc::clone(&activity),
        config.node_settings(),
    );
    manager.boot().await.context("failed to boot server manager")?;

    cron::spawn_activity_flush(
        Arc::clone(&activity),
        Arc::clone(&remote),
        std::time::Duration::from_secs(config.system.activity_send_interval),
        config.system.activity_send_count,
    );

    let addr = format!("{}:{}", config.api.host, config.api.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind API listener on {addr}"))?;
    tracing::info!(%addr, "api server listening");

    let app = api::router(Arc::clone(&manager), Arc::new(config));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("api server failed")?;

    tracing::info!("shutting down");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
