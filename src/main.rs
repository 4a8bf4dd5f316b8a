use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mjproxy::account::registry::AccountRegistry;
use mjproxy::api::{self, ApiService};
use mjproxy::config::Setting;
use mjproxy::notify::mail::LogMailNotifier;
use mjproxy::notify::CallbackDispatcher;
use mjproxy::screen::WordListScreener;
use mjproxy::store::SqliteStore;
use mjproxy::transport::DiscordInteractionTransport;

#[derive(Parser)]
#[command(name = "mjproxy", version, about = "Multi-account Midjourney proxy")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yaml", env = "MJPROXY_CONFIG")]
    config: PathBuf,

    /// Override the configured HTTP bind host
    #[arg(long)]
    host: Option<String>,

    /// Override the configured HTTP bind port
    #[arg(long)]
    port: Option<u16>,

    /// Log filter, e.g. "info" or "info,mjproxy=debug"
    #[arg(long, default_value = "info", env = "MJPROXY_LOG")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&cli.log).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut setting = Setting::load(&cli.config)
        .with_context(|| format!("load configuration from {}", cli.config.display()))?;
    if let Some(host) = cli.host {
        setting.server.host = host;
    }
    if let Some(port) = cli.port {
        setting.server.port = port;
    }

    let store = Arc::new(
        SqliteStore::open(&setting.store_path)
            .with_context(|| format!("open store at {}", setting.store_path))?,
    );
    let transport = Arc::new(DiscordInteractionTransport::new(&setting.ng_discord.server));
    let callbacks = CallbackDispatcher::new(
        setting.notify_pool_size,
        setting.notify_hook.clone(),
        setting.notify_secret.clone(),
    );
    let mailer = Arc::new(LogMailNotifier::new(setting.smtp.clone()));

    let registry = AccountRegistry::new(
        setting.clone(),
        store.clone(),
        transport,
        callbacks,
        mailer,
    );
    registry.start().await.context("start account registry")?;

    let screener = Arc::new(WordListScreener::new(store.clone()));
    let service = ApiService::new(Arc::clone(&registry), store, screener);
    let app = api::router(service);

    let addr = format!("{}:{}", setting.server.host, setting.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!("listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve http")?;

    registry.shutdown().await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
