//! geotrackd - real-time location tracking daemon.
//!
//! Tracked devices hold a WebSocket open at `/ws`, stream position fixes
//! through a validation pipeline, and the daemon fans accepted fixes out
//! to watching dashboards while throttling durable writes. Operators get
//! a small HTTP API under `/api` for listing, retuning, and the kill
//! switch.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use geotrackd::auth::SharedSecretVerifier;
use geotrackd::config::Config;
use geotrackd::persist::{spawn_persist_worker, MemoryFixStore};
use geotrackd::server::{self, AppState};
use geotrackd::validate::ValidationPipeline;
use geotrackd::watch::{BroadcastRouter, WatcherRegistry};
use geotrackd::{SessionManager, SessionStore};

#[derive(Parser, Debug)]
#[command(name = "geotrackd", version, about, long_about = None)]
struct Cli {
    /// Address to bind the HTTP/WebSocket listener (overrides config)
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Path to a TOML config file
    #[arg(long, default_value = "geotrackd.toml")]
    config: PathBuf,

    /// Shared secret devices must present as `<subject>:<secret>`
    #[arg(long, env = "GEOTRACKD_SECRET")]
    secret: Option<String>,

    /// Bearer token required by the operator API
    #[arg(long, env = "GEOTRACKD_OPERATOR_TOKEN")]
    operator_token: Option<String>,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "geotrackd=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = match Config::load(&cli.config)? {
        Some(config) => {
            tracing::info!(path = %cli.config.display(), "loaded config");
            config
        }
        None => Config::default(),
    };
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if cli.secret.is_some() {
        config.auth.shared_secret = cli.secret;
    }
    if cli.operator_token.is_some() {
        config.auth.operator_token = cli.operator_token;
    }

    if config.auth.shared_secret.is_none() {
        tracing::warn!("no shared secret configured; any non-empty subject id authenticates");
    }

    let sessions = SessionStore::new();
    let watchers = WatcherRegistry::new();
    let router = BroadcastRouter::new(watchers.clone());
    let (persist, _persist_worker) = spawn_persist_worker(
        Arc::new(MemoryFixStore::new()),
        sessions.clone(),
        router.clone(),
        config.channels.persist_queue_depth,
    );

    let manager = SessionManager::new(
        sessions,
        watchers,
        router,
        persist,
        ValidationPipeline::new(
            config.tracking.clock_skew_tolerance_ms,
            config.tracking.max_speed_mps,
        ),
        config.tracking.default_thresholds,
        config.tracking.stale_after_ms,
    );

    let state = AppState {
        manager,
        verifier: Arc::new(SharedSecretVerifier::new(config.auth.shared_secret.clone())),
        watcher_buffer: config.channels.watcher_buffer,
        operator_token: config.auth.operator_token.clone(),
    };

    let app = server::router(state);
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    tracing::info!(addr = %config.bind, "geotrackd listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    Ok(())
}
