mod auth;
mod config;
mod crypto;
mod db;
mod error;
mod events;
mod nip46;
mod peers;
mod pubkey;
mod ratelimit;
mod routes;
mod signer;
mod types;

use crate::auth::AuthManager;
use crate::config::{Config, RuntimeConfig};
use crate::db::Database;
use crate::events::{EventBus, ServerCapabilities};
use crate::peers::PeerRegistry;
use crate::ratelimit::RateLimiter;
use crate::routes::AppState;
use anyhow::Context;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::from_env();
    let db = Database::open(config.db_path.clone()).context("failed opening database")?;
    let runtime = RuntimeConfig::from_config(&config);

    let bus = EventBus::new(1_024);
    let capabilities = ServerCapabilities::new(bus);
    let auth = Arc::new(AuthManager::new(db.clone()));
    let peers = Arc::new(PeerRegistry::new(db.clone()));
    let rate_limiter = Arc::new(RateLimiter::new(db.clone()));

    let state = AppState::new(config.clone(), runtime, db, auth, peers, rate_limiter, capabilities);

    state.capabilities.log(
        "daemon_started",
        json!({ "bind_addr": state.config.bind_addr }),
    );

    let _rate_limit_cleanup = spawn_rate_limit_cleanup(state.rate_limiter.clone());
    let _session_sweep = spawn_session_sweep(state.clone());

    if let (Some(share), Some(group)) = (&config.share_credential, &config.group_credential) {
        if let Err(err) = state.bootstrap_env_credentials(share, group).await {
            tracing::warn!(%err, "failed to bootstrap signer from SHARE_CRED/GROUP_CRED");
        }
    }

    let app = routes::router(state.clone());

    let listener = tokio::net::TcpListener::bind(&state.config.bind_addr)
        .await
        .with_context(|| format!("failed binding {}", state.config.bind_addr))?;

    info!("daemon listening on {}", state.config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("axum server exited with error")?;

    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("install ctrl-c handler should not fail");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("install signal handler should not fail")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    error!("shutdown signal received");
}

fn spawn_rate_limit_cleanup(rate_limiter: Arc<RateLimiter>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move { rate_limiter.run_cleanup_loop().await })
}

/// Evicts idle sessions (and their cached credential keys) every minute,
/// using whatever `session_timeout_secs` currently holds on `RuntimeConfig`
/// so a live `/api/env` patch takes effect on the next sweep.
fn spawn_session_sweep(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let ttl = state.runtime.session_timeout_secs.load(std::sync::atomic::Ordering::Relaxed);
            match state.auth.sweep_sessions(ttl) {
                Ok(0) => {}
                Ok(n) => tracing::debug!(evicted = n, "session sweep"),
                Err(err) => tracing::warn!(%err, "session sweep failed"),
            }
        }
    })
}

