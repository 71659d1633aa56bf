//! ElitePros - wallet ledger and contest settlement service
//!
//! Serves the HTTP API and runs the background loops: leaderboard period
//! payouts, the reconciliation sweep and rate-limiter housekeeping.

use anyhow::{Context, Result};
use axum::middleware;
use chrono::Utc;
use clap::Parser;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, time::interval};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use elitepros_backend::{
    api::{self, AppState, ServiceSettings},
    auth::JwtHandler,
    config::{load_env, Config, GatewayMode, StoreMode},
    gateway::{PaymentGateway, SandboxGateway, ZapupiGateway},
    leaderboard::LeaderboardService,
    middleware::{rate_limit_middleware, request_logging, RateLimiter},
    models::now_ms,
    reconcile::Reconciler,
    store::{LedgerStore, MemoryStore, SqliteStore},
};

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    let config = Config::parse();
    init_tracing();

    info!("🏆 ElitePros ledger starting");

    let store: Arc<dyn LedgerStore> = match config.store {
        StoreMode::Sqlite => {
            let path = config.ledger_db_path();
            info!("💾 Ledger store: sqlite at {}", path);
            Arc::new(SqliteStore::new(&path)?)
        }
        StoreMode::Memory => {
            warn!("💾 Ledger store: in-memory, balances are lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    let gateway: Arc<dyn PaymentGateway> = match config.gateway {
        GatewayMode::Zapupi => {
            let zapupi = config.zapupi()?;
            info!("💳 Zapupi gateway at {}", zapupi.base_url);
            Arc::new(ZapupiGateway::new(zapupi).context("Failed to build Zapupi client")?)
        }
        GatewayMode::Sandbox => {
            warn!("💳 Sandbox payment gateway active, no real money moves");
            Arc::new(SandboxGateway::new())
        }
    };

    let webhook_secret = config.webhook_secret();
    if webhook_secret.is_none() {
        warn!("WEBHOOK_SECRET not set, deposit webhooks are accepted unsigned");
    }

    let settings = ServiceSettings {
        deposits: config.deposit_settings()?,
        leaderboards: config.leaderboard_settings(),
        stale_after_ms: config.stale_after_ms(),
    };
    let jwt_handler = Arc::new(JwtHandler::new(config.jwt_secret.clone()));
    let state = AppState::new(store, gateway, jwt_handler, settings, webhook_secret);

    tokio::spawn(leaderboard_polling(
        state.leaderboards.clone(),
        config.leaderboard_tick_secs,
    ));
    tokio::spawn(reconcile_polling(
        state.reconciler.clone(),
        config.reconcile_interval_secs,
    ));

    let limiter = RateLimiter::new(config.rate_limit());
    tokio::spawn(rate_limit_cleanup(limiter.clone()));

    let app = api::router(state)
        .layer(middleware::from_fn_with_state(limiter, rate_limit_middleware))
        .layer(middleware::from_fn(request_logging))
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("🎯 API server listening on {}", config.bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("Server error")?;

    Ok(())
}

/// Pays out every board whose period closed since the last tick.
async fn leaderboard_polling(leaderboards: LeaderboardService, tick_secs: u64) {
    let mut ticker = interval(Duration::from_secs(tick_secs.max(1)));
    loop {
        ticker.tick().await;
        for report in leaderboards.tick(Utc::now()).await {
            info!(
                board = report.board.as_str(),
                period = %report.period,
                outcome = ?report.outcome,
                winners = report.payouts.len(),
                "🏅 Leaderboard period closed"
            );
        }
    }
}

async fn reconcile_polling(reconciler: Reconciler, interval_secs: u64) {
    let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));
    loop {
        ticker.tick().await;
        let report = reconciler.sweep(now_ms()).await;
        if report.errors > 0 {
            error!(errors = report.errors, repairs = report.repairs(), "Reconciliation sweep hit errors");
        } else if report.repairs() > 0 {
            info!(?report, "🧹 Reconciliation sweep repaired state");
        }
    }
}

async fn rate_limit_cleanup(limiter: RateLimiter) {
    let mut ticker = interval(Duration::from_secs(300));
    loop {
        ticker.tick().await;
        limiter.cleanup();
    }
}

/// Initialize tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "elitepros_backend=debug,elitepros=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
