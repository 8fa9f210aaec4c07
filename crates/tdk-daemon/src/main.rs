//! tdk-daemon entry point.
//!
//! This file is intentionally thin: tracing, config, store bootstrap, worker
//! pools, HTTP server, shutdown. Route handlers live in `routes.rs`; pool
//! wiring lives in `runtime.rs`.
//!
//! Exit codes: 0 clean shutdown, 1 fatal config error, 2 store migration
//! failure.

use std::{net::SocketAddr, process::ExitCode, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, Level};

use tdk_daemon::{routes, runtime, state};

const EXIT_CONFIG: u8 = 1;
const EXIT_MIGRATION: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env.local if present (dev convenience). Silent if the file does
    // not exist — production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    // --- Config + secrets (exit 1 on failure) ---
    let config_paths = std::env::var("TDK_CONFIG")
        .unwrap_or_else(|_| "config/base.yaml".to_string());
    let paths: Vec<&str> = config_paths.split(',').map(str::trim).collect();
    let loaded = match tdk_config::load_layered_yaml(&paths) {
        Ok(l) => l,
        Err(e) => {
            error!(error = %format!("{e:#}"), "config load failed");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    info!(config_hash = %loaded.config_hash, "config loaded");

    let secrets = match tdk_config::resolve_secrets(&loaded.config_json) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %format!("{e:#}"), "secret resolution failed");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let cfg = loaded.pipeline.clone();

    let bind_addr: SocketAddr = match cfg.bind_addr.parse() {
        Ok(a) => a,
        Err(e) => {
            error!(bind_addr = %cfg.bind_addr, error = %e, "invalid bind address");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    // --- Store bootstrap (exit 2 on migration failure) ---
    let db_path = std::path::Path::new(&cfg.database_path);
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                error!(error = %e, "database directory create failed");
                return ExitCode::from(EXIT_MIGRATION);
            }
        }
    }
    let pool = match tdk_db::connect(db_path).await {
        Ok(p) => p,
        Err(e) => {
            error!(error = %format!("{e:#}"), "database open failed");
            return ExitCode::from(EXIT_MIGRATION);
        }
    };
    if let Err(e) = tdk_db::migrate(&pool).await {
        error!(error = %format!("{e:#}"), "database migration failed");
        return ExitCode::from(EXIT_MIGRATION);
    }

    // --- Worker pools ---
    let broker = runtime::build_broker(pool.clone(), &cfg);
    let scheduler_status = tdk_scheduler::shared_status(cfg.scheduler.tick_interval_secs);
    let pipeline = match runtime::spawn_pipeline(
        pool.clone(),
        broker.clone(),
        &cfg,
        &secrets,
        Arc::clone(&scheduler_status),
    ) {
        Ok(p) => p,
        Err(e) => {
            error!(error = %format!("{e:#}"), "pipeline spawn failed");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    // --- HTTP surface ---
    let shared = Arc::new(state::AppState::new(
        pool,
        broker,
        scheduler_status,
        Arc::clone(&pipeline.research),
        cfg.clone(),
    ));
    let app = routes::build_router(shared)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    info!("tdk-daemon listening on http://{}", bind_addr);
    let serve = async {
        let listener = tokio::net::TcpListener::bind(bind_addr)
            .await
            .context("bind failed")?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("server crashed")
    };

    let result = serve.await;

    // Stop claiming, drain in-flight work, let leases cover the rest.
    pipeline
        .shutdown(Duration::from_secs(cfg.shutdown_grace_secs))
        .await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "server error");
            ExitCode::FAILURE
        }
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// CORS: allow only localhost origins (the desktop UI).
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
        "http://localhost:1420",
        "http://127.0.0.1:1420",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
