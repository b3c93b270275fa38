//! Barbershop CMS server binary.
//!
//! Serves the public site and the admin JSON API: content collections
//! backed by JSON files or SQLite, bearer-token admin sessions, image
//! uploads and visit statistics.

mod app;
mod atomic;
mod auth;
mod background;
mod config;
mod content;
mod error;
mod frontend;
mod http;
mod locking;
mod logging;
mod ratelimit;
mod router;
mod session;
mod stats;
mod storage;
mod tls;
mod upload;
mod validation;

use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

use crate::app::{AppState, build_app};
use crate::background::spawn_background_tasks;
use crate::config::{Args, FileConfig, StorageBackend};
use crate::frontend::SiteDir;
use crate::ratelimit::{RateLimiter, UploadRateLimiter};
use crate::router::api_router;
use crate::session::SessionManager;
use crate::storage::{JsonStore, SqliteStore, Storage};

shadow!(build);

/// Starts the CMS server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    dotenvy::dotenv().ok();
    logging::init_logging();

    let args = Args::parse();
    let file_config = FileConfig::load(Path::new(&args.config_file)).await;
    let auth_settings = args.auth_settings(&file_config);
    let storage = match args.storage {
        StorageBackend::Json => {
            let store = JsonStore::open(PathBuf::from(&args.data_dir))
                .await
                .map_err(std::io::Error::other)?;
            info!(dir = %store.root_path().display(), "using json storage");
            Storage::Json(store)
        }
        StorageBackend::Sqlite => Storage::Sqlite(
            SqliteStore::open(Path::new(&args.db_path))
                .await
                .map_err(std::io::Error::other)?,
        ),
    };

    let uploads_dir = PathBuf::from(&args.uploads_dir);
    tokio::fs::create_dir_all(&uploads_dir).await?;
    let db_dir = Path::new(&args.db_path)
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or(Path::new(&args.data_dir));
    let site = SiteDir::new(
        PathBuf::from(&args.site_dir),
        &[Path::new(&args.data_dir), db_dir, Path::new(&args.config_file)],
    );

    if args.admin_password.as_deref().is_none_or(str::is_empty) {
        warn!("ADMIN_PASSWORD is not set, admin login is disabled");
    }
    if args.trusted_proxy {
        info!("client addresses are taken from X-Forwarded-For");
    }

    let router = api_router();
    info!(
        backend = storage.backend_name(),
        routes = router.len(),
        "api ready"
    );
    let state = Arc::new(AppState {
        storage,
        sessions: SessionManager::new(auth_settings.session_ttl),
        login_limiter: RateLimiter::new(
            auth_settings.login_max_attempts,
            auth_settings.login_lockout,
        ),
        upload_limiter: UploadRateLimiter::new(
            args.upload_rate_max,
            Duration::from_secs(args.upload_rate_window_secs),
        ),
        router,
        admin_password: args.admin_password.clone(),
        site,
        uploads_dir,
        upload_max_size: args.upload_max_size,
        max_body_size: args.max_body_size,
        trust_forwarded: args.trusted_proxy,
    });
    spawn_background_tasks(
        state.clone(),
        Duration::from_secs(args.cleanup_interval_secs),
        Duration::from_secs(args.login_retention_secs),
    );

    let app = build_app(state, args.cors_origins.as_deref());

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let tls_config = tls::build_rustls_config(&args).await?;
    let handle = Handle::new();

    info!("🚀 Starting HTTP server at {}", http_addr);
    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(app.clone().into_make_service_with_connect_info::<SocketAddr>());

    let https_server = async {
        match tls_config {
            Some(config) => {
                let https_addr = SocketAddr::new(host, args.https_port);
                info!("🔒 Starting HTTPS server at {}", https_addr);
                axum_server::bind_rustls(https_addr, config)
                    .handle(handle.clone())
                    .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                    .await
            }
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = http_server => result?,
        result = https_server => result?,
        _ = shutdown_signal(handle.clone()) => {}
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
