mod config;
mod sweeper;

use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use courier_api::AppStateInner;
use courier_core::{
    Courier, Directory, Dispatcher, HttpDirectory, LogMailer, Mailer, StaticDirectory, TokenVerifier,
    WebhookMailer,
};
use courier_db::Database;

use config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug,courier_core=debug,tower_http=debug".into()),
        )
        .init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("FATAL: {:#}", e);
            std::process::exit(1);
        }
    };

    // Init database
    let db = Arc::new(Database::open(&config.db_path)?);
    info!("Database ready at {}", config.db_path.display());

    // Collaborators
    let mailer: Arc<dyn Mailer> = match &config.mailer_url {
        Some(url) => Arc::new(WebhookMailer::new(url.clone())?),
        None => {
            warn!("COURIER_MAILER_URL unset, escalation emails will only be logged");
            Arc::new(LogMailer)
        }
    };
    let directory: Arc<dyn Directory> = match &config.directory_url {
        Some(url) => Arc::new(HttpDirectory::new(url.clone())?),
        None => {
            warn!("COURIER_DIRECTORY_URL unset, no email addresses can be resolved");
            Arc::new(StaticDirectory::default())
        }
    };

    let courier = Courier::new(db, Dispatcher::new(), mailer, directory, config.courier.clone());
    let state = AppStateInner::new(courier.clone(), TokenVerifier::new(&config.jwt_secret));

    tokio::spawn(sweeper::run_sweep_loop(courier, config.sweep_interval));

    let app = courier_api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!("Courier server listening on {}", config.addr);
    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable ({}), waiting for Ctrl+C", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
