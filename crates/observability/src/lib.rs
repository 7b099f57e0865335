//! # tally-observability
//!
//! Observability-Crate fuer den Tally-Realtime-Kern:
//! - Prometheus-kompatible Metriken (`/metrics`)
//! - Health-Check-Endpunkt (`/health`)
//! - Structured JSON Logging via tracing-subscriber
//! - Request-Timing Middleware

pub mod health;
pub mod logging;
pub mod metrics;
pub mod middleware;

pub use health::{health_router, HealthResponse, HealthState, HealthStatus};
pub use logging::{log_format_gueltig, log_level_gueltig, logging_initialisieren, LogFormat};
pub use metrics::{metrics_router, TallyMetriken};
pub use middleware::{request_timing_layer, timing_middleware};

use anyhow::Result;
use axum::Router;
use std::net::SocketAddr;
use tokio::sync::watch;

/// Router mit `/metrics` und `/health`
pub fn observability_router(metriken: TallyMetriken, health: HealthState) -> Router {
    Router::new()
        .merge(metrics_router(metriken))
        .merge(health_router(health))
}

/// Startet den internen HTTP-Server
///
/// `app` enthaelt mindestens [`observability_router`]; der Aufrufer kann
/// weitere interne Routen hineinmergen. Laeuft bis `shutdown` auf `true`
/// wechselt.
pub async fn observability_server_starten(
    bind_addr: SocketAddr,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let app = app.layer(request_timing_layer());

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = %bind_addr, "Interner HTTP-Server gestartet");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|s| *s).await;
        })
        .await?;
    Ok(())
}
