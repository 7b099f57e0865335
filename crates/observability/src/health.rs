//! `GET /health`
//!
//! Ein ausgefallener Presence-Store macht den Dienst nur `degraded`:
//! Verbindungen und Broadcasts funktionieren weiter, nur die
//! Online-Anzeige fehlt. Waehrend des Shutdowns meldet der Endpunkt
//! `unhealthy` mit 503, damit der Load-Balancer keine neuen Clients schickt.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    fn http_status(self) -> StatusCode {
        match self {
            // degraded bleibt 200, der Liveness-Check soll den Pod nicht abschiessen
            Self::Healthy | Self::Degraded => StatusCode::OK,
            Self::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// JSON-Body von `/health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub presence_store_available: bool,
    pub connected_clients: u64,
    pub draining: bool,
}

struct Inner {
    gestartet: Instant,
    presence_verfuegbar: AtomicBool,
    verbundene_clients: AtomicU64,
    draining: AtomicBool,
}

/// Von Signaling fortgeschriebener Zustand, billig klonbar
///
/// Store-Status kommt aus der Bereinigungsschleife, die Client-Anzahl aus
/// dem Broadcaster, `draining` vom Server beim Shutdown.
#[derive(Clone)]
pub struct HealthState {
    inner: Arc<Inner>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::neu()
    }
}

impl HealthState {
    pub fn neu() -> Self {
        Self {
            inner: Arc::new(Inner {
                gestartet: Instant::now(),
                presence_verfuegbar: AtomicBool::new(true),
                verbundene_clients: AtomicU64::new(0),
                draining: AtomicBool::new(false),
            }),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.inner.gestartet.elapsed().as_secs()
    }

    pub fn presence_verfuegbar(&self) -> bool {
        self.inner.presence_verfuegbar.load(Ordering::Relaxed)
    }

    pub fn presence_status_setzen(&self, verfuegbar: bool) {
        self.inner
            .presence_verfuegbar
            .store(verfuegbar, Ordering::Relaxed);
    }

    pub fn clients_setzen(&self, anzahl: u64) {
        self.inner.verbundene_clients.store(anzahl, Ordering::Relaxed);
    }

    /// Einbahnstrasse: nach dem Shutdown-Signal gibt es kein Zurueck
    pub fn draining_markieren(&self) {
        self.inner.draining.store(true, Ordering::Relaxed);
    }

    pub fn status(&self) -> HealthStatus {
        if self.inner.draining.load(Ordering::Relaxed) {
            HealthStatus::Unhealthy
        } else if self.presence_verfuegbar() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        }
    }

    pub fn bericht(&self) -> HealthResponse {
        HealthResponse {
            status: self.status(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.uptime_seconds(),
            presence_store_available: self.presence_verfuegbar(),
            connected_clients: self.inner.verbundene_clients.load(Ordering::Relaxed),
            draining: self.inner.draining.load(Ordering::Relaxed),
        }
    }
}

pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_abfragen))
        .with_state(state)
}

async fn health_abfragen(State(state): State<HealthState>) -> impl IntoResponse {
    let bericht = state.bericht();
    (bericht.status.http_status(), Json(bericht))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frischer_zustand_ist_healthy() {
        let state = HealthState::neu();
        assert!(state.uptime_seconds() < 5);
        assert_eq!(state.status(), HealthStatus::Healthy);
        assert_eq!(state.status().http_status(), StatusCode::OK);
    }

    #[test]
    fn store_ausfall_degradiert_und_erholt_sich() {
        let state = HealthState::neu();
        state.presence_status_setzen(false);
        let bericht = state.bericht();
        assert_eq!(bericht.status, HealthStatus::Degraded);
        assert!(!bericht.presence_store_available);
        assert_eq!(bericht.status.http_status(), StatusCode::OK);

        state.presence_status_setzen(true);
        assert_eq!(state.status(), HealthStatus::Healthy);
    }

    #[test]
    fn draining_schlaegt_alles() {
        let state = HealthState::neu();
        state.presence_status_setzen(false);
        state.draining_markieren();
        assert_eq!(state.status(), HealthStatus::Unhealthy);
        assert_eq!(state.status().http_status(), StatusCode::SERVICE_UNAVAILABLE);

        state.presence_status_setzen(true);
        assert_eq!(state.status(), HealthStatus::Unhealthy);
    }

    #[test]
    fn klone_teilen_zustand_und_json_ist_snake_case() {
        let state = HealthState::neu();
        state.clone().clients_setzen(7);

        let json = serde_json::to_value(state.bericht()).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["connected_clients"], 7);
        assert_eq!(json["presence_store_available"], true);
        assert_eq!(json["draining"], false);
    }
}
