//! tally-server – Bibliotheks-Root
//!
//! Verdrahtet Konfiguration, Presence, Gatekeeper und den Realtime-Kern
//! und stellt den oeffentlichen Einstiegspunkt fuer Tests bereit.

pub mod config;

use anyhow::{Context, Result};
use axum::Router;
use config::{PresenceBackend, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tally_auth::{Gatekeeper, StatischerTokenVerifier};
use tally_observability::{
    observability_router, observability_server_starten, request_timing_layer, timing_middleware,
    TallyMetriken,
};
use tally_presence::{PresenceManager, PresenceStore, RedisStore, SpeicherStore};
use tally_signaling::{
    hintergrund_tasks_starten, intern_router, realtime_router, RealtimeState, INTERN_EVENTS_PFAD,
};
use tokio::sync::watch;

/// Maximale Wartezeit auf das Abmelden aller Verbindungen beim Shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Haelt den laufenden Server-Zustand zusammen
pub struct Server {
    pub config: ServerConfig,
}

impl Server {
    /// Erstellt einen neuen Server aus der gegebenen Konfiguration
    pub fn neu(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Baut das Kontext-Objekt aus der Konfiguration
    pub fn state_bauen(&self, metriken: TallyMetriken) -> Result<Arc<RealtimeState>> {
        let tokens = self.config.auth.tokens.clone();
        if tokens.is_empty() {
            tracing::warn!("Keine Tokens konfiguriert – jeder Handshake wird abgelehnt");
        }
        let verifier = StatischerTokenVerifier::neu(tokens);
        tracing::info!(tokens = verifier.anzahl(), "Token-Verifier geladen");

        let presence = PresenceManager::neu(self.presence_store()?, self.config.presence_config());
        let gatekeeper = Gatekeeper::neu(&self.config.rate_limit_konfig(), Arc::new(verifier));
        Ok(RealtimeState::neu(
            self.config.realtime_config(),
            presence,
            gatekeeper,
            metriken,
        ))
    }

    fn presence_store(&self) -> Result<Arc<dyn PresenceStore>> {
        match self.config.presence.backend {
            PresenceBackend::Speicher => {
                tracing::info!("Presence-Store: prozesslokal");
                Ok(Arc::new(SpeicherStore::neu()))
            }
            PresenceBackend::Redis => {
                let url = self
                    .config
                    .presence
                    .url
                    .as_deref()
                    .context("presence.url fehlt fuer backend = \"redis\"")?;
                let store = RedisStore::neu(url).context("Ungueltige Redis-URL")?;
                tracing::info!("Presence-Store: Redis");
                Ok(Arc::new(store))
            }
        }
    }

    /// Startet alle Subsysteme und laeuft bis zum Shutdown-Signal
    ///
    /// Reihenfolge:
    /// 1. Metriken und Kontext-Objekt bauen
    /// 2. Observability-Server starten (falls aktiviert)
    /// 3. Hintergrund-Tasks starten
    /// 4. WebSocket-Listener starten
    /// 5. Auf Ctrl-C / SIGTERM warten, dann alles ueber den Watch-Kanal beenden
    pub async fn starten(self) -> Result<()> {
        let metriken = TallyMetriken::neu().context("Metriken konnten nicht registriert werden")?;
        let state = self.state_bauen(metriken)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tracing::info!(
            server_name = %self.config.server.name,
            ws = %self.config.ws_bind_adresse(),
            pfad = %self.config.netzwerk.ws_pfad,
            "Server startet"
        );

        let observability = match self.config.observability_bind_adresse() {
            Some(adresse) => {
                let addr: SocketAddr = adresse
                    .parse()
                    .with_context(|| format!("Ungueltige Observability-Adresse '{adresse}'"))?;
                let intern = intern_app(Arc::clone(&state));
                let rx = shutdown_rx.clone();
                tracing::info!(adresse = %addr, pfad = INTERN_EVENTS_PFAD, "Interner Publish-Eingang aktiv");
                Some(tokio::spawn(async move {
                    if let Err(e) = observability_server_starten(addr, intern, rx).await {
                        tracing::error!(fehler = %e, "Observability-Server beendet");
                    }
                }))
            }
            None => None,
        };

        let hintergrund = hintergrund_tasks_starten(Arc::clone(&state), shutdown_rx.clone());

        let listener = tokio::net::TcpListener::bind(self.config.ws_bind_adresse())
            .await
            .with_context(|| format!("Bind auf {} fehlgeschlagen", self.config.ws_bind_adresse()))?;
        tracing::info!(adresse = %self.config.ws_bind_adresse(), "WebSocket-Listener bereit");

        let app = app_router(Arc::clone(&state), shutdown_rx);
        let health = state.health.clone();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown-Signal empfangen, Server wird beendet");
            health.draining_markieren();
            let _ = shutdown_tx.send(true);
        })
        .await?;

        for task in hintergrund {
            let _ = task.await;
        }
        verbindungen_abwarten(&state).await;
        if let Some(task) = observability {
            let _ = task.await;
        }

        tracing::info!("Server beendet");
        Ok(())
    }
}

/// Router mit WebSocket-Route, Request-Metriken und Trace-Layer
pub fn app_router(state: Arc<RealtimeState>, shutdown: watch::Receiver<bool>) -> Router {
    let metriken = state.metriken.clone();
    realtime_router(state, shutdown)
        .layer(axum::middleware::from_fn_with_state(metriken, timing_middleware))
        .layer(request_timing_layer())
}

/// Interner Port: `/metrics`, `/health` und `POST /internal/events`
pub fn intern_app(state: Arc<RealtimeState>) -> Router {
    observability_router(state.metriken.clone(), state.health.clone()).merge(intern_router(state))
}

/// Wartet, bis alle Verbindungs-Tasks ihre Presence abgemeldet haben
async fn verbindungen_abwarten(state: &RealtimeState) {
    let ergebnis = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while state.broadcaster.client_anzahl() > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if ergebnis.is_err() {
        tracing::warn!(
            verbleibend = state.broadcaster.client_anzahl(),
            "Nicht alle Verbindungen rechtzeitig beendet"
        );
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(fehler = %e, "Ctrl-C-Handler nicht installierbar");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(fehler = %e, "SIGTERM-Handler nicht installierbar");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
