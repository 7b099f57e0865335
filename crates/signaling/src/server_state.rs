//! Gemeinsamer Server-Zustand fuer den Realtime-Kern
//!
//! Explizites Kontext-Objekt: wird einmal beim Start gebaut und in
//! Handshake, Verbindungen und Hintergrund-Tasks gereicht. Es gibt keine
//! globalen Singletons; Tests bauen sich ihren eigenen Zustand mit
//! In-Memory-Store und statischem Verifier.

use std::sync::Arc;
use std::time::Duration;
use tally_auth::Gatekeeper;
use tally_observability::{HealthState, TallyMetriken};
use tally_presence::{PresenceError, PresenceManager};

use crate::broadcast::{BroadcastKonfig, EventBroadcaster};

/// Konfiguration fuer den Realtime-Kern
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Maximale gleichzeitige Verbindungen (danach `503`)
    pub max_verbindungen: usize,
    /// Pfad der WebSocket-Route
    pub ws_pfad: String,
    /// Trennung nach so langer Funkstille des Clients
    pub verbindungs_timeout: Duration,
    /// Verbindungen ohne Heartbeat seit dieser Dauer gelten als veraltet
    pub stale_nach: Duration,
    /// Intervall der Stale-Bereinigung
    pub bereinigung_intervall: Duration,
    /// Intervall des Presence-Rebroadcasts
    pub rebroadcast_intervall: Duration,
    pub broadcast: BroadcastKonfig,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            max_verbindungen: 10_000,
            ws_pfad: "/ws".to_string(),
            verbindungs_timeout: Duration::from_secs(90),
            stale_nach: Duration::from_secs(120),
            bereinigung_intervall: Duration::from_secs(60),
            rebroadcast_intervall: Duration::from_secs(30),
            broadcast: BroadcastKonfig::default(),
        }
    }
}

/// Gemeinsamer Zustand (thread-safe, Arc-geteilt)
pub struct RealtimeState {
    pub config: Arc<RealtimeConfig>,
    /// Presence-Manager (wer ist online)
    pub presence: PresenceManager,
    /// Event-Broadcaster (Raeume und Send-Queues)
    pub broadcaster: EventBroadcaster,
    /// Pruefkette fuer neue Verbindungen
    pub gatekeeper: Gatekeeper,
    pub metriken: TallyMetriken,
    pub health: HealthState,
}

impl RealtimeState {
    pub fn neu(
        config: RealtimeConfig,
        presence: PresenceManager,
        gatekeeper: Gatekeeper,
        metriken: TallyMetriken,
    ) -> Arc<Self> {
        let broadcaster = EventBroadcaster::neu(config.broadcast.clone(), metriken.clone());
        Arc::new(Self {
            config: Arc::new(config),
            presence,
            broadcaster,
            gatekeeper,
            metriken,
            health: HealthState::neu(),
        })
    }

    /// Protokolliert einen Presence-Fehler
    ///
    /// Presence ist best-effort: Fehler werden gezaehlt und geloggt, aber nie
    /// an den Aufrufer weitergereicht.
    pub fn presence_fehler(&self, fehler: &PresenceError, vorgang: &'static str) {
        self.metriken.presence_store_errors_total.inc();
        self.health.presence_status_setzen(false);
        tracing::warn!(vorgang, fehler = %fehler, "Presence-Operation fehlgeschlagen");
    }

    /// Schreibt die Client-Anzahl in den Health-Zustand
    pub fn health_aktualisieren(&self) {
        self.health
            .clients_setzen(self.broadcaster.client_anzahl() as u64);
    }
}
