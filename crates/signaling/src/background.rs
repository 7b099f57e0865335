//! Hintergrund-Tasks – Stale-Bereinigung und Presence-Rebroadcast
//!
//! Beide Schleifen laufen in festen Intervallen bis zum Shutdown-Signal.
//! Fehler werden pro Durchlauf (und beim Rebroadcast pro Tenant)
//! abgefangen; ein fehlerhafter Tenant haelt die anderen nicht auf.

use std::sync::Arc;
use std::time::Duration;
use tally_core::UserId;
use tally_presence::BereinigungsBericht;
use tally_protocol::{DomainEvent, EventDaten};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::server_state::RealtimeState;

/// Startet Bereinigung und Rebroadcast als eigene Tasks
pub fn hintergrund_tasks_starten(
    state: Arc<RealtimeState>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(bereinigungs_schleife(Arc::clone(&state), shutdown.clone())),
        tokio::spawn(rebroadcast_schleife(state, shutdown)),
    ]
}

async fn bereinigungs_schleife(state: Arc<RealtimeState>, shutdown: watch::Receiver<bool>) {
    let intervall = state.config.bereinigung_intervall;
    periodisch("bereinigung", intervall, shutdown, move || {
        let state = Arc::clone(&state);
        async move {
            bereinigung_ausfuehren(&state).await;
        }
    })
    .await;
}

async fn rebroadcast_schleife(state: Arc<RealtimeState>, shutdown: watch::Receiver<bool>) {
    let intervall = state.config.rebroadcast_intervall;
    periodisch("rebroadcast", intervall, shutdown, move || {
        let state = Arc::clone(&state);
        async move {
            rebroadcast_ausfuehren(&state).await;
        }
    })
    .await;
}

/// Fuehrt `durchlauf` alle `intervall` aus, bis `shutdown` auf `true` steht
///
/// Der erste Durchlauf erfolgt nach einem vollen Intervall.
async fn periodisch<F, Fut>(
    name: &'static str,
    intervall: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut durchlauf: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + intervall, intervall);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::debug!(task = name, intervall_sek = intervall.as_secs(), "Hintergrund-Task gestartet");

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => durchlauf().await,
            ergebnis = shutdown.changed() => {
                if ergebnis.is_err() {
                    break;
                }
            }
        }
    }
    tracing::debug!(task = name, "Hintergrund-Task beendet");
}

/// Ein Durchlauf der Stale-Bereinigung
///
/// Prueft dabei auch die Store-Verbindung und setzt den Health-Status.
pub async fn bereinigung_ausfuehren(state: &RealtimeState) -> Option<BereinigungsBericht> {
    let verfuegbar = state.presence.store_pruefen().await;
    state.health.presence_status_setzen(verfuegbar);
    if !verfuegbar {
        state.metriken.presence_store_errors_total.inc();
        tracing::warn!("Presence-Store nicht erreichbar – Bereinigung uebersprungen");
        return None;
    }

    match state
        .presence
        .stale_verbindungen_bereinigen(state.config.stale_nach)
        .await
    {
        Ok(bericht) => {
            tracing::debug!(
                verbindungen = bericht.verbindungen,
                benutzer = bericht.benutzer,
                fehlgeschlagene_tenants = bericht.fehlgeschlagene_tenants,
                "Bereinigung abgeschlossen"
            );
            Some(bericht)
        }
        Err(e) => {
            state.presence_fehler(&e, "stale_verbindungen_bereinigen");
            None
        }
    }
}

/// Ein Durchlauf des Rebroadcasts: `ONLINE_USERS_UPDATED` pro aktivem Tenant
///
/// Gibt die Anzahl der Tenants zurueck, fuer die gesendet wurde.
pub async fn rebroadcast_ausfuehren(state: &RealtimeState) -> usize {
    let tenants = match state.presence.aktive_tenants().await {
        Ok(tenants) => tenants,
        Err(e) => {
            state.presence_fehler(&e, "aktive_tenants");
            return 0;
        }
    };

    let mut gesendet = 0;
    for tenant in tenants {
        match state.presence.online_benutzer(&tenant).await {
            Ok(liste) => {
                let event = DomainEvent::neu(
                    tenant.clone(),
                    UserId::system(),
                    EventDaten::OnlineUsersUpdated(liste),
                );
                let empfaenger = state.broadcaster.publish(&event);
                tracing::trace!(tenant_id = %tenant, empfaenger, "Presence-Rebroadcast");
                gesendet += 1;
            }
            Err(e) => {
                tracing::warn!(tenant_id = %tenant, fehler = %e, "Rebroadcast fuer Tenant fehlgeschlagen");
                state.metriken.presence_store_errors_total.inc();
            }
        }
    }
    gesendet
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
