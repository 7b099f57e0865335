//! Client-Connection – Lebenszyklus einer einzelnen Verbindung
//!
//! Jede WebSocket-Verbindung bekommt eine `ClientConnection` in einem
//! eigenen tokio-Task. Der Transport ist abstrahiert: eingehend ein
//! `Stream<Item = Eingang>`, ausgehend ein `Sink<String>`.
//!
//! ## State Machine
//! ```text
//! Unauthentifiziert -> Aktiv -> Trennend -> Geschlossen
//! ```
//! `Geschlossen` ist terminal. Eine neue physische Verbindung ergibt immer
//! eine neue [`Verbindung`] mit neuer ID.
//!
//! ## Freigabe
//! Die Presence-Abmeldung laeuft auf jedem Pfad: nach regulaerem Ende,
//! nach einem Handler-Fehler und auch wenn der Task abgebrochen wird
//! (dann per Drop-Guard im Hintergrund).

use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::sync::Arc;
use tally_core::rooms::{admin_raum, benachrichtigungs_raum, benutzer_raum, tenant_raum};
use tally_core::{ConnectionId, Identitaet};
use tally_presence::PresenceDaten;
use tally_protocol::events::{EventDaten, PresenceAenderung};
use tally_protocol::{nachricht_kodieren, DomainEvent, ErrorCode, ServerNachricht};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::broadcast::ClientEmpfaenger;
use crate::dispatcher::{abgesichert, MessageDispatcher};
use crate::server_state::RealtimeState;

// ---------------------------------------------------------------------------
// Typen
// ---------------------------------------------------------------------------

/// Eingehender Transport-Frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eingang {
    Text(String),
    Binaer,
    Geschlossen,
}

/// Zustand der Verbindung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerbindungsZustand {
    Unauthentifiziert,
    Aktiv,
    Trennend,
    Geschlossen,
}

impl VerbindungsZustand {
    pub fn uebergang_erlaubt(self, nach: Self) -> bool {
        use VerbindungsZustand::*;
        matches!(
            (self, nach),
            (Unauthentifiziert, Aktiv)
                | (Unauthentifiziert, Geschlossen)
                | (Aktiv, Trennend)
                | (Trennend, Geschlossen)
        )
    }
}

/// Grund fuer das Ende der Verbindungsschleife
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trennungsgrund {
    Client,
    Transport,
    Timeout,
    LangsamerClient,
    HandlerFehler,
    Shutdown,
}

/// Typisierter Verbindungswert, einmal beim Handshake-Abschluss gebaut
#[derive(Debug, Clone)]
pub struct Verbindung {
    pub id: ConnectionId,
    pub identitaet: Identitaet,
    pub verbunden_seit: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// ClientConnection
// ---------------------------------------------------------------------------

pub struct ClientConnection {
    state: Arc<RealtimeState>,
    zustand: VerbindungsZustand,
}

impl ClientConnection {
    pub fn neu(state: Arc<RealtimeState>) -> Self {
        Self {
            state,
            zustand: VerbindungsZustand::Unauthentifiziert,
        }
    }

    pub fn zustand(&self) -> VerbindungsZustand {
        self.zustand
    }

    fn zustand_setzen(&mut self, conn: ConnectionId, nach: VerbindungsZustand) {
        if !self.zustand.uebergang_erlaubt(nach) {
            tracing::error!(connection_id = %conn, von = ?self.zustand, nach = ?nach, "Unerlaubter Zustandswechsel");
        }
        tracing::trace!(connection_id = %conn, von = ?self.zustand, nach = ?nach, "Zustandswechsel");
        self.zustand = nach;
    }

    /// Betreibt die Verbindung bis zur Trennung
    ///
    /// `identitaet` stammt aus der bestandenen Pruefkette des Handshakes.
    pub async fn verarbeiten<E, A>(
        mut self,
        identitaet: Identitaet,
        mut eingang: E,
        mut ausgang: A,
        mut shutdown: watch::Receiver<bool>,
    ) -> Trennungsgrund
    where
        E: Stream<Item = Eingang> + Unpin,
        A: Sink<String> + Unpin,
        A::Error: std::fmt::Display,
    {
        let verbindung = Verbindung {
            id: ConnectionId::new(),
            identitaet,
            verbunden_seit: Utc::now(),
        };
        let conn = verbindung.id;
        let freigabe = Freigabe {
            state: Arc::clone(&self.state),
            verbindung: verbindung.clone(),
            erledigt: false,
        };

        let ClientEmpfaenger { mut rx, trennen } = self.aktivieren(&verbindung).await;
        self.zustand_setzen(conn, VerbindungsZustand::Aktiv);

        let dispatcher = MessageDispatcher::neu(Arc::clone(&self.state));
        let timeout = self.state.config.verbindungs_timeout;
        let mut letzter_empfang = Instant::now();

        let grund = loop {
            if *shutdown.borrow() {
                break Trennungsgrund::Shutdown;
            }

            tokio::select! {
                // Eingehende Frames, in Empfangsreihenfolge verarbeitet
                eingehend = eingang.next() => match eingehend {
                    Some(Eingang::Text(text)) => {
                        letzter_empfang = Instant::now();
                        if let Err(e) = abgesichert(dispatcher.frame_verarbeiten(&verbindung, &text)).await {
                            tracing::error!(connection_id = %conn, fehler = %e, "Handler-Fehler – Verbindung wird geschlossen");
                            let fehler = ServerNachricht::error(ErrorCode::InternalError, "Internal error");
                            if let Ok(frame) = nachricht_kodieren(&fehler) {
                                let _ = ausgang.send(frame).await;
                            }
                            break Trennungsgrund::HandlerFehler;
                        }
                    }
                    Some(Eingang::Binaer) => {
                        letzter_empfang = Instant::now();
                        if dispatcher.binaer_ablehnen(&verbindung).is_err() {
                            break Trennungsgrund::HandlerFehler;
                        }
                    }
                    Some(Eingang::Geschlossen) | None => break Trennungsgrund::Client,
                },

                // Ausgehende Frames aus dem Broadcaster
                Some(frame) = rx.recv() => {
                    if let Err(e) = ausgang.send(frame.to_string()).await {
                        tracing::debug!(connection_id = %conn, fehler = %e, "Senden fehlgeschlagen");
                        break Trennungsgrund::Transport;
                    }
                }

                _ = trennen.notified() => break Trennungsgrund::LangsamerClient,

                _ = tokio::time::sleep_until(letzter_empfang + timeout) => {
                    tracing::info!(connection_id = %conn, "Verbindungs-Timeout");
                    break Trennungsgrund::Timeout;
                }

                Ok(()) = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break Trennungsgrund::Shutdown;
                    }
                }
            }
        };

        self.zustand_setzen(conn, VerbindungsZustand::Trennend);
        tracing::info!(
            connection_id = %conn,
            tenant_id = %verbindung.identitaet.tenant_id,
            user_id = %verbindung.identitaet.user_id,
            grund = ?grund,
            "Verbindung wird getrennt"
        );

        if grund == Trennungsgrund::Shutdown {
            let abschied = ServerNachricht::error(ErrorCode::InternalError, "Server shutting down");
            if let Ok(frame) = nachricht_kodieren(&abschied) {
                let _ = ausgang.send(frame).await;
            }
        }

        drop(rx);
        freigabe.ausfuehren().await;
        let _ = ausgang.close().await;
        self.zustand_setzen(conn, VerbindungsZustand::Geschlossen);
        grund
    }

    /// Raeume beitreten, Presence setzen, Join melden, Snapshot senden
    async fn aktivieren(&self, verbindung: &Verbindung) -> ClientEmpfaenger {
        let state = &self.state;
        let id = &verbindung.identitaet;
        let empfaenger = state.broadcaster.client_registrieren(
            verbindung.id,
            id.tenant_id.clone(),
            id.user_id.clone(),
        );

        for raum in start_raeume(id) {
            if let Err(e) = state.broadcaster.raum_beitreten(verbindung.id, &raum) {
                tracing::warn!(connection_id = %verbindung.id, raum = %raum, fehler = %e, "Raum-Beitritt fehlgeschlagen");
            }
        }
        state.health_aktualisieren();

        if let Err(e) = state
            .presence
            .user_online_setzen(&id.tenant_id, &id.user_id, verbindung.id, PresenceDaten::from(id))
            .await
        {
            state.presence_fehler(&e, "user_online_setzen");
        }

        state
            .broadcaster
            .publish_ausser(&presence_ereignis(id, true), verbindung.id);

        match state.presence.online_benutzer(&id.tenant_id).await {
            Ok(liste) => {
                let snapshot = DomainEvent::neu(
                    id.tenant_id.clone(),
                    id.user_id.clone(),
                    EventDaten::OnlineUsers(liste),
                );
                state.broadcaster.an_verbindung_senden(verbindung.id, &snapshot);
            }
            Err(e) => state.presence_fehler(&e, "online_benutzer"),
        }

        tracing::info!(
            connection_id = %verbindung.id,
            tenant_id = %id.tenant_id,
            user_id = %id.user_id,
            rolle = %id.role,
            "Verbindung aktiv"
        );
        empfaenger
    }
}

/// Raeume, denen jede Verbindung beim Aktivieren beitritt
pub fn start_raeume(identitaet: &Identitaet) -> Vec<String> {
    let t = &identitaet.tenant_id;
    let mut raeume = vec![
        tenant_raum(t),
        benutzer_raum(t, &identitaet.user_id),
        benachrichtigungs_raum(t),
    ];
    if identitaet.role.ist_admin() {
        raeume.push(admin_raum(t));
    }
    raeume
}

fn presence_ereignis(identitaet: &Identitaet, beigetreten: bool) -> DomainEvent {
    let aenderung = PresenceAenderung {
        user_id: identitaet.user_id.clone(),
        email: identitaet.email.clone(),
        role: identitaet.role,
        timestamp: Utc::now(),
    };
    let daten = if beigetreten {
        EventDaten::UserJoined(aenderung)
    } else {
        EventDaten::UserLeft(aenderung)
    };
    DomainEvent::neu(identitaet.tenant_id.clone(), identitaet.user_id.clone(), daten)
}

// ---------------------------------------------------------------------------
// Freigabe
// ---------------------------------------------------------------------------

/// Drop-Guard fuer die Abmeldung einer Verbindung
struct Freigabe {
    state: Arc<RealtimeState>,
    verbindung: Verbindung,
    erledigt: bool,
}

impl Freigabe {
    async fn ausfuehren(mut self) {
        verbindung_freigeben(&self.state, &self.verbindung).await;
        self.erledigt = true;
    }
}

impl Drop for Freigabe {
    fn drop(&mut self) {
        if self.erledigt {
            return;
        }
        let state = Arc::clone(&self.state);
        let verbindung = self.verbindung.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!(connection_id = %verbindung.id, "Verbindungs-Task abgebrochen – Freigabe im Hintergrund");
                handle.spawn(async move { verbindung_freigeben(&state, &verbindung).await });
            }
            Err(_) => {
                state.broadcaster.client_entfernen(verbindung.id);
                tracing::error!(connection_id = %verbindung.id, "Keine Runtime – Presence-Abmeldung entfaellt");
            }
        }
    }
}

/// Meldet eine Verbindung ab
///
/// `USER_LEFT` geht nur raus, wenn es die letzte Verbindung der Identitaet
/// war.
async fn verbindung_freigeben(state: &RealtimeState, verbindung: &Verbindung) {
    let id = &verbindung.identitaet;
    state.broadcaster.client_entfernen(verbindung.id);
    state.health_aktualisieren();

    match state
        .presence
        .verbindung_entfernen(&id.tenant_id, &id.user_id, verbindung.id)
        .await
    {
        Ok(true) => {
            tracing::debug!(connection_id = %verbindung.id, user_id = %id.user_id, "Weitere Verbindungen der Identitaet aktiv");
        }
        Ok(false) => {
            state.broadcaster.publish(&presence_ereignis(id, false));
            tracing::info!(tenant_id = %id.tenant_id, user_id = %id.user_id, "Identitaet offline");
        }
        Err(e) => state.presence_fehler(&e, "verbindung_entfernen"),
    }

    state.gatekeeper.trennung_melden(id);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
