//! Message-Dispatcher – verarbeitet Befehle einer aktiven Verbindung
//!
//! Der Dispatcher dekodiert einen Client-Frame, ruft den passenden Handler
//! auf und reiht die Antwort in die Send-Queue der Verbindung ein.
//!
//! ## Fehlerklassen
//! - Ungueltiger Frame oder unbekannter Entitaetstyp: `error`-Antwort,
//!   die Verbindung bleibt offen
//! - Rueckgabe `Err`: Handler-Fehler, der Aufrufer schliesst die Verbindung

use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tally_core::rooms::{entitaets_raum, entitaetstyp_raum};
use tally_core::{EntitaetsTyp, EntityId, TenantId};
use tally_protocol::{befehl_dekodieren, AbonnementAnfrage, ClientBefehl, ErrorCode, ServerNachricht};

use crate::connection::Verbindung;
use crate::error::{SignalingError, SignalingResult};
use crate::server_state::RealtimeState;

/// Zentraler Message-Dispatcher einer Verbindung
pub struct MessageDispatcher {
    state: Arc<RealtimeState>,
}

impl MessageDispatcher {
    pub fn neu(state: Arc<RealtimeState>) -> Self {
        Self { state }
    }

    /// Verarbeitet einen Text-Frame
    pub async fn frame_verarbeiten(&self, verbindung: &Verbindung, text: &str) -> SignalingResult<()> {
        match befehl_dekodieren(text) {
            Ok(befehl) => self.dispatch(verbindung, befehl).await,
            Err(e) => {
                tracing::debug!(connection_id = %verbindung.id, fehler = %e, "Ungueltiger Client-Frame");
                self.antworten(
                    verbindung,
                    &ServerNachricht::error(ErrorCode::InvalidRequest, "Invalid command"),
                )
            }
        }
    }

    /// Binaer-Frames sind im Protokoll nicht vorgesehen
    pub fn binaer_ablehnen(&self, verbindung: &Verbindung) -> SignalingResult<()> {
        self.antworten(
            verbindung,
            &ServerNachricht::error(ErrorCode::InvalidRequest, "Binary frames are not supported"),
        )
    }

    async fn dispatch(&self, verbindung: &Verbindung, befehl: ClientBefehl) -> SignalingResult<()> {
        tracing::trace!(connection_id = %verbindung.id, befehl = befehl.name(), "Befehl empfangen");
        match befehl {
            ClientBefehl::Heartbeat => self.heartbeat(verbindung).await,
            ClientBefehl::Subscribe(anfrage) => self.abonnieren(verbindung, &anfrage),
            ClientBefehl::Unsubscribe(anfrage) => self.abbestellen(verbindung, &anfrage),
        }
    }

    // -----------------------------------------------------------------------
    // Handler
    // -----------------------------------------------------------------------

    /// Heartbeat: erneuert nur die Presence-TTLs
    async fn heartbeat(&self, verbindung: &Verbindung) -> SignalingResult<()> {
        let id = &verbindung.identitaet;
        if let Err(e) = self
            .state
            .presence
            .last_seen_aktualisieren(&id.tenant_id, &id.user_id, verbindung.id)
            .await
        {
            self.state.presence_fehler(&e, "last_seen_aktualisieren");
        }
        self.antworten(verbindung, &ServerNachricht::heartbeat_ack())
    }

    fn abonnieren(&self, verbindung: &Verbindung, anfrage: &AbonnementAnfrage) -> SignalingResult<()> {
        let raum = match abonnement_raum(&verbindung.identitaet.tenant_id, anfrage) {
            Ok(raum) => raum,
            Err((code, meldung)) => {
                return self.antworten(verbindung, &ServerNachricht::error(code, meldung));
            }
        };
        match self.state.broadcaster.raum_beitreten(verbindung.id, &raum) {
            Ok(()) => {
                tracing::debug!(connection_id = %verbindung.id, raum = %raum, "Abonniert");
                self.antworten(verbindung, &ServerNachricht::abonniert(anfrage))
            }
            Err(SignalingError::ZugriffVerweigert(_)) => self.antworten(
                verbindung,
                &ServerNachricht::error(ErrorCode::Forbidden, "Access denied"),
            ),
            Err(e) => Err(e),
        }
    }

    fn abbestellen(&self, verbindung: &Verbindung, anfrage: &AbonnementAnfrage) -> SignalingResult<()> {
        let raum = match abonnement_raum(&verbindung.identitaet.tenant_id, anfrage) {
            Ok(raum) => raum,
            Err((code, meldung)) => {
                return self.antworten(verbindung, &ServerNachricht::error(code, meldung));
            }
        };
        self.state.broadcaster.raum_verlassen(verbindung.id, &raum);
        tracing::debug!(connection_id = %verbindung.id, raum = %raum, "Abbestellt");
        self.antworten(verbindung, &ServerNachricht::abbestellt(anfrage))
    }

    fn antworten(&self, verbindung: &Verbindung, nachricht: &ServerNachricht) -> SignalingResult<()> {
        if self.state.broadcaster.nachricht_senden(verbindung.id, nachricht) {
            Ok(())
        } else {
            Err(SignalingError::SendFehler(format!(
                "Antwort an {} nicht zustellbar",
                verbindung.id
            )))
        }
    }
}

/// Loest eine Abonnement-Anfrage in eine Raum-Adresse des eigenen Tenants auf
///
/// Der Tenant stammt immer aus der Identitaet der Verbindung, nie aus der
/// Anfrage.
pub fn abonnement_raum(
    tenant: &TenantId,
    anfrage: &AbonnementAnfrage,
) -> Result<String, (ErrorCode, &'static str)> {
    let typ: EntitaetsTyp = anfrage
        .entity_type
        .parse()
        .map_err(|_| (ErrorCode::Forbidden, "Entity type not allowed"))?;
    match &anfrage.entity_id {
        Some(id) => {
            let id = EntityId::neu(id.as_str())
                .map_err(|_| (ErrorCode::InvalidRequest, "Invalid entity id"))?;
            Ok(entitaets_raum(tenant, typ, &id))
        }
        None => Ok(entitaetstyp_raum(tenant, typ)),
    }
}

/// Fuehrt einen Handler aus und faengt Panics als [`SignalingError::HandlerFehler`]
pub async fn abgesichert<F, T>(handler: F) -> SignalingResult<T>
where
    F: Future<Output = SignalingResult<T>>,
{
    match AssertUnwindSafe(handler).catch_unwind().await {
        Ok(ergebnis) => ergebnis,
        Err(panik) => {
            let meldung = panik
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panik.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unbekannte Panik".to_string());
            Err(SignalingError::handler(meldung))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> TenantId {
        TenantId::neu("acme").unwrap()
    }

    fn anfrage(typ: &str, id: Option<&str>) -> AbonnementAnfrage {
        AbonnementAnfrage {
            entity_type: typ.to_string(),
            entity_id: id.map(str::to_string),
        }
    }

    #[test]
    fn raum_fuer_entitaet_und_typ() {
        assert_eq!(
            abonnement_raum(&tenant(), &anfrage("account", Some("a1"))).unwrap(),
            "tenant:acme:entity:account:a1"
        );
        assert_eq!(
            abonnement_raum(&tenant(), &anfrage("card", None)).unwrap(),
            "tenant:acme:entity:card"
        );
    }

    #[test]
    fn unbekannter_typ_ist_verboten() {
        let (code, _) = abonnement_raum(&tenant(), &anfrage("invoice", None)).unwrap_err();
        assert_eq!(code, ErrorCode::Forbidden);
    }

    #[test]
    fn ungueltige_id_ist_ungueltige_anfrage() {
        // Ein ':' in der ID wuerde sonst eine fremde Raum-Adresse erzeugen
        let (code, _) =
            abonnement_raum(&tenant(), &anfrage("account", Some("x:tenant:other"))).unwrap_err();
        assert_eq!(code, ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn panik_wird_zu_handler_fehler() {
        let ergebnis = abgesichert(async {
            if true {
                panic!("kaputt");
            }
            Ok::<(), SignalingError>(())
        })
        .await;
        match ergebnis {
            Err(SignalingError::HandlerFehler(meldung)) => assert_eq!(meldung, "kaputt"),
            sonst => panic!("unerwartet: {sonst:?}"),
        }

        let ok = abgesichert(async { Ok::<u8, SignalingError>(7) }).await;
        assert_eq!(ok.unwrap(), 7);
    }
}
