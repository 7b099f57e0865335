//! Event-Broadcaster – stellt Domain-Events an die Verbindungen der
//! Ziel-Raeume zu
//!
//! Der Broadcaster verwaltet die Send-Queues aller verbundenen Clients und
//! die Raum-Mitgliedschaften. Produzenten rufen nur [`EventBroadcaster::publish`]
//! auf; welche Raeume ein Ereignis erreicht, entscheidet die Taxonomie
//! (`EventType::klasse`), nicht der Produzent.
//!
//! ## Zustellung
//! - Jeder Frame wird einmal kodiert und als `Arc<str>` geteilt
//! - Vor jeder Aussendung wird der Tenant des Raums gegen den Tenant des
//!   Empfaengers geprueft
//! - `LOW`-Events werden verworfen sobald die freie Queue-Kapazitaet unter
//!   die Reserve faellt
//! - Ist die Queue fuer ein `NORMAL`+ Event voll, wird der Client als
//!   langsam markiert und getrennt

use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tally_core::rooms::{
    admin_raum, benachrichtigungs_raum, benutzer_raum, entitaets_raum, entitaetstyp_raum,
    tenant_raum, tenant_zugriff_pruefen,
};
use tally_core::{ConnectionId, TenantId, UserId};
use tally_observability::TallyMetriken;
use tally_protocol::events::RaumKlasse;
use tally_protocol::{
    ereignis_kodieren, nachricht_kodieren, validieren, DomainEvent, Prioritaet, ServerNachricht,
    TenantBereich,
};
use tokio::sync::{mpsc, Notify};

use crate::error::{SignalingError, SignalingResult};

// ---------------------------------------------------------------------------
// Konfiguration
// ---------------------------------------------------------------------------

/// Konfiguration der Send-Queues
#[derive(Debug, Clone)]
pub struct BroadcastKonfig {
    /// Groesse der Send-Queue pro Verbindung
    pub send_queue_groesse: usize,
    /// Freie Kapazitaet in Prozent, unter der `LOW`-Events verworfen werden
    pub low_reserve_prozent: u8,
}

impl Default for BroadcastKonfig {
    fn default() -> Self {
        Self {
            send_queue_groesse: 256,
            low_reserve_prozent: 25,
        }
    }
}

impl BroadcastKonfig {
    /// Reserve in Queue-Plaetzen (aufgerundet)
    fn reserve(&self) -> usize {
        let prozent = usize::from(self.low_reserve_prozent.min(100));
        (self.send_queue_groesse * prozent).div_ceil(100)
    }
}

// ---------------------------------------------------------------------------
// ClientSender
// ---------------------------------------------------------------------------

/// Ergebnis eines Zustellversuchs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Zustellung {
    Eingereiht,
    Verworfen,
    Langsam,
    Geschlossen,
}

/// Handle auf die Send-Queue einer verbundenen Verbindung
#[derive(Debug)]
struct ClientSender {
    tenant_id: TenantId,
    user_id: UserId,
    tx: mpsc::Sender<Arc<str>>,
    trennen: Arc<Notify>,
    raeume: HashSet<String>,
}

impl ClientSender {
    /// Reiht einen Frame nicht-blockierend ein
    fn senden(&self, frame: &Arc<str>, prioritaet: Prioritaet, reserve: usize) -> Zustellung {
        if prioritaet.verwerfbar() && self.tx.capacity() < reserve {
            return Zustellung::Verworfen;
        }
        match self.tx.try_send(Arc::clone(frame)) {
            Ok(()) => Zustellung::Eingereiht,
            Err(mpsc::error::TrySendError::Full(_)) if prioritaet.verwerfbar() => {
                Zustellung::Verworfen
            }
            Err(mpsc::error::TrySendError::Full(_)) => Zustellung::Langsam,
            Err(mpsc::error::TrySendError::Closed(_)) => Zustellung::Geschlossen,
        }
    }
}

/// Empfangsseite einer registrierten Verbindung
///
/// Die Verbindung liest ihre Frames aus `rx` und beendet sich, sobald
/// `trennen` signalisiert wird.
pub struct ClientEmpfaenger {
    pub rx: mpsc::Receiver<Arc<str>>,
    pub trennen: Arc<Notify>,
}

// ---------------------------------------------------------------------------
// EventBroadcaster
// ---------------------------------------------------------------------------

/// Zentraler Event-Broadcaster fuer alle verbundenen Clients
///
/// Thread-safe via Arc + DashMap. Clone teilt den inneren Zustand.
#[derive(Clone)]
pub struct EventBroadcaster {
    inner: Arc<EventBroadcasterInner>,
}

struct EventBroadcasterInner {
    konfig: BroadcastKonfig,
    metriken: TallyMetriken,
    /// Client-Sender, indiziert nach ConnectionId
    clients: DashMap<ConnectionId, ClientSender>,
    /// Raum-Mitgliedschaft: Adresse -> Verbindungen
    raeume: DashMap<String, HashSet<ConnectionId>>,
}

impl EventBroadcaster {
    pub fn neu(konfig: BroadcastKonfig, metriken: TallyMetriken) -> Self {
        Self {
            inner: Arc::new(EventBroadcasterInner {
                konfig,
                metriken,
                clients: DashMap::new(),
                raeume: DashMap::new(),
            }),
        }
    }

    /// Registriert eine Verbindung und gibt ihre Empfangs-Queue zurueck
    pub fn client_registrieren(
        &self,
        conn: ConnectionId,
        tenant_id: TenantId,
        user_id: UserId,
    ) -> ClientEmpfaenger {
        let (tx, rx) = mpsc::channel(self.inner.konfig.send_queue_groesse.max(1));
        let trennen = Arc::new(Notify::new());
        self.inner.clients.insert(
            conn,
            ClientSender {
                tenant_id,
                user_id,
                tx,
                trennen: Arc::clone(&trennen),
                raeume: HashSet::new(),
            },
        );
        self.inner.metriken.connected_clients.inc();
        tracing::debug!(connection_id = %conn, "Client im Broadcaster registriert");
        ClientEmpfaenger { rx, trennen }
    }

    /// Entfernt eine Verbindung samt aller Raum-Mitgliedschaften
    ///
    /// Idempotent: gibt `false` zurueck wenn die Verbindung nicht (mehr)
    /// registriert war.
    pub fn client_entfernen(&self, conn: ConnectionId) -> bool {
        let Some((_, sender)) = self.inner.clients.remove(&conn) else {
            return false;
        };
        for raum in &sender.raeume {
            self.aus_raum_austragen(raum, conn);
        }
        self.inner.metriken.connected_clients.dec();
        tracing::debug!(connection_id = %conn, raeume = sender.raeume.len(), "Client aus Broadcaster entfernt");
        true
    }

    /// Tritt einem Raum bei
    ///
    /// Der Raum muss zum Tenant der Verbindung gehoeren.
    pub fn raum_beitreten(&self, conn: ConnectionId, raum: &str) -> SignalingResult<()> {
        {
            let mut sender = self
                .inner
                .clients
                .get_mut(&conn)
                .ok_or_else(|| SignalingError::SendFehler(format!("{conn} nicht registriert")))?;
            if !tenant_zugriff_pruefen(raum, &sender.tenant_id) {
                tracing::warn!(
                    connection_id = %conn,
                    tenant_id = %sender.tenant_id,
                    raum = %raum,
                    "Raum-Beitritt verweigert: fremder Tenant"
                );
                return Err(SignalingError::zugriff_verweigert(raum));
            }
            sender.raeume.insert(raum.to_string());
        }

        self.inner
            .raeume
            .entry(raum.to_string())
            .or_default()
            .insert(conn);

        // Parallel entfernt: Mitgliedschaft wieder austragen
        if !self.inner.clients.contains_key(&conn) {
            self.aus_raum_austragen(raum, conn);
        }
        Ok(())
    }

    /// Verlaesst einen Raum; `false` wenn die Verbindung nicht Mitglied war
    pub fn raum_verlassen(&self, conn: ConnectionId, raum: &str) -> bool {
        let war_mitglied = self
            .inner
            .clients
            .get_mut(&conn)
            .map(|mut s| s.raeume.remove(raum))
            .unwrap_or(false);
        self.aus_raum_austragen(raum, conn);
        war_mitglied
    }

    fn aus_raum_austragen(&self, raum: &str, conn: ConnectionId) {
        if let Some(mut mitglieder) = self.inner.raeume.get_mut(raum) {
            mitglieder.remove(&conn);
        }
        self.inner.raeume.remove_if(raum, |_, m| m.is_empty());
    }

    // -----------------------------------------------------------------------
    // Publish
    // -----------------------------------------------------------------------

    /// Veroeffentlicht ein Domain-Event an alle Verbindungen der Ziel-Raeume
    ///
    /// Gibt die Anzahl der Verbindungen zurueck, fuer die das Event
    /// eingereiht wurde.
    pub fn publish(&self, event: &DomainEvent) -> usize {
        self.publish_intern(event, None)
    }

    /// Wie [`Self::publish`], schliesst aber eine Verbindung aus
    /// (z.B. den Ausloeser von `USER_JOINED`)
    pub fn publish_ausser(&self, event: &DomainEvent, ausgeschlossen: ConnectionId) -> usize {
        self.publish_intern(event, Some(ausgeschlossen))
    }

    /// Validiert ein untypisiertes Event und veroeffentlicht es
    pub fn publish_roh(&self, roh: &Value) -> SignalingResult<usize> {
        match validieren(roh) {
            Ok(event) => Ok(self.publish(&event)),
            Err(e) => {
                tracing::warn!(fehler = %e, "Ungueltiges Domain-Event verworfen");
                Err(SignalingError::Validierung(e))
            }
        }
    }

    fn publish_intern(&self, event: &DomainEvent, ausgeschlossen: Option<ConnectionId>) -> usize {
        let event_type = event.event_type();
        let frame: Arc<str> = match ereignis_kodieren(event) {
            Ok(text) => text.into(),
            Err(e) => {
                tracing::error!(event_type = %event_type, fehler = %e, "Event-Kodierung fehlgeschlagen");
                return 0;
            }
        };

        // Jede Verbindung genau einmal, auch wenn sie in mehreren Zielraeumen ist
        let mut empfaenger: Vec<(ConnectionId, String)> = Vec::new();
        let mut gesehen = HashSet::new();
        for raum in ziel_raeume(event) {
            let Some(mitglieder) = self.inner.raeume.get(&raum) else {
                continue;
            };
            for conn in mitglieder.iter() {
                if Some(*conn) != ausgeschlossen && gesehen.insert(*conn) {
                    empfaenger.push((*conn, raum.clone()));
                }
            }
        }

        let prioritaet = event.prioritaet();
        let gesendet = empfaenger
            .iter()
            .filter(|(conn, raum)| self.zustellen(*conn, Some(raum), &frame, prioritaet))
            .count();

        self.inner.metriken.event_zaehlen(event_type.as_str());
        tracing::debug!(
            tenant_id = %event.tenant_id,
            event_type = %event_type,
            empfaenger = gesendet,
            "Event veroeffentlicht"
        );
        gesendet
    }

    // -----------------------------------------------------------------------
    // Private Zustellung
    // -----------------------------------------------------------------------

    /// Sendet ein Domain-Event nur an eine Verbindung (z.B. `ONLINE_USERS`)
    pub fn an_verbindung_senden(&self, conn: ConnectionId, event: &DomainEvent) -> bool {
        if !self.gleicher_tenant(conn, &event.tenant_id) {
            tracing::warn!(
                connection_id = %conn,
                tenant_id = %event.tenant_id,
                "Private Zustellung verweigert: fremder Tenant"
            );
            return false;
        }
        match ereignis_kodieren(event) {
            Ok(text) => self.zustellen(conn, None, &text.into(), event.prioritaet()),
            Err(e) => {
                tracing::error!(fehler = %e, "Event-Kodierung fehlgeschlagen");
                false
            }
        }
    }

    /// Sendet eine Steuernachricht an eine Verbindung
    pub fn nachricht_senden(&self, conn: ConnectionId, nachricht: &ServerNachricht) -> bool {
        match nachricht_kodieren(nachricht) {
            Ok(text) => self.zustellen(conn, None, &text.into(), Prioritaet::Normal),
            Err(e) => {
                tracing::error!(fehler = %e, "Nachricht-Kodierung fehlgeschlagen");
                false
            }
        }
    }

    fn gleicher_tenant(&self, conn: ConnectionId, tenant: &TenantId) -> bool {
        self.inner
            .clients
            .get(&conn)
            .is_some_and(|s| &s.tenant_id == tenant)
    }

    /// Reiht einen Frame fuer eine Verbindung ein
    ///
    /// Mit `raum` wird vorher der Tenant des Raums gegen den Empfaenger
    /// geprueft.
    fn zustellen(
        &self,
        conn: ConnectionId,
        raum: Option<&str>,
        frame: &Arc<str>,
        prioritaet: Prioritaet,
    ) -> bool {
        let ergebnis = {
            let Some(sender) = self.inner.clients.get(&conn) else {
                return false;
            };
            if let Some(raum) = raum {
                if !tenant_zugriff_pruefen(raum, &sender.tenant_id) {
                    tracing::warn!(
                        connection_id = %conn,
                        tenant_id = %sender.tenant_id,
                        raum = %raum,
                        "Zustellung verweigert: Raum gehoert zu fremdem Tenant"
                    );
                    return false;
                }
            }
            let ergebnis = sender.senden(frame, prioritaet, self.inner.konfig.reserve());
            if ergebnis == Zustellung::Langsam {
                tracing::warn!(
                    connection_id = %conn,
                    tenant_id = %sender.tenant_id,
                    user_id = %sender.user_id,
                    prioritaet = prioritaet.as_str(),
                    "Send-Queue voll – langsamer Client wird getrennt"
                );
                sender.trennen.notify_one();
            }
            ergebnis
        };

        match ergebnis {
            Zustellung::Eingereiht => true,
            Zustellung::Verworfen => {
                self.inner.metriken.verworfen_zaehlen(prioritaet.as_str());
                tracing::debug!(connection_id = %conn, "LOW-Event unter Backpressure verworfen");
                false
            }
            Zustellung::Langsam => {
                self.inner.metriken.slow_consumers_total.inc();
                self.client_entfernen(conn);
                false
            }
            Zustellung::Geschlossen => {
                tracing::debug!(connection_id = %conn, "Send-Queue geschlossen (Client getrennt)");
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Abfragen
    // -----------------------------------------------------------------------

    /// Gibt die Anzahl der registrierten Verbindungen zurueck
    pub fn client_anzahl(&self) -> usize {
        self.inner.clients.len()
    }

    pub fn ist_registriert(&self, conn: ConnectionId) -> bool {
        self.inner.clients.contains_key(&conn)
    }

    /// Raeume, denen eine Verbindung beigetreten ist
    pub fn raeume_von(&self, conn: ConnectionId) -> Vec<String> {
        let mut raeume: Vec<String> = self
            .inner
            .clients
            .get(&conn)
            .map(|s| s.raeume.iter().cloned().collect())
            .unwrap_or_default();
        raeume.sort();
        raeume
    }

    /// Anzahl der Verbindungen in einem Raum
    pub fn mitglieder_anzahl(&self, raum: &str) -> usize {
        self.inner.raeume.get(raum).map(|m| m.len()).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Ziel-Aufloesung
// ---------------------------------------------------------------------------

/// Loest ein Event ueber seine Raum-Klasse in Ziel-Raeume auf
pub fn ziel_raeume(event: &DomainEvent) -> Vec<String> {
    let tenant = &event.tenant_id;
    match event.klasse() {
        RaumKlasse::Tenant(TenantBereich::Alle) => vec![tenant_raum(tenant)],
        RaumKlasse::Tenant(TenantBereich::Admin) => vec![admin_raum(tenant)],
        RaumKlasse::Tenant(TenantBereich::Benachrichtigungen) => {
            vec![benachrichtigungs_raum(tenant)]
        }
        RaumKlasse::Benutzer => {
            let ziel = event.daten.ziel_benutzer().unwrap_or(&event.user_id);
            vec![benutzer_raum(tenant, ziel)]
        }
        // Finanzdaten sind Tenant-Zustand: jede Verbindung des Tenants sieht
        // sie, Abonnements grenzen nur Clients ohne Tenant-Raum ein
        RaumKlasse::Entitaet(typ) => {
            let mut raeume = Vec::with_capacity(3);
            if let Some(id) = event.daten.entitaets_id() {
                raeume.push(entitaets_raum(tenant, typ, id));
            }
            raeume.push(entitaetstyp_raum(tenant, typ));
            raeume.push(tenant_raum(tenant));
            raeume
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tally_core::{EntitaetsTyp, EntityId};
    use tally_protocol::events::{
        EventDaten, KategorieDaten, KontostandDaten, PresenceAenderung, RollenDaten,
    };
    use tally_protocol::ErrorCode;

    fn t(id: &str) -> TenantId {
        TenantId::neu(id).unwrap()
    }

    fn u(id: &str) -> UserId {
        UserId::neu(id).unwrap()
    }

    fn broadcaster(send_queue_groesse: usize) -> EventBroadcaster {
        EventBroadcaster::neu(
            BroadcastKonfig {
                send_queue_groesse,
                low_reserve_prozent: 25,
            },
            TallyMetriken::neu().unwrap(),
        )
    }

    fn kontostand(tenant: &str, konto: &str) -> DomainEvent {
        DomainEvent::neu(
            t(tenant),
            u("producer"),
            EventDaten::AccountBalanceUpdated(KontostandDaten {
                account_id: EntityId::neu(konto).unwrap(),
                previous_balance: 100.0,
                new_balance: 150.0,
                currency: None,
            }),
        )
    }

    fn beigetreten(tenant: &str, user: &str) -> DomainEvent {
        DomainEvent::neu(
            t(tenant),
            u(user),
            EventDaten::UserJoined(PresenceAenderung {
                user_id: u(user),
                email: format!("{user}@example.org"),
                role: tally_core::Rolle::Member,
                timestamp: chrono::Utc::now(),
            }),
        )
    }

    fn kategorie_geaendert(tenant: &str) -> DomainEvent {
        DomainEvent::neu(
            t(tenant),
            u("producer"),
            EventDaten::CategoryUpdated(KategorieDaten {
                category_id: EntityId::neu("c1").unwrap(),
                name: None,
                parent_id: None,
            }),
        )
    }

    fn frame(rx: &mut mpsc::Receiver<Arc<str>>) -> Value {
        serde_json::from_str(&rx.try_recv().expect("Frame erwartet")).unwrap()
    }

    #[test]
    fn reserve_wird_aufgerundet() {
        let konfig = BroadcastKonfig {
            send_queue_groesse: 10,
            low_reserve_prozent: 25,
        };
        assert_eq!(konfig.reserve(), 3);
        assert_eq!(BroadcastKonfig::default().reserve(), 64);
    }

    #[test]
    fn ziel_raeume_nach_klasse() {
        let raeume = ziel_raeume(&kontostand("T", "a1"));
        assert_eq!(
            raeume,
            vec![
                entitaets_raum(&t("T"), EntitaetsTyp::Account, &EntityId::neu("a1").unwrap()),
                entitaetstyp_raum(&t("T"), EntitaetsTyp::Account),
                tenant_raum(&t("T")),
            ]
        );

        assert_eq!(ziel_raeume(&beigetreten("T", "a")), vec![tenant_raum(&t("T"))]);

        let rolle = DomainEvent::neu(
            t("T"),
            u("admin"),
            EventDaten::UserRoleChanged(RollenDaten {
                target_user_id: u("ziel"),
                previous_role: None,
                new_role: tally_core::Rolle::Admin,
            }),
        );
        assert_eq!(ziel_raeume(&rolle), vec![benutzer_raum(&t("T"), &u("ziel"))]);
    }

    #[tokio::test]
    async fn fremder_raum_wird_abgelehnt() {
        let b = broadcaster(8);
        let conn = ConnectionId::new();
        let _empfaenger = b.client_registrieren(conn, t("T1"), u("a"));

        assert!(b.raum_beitreten(conn, &tenant_raum(&t("T1"))).is_ok());
        let fehler = b.raum_beitreten(conn, &tenant_raum(&t("T2"))).unwrap_err();
        assert!(matches!(fehler, SignalingError::ZugriffVerweigert(_)));
        assert!(b.raum_beitreten(conn, "kein:raum").is_err());
        assert_eq!(b.raeume_von(conn), vec![tenant_raum(&t("T1"))]);
    }

    #[tokio::test]
    async fn kontostand_erreicht_abonnenten_und_tenant_genau_einmal() {
        let b = broadcaster(8);
        let (abonnent, nur_tenant, ohne_raum, fremd) = (
            ConnectionId::new(),
            ConnectionId::new(),
            ConnectionId::new(),
            ConnectionId::new(),
        );
        let mut rx_abonnent = b.client_registrieren(abonnent, t("T"), u("a")).rx;
        let mut rx_tenant = b.client_registrieren(nur_tenant, t("T"), u("b")).rx;
        let mut rx_ohne = b.client_registrieren(ohne_raum, t("T"), u("d")).rx;
        let mut rx_fremd = b.client_registrieren(fremd, t("T2"), u("c")).rx;

        let konto = EntityId::neu("a1").unwrap();
        // Abonnent sitzt in allen drei Zielraeumen
        b.raum_beitreten(abonnent, &tenant_raum(&t("T"))).unwrap();
        b.raum_beitreten(abonnent, &entitaets_raum(&t("T"), EntitaetsTyp::Account, &konto))
            .unwrap();
        b.raum_beitreten(abonnent, &entitaetstyp_raum(&t("T"), EntitaetsTyp::Account))
            .unwrap();
        b.raum_beitreten(nur_tenant, &tenant_raum(&t("T"))).unwrap();
        b.raum_beitreten(fremd, &tenant_raum(&t("T2"))).unwrap();
        b.raum_beitreten(fremd, &entitaets_raum(&t("T2"), EntitaetsTyp::Account, &konto))
            .unwrap();

        assert_eq!(b.publish(&kontostand("T", "a1")), 2);

        let json = frame(&mut rx_abonnent);
        assert_eq!(json["event"], "ACCOUNT_BALANCE_UPDATED");
        assert_eq!(json["data"]["data"]["newBalance"], 150.0);
        assert!(rx_abonnent.try_recv().is_err());
        assert_eq!(frame(&mut rx_tenant)["data"]["tenantId"], "T");
        assert!(rx_ohne.try_recv().is_err());
        assert!(rx_fremd.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_ausser_ueberspringt_ausloeser() {
        let b = broadcaster(8);
        let (c1, c2) = (ConnectionId::new(), ConnectionId::new());
        let mut rx1 = b.client_registrieren(c1, t("T"), u("a")).rx;
        let mut rx2 = b.client_registrieren(c2, t("T"), u("b")).rx;
        b.raum_beitreten(c1, &tenant_raum(&t("T"))).unwrap();
        b.raum_beitreten(c2, &tenant_raum(&t("T"))).unwrap();

        assert_eq!(b.publish_ausser(&beigetreten("T", "a"), c1), 1);
        assert!(rx1.try_recv().is_err());
        assert_eq!(frame(&mut rx2)["data"]["userId"], "a");
    }

    #[tokio::test]
    async fn publish_roh_validiert() {
        let b = broadcaster(8);
        let fehler = b
            .publish_roh(&json!({ "eventType": "NICHT_DA", "tenantId": "T", "userId": "u", "timestamp": 0 }))
            .unwrap_err();
        assert!(matches!(fehler, SignalingError::Validierung(_)));

        let conn = ConnectionId::new();
        let mut rx = b.client_registrieren(conn, t("T"), u("a")).rx;
        b.raum_beitreten(conn, &entitaetstyp_raum(&t("T"), EntitaetsTyp::Account))
            .unwrap();
        let anzahl = b
            .publish_roh(&json!({
                "eventType": "ACCOUNT_BALANCE_UPDATED",
                "tenantId": "T",
                "userId": "u",
                "timestamp": "2024-05-01T12:00:00Z",
                "data": { "accountId": "a1", "previousBalance": 100, "newBalance": 150 },
                "metadata": { "source": "api", "internalTrace": "geheim" }
            }))
            .unwrap();
        assert_eq!(anzahl, 1);
        let json = frame(&mut rx);
        assert_eq!(json["data"]["metadata"]["source"], "api");
        assert!(json["data"]["metadata"].get("internalTrace").is_none());
    }

    #[tokio::test]
    async fn low_events_werden_unter_reserve_verworfen() {
        let b = broadcaster(8); // Reserve: 2 Plaetze
        let conn = ConnectionId::new();
        let mut rx = b.client_registrieren(conn, t("T"), u("a")).rx;
        b.raum_beitreten(conn, &tenant_raum(&t("T"))).unwrap();

        for _ in 0..7 {
            assert_eq!(b.publish(&beigetreten("T", "x")), 1);
        }
        // Nur noch 1 Platz frei: LOW wird verworfen, die Kategorie-Aenderung
        // (NORMAL) bekommt den letzten Platz
        assert_eq!(b.publish(&beigetreten("T", "y")), 0);
        assert_eq!(b.publish(&kategorie_geaendert("T")), 1);
        assert_eq!(b.publish(&beigetreten("T", "z")), 0);
        assert_eq!(b.inner.metriken.events_dropped_total.with_label_values(&["LOW"]).get(), 2);
        assert!(b.ist_registriert(conn));

        let mut frames = Vec::new();
        while let Ok(f) = rx.try_recv() {
            frames.push(f);
        }
        assert_eq!(frames.len(), 8);
        assert!(frames[7].contains("CATEGORY_UPDATED"));
    }

    #[tokio::test]
    async fn volle_queue_trennt_langsamen_client() {
        let b = broadcaster(2);
        let conn = ConnectionId::new();
        let empfaenger = b.client_registrieren(conn, t("T"), u("a"));
        b.raum_beitreten(conn, &entitaetstyp_raum(&t("T"), EntitaetsTyp::Account))
            .unwrap();

        assert_eq!(b.publish(&kontostand("T", "a1")), 1);
        assert_eq!(b.publish(&kontostand("T", "a1")), 1);
        // HIGH-Event bei voller Queue: nie still verwerfen, sondern trennen
        assert_eq!(b.publish(&kontostand("T", "a1")), 0);

        assert!(!b.ist_registriert(conn));
        assert_eq!(b.mitglieder_anzahl(&entitaetstyp_raum(&t("T"), EntitaetsTyp::Account)), 0);
        assert_eq!(b.inner.metriken.slow_consumers_total.get(), 1);
        // Signal bleibt gespeichert bis die Verbindung es abholt
        tokio::time::timeout(std::time::Duration::from_secs(1), empfaenger.trennen.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn private_zustellung_prueft_tenant() {
        let b = broadcaster(4);
        let conn = ConnectionId::new();
        let mut rx = b.client_registrieren(conn, t("T1"), u("a")).rx;

        assert!(!b.an_verbindung_senden(conn, &kontostand("T2", "a1")));
        assert!(rx.try_recv().is_err());
        assert!(b.an_verbindung_senden(conn, &kontostand("T1", "a1")));
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn entfernen_raeumt_raeume_auf() {
        let b = broadcaster(4);
        let conn = ConnectionId::new();
        let _e = b.client_registrieren(conn, t("T"), u("a"));
        b.raum_beitreten(conn, &tenant_raum(&t("T"))).unwrap();
        b.raum_beitreten(conn, &benutzer_raum(&t("T"), &u("a"))).unwrap();
        assert_eq!(b.client_anzahl(), 1);

        assert!(b.client_entfernen(conn));
        assert!(!b.client_entfernen(conn));
        assert_eq!(b.client_anzahl(), 0);
        assert_eq!(b.mitglieder_anzahl(&tenant_raum(&t("T"))), 0);
        assert!(b.inner.raeume.is_empty());
        assert_eq!(b.inner.metriken.connected_clients.get(), 0);
    }
}
