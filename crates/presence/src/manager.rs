//! Presence-Manager – Online/Offline-Buchfuehrung pro Identitaet
//!
//! ## Store-Layout
//! ```text
//! presence:{t}:{u}              Hash  connId -> {connectedAt, email, role, metadata}
//! presence:{t}:{u}:{connId}     Text  lastSeen (Epoch-ms), eigene TTL
//! presence:tenant:{t}:users     Set   aktive User-IDs des Tenants
//! presence:tenants              Set   Tenants mit mindestens einer Identitaet
//! ```
//!
//! Jede Mutation ist genau ein `atomar`-Block. Presence ist eventual
//! consistent und wird nie fuer Autorisierung verwendet.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tally_core::{ConnectionId, Identitaet, OnlineBenutzer, Rolle, TenantId, UserId};

use crate::error::PresenceResult;
use crate::store::{PresenceStore, StoreOp, StoreWert};

const REGISTRY_KEY: &str = "presence:tenants";

// ---------------------------------------------------------------------------
// Konfiguration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// TTL des Begleit-Keys pro Verbindung, wird per Heartbeat erneuert
    pub verbindungs_ttl: Duration,
    /// TTL des Aggregat-Hashes pro Identitaet
    pub presence_ttl: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            verbindungs_ttl: Duration::from_secs(90),
            presence_ttl: Duration::from_secs(300),
        }
    }
}

// ---------------------------------------------------------------------------
// Datentypen
// ---------------------------------------------------------------------------

/// Daten, die beim Online-Setzen pro Verbindung abgelegt werden
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceDaten {
    pub email: String,
    pub role: Rolle,
    pub metadata: Option<Value>,
}

impl From<&Identitaet> for PresenceDaten {
    fn from(identitaet: &Identitaet) -> Self {
        Self {
            email: identitaet.email.clone(),
            role: identitaet.role,
            metadata: None,
        }
    }
}

/// Hash-Feldwert pro Verbindung
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerbindungsEintrag {
    connected_at: DateTime<Utc>,
    email: String,
    role: Rolle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<Value>,
}

/// Ergebnis eines Bereinigungslaufs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BereinigungsBericht {
    /// Entfernte Verbindungen
    pub verbindungen: usize,
    /// Identitaeten ohne verbleibende Verbindung
    pub benutzer: usize,
    /// Tenants, deren Bereinigung fehlschlug
    pub fehlgeschlagene_tenants: usize,
}

// ---------------------------------------------------------------------------
// Schluessel
// ---------------------------------------------------------------------------

fn presence_key(tenant: &TenantId, user: &UserId) -> String {
    format!("presence:{tenant}:{user}")
}

fn verbindungs_praefix(tenant: &TenantId, user: &UserId) -> String {
    format!("presence:{tenant}:{user}:")
}

fn verbindungs_key(tenant: &TenantId, user: &UserId, feld: &str) -> String {
    format!("{}{feld}", verbindungs_praefix(tenant, user))
}

fn index_key(tenant: &TenantId) -> String {
    format!("presence:tenant:{tenant}:users")
}

/// Hash-Feld einer Verbindung (UUID ohne `conn:`-Praefix)
fn feld(conn: ConnectionId) -> String {
    conn.inner().to_string()
}

// ---------------------------------------------------------------------------
// PresenceManager
// ---------------------------------------------------------------------------

/// Zentraler Presence-Manager
///
/// Thread-safe via Arc, kann geklont werden.
#[derive(Clone)]
pub struct PresenceManager {
    inner: Arc<PresenceManagerInner>,
}

struct PresenceManagerInner {
    store: Arc<dyn PresenceStore>,
    config: PresenceConfig,
    /// Ergebnis der letzten Store-Operation
    verfuegbar: AtomicBool,
}

impl PresenceManager {
    pub fn neu(store: Arc<dyn PresenceStore>, config: PresenceConfig) -> Self {
        Self {
            inner: Arc::new(PresenceManagerInner {
                store,
                config,
                verfuegbar: AtomicBool::new(true),
            }),
        }
    }

    /// Ob die letzte Store-Operation erfolgreich war
    pub fn store_verfuegbar(&self) -> bool {
        self.inner.verfuegbar.load(Ordering::Relaxed)
    }

    /// Prueft die Store-Verbindung aktiv
    pub async fn store_pruefen(&self) -> bool {
        self.beobachten(self.inner.store.ping().await).is_ok()
    }

    fn beobachten<T>(&self, ergebnis: PresenceResult<T>) -> PresenceResult<T> {
        self.inner.verfuegbar.store(ergebnis.is_ok(), Ordering::Relaxed);
        ergebnis
    }

    async fn atomar(&self, ops: Vec<StoreOp>) -> PresenceResult<Vec<StoreWert>> {
        let ergebnis = self.inner.store.atomar(ops).await;
        self.beobachten(ergebnis)
    }

    // -----------------------------------------------------------------------
    // Mutationen
    // -----------------------------------------------------------------------

    /// Registriert eine Verbindung als online
    ///
    /// Idempotent: ein wiederholter Aufruf fuer dieselbe Verbindung erneuert
    /// nur die TTLs, `connectedAt` bleibt erhalten.
    pub async fn user_online_setzen(
        &self,
        tenant: &TenantId,
        user: &UserId,
        conn: ConnectionId,
        daten: PresenceDaten,
    ) -> PresenceResult<()> {
        let jetzt = Utc::now();
        let eintrag = serde_json::to_string(&VerbindungsEintrag {
            connected_at: jetzt,
            email: daten.email,
            role: daten.role,
            metadata: daten.metadata,
        })?;
        let hash = presence_key(tenant, user);

        self.atomar(vec![
            StoreOp::HashSetzenFallsNeu {
                key: hash.clone(),
                feld: feld(conn),
                wert: eintrag,
            },
            StoreOp::Ablauf {
                key: hash,
                ttl: self.inner.config.presence_ttl,
            },
            StoreOp::Setzen {
                key: verbindungs_key(tenant, user, &feld(conn)),
                wert: jetzt.timestamp_millis().to_string(),
                ttl: Some(self.inner.config.verbindungs_ttl),
            },
            StoreOp::SetHinzufuegen {
                key: index_key(tenant),
                mitglied: user.to_string(),
            },
            StoreOp::SetHinzufuegen {
                key: REGISTRY_KEY.into(),
                mitglied: tenant.to_string(),
            },
        ])
        .await?;

        tracing::debug!(tenant_id = %tenant, user_id = %user, connection_id = %conn, "Presence gesetzt");
        Ok(())
    }

    /// Entfernt eine Verbindung
    ///
    /// Gibt `true` zurueck solange noch mindestens eine lebende Verbindung
    /// der Identitaet existiert, sonst `false`. Mit einer bereits entfernten
    /// Verbindung aufgerufen: `false` (sofern keine andere mehr lebt).
    pub async fn verbindung_entfernen(
        &self,
        tenant: &TenantId,
        user: &UserId,
        conn: ConnectionId,
    ) -> PresenceResult<bool> {
        let hash = presence_key(tenant, user);
        let index = index_key(tenant);

        let ergebnis = self
            .atomar(vec![
                StoreOp::HashEntfernen {
                    key: hash.clone(),
                    feld: feld(conn),
                },
                StoreOp::Loeschen {
                    key: verbindungs_key(tenant, user, &feld(conn)),
                },
                StoreOp::VerwaisteFelderEntfernen {
                    key: hash.clone(),
                    praefix: verbindungs_praefix(tenant, user),
                },
                StoreOp::SetEntfernenFallsLeer {
                    key: index.clone(),
                    mitglied: user.to_string(),
                    pruef_key: hash.clone(),
                },
                StoreOp::SetEntfernenFallsLeer {
                    key: REGISTRY_KEY.into(),
                    mitglied: tenant.to_string(),
                    pruef_key: index,
                },
                StoreOp::HashLaenge { key: hash },
            ])
            .await?;

        let verbleibend = ergebnis.last().and_then(StoreWert::zahl).unwrap_or(0);
        tracing::debug!(
            tenant_id = %tenant,
            user_id = %user,
            connection_id = %conn,
            verbleibend,
            "Verbindung aus Presence entfernt"
        );
        Ok(verbleibend > 0)
    }

    /// Heartbeat: erneuert nur die TTLs
    pub async fn last_seen_aktualisieren(
        &self,
        tenant: &TenantId,
        user: &UserId,
        conn: ConnectionId,
    ) -> PresenceResult<()> {
        self.atomar(vec![
            StoreOp::Setzen {
                key: verbindungs_key(tenant, user, &feld(conn)),
                wert: Utc::now().timestamp_millis().to_string(),
                ttl: Some(self.inner.config.verbindungs_ttl),
            },
            StoreOp::Ablauf {
                key: presence_key(tenant, user),
                ttl: self.inner.config.presence_ttl,
            },
        ])
        .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Abfragen
    // -----------------------------------------------------------------------

    /// Alle online-Identitaeten eines Tenants
    ///
    /// Selbstheilend: Index-Eintraege ohne lebende Verbindung werden
    /// uebersprungen und entfernt. Veraltete Daten sind nie ein Fehler.
    pub async fn online_benutzer(&self, tenant: &TenantId) -> PresenceResult<Vec<OnlineBenutzer>> {
        let mitglieder = self
            .beobachten(self.inner.store.set_mitglieder(&index_key(tenant)).await)?;

        let mut online = Vec::with_capacity(mitglieder.len());
        for mitglied in mitglieder {
            let Ok(user) = UserId::neu(&mitglied) else {
                tracing::warn!(tenant_id = %tenant, mitglied = %mitglied, "Ungueltige User-ID im Presence-Index");
                self.index_eintrag_entfernen(tenant, &mitglied).await;
                continue;
            };

            let (lebend, tot) = self.verbindungen_lesen(tenant, &user).await?;
            if !tot.is_empty() || lebend.is_empty() {
                self.verbindungen_bereinigen(tenant, &user, &tot).await;
            }
            if let Some(eintrag) = aggregieren(user, &lebend) {
                online.push(eintrag);
            }
        }
        Ok(online)
    }

    /// Alle Tenants mit mindestens einer registrierten Identitaet
    ///
    /// Liest den Registry-Key, kein Scan ueber den Store.
    pub async fn aktive_tenants(&self) -> PresenceResult<Vec<TenantId>> {
        let mitglieder = self.beobachten(self.inner.store.set_mitglieder(REGISTRY_KEY).await)?;
        Ok(mitglieder
            .into_iter()
            .filter_map(|t| TenantId::neu(t).ok())
            .collect())
    }

    // -----------------------------------------------------------------------
    // Bereinigung
    // -----------------------------------------------------------------------

    /// Entfernt Verbindungen, deren `lastSeen` aelter als `max_alter` ist
    pub async fn stale_verbindungen_bereinigen(
        &self,
        max_alter: Duration,
    ) -> PresenceResult<BereinigungsBericht> {
        self.stale_verbindungen_bereinigen_zum(max_alter, Utc::now()).await
    }

    /// Wie [`Self::stale_verbindungen_bereinigen`] mit explizitem Zeitpunkt
    ///
    /// Fehler eines Tenants brechen den Lauf fuer andere Tenants nicht ab.
    pub async fn stale_verbindungen_bereinigen_zum(
        &self,
        max_alter: Duration,
        jetzt: DateTime<Utc>,
    ) -> PresenceResult<BereinigungsBericht> {
        let grenze = jetzt
            - chrono::Duration::from_std(max_alter).unwrap_or_else(|_| chrono::Duration::zero());
        let mut bericht = BereinigungsBericht::default();

        for tenant in self.aktive_tenants().await? {
            match self.tenant_bereinigen(&tenant, grenze).await {
                Ok((verbindungen, benutzer)) => {
                    bericht.verbindungen += verbindungen;
                    bericht.benutzer += benutzer;
                }
                Err(e) => {
                    bericht.fehlgeschlagene_tenants += 1;
                    tracing::warn!(tenant_id = %tenant, fehler = %e, "Presence-Bereinigung fehlgeschlagen");
                }
            }
        }

        if bericht.verbindungen > 0 {
            tracing::info!(
                verbindungen = bericht.verbindungen,
                benutzer = bericht.benutzer,
                "Veraltete Verbindungen bereinigt"
            );
        }
        Ok(bericht)
    }

    async fn tenant_bereinigen(
        &self,
        tenant: &TenantId,
        grenze: DateTime<Utc>,
    ) -> PresenceResult<(usize, usize)> {
        let index = index_key(tenant);
        let mut verbindungen = 0;
        let mut benutzer = 0;

        for mitglied in self.beobachten(self.inner.store.set_mitglieder(&index).await)? {
            let Ok(user) = UserId::neu(&mitglied) else {
                self.index_eintrag_entfernen(tenant, &mitglied).await;
                continue;
            };
            let (lebend, mut tot) = self.verbindungen_lesen(tenant, &user).await?;
            let (frisch, veraltet): (Vec<_>, Vec<_>) =
                lebend.into_iter().partition(|v| v.last_seen >= grenze);
            tot.extend(veraltet.into_iter().map(|v| v.feld));

            if tot.is_empty() && !frisch.is_empty() {
                continue;
            }
            let hash = presence_key(tenant, &user);
            let mut ops: Vec<StoreOp> = tot
                .iter()
                .flat_map(|f| {
                    [
                        StoreOp::HashEntfernen { key: hash.clone(), feld: f.clone() },
                        StoreOp::Loeschen { key: verbindungs_key(tenant, &user, f) },
                    ]
                })
                .collect();
            ops.push(StoreOp::SetEntfernenFallsLeer {
                key: index.clone(),
                mitglied: user.to_string(),
                pruef_key: hash,
            });
            let ergebnis = self.atomar(ops).await?;

            verbindungen += tot.len();
            if ergebnis.last().and_then(StoreWert::zahl) == Some(1) {
                benutzer += 1;
                tracing::debug!(tenant_id = %tenant, user_id = %user, "Identitaet ohne Verbindungen entfernt");
            }
        }

        self.atomar(vec![StoreOp::SetEntfernenFallsLeer {
            key: REGISTRY_KEY.into(),
            mitglied: tenant.to_string(),
            pruef_key: index,
        }])
        .await?;
        Ok((verbindungen, benutzer))
    }

    // -----------------------------------------------------------------------
    // Interne Hilfen
    // -----------------------------------------------------------------------

    /// Liest alle Verbindungen einer Identitaet
    ///
    /// Gibt lebende Verbindungen und die Felder toter Verbindungen (Begleit-Key
    /// abgelaufen oder Eintrag unlesbar) getrennt zurueck.
    async fn verbindungen_lesen(
        &self,
        tenant: &TenantId,
        user: &UserId,
    ) -> PresenceResult<(Vec<LebendeVerbindung>, Vec<String>)> {
        let hash = self.beobachten(self.inner.store.hash_alle(&presence_key(tenant, user)).await)?;
        let mut lebend = Vec::with_capacity(hash.len());
        let mut tot = Vec::new();

        for (feld, wert) in hash {
            let last_seen = self
                .beobachten(self.inner.store.holen(&verbindungs_key(tenant, user, &feld)).await)?
                .and_then(|ms| ms.parse::<i64>().ok())
                .and_then(DateTime::from_timestamp_millis);
            let eintrag = serde_json::from_str::<VerbindungsEintrag>(&wert);

            match (last_seen, eintrag) {
                (Some(last_seen), Ok(eintrag)) => lebend.push(LebendeVerbindung {
                    feld,
                    eintrag,
                    last_seen,
                }),
                (_, Err(e)) => {
                    tracing::warn!(tenant_id = %tenant, user_id = %user, fehler = %e, "Unlesbarer Presence-Eintrag");
                    tot.push(feld);
                }
                (None, Ok(_)) => tot.push(feld),
            }
        }
        Ok((lebend, tot))
    }

    /// Best-effort: entfernt tote Felder und ggf. den Index-Eintrag
    async fn verbindungen_bereinigen(&self, tenant: &TenantId, user: &UserId, tot: &[String]) {
        let hash = presence_key(tenant, user);
        let mut ops: Vec<StoreOp> = tot
            .iter()
            .map(|f| StoreOp::HashEntfernen { key: hash.clone(), feld: f.clone() })
            .collect();
        ops.push(StoreOp::SetEntfernenFallsLeer {
            key: index_key(tenant),
            mitglied: user.to_string(),
            pruef_key: hash,
        });
        if let Err(e) = self.atomar(ops).await {
            tracing::debug!(tenant_id = %tenant, user_id = %user, fehler = %e, "Presence-Selbstheilung fehlgeschlagen");
        }
    }

    async fn index_eintrag_entfernen(&self, tenant: &TenantId, mitglied: &str) {
        let ops = vec![StoreOp::SetEntfernenFallsLeer {
            key: index_key(tenant),
            mitglied: mitglied.to_string(),
            pruef_key: format!("presence:{tenant}:{mitglied}"),
        }];
        if let Err(e) = self.atomar(ops).await {
            tracing::debug!(tenant_id = %tenant, fehler = %e, "Index-Eintrag nicht entfernt");
        }
    }
}

struct LebendeVerbindung {
    feld: String,
    eintrag: VerbindungsEintrag,
    last_seen: DateTime<Utc>,
}

/// Verdichtet die lebenden Verbindungen einer Identitaet
fn aggregieren(user: UserId, verbindungen: &[LebendeVerbindung]) -> Option<OnlineBenutzer> {
    let erste = verbindungen.iter().min_by_key(|v| v.eintrag.connected_at)?;
    let last_seen = verbindungen.iter().map(|v| v.last_seen).max()?;
    Some(OnlineBenutzer {
        user_id: user,
        email: erste.eintrag.email.clone(),
        role: erste.eintrag.role,
        connected_at: erste.eintrag.connected_at,
        last_seen,
        connection_count: verbindungen.len(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AusfallStore, SpeicherStore};

    fn manager() -> (PresenceManager, Arc<SpeicherStore>) {
        let store = Arc::new(SpeicherStore::neu());
        (PresenceManager::neu(store.clone(), PresenceConfig::default()), store)
    }

    fn t(id: &str) -> TenantId {
        TenantId::neu(id).unwrap()
    }

    fn u(id: &str) -> UserId {
        UserId::neu(id).unwrap()
    }

    fn daten(role: Rolle) -> PresenceDaten {
        PresenceDaten {
            email: "a@example.org".into(),
            role,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn mehrere_verbindungen_einer_identitaet() {
        let (pm, _) = manager();
        let (c1, c2) = (ConnectionId::new(), ConnectionId::new());

        pm.user_online_setzen(&t("T"), &u("A"), c1, daten(Rolle::Member)).await.unwrap();
        pm.user_online_setzen(&t("T"), &u("A"), c2, daten(Rolle::Member)).await.unwrap();
        let online = pm.online_benutzer(&t("T")).await.unwrap();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].connection_count, 2);

        assert!(pm.verbindung_entfernen(&t("T"), &u("A"), c1).await.unwrap());
        let online = pm.online_benutzer(&t("T")).await.unwrap();
        assert_eq!(online[0].connection_count, 1);

        assert!(!pm.verbindung_entfernen(&t("T"), &u("A"), c2).await.unwrap());
        assert!(pm.online_benutzer(&t("T")).await.unwrap().is_empty());
        assert!(pm.aktive_tenants().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn entfernen_mit_veralteter_id_ist_idempotent() {
        let (pm, store) = manager();
        let c1 = ConnectionId::new();
        pm.user_online_setzen(&t("T"), &u("A"), c1, daten(Rolle::Member)).await.unwrap();

        assert!(!pm.verbindung_entfernen(&t("T"), &u("A"), c1).await.unwrap());
        assert!(!pm.verbindung_entfernen(&t("T"), &u("A"), c1).await.unwrap());
        assert!(!pm
            .verbindung_entfernen(&t("T"), &u("nie-da"), ConnectionId::new())
            .await
            .unwrap());
        assert_eq!(store.anzahl_keys(), 0);
    }

    #[tokio::test]
    async fn connected_at_bleibt_beim_erneuten_setzen() {
        let (pm, _) = manager();
        let c1 = ConnectionId::new();
        pm.user_online_setzen(&t("T"), &u("A"), c1, daten(Rolle::Admin)).await.unwrap();
        let vorher = pm.online_benutzer(&t("T")).await.unwrap()[0].connected_at;

        tokio::time::sleep(Duration::from_millis(5)).await;
        pm.user_online_setzen(&t("T"), &u("A"), c1, daten(Rolle::Admin)).await.unwrap();
        let online = pm.online_benutzer(&t("T")).await.unwrap();
        assert_eq!(online[0].connected_at, vorher);
        assert_eq!(online[0].connection_count, 1);
        assert_eq!(online[0].role, Rolle::Admin);
    }

    #[tokio::test]
    async fn gleichzeitige_verbindungen_verlieren_nichts() {
        let (pm, _) = manager();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let pm = pm.clone();
            handles.push(tokio::spawn(async move {
                pm.user_online_setzen(&t("T"), &u("A"), ConnectionId::new(), daten(Rolle::Member))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let online = pm.online_benutzer(&t("T")).await.unwrap();
        assert_eq!(online[0].connection_count, 16);
    }

    #[tokio::test]
    async fn tenants_sind_getrennt() {
        let (pm, _) = manager();
        pm.user_online_setzen(&t("T1"), &u("A"), ConnectionId::new(), daten(Rolle::Member))
            .await
            .unwrap();
        pm.user_online_setzen(&t("T2"), &u("B"), ConnectionId::new(), daten(Rolle::Member))
            .await
            .unwrap();

        let t1 = pm.online_benutzer(&t("T1")).await.unwrap();
        assert_eq!(t1.len(), 1);
        assert_eq!(t1[0].user_id, u("A"));

        let mut tenants = pm.aktive_tenants().await.unwrap();
        tenants.sort();
        assert_eq!(tenants, vec![t("T1"), t("T2")]);
    }

    #[tokio::test(start_paused = true)]
    async fn abgelaufene_verbindung_wird_beim_lesen_entfernt() {
        let (pm, _) = manager();
        pm.user_online_setzen(&t("T"), &u("A"), ConnectionId::new(), daten(Rolle::Member))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(91)).await;
        assert!(pm.online_benutzer(&t("T")).await.unwrap().is_empty());
        assert!(pm.inner.store.set_mitglieder(&index_key(&t("T"))).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_haelt_verbindung_am_leben() {
        let (pm, _) = manager();
        let c1 = ConnectionId::new();
        pm.user_online_setzen(&t("T"), &u("A"), c1, daten(Rolle::Member)).await.unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        pm.last_seen_aktualisieren(&t("T"), &u("A"), c1).await.unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;

        assert_eq!(pm.online_benutzer(&t("T")).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn entfernen_zaehlt_tote_geschwister_nicht() {
        let (pm, _) = manager();
        let (c1, c2) = (ConnectionId::new(), ConnectionId::new());
        pm.user_online_setzen(&t("T"), &u("A"), c1, daten(Rolle::Member)).await.unwrap();
        pm.user_online_setzen(&t("T"), &u("A"), c2, daten(Rolle::Member)).await.unwrap();

        // c1 sendet keine Heartbeats mehr
        tokio::time::advance(Duration::from_secs(60)).await;
        pm.last_seen_aktualisieren(&t("T"), &u("A"), c2).await.unwrap();
        tokio::time::advance(Duration::from_secs(40)).await;

        assert!(!pm.verbindung_entfernen(&t("T"), &u("A"), c2).await.unwrap());
    }

    #[tokio::test]
    async fn stale_bereinigung_entfernt_letzte_verbindung() {
        let (pm, _) = manager();
        pm.user_online_setzen(&t("T"), &u("A"), ConnectionId::new(), daten(Rolle::Member))
            .await
            .unwrap();
        pm.user_online_setzen(&t("T"), &u("B"), ConnectionId::new(), daten(Rolle::Member))
            .await
            .unwrap();

        // Nichts ist aelter als 5 Minuten
        let bericht = pm.stale_verbindungen_bereinigen(Duration::from_secs(300)).await.unwrap();
        assert_eq!(bericht.verbindungen, 0);
        assert_eq!(pm.online_benutzer(&t("T")).await.unwrap().len(), 2);

        let spaeter = Utc::now() + chrono::Duration::minutes(10);
        let bericht = pm
            .stale_verbindungen_bereinigen_zum(Duration::from_secs(300), spaeter)
            .await
            .unwrap();
        assert_eq!(bericht.verbindungen, 2);
        assert_eq!(bericht.benutzer, 2);
        assert!(pm.online_benutzer(&t("T")).await.unwrap().is_empty());
        assert!(pm.aktive_tenants().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ausgefallener_store_meldet_fehler() {
        let pm = PresenceManager::neu(Arc::new(AusfallStore), PresenceConfig::default());
        assert!(pm.store_verfuegbar());

        let ergebnis = pm
            .user_online_setzen(&t("T"), &u("A"), ConnectionId::new(), daten(Rolle::Member))
            .await;
        assert!(ergebnis.is_err());
        assert!(!pm.store_verfuegbar());
        assert!(!pm.store_pruefen().await);
    }

    #[tokio::test]
    async fn metadaten_werden_gespeichert() {
        let (pm, store) = manager();
        let c1 = ConnectionId::new();
        let mut d = daten(Rolle::Viewer);
        d.metadata = Some(serde_json::json!({ "device": "ios" }));
        pm.user_online_setzen(&t("T"), &u("A"), c1, d).await.unwrap();

        let hash = store.hash_alle(&presence_key(&t("T"), &u("A"))).await.unwrap();
        let eintrag: serde_json::Value = serde_json::from_str(&hash[&feld(c1)]).unwrap();
        assert_eq!(eintrag["metadata"]["device"], "ios");
        assert_eq!(eintrag["role"], "viewer");
        assert!(eintrag["connectedAt"].is_string());
    }
}
