//! Presence-Store-Adapter
//!
//! Duenne Abstraktion ueber einen Key-Value-Store mit TTL-Unterstuetzung
//! (Redis-Semantik: Strings, Hashes, Sets). Keine Fachlogik.
//!
//! Alle Schreibzugriffe laufen ueber [`PresenceStore::atomar`]: eine Liste
//! von [`StoreOp`]s wird als unteilbarer Block ausgefuehrt, sodass
//! gleichzeitige Verbindungen derselben Identitaet keine Updates verlieren.
//!
//! [`SpeicherStore`] ist die prozesslokale Implementierung; Ablaeufe werden
//! lazy beim naechsten Zugriff ausgewertet (`tokio::time::Instant`, damit
//! Tests mit pausierter Zeit arbeiten koennen).

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{PresenceError, PresenceResult};

// ---------------------------------------------------------------------------
// Operationen
// ---------------------------------------------------------------------------

/// Einzelne Schreiboperation innerhalb eines atomaren Blocks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// HSETNX: setzt das Feld nur wenn es noch nicht existiert
    HashSetzenFallsNeu { key: String, feld: String, wert: String },
    /// HDEL
    HashEntfernen { key: String, feld: String },
    /// Entfernt alle Hash-Felder, deren Begleit-Key `{praefix}{feld}` nicht
    /// (mehr) existiert
    VerwaisteFelderEntfernen { key: String, praefix: String },
    /// SET mit optionalem EX
    Setzen { key: String, wert: String, ttl: Option<Duration> },
    /// DEL
    Loeschen { key: String },
    /// EXPIRE (ohne Wirkung auf nicht existierende Keys)
    Ablauf { key: String, ttl: Duration },
    /// SADD
    SetHinzufuegen { key: String, mitglied: String },
    /// SREM, aber nur wenn `pruef_key` leer ist oder nicht existiert
    SetEntfernenFallsLeer { key: String, mitglied: String, pruef_key: String },
    /// HLEN
    HashLaenge { key: String },
}

/// Ergebnis einer einzelnen Operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreWert {
    Ok,
    Zahl(u64),
}

impl StoreWert {
    pub fn zahl(&self) -> Option<u64> {
        match self {
            Self::Zahl(n) => Some(*n),
            Self::Ok => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Key-Value-Store mit TTL fuer Presence-Daten
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Fuehrt alle Operationen als einen unteilbaren Block aus
    ///
    /// Gibt pro Operation ein Ergebnis in derselben Reihenfolge zurueck.
    async fn atomar(&self, ops: Vec<StoreOp>) -> PresenceResult<Vec<StoreWert>>;

    /// GET
    async fn holen(&self, key: &str) -> PresenceResult<Option<String>>;

    /// HGETALL
    async fn hash_alle(&self, key: &str) -> PresenceResult<HashMap<String, String>>;

    /// SMEMBERS (sortiert)
    async fn set_mitglieder(&self, key: &str) -> PresenceResult<Vec<String>>;

    /// PING
    async fn ping(&self) -> PresenceResult<()>;
}

// ---------------------------------------------------------------------------
// SpeicherStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Wert {
    Text(String),
    Hash(HashMap<String, String>),
    Set(BTreeSet<String>),
}

impl Wert {
    fn laenge(&self) -> usize {
        match self {
            Self::Text(_) => 1,
            Self::Hash(h) => h.len(),
            Self::Set(s) => s.len(),
        }
    }
}

#[derive(Debug)]
struct Eintrag {
    wert: Wert,
    ablauf: Option<Instant>,
}

impl Eintrag {
    fn abgelaufen(&self, jetzt: Instant) -> bool {
        self.ablauf.is_some_and(|a| a <= jetzt)
    }
}

#[derive(Debug, Default)]
struct Daten {
    eintraege: HashMap<String, Eintrag>,
}

impl Daten {
    /// Liefert einen lebenden Eintrag, abgelaufene werden dabei entfernt
    fn lebend(&mut self, key: &str, jetzt: Instant) -> Option<&mut Eintrag> {
        if self.eintraege.get(key).is_some_and(|e| e.abgelaufen(jetzt)) {
            self.eintraege.remove(key);
        }
        self.eintraege.get_mut(key)
    }

    fn existiert(&mut self, key: &str, jetzt: Instant) -> bool {
        self.lebend(key, jetzt).is_some()
    }

    fn laenge(&mut self, key: &str, jetzt: Instant) -> usize {
        self.lebend(key, jetzt).map_or(0, |e| e.wert.laenge())
    }

    fn hash_mut(&mut self, key: &str, jetzt: Instant) -> Option<&mut HashMap<String, String>> {
        match self.lebend(key, jetzt) {
            Some(Eintrag { wert: Wert::Hash(h), .. }) => Some(h),
            _ => None,
        }
    }

    /// Leere Hashes und Sets verschwinden wie in Redis
    fn leere_entfernen(&mut self, key: &str) {
        if self.eintraege.get(key).is_some_and(|e| e.wert.laenge() == 0) {
            self.eintraege.remove(key);
        }
    }

    fn ausfuehren(&mut self, op: StoreOp, jetzt: Instant) -> StoreWert {
        match op {
            StoreOp::HashSetzenFallsNeu { key, feld, wert } => {
                if !matches!(self.lebend(&key, jetzt), Some(Eintrag { wert: Wert::Hash(_), .. })) {
                    self.eintraege.insert(
                        key.clone(),
                        Eintrag { wert: Wert::Hash(HashMap::new()), ablauf: None },
                    );
                }
                let neu = match self.hash_mut(&key, jetzt) {
                    Some(h) if !h.contains_key(&feld) => {
                        h.insert(feld, wert);
                        true
                    }
                    _ => false,
                };
                StoreWert::Zahl(u64::from(neu))
            }
            StoreOp::HashEntfernen { key, feld } => {
                let entfernt = self
                    .hash_mut(&key, jetzt)
                    .is_some_and(|h| h.remove(&feld).is_some());
                self.leere_entfernen(&key);
                StoreWert::Zahl(u64::from(entfernt))
            }
            StoreOp::VerwaisteFelderEntfernen { key, praefix } => {
                let felder: Vec<String> = self
                    .hash_mut(&key, jetzt)
                    .map(|h| h.keys().cloned().collect())
                    .unwrap_or_default();
                let verwaist: Vec<String> = felder
                    .into_iter()
                    .filter(|f| !self.existiert(&format!("{praefix}{f}"), jetzt))
                    .collect();
                if let Some(h) = self.hash_mut(&key, jetzt) {
                    for feld in &verwaist {
                        h.remove(feld);
                    }
                }
                self.leere_entfernen(&key);
                StoreWert::Zahl(verwaist.len() as u64)
            }
            StoreOp::Setzen { key, wert, ttl } => {
                self.eintraege.insert(
                    key,
                    Eintrag {
                        wert: Wert::Text(wert),
                        ablauf: ttl.map(|t| jetzt + t),
                    },
                );
                StoreWert::Ok
            }
            StoreOp::Loeschen { key } => {
                let geloescht = self.lebend(&key, jetzt).is_some();
                self.eintraege.remove(&key);
                StoreWert::Zahl(u64::from(geloescht))
            }
            StoreOp::Ablauf { key, ttl } => match self.lebend(&key, jetzt) {
                Some(e) => {
                    e.ablauf = Some(jetzt + ttl);
                    StoreWert::Zahl(1)
                }
                None => StoreWert::Zahl(0),
            },
            StoreOp::SetHinzufuegen { key, mitglied } => {
                if !matches!(self.lebend(&key, jetzt), Some(Eintrag { wert: Wert::Set(_), .. })) {
                    self.eintraege.insert(
                        key.clone(),
                        Eintrag { wert: Wert::Set(BTreeSet::new()), ablauf: None },
                    );
                }
                let neu = match self.eintraege.get_mut(&key) {
                    Some(Eintrag { wert: Wert::Set(s), .. }) => s.insert(mitglied),
                    _ => false,
                };
                StoreWert::Zahl(u64::from(neu))
            }
            StoreOp::SetEntfernenFallsLeer { key, mitglied, pruef_key } => {
                if self.laenge(&pruef_key, jetzt) > 0 {
                    return StoreWert::Zahl(0);
                }
                let entfernt = match self.lebend(&key, jetzt) {
                    Some(Eintrag { wert: Wert::Set(s), .. }) => s.remove(&mitglied),
                    _ => false,
                };
                self.leere_entfernen(&key);
                StoreWert::Zahl(u64::from(entfernt))
            }
            StoreOp::HashLaenge { key } => {
                let n = match self.lebend(&key, jetzt) {
                    Some(Eintrag { wert: Wert::Hash(h), .. }) => h.len(),
                    _ => 0,
                };
                StoreWert::Zahl(n as u64)
            }
        }
    }
}

/// Prozesslokaler Presence-Store
///
/// Ein einzelner Mutex serialisiert alle Bloecke; damit ist jeder
/// `atomar`-Aufruf unteilbar.
#[derive(Debug, Default)]
pub struct SpeicherStore {
    daten: Mutex<Daten>,
}

impl SpeicherStore {
    pub fn neu() -> Self {
        Self::default()
    }

    /// Anzahl lebender Keys
    pub fn anzahl_keys(&self) -> usize {
        let jetzt = Instant::now();
        let mut daten = self.daten.lock();
        daten.eintraege.retain(|_, e| !e.abgelaufen(jetzt));
        daten.eintraege.len()
    }
}

#[async_trait]
impl PresenceStore for SpeicherStore {
    async fn atomar(&self, ops: Vec<StoreOp>) -> PresenceResult<Vec<StoreWert>> {
        let jetzt = Instant::now();
        let mut daten = self.daten.lock();
        Ok(ops.into_iter().map(|op| daten.ausfuehren(op, jetzt)).collect())
    }

    async fn holen(&self, key: &str) -> PresenceResult<Option<String>> {
        let jetzt = Instant::now();
        match self.daten.lock().lebend(key, jetzt) {
            Some(Eintrag { wert: Wert::Text(t), .. }) => Ok(Some(t.clone())),
            _ => Ok(None),
        }
    }

    async fn hash_alle(&self, key: &str) -> PresenceResult<HashMap<String, String>> {
        let jetzt = Instant::now();
        Ok(self.daten.lock().hash_mut(key, jetzt).cloned().unwrap_or_default())
    }

    async fn set_mitglieder(&self, key: &str) -> PresenceResult<Vec<String>> {
        let jetzt = Instant::now();
        match self.daten.lock().lebend(key, jetzt) {
            Some(Eintrag { wert: Wert::Set(s), .. }) => Ok(s.iter().cloned().collect()),
            _ => Ok(Vec::new()),
        }
    }

    async fn ping(&self) -> PresenceResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AusfallStore
// ---------------------------------------------------------------------------

/// Store, der jede Operation mit `StoreNichtVerfuegbar` ablehnt
///
/// Fuer Tests der Degradation: Presence faellt aus, Messaging laeuft weiter.
#[derive(Debug, Default)]
pub struct AusfallStore;

#[async_trait]
impl PresenceStore for AusfallStore {
    async fn atomar(&self, _ops: Vec<StoreOp>) -> PresenceResult<Vec<StoreWert>> {
        Err(PresenceError::store("Verbindung verweigert"))
    }

    async fn holen(&self, _key: &str) -> PresenceResult<Option<String>> {
        Err(PresenceError::store("Verbindung verweigert"))
    }

    async fn hash_alle(&self, _key: &str) -> PresenceResult<HashMap<String, String>> {
        Err(PresenceError::store("Verbindung verweigert"))
    }

    async fn set_mitglieder(&self, _key: &str) -> PresenceResult<Vec<String>> {
        Err(PresenceError::store("Verbindung verweigert"))
    }

    async fn ping(&self) -> PresenceResult<()> {
        Err(PresenceError::store("Verbindung verweigert"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn setzen(key: &str, ttl: Option<Duration>) -> StoreOp {
        StoreOp::Setzen { key: key.into(), wert: "1".into(), ttl }
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_laeuft_lazy_ab() {
        let store = SpeicherStore::neu();
        store.atomar(vec![setzen("k", Some(Duration::from_secs(10)))]).await.unwrap();
        assert_eq!(store.holen("k").await.unwrap().as_deref(), Some("1"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.holen("k").await.unwrap(), None);
        assert_eq!(store.anzahl_keys(), 0);
    }

    #[tokio::test]
    async fn hsetnx_behaelt_ersten_wert() {
        let store = SpeicherStore::neu();
        let ergebnis = store
            .atomar(vec![
                StoreOp::HashSetzenFallsNeu { key: "h".into(), feld: "f".into(), wert: "erst".into() },
                StoreOp::HashSetzenFallsNeu { key: "h".into(), feld: "f".into(), wert: "zweit".into() },
                StoreOp::HashLaenge { key: "h".into() },
            ])
            .await
            .unwrap();
        assert_eq!(ergebnis, vec![StoreWert::Zahl(1), StoreWert::Zahl(0), StoreWert::Zahl(1)]);
        assert_eq!(store.hash_alle("h").await.unwrap()["f"], "erst");
    }

    #[tokio::test]
    async fn leerer_hash_verschwindet() {
        let store = SpeicherStore::neu();
        store
            .atomar(vec![
                StoreOp::HashSetzenFallsNeu { key: "h".into(), feld: "f".into(), wert: "x".into() },
                StoreOp::HashEntfernen { key: "h".into(), feld: "f".into() },
            ])
            .await
            .unwrap();
        assert_eq!(store.anzahl_keys(), 0);
    }

    #[tokio::test]
    async fn set_entfernen_nur_wenn_pruef_key_leer() {
        let store = SpeicherStore::neu();
        let entfernen = || StoreOp::SetEntfernenFallsLeer {
            key: "s".into(),
            mitglied: "m".into(),
            pruef_key: "h".into(),
        };
        store
            .atomar(vec![
                StoreOp::SetHinzufuegen { key: "s".into(), mitglied: "m".into() },
                StoreOp::HashSetzenFallsNeu { key: "h".into(), feld: "f".into(), wert: "x".into() },
            ])
            .await
            .unwrap();

        let ergebnis = store.atomar(vec![entfernen()]).await.unwrap();
        assert_eq!(ergebnis, vec![StoreWert::Zahl(0)]);
        assert_eq!(store.set_mitglieder("s").await.unwrap(), vec!["m".to_string()]);

        let ergebnis = store
            .atomar(vec![StoreOp::Loeschen { key: "h".into() }, entfernen()])
            .await
            .unwrap();
        assert_eq!(ergebnis[1], StoreWert::Zahl(1));
        assert!(store.set_mitglieder("s").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn verwaiste_felder_werden_entfernt() {
        let store = SpeicherStore::neu();
        store
            .atomar(vec![
                StoreOp::HashSetzenFallsNeu { key: "h".into(), feld: "a".into(), wert: "x".into() },
                StoreOp::HashSetzenFallsNeu { key: "h".into(), feld: "b".into(), wert: "x".into() },
                setzen("h:a", Some(Duration::from_secs(5))),
                setzen("h:b", Some(Duration::from_secs(60))),
            ])
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        let ergebnis = store
            .atomar(vec![
                StoreOp::VerwaisteFelderEntfernen { key: "h".into(), praefix: "h:".into() },
                StoreOp::HashLaenge { key: "h".into() },
            ])
            .await
            .unwrap();
        assert_eq!(ergebnis, vec![StoreWert::Zahl(1), StoreWert::Zahl(1)]);
        assert!(store.hash_alle("h").await.unwrap().contains_key("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn ablauf_verlaengert_ttl() {
        let store = SpeicherStore::neu();
        store.atomar(vec![setzen("k", Some(Duration::from_secs(10)))]).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        store
            .atomar(vec![StoreOp::Ablauf { key: "k".into(), ttl: Duration::from_secs(10) }])
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store.holen("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn ausfall_store_lehnt_ab() {
        let store = AusfallStore;
        assert!(matches!(
            store.atomar(vec![]).await,
            Err(PresenceError::StoreNichtVerfuegbar(_))
        ));
        assert!(store.ping().await.is_err());
    }
}
