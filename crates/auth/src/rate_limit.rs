//! Rate Limiter fuer Verbindungsaufbau
//!
//! Zwei unabhaengige Schichten:
//! - [`IpRateLimiter`]: festes Fenster pro Client-IP (Netzwerk-Missbrauch)
//! - [`IdentitaetsRateLimiter`]: Versuche pro Fenster und Cooldown nach
//!   einer Trennung pro `(tenant, user)` (Credential-Missbrauch, Flapping)
//!
//! Zaehler sind prozesslokal. Bei horizontaler Skalierung begrenzt jeder
//! Prozess unabhaengig. Abgelaufene Fenster werden lazy beim naechsten
//! Zugriff zurueckgesetzt, es gibt keinen Bereinigungs-Task. Grosse Tabellen
//! werden hoechstens einmal pro Fensterlaenge durchkaemmt.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::net::IpAddr;
use std::time::Duration;
use tally_core::{TenantId, UserId};
use tokio::time::Instant;

/// Ab dieser Groesse werden abgelaufene Eintraege beim Zugriff verworfen
const GC_SCHWELLE: usize = 10_000;

/// Konfiguration beider Limiter
#[derive(Debug, Clone)]
pub struct RateLimitKonfig {
    /// Maximale Verbindungsversuche pro IP und Fenster
    pub ip_max_anfragen: u32,
    pub ip_fenster: Duration,
    /// Maximale Verbindungsversuche pro Identitaet und Fenster
    pub identitaet_max_versuche: u32,
    pub identitaet_fenster: Duration,
    /// Sperrzeit nach einer Trennung
    pub identitaet_cooldown: Duration,
}

impl Default for RateLimitKonfig {
    fn default() -> Self {
        Self {
            ip_max_anfragen: 60,
            ip_fenster: Duration::from_secs(60),
            identitaet_max_versuche: 10,
            identitaet_fenster: Duration::from_secs(60),
            identitaet_cooldown: Duration::from_millis(1000),
        }
    }
}

// ---------------------------------------------------------------------------
// Festes Fenster
// ---------------------------------------------------------------------------

/// Zaehlfenster fuer einen Schluessel
#[derive(Debug)]
struct Fenster {
    anzahl: u32,
    reset: Instant,
}

impl Fenster {
    fn neu(jetzt: Instant, dauer: Duration) -> Self {
        Self {
            anzahl: 0,
            reset: jetzt + dauer,
        }
    }

    /// Setzt das Fenster zurueck falls abgelaufen
    fn auffrischen(&mut self, jetzt: Instant, dauer: Duration) {
        if jetzt >= self.reset {
            *self = Self::neu(jetzt, dauer);
        }
    }

    /// Zaehlt einen Versuch. `Err(retry_after)` wenn das Limit erreicht ist.
    fn zaehlen(&mut self, jetzt: Instant, dauer: Duration, max: u32) -> Result<(), Duration> {
        self.auffrischen(jetzt, dauer);
        if self.anzahl >= max {
            return Err(self.reset.saturating_duration_since(jetzt));
        }
        self.anzahl += 1;
        Ok(())
    }
}

/// Eintraege eines Limiters plus Zeitpunkt der letzten Bereinigung
#[derive(Debug)]
struct Tabelle<K, V> {
    eintraege: HashMap<K, V>,
    letzte_bereinigung: Option<Instant>,
    #[cfg_attr(not(test), allow(dead_code))]
    bereinigungen: u64,
}

impl<K: Eq + Hash, V> Tabelle<K, V> {
    fn neu() -> Self {
        Self {
            eintraege: HashMap::new(),
            letzte_bereinigung: None,
            bereinigungen: 0,
        }
    }

    /// Verwirft abgelaufene Eintraege ab `GC_SCHWELLE`, aber nur wenn seit
    /// der letzten Runde `abstand` vergangen ist
    fn aufraeumen(&mut self, jetzt: Instant, abstand: Duration, abgelaufen: impl Fn(&V) -> bool) {
        if self.eintraege.len() < GC_SCHWELLE {
            return;
        }
        if self.letzte_bereinigung.is_some_and(|l| jetzt < l + abstand) {
            return;
        }
        self.eintraege.retain(|_, v| !abgelaufen(v));
        self.letzte_bereinigung = Some(jetzt);
        self.bereinigungen += 1;
    }
}

// ---------------------------------------------------------------------------
// IpRateLimiter
// ---------------------------------------------------------------------------

/// Festes Fenster pro Client-IP
#[derive(Debug)]
pub struct IpRateLimiter {
    max_anfragen: u32,
    fenster: Duration,
    tabelle: Mutex<Tabelle<IpAddr, Fenster>>,
}

impl IpRateLimiter {
    pub fn neu(max_anfragen: u32, fenster: Duration) -> Self {
        Self {
            max_anfragen,
            fenster,
            tabelle: Mutex::new(Tabelle::neu()),
        }
    }

    /// Prueft und zaehlt einen Versuch.
    ///
    /// Gibt `Ok(())` zurueck wenn erlaubt, `Err(retry_after)` sonst.
    pub fn pruefen(&self, ip: IpAddr) -> Result<(), Duration> {
        let jetzt = Instant::now();
        let mut tabelle = self.tabelle.lock();
        tabelle.aufraeumen(jetzt, self.fenster, |f| jetzt >= f.reset);
        tabelle
            .eintraege
            .entry(ip)
            .or_insert_with(|| Fenster::neu(jetzt, self.fenster))
            .zaehlen(jetzt, self.fenster, self.max_anfragen)
    }

    /// Anzahl gehaltener Eintraege
    pub fn anzahl_eintraege(&self) -> usize {
        self.tabelle.lock().eintraege.len()
    }
}

// ---------------------------------------------------------------------------
// IdentitaetsRateLimiter
// ---------------------------------------------------------------------------

type IdentitaetsSchluessel = (TenantId, UserId);

#[derive(Debug)]
struct IdentitaetsEintrag {
    fenster: Fenster,
    cooldown_bis: Option<Instant>,
}

/// Versuche pro Fenster plus Cooldown nach Trennung pro Identitaet
#[derive(Debug)]
pub struct IdentitaetsRateLimiter {
    max_versuche: u32,
    fenster: Duration,
    cooldown: Duration,
    tabelle: Mutex<Tabelle<IdentitaetsSchluessel, IdentitaetsEintrag>>,
}

impl IdentitaetsRateLimiter {
    pub fn neu(max_versuche: u32, fenster: Duration, cooldown: Duration) -> Self {
        Self {
            max_versuche,
            fenster,
            cooldown,
            tabelle: Mutex::new(Tabelle::neu()),
        }
    }

    /// Prueft und zaehlt einen Verbindungsversuch der Identitaet
    ///
    /// Ein laufender Cooldown lehnt ab, ohne den Versuch zu zaehlen.
    pub fn pruefen(&self, tenant: &TenantId, user: &UserId) -> Result<(), Duration> {
        let jetzt = Instant::now();
        let fenster = self.fenster;
        let mut tabelle = self.tabelle.lock();
        tabelle.aufraeumen(jetzt, fenster.max(self.cooldown), |e| {
            jetzt >= e.fenster.reset && e.cooldown_bis.map_or(true, |c| jetzt >= c)
        });

        let eintrag = tabelle
            .eintraege
            .entry((tenant.clone(), user.clone()))
            .or_insert_with(|| IdentitaetsEintrag {
                fenster: Fenster::neu(jetzt, fenster),
                cooldown_bis: None,
            });

        if let Some(bis) = eintrag.cooldown_bis {
            if jetzt < bis {
                return Err(bis - jetzt);
            }
            eintrag.cooldown_bis = None;
        }
        eintrag.fenster.zaehlen(jetzt, fenster, self.max_versuche)
    }

    /// Vermerkt eine Trennung; der naechste Versuch innerhalb des Cooldowns
    /// wird abgelehnt
    pub fn trennung_melden(&self, tenant: &TenantId, user: &UserId) {
        if self.cooldown.is_zero() {
            return;
        }
        let jetzt = Instant::now();
        let mut tabelle = self.tabelle.lock();
        let eintrag = tabelle
            .eintraege
            .entry((tenant.clone(), user.clone()))
            .or_insert_with(|| IdentitaetsEintrag {
                fenster: Fenster::neu(jetzt, self.fenster),
                cooldown_bis: None,
            });
        eintrag.cooldown_bis = Some(jetzt + self.cooldown);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(letztes: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, letztes))
    }

    fn t() -> TenantId {
        TenantId::neu("acme").unwrap()
    }

    fn u(id: &str) -> UserId {
        UserId::neu(id).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn ip_limiter_lehnt_n_plus_eins_ab() {
        let limiter = IpRateLimiter::neu(3, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(limiter.pruefen(ip(1)).is_ok());
        }
        let retry = limiter.pruefen(ip(1)).unwrap_err();
        assert!(retry <= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn ip_limiter_neues_fenster_nach_ablauf() {
        let limiter = IpRateLimiter::neu(1, Duration::from_secs(60));
        assert!(limiter.pruefen(ip(1)).is_ok());
        assert!(limiter.pruefen(ip(1)).is_err());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(limiter.pruefen(ip(1)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn verschiedene_ips_unabhaengig() {
        let limiter = IpRateLimiter::neu(1, Duration::from_secs(60));
        assert!(limiter.pruefen(ip(1)).is_ok());
        assert!(limiter.pruefen(ip(2)).is_ok()); // andere IP
        assert!(limiter.pruefen(ip(1)).is_err()); // erste IP erschoepft
    }

    #[tokio::test(start_paused = true)]
    async fn identitaet_max_versuche() {
        let limiter = IdentitaetsRateLimiter::neu(2, Duration::from_secs(60), Duration::ZERO);
        assert!(limiter.pruefen(&t(), &u("a")).is_ok());
        assert!(limiter.pruefen(&t(), &u("a")).is_ok());
        assert!(limiter.pruefen(&t(), &u("a")).is_err());
        assert!(limiter.pruefen(&t(), &u("b")).is_ok());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.pruefen(&t(), &u("a")).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_nach_trennung() {
        let limiter =
            IdentitaetsRateLimiter::neu(100, Duration::from_secs(60), Duration::from_millis(1000));
        assert!(limiter.pruefen(&t(), &u("a")).is_ok());
        limiter.trennung_melden(&t(), &u("a"));

        tokio::time::advance(Duration::from_millis(500)).await;
        let retry = limiter.pruefen(&t(), &u("a")).unwrap_err();
        assert_eq!(retry, Duration::from_millis(500));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(limiter.pruefen(&t(), &u("a")).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_zaehlt_nicht_als_versuch() {
        let limiter =
            IdentitaetsRateLimiter::neu(1, Duration::from_secs(60), Duration::from_millis(100));
        limiter.trennung_melden(&t(), &u("a"));
        assert!(limiter.pruefen(&t(), &u("a")).is_err());

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(limiter.pruefen(&t(), &u("a")).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn abgelaufene_eintraege_werden_lazy_verworfen() {
        let limiter = IpRateLimiter::neu(5, Duration::from_secs(1));
        for i in 0..GC_SCHWELLE {
            let ip = IpAddr::V4(Ipv4Addr::from(i as u32));
            assert!(limiter.pruefen(ip).is_ok());
        }
        assert_eq!(limiter.anzahl_eintraege(), GC_SCHWELLE);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(limiter.pruefen(ip(1)).is_ok());
        assert_eq!(limiter.anzahl_eintraege(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn volle_frische_tabelle_wird_einmal_pro_fenster_durchkaemmt() {
        let limiter = IpRateLimiter::neu(5, Duration::from_secs(60));
        for i in 0..GC_SCHWELLE as u32 {
            assert!(limiter.pruefen(IpAddr::V4(Ipv4Addr::from(i))).is_ok());
        }

        // Alle Eintraege frisch: eine Runde, danach bis Fensterende keine mehr
        for i in 0..100u32 {
            let ip = IpAddr::V4(Ipv4Addr::from(0x0a00_0000 + i));
            assert!(limiter.pruefen(ip).is_ok());
        }
        assert_eq!(limiter.tabelle.lock().bereinigungen, 1);
        assert_eq!(limiter.anzahl_eintraege(), GC_SCHWELLE + 100);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.pruefen(ip(1)).is_ok());
        assert_eq!(limiter.tabelle.lock().bereinigungen, 2);
        assert_eq!(limiter.anzahl_eintraege(), 1);
    }
}
