//! TOML-Konfiguration des Realtime-Servers
//!
//! Jede Sektion ist optional; fehlende Schluessel nehmen die Werte aus
//! `config.example.toml`. Ohne `[auth]` werden alle Handshakes abgelehnt.

use anyhow::Context;
use serde::Deserialize;
use std::time::Duration;
use tally_auth::{RateLimitKonfig, TokenEintrag};
use tally_observability::{log_format_gueltig, log_level_gueltig};
use tally_presence::PresenceConfig;
use tally_signaling::{BroadcastKonfig, RealtimeConfig};

/// Wurzel der TOML-Datei, eine Sektion pro Feld
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// `[server]`
    pub server: ServerEinstellungen,
    /// Bind-Adresse, Ports, WebSocket-Pfad
    pub netzwerk: NetzwerkEinstellungen,
    /// IP- und Identitaets-Limits
    pub rate_limit: RateLimitEinstellungen,
    /// Presence-TTLs und Hintergrund-Intervalle
    pub presence: PresenceEinstellungen,
    /// Send-Queues der Verbindungen
    pub broadcast: BroadcastEinstellungen,
    /// Level und Format fuer tracing
    pub logging: LoggingEinstellungen,
    /// Statische Token-Tabelle
    pub auth: AuthEinstellungen,
}

/// `[server]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerEinstellungen {
    /// Erscheint nur im Start-Log
    pub name: String,
    /// Maximale Anzahl gleichzeitiger Verbindungen
    pub max_verbindungen: usize,
    /// Trennung nach so vielen Sekunden ohne Frame vom Client
    pub verbindungs_timeout_sek: u64,
}

impl Default for ServerEinstellungen {
    fn default() -> Self {
        Self {
            name: "Tally Realtime".into(),
            max_verbindungen: 10_000,
            verbindungs_timeout_sek: 90,
        }
    }
}

/// `[netzwerk]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetzwerkEinstellungen {
    pub bind_adresse: String,
    /// Port fuer WebSocket-Verbindungen
    pub ws_port: u16,
    /// Pfad der WebSocket-Route
    pub ws_pfad: String,
    /// Port fuer Metriken und Health (0 = deaktiviert)
    pub observability_port: u16,
}

impl Default for NetzwerkEinstellungen {
    fn default() -> Self {
        Self {
            bind_adresse: "0.0.0.0".into(),
            ws_port: 8080,
            ws_pfad: "/ws".into(),
            observability_port: 9300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitEinstellungen {
    pub ip_max_anfragen: u32,
    pub ip_fenster_sek: u64,
    pub identitaet_max_versuche: u32,
    pub identitaet_fenster_sek: u64,
    pub identitaet_cooldown_ms: u64,
}

impl Default for RateLimitEinstellungen {
    fn default() -> Self {
        Self {
            ip_max_anfragen: 60,
            ip_fenster_sek: 60,
            identitaet_max_versuche: 10,
            identitaet_fenster_sek: 60,
            identitaet_cooldown_ms: 1000,
        }
    }
}

/// Wohin Presence-Daten geschrieben werden
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceBackend {
    /// Prozesslokal, geht beim Neustart verloren
    #[default]
    Speicher,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PresenceEinstellungen {
    pub backend: PresenceBackend,
    /// Verbindungs-URL, nur fuer `backend = "redis"`
    pub url: Option<String>,
    /// TTL pro Verbindung, per Heartbeat erneuert
    pub verbindungs_ttl_sek: u64,
    /// TTL des Aggregats pro Identitaet
    pub presence_ttl_sek: u64,
    pub stale_nach_sek: u64,
    pub bereinigung_intervall_sek: u64,
    pub rebroadcast_intervall_sek: u64,
}

impl Default for PresenceEinstellungen {
    fn default() -> Self {
        Self {
            backend: PresenceBackend::Speicher,
            url: None,
            verbindungs_ttl_sek: 90,
            presence_ttl_sek: 300,
            stale_nach_sek: 120,
            bereinigung_intervall_sek: 60,
            rebroadcast_intervall_sek: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BroadcastEinstellungen {
    pub send_queue_groesse: usize,
    /// Freier Anteil der Queue, unter dem LOW-Events verworfen werden
    pub low_reserve_prozent: u8,
}

impl Default for BroadcastEinstellungen {
    fn default() -> Self {
        let standard = BroadcastKonfig::default();
        Self {
            send_queue_groesse: standard.send_queue_groesse,
            low_reserve_prozent: standard.low_reserve_prozent,
        }
    }
}

/// `[logging]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingEinstellungen {
    /// Level oder tracing-Filter-Direktive
    pub level: String,
    /// `text` oder `json`
    pub format: String,
}

impl Default for LoggingEinstellungen {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthEinstellungen {
    pub tokens: Vec<TokenEintrag>,
}

impl ServerConfig {
    /// Liest und prueft `pfad`; eine fehlende Datei ergibt die Defaults
    pub fn laden(pfad: &str) -> anyhow::Result<Self> {
        let config = match std::fs::read_to_string(pfad) {
            Ok(inhalt) => Self::aus_toml(&inhalt)
                .with_context(|| format!("Konfigurationsfehler in '{pfad}'"))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(pfad, "Keine Konfigurationsdatei, starte mit Defaults");
                Self::default()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("'{pfad}' nicht lesbar"));
            }
        };
        config.pruefen()?;
        Ok(config)
    }

    pub fn aus_toml(inhalt: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(inhalt)?)
    }

    /// Prueft Wertebereiche, die serde nicht abdeckt
    pub fn pruefen(&self) -> anyhow::Result<()> {
        if !log_level_gueltig(&self.logging.level) {
            anyhow::bail!("Unbekanntes Log-Level '{}'", self.logging.level);
        }
        if !log_format_gueltig(&self.logging.format) {
            anyhow::bail!("Unbekanntes Log-Format '{}'", self.logging.format);
        }
        if self.broadcast.send_queue_groesse == 0 {
            anyhow::bail!("broadcast.send_queue_groesse muss groesser 0 sein");
        }
        if self.broadcast.low_reserve_prozent > 100 {
            anyhow::bail!("broadcast.low_reserve_prozent muss zwischen 0 und 100 liegen");
        }
        if !self.netzwerk.ws_pfad.starts_with('/') {
            anyhow::bail!("netzwerk.ws_pfad muss mit '/' beginnen");
        }
        if self.presence.backend == PresenceBackend::Redis
            && self.presence.url.as_deref().map_or(true, str::is_empty)
        {
            anyhow::bail!("presence.url fehlt fuer backend = \"redis\"");
        }
        if self.presence.bereinigung_intervall_sek == 0 || self.presence.rebroadcast_intervall_sek == 0 {
            anyhow::bail!("Presence-Intervalle muessen groesser 0 sein");
        }
        Ok(())
    }

    /// Bind-Adresse fuer den WebSocket-Server
    pub fn ws_bind_adresse(&self) -> String {
        format!("{}:{}", self.netzwerk.bind_adresse, self.netzwerk.ws_port)
    }

    /// Bind-Adresse fuer den Observability-Server (`None` = deaktiviert)
    pub fn observability_bind_adresse(&self) -> Option<String> {
        (self.netzwerk.observability_port != 0).then(|| {
            format!(
                "{}:{}",
                self.netzwerk.bind_adresse, self.netzwerk.observability_port
            )
        })
    }

    pub fn realtime_config(&self) -> RealtimeConfig {
        RealtimeConfig {
            max_verbindungen: self.server.max_verbindungen,
            ws_pfad: self.netzwerk.ws_pfad.clone(),
            verbindungs_timeout: Duration::from_secs(self.server.verbindungs_timeout_sek),
            stale_nach: Duration::from_secs(self.presence.stale_nach_sek),
            bereinigung_intervall: Duration::from_secs(self.presence.bereinigung_intervall_sek),
            rebroadcast_intervall: Duration::from_secs(self.presence.rebroadcast_intervall_sek),
            broadcast: BroadcastKonfig {
                send_queue_groesse: self.broadcast.send_queue_groesse,
                low_reserve_prozent: self.broadcast.low_reserve_prozent,
            },
        }
    }

    pub fn rate_limit_konfig(&self) -> RateLimitKonfig {
        let r = &self.rate_limit;
        RateLimitKonfig {
            ip_max_anfragen: r.ip_max_anfragen,
            ip_fenster: Duration::from_secs(r.ip_fenster_sek),
            identitaet_max_versuche: r.identitaet_max_versuche,
            identitaet_fenster: Duration::from_secs(r.identitaet_fenster_sek),
            identitaet_cooldown: Duration::from_millis(r.identitaet_cooldown_ms),
        }
    }

    pub fn presence_config(&self) -> PresenceConfig {
        PresenceConfig {
            verbindungs_ttl: Duration::from_secs(self.presence.verbindungs_ttl_sek),
            presence_ttl: Duration::from_secs(self.presence.presence_ttl_sek),
        }
    }
}
