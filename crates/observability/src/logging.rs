//! Structured Logging Setup via tracing-subscriber
//!
//! Umgebungsvariablen haben Vorrang vor der Konfigurationsdatei:
//! - `TALLY_LOG_LEVEL`: Level oder Filter-Direktive (`info,tally_signaling=debug`)
//! - `TALLY_LOG_FORMAT`: `text` oder `json`

use anyhow::anyhow;
use std::str::FromStr;
use tracing_subscriber::{fmt, EnvFilter};

pub const ENV_LOG_LEVEL: &str = "TALLY_LOG_LEVEL";
pub const ENV_LOG_FORMAT: &str = "TALLY_LOG_FORMAT";

const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Ausgabeformat der Log-Zeilen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            sonst => Err(format!("unbekanntes Log-Format '{sonst}'")),
        }
    }
}

/// Initialisiert das globale Logging
///
/// Ungueltige Werte fallen auf `info` bzw. `text` zurueck. Fehler nur, wenn
/// bereits ein Subscriber installiert ist.
pub fn logging_initialisieren(level: &str, format: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env(ENV_LOG_LEVEL)
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let format = std::env::var(ENV_LOG_FORMAT)
        .ok()
        .and_then(|f| f.parse().ok())
        .or_else(|| format.parse().ok())
        .unwrap_or_default();

    let ergebnis = match format {
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_current_span(true)
            .try_init(),
        LogFormat::Text => fmt().with_env_filter(filter).with_target(true).try_init(),
    };
    ergebnis.map_err(|e| anyhow!("Logging bereits initialisiert: {e}"))
}

/// Prueft einen Level-String aus der Konfiguration
///
/// Einfache Level muessen kleingeschrieben sein; Direktiven mit `=` oder
/// `,` werden von `EnvFilter` geprueft.
pub fn log_level_gueltig(level: &str) -> bool {
    if level.contains('=') || level.contains(',') {
        return EnvFilter::try_new(level).is_ok();
    }
    LEVELS.contains(&level)
}

pub fn log_format_gueltig(format: &str) -> bool {
    format.parse::<LogFormat>().is_ok()
}
