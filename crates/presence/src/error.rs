//! Fehlertypen fuer die Presence-Buchfuehrung

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PresenceError {
    /// Store nicht erreichbar oder Operation abgebrochen
    #[error("Presence-Store nicht verfuegbar: {0}")]
    StoreNichtVerfuegbar(String),

    #[error("Serialisierungsfehler: {0}")]
    Serialisierung(#[from] serde_json::Error),
}

impl PresenceError {
    pub fn store(msg: impl Into<String>) -> Self {
        Self::StoreNichtVerfuegbar(msg.into())
    }
}

pub type PresenceResult<T> = std::result::Result<T, PresenceError>;
