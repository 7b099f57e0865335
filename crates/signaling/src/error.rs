//! Fehlertypen fuer den Signaling-Service

use tally_presence::PresenceError;
use tally_protocol::{ValidierungsFehler, WireFehler};
use thiserror::Error;

/// Fehlertyp fuer den Signaling-Service
#[derive(Debug, Error)]
pub enum SignalingError {
    /// Ungueltiges Domain-Event am Publish-Eingang
    #[error("Validierung fehlgeschlagen: {0}")]
    Validierung(#[from] ValidierungsFehler),

    /// Raum gehoert nicht zum Tenant der Verbindung
    #[error("Zugriff verweigert: {0}")]
    ZugriffVerweigert(String),

    /// Presence-Store-Fehler
    #[error("Presence-Fehler: {0}")]
    Presence(#[from] PresenceError),

    /// Unerwarteter Fehler in einem Verbindungs-Handler
    #[error("Handler-Fehler: {0}")]
    HandlerFehler(String),

    /// Senden an Client fehlgeschlagen (Queue geschlossen, Kodierung)
    #[error("Senden fehlgeschlagen: {0}")]
    SendFehler(String),

    /// IO-Fehler (Socket, Listener)
    #[error("IO-Fehler: {0}")]
    Io(#[from] std::io::Error),
}

impl SignalingError {
    pub fn zugriff_verweigert(raum: impl Into<String>) -> Self {
        Self::ZugriffVerweigert(raum.into())
    }

    pub fn handler(msg: impl Into<String>) -> Self {
        Self::HandlerFehler(msg.into())
    }
}

impl From<WireFehler> for SignalingError {
    fn from(e: WireFehler) -> Self {
        Self::SendFehler(e.to_string())
    }
}

/// Result-Typ fuer den Signaling-Service
pub type SignalingResult<T> = Result<T, SignalingError>;
