//! Control-Protokoll (WebSocket-Textframes)
//!
//! Befehle vom Client und Steuerantworten vom Server. Domain-Events laufen
//! nicht hierueber, sondern ueber `wire::ereignis_kodieren`.
//!
//! ## Design
//! - Client: `{"command": "...", "data": {...}}`
//! - Server: `{"event": "...", "data": {...}}`
//! - Tagged Enums fuer typsichere Nachrichtentypen

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Fehler-Codes
// ---------------------------------------------------------------------------

/// Fehler-Codes fuer `error`-Frames an verbundene Clients
///
/// Abgelehnte Handshakes bekommen keinen Frame, sondern einen HTTP-Status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InternalError,
    InvalidRequest,
    Forbidden,
}

// ---------------------------------------------------------------------------
// Client -> Server
// ---------------------------------------------------------------------------

/// Abonnement eines Entitaets- oder Entitaetstyp-Raums
///
/// `entity_type` bleibt hier ein String; die Allow-List-Pruefung macht der
/// Orchestrator, damit unbekannte Typen als `FORBIDDEN` beantwortet werden
/// koennen statt als unlesbarer Frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbonnementAnfrage {
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
}

/// Befehl eines verbundenen Clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "data", rename_all = "snake_case")]
pub enum ClientBefehl {
    Heartbeat,
    Subscribe(AbonnementAnfrage),
    Unsubscribe(AbonnementAnfrage),
}

impl ClientBefehl {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::Subscribe(_) => "subscribe",
            Self::Unsubscribe(_) => "unsubscribe",
        }
    }
}

// ---------------------------------------------------------------------------
// Server -> Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatAntwort {
    pub timestamp: DateTime<Utc>,
}

/// Bestaetigung eines (Ab-)Abonnements, spiegelt die Anfrage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbonnementAntwort {
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FehlerAntwort {
    pub code: ErrorCode,
    pub message: String,
}

/// Steuernachricht vom Server an genau eine Verbindung
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerNachricht {
    HeartbeatAck(HeartbeatAntwort),
    SubscriptionConfirmed(AbonnementAntwort),
    UnsubscriptionConfirmed(AbonnementAntwort),
    Error(FehlerAntwort),
}

impl ServerNachricht {
    /// Heartbeat-Bestaetigung mit aktuellem Zeitstempel
    pub fn heartbeat_ack() -> Self {
        Self::HeartbeatAck(HeartbeatAntwort {
            timestamp: Utc::now(),
        })
    }

    pub fn abonniert(anfrage: &AbonnementAnfrage) -> Self {
        Self::SubscriptionConfirmed(Self::antwort(anfrage))
    }

    pub fn abbestellt(anfrage: &AbonnementAnfrage) -> Self {
        Self::UnsubscriptionConfirmed(Self::antwort(anfrage))
    }

    /// Erstellt eine Fehler-Antwort
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(FehlerAntwort {
            code,
            message: message.into(),
        })
    }

    fn antwort(anfrage: &AbonnementAnfrage) -> AbonnementAntwort {
        AbonnementAntwort {
            entity_type: anfrage.entity_type.clone(),
            entity_id: anfrage.entity_id.clone(),
            timestamp: Utc::now(),
        }
    }

    /// Serialisiert die Nachricht als JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Deserialisiert eine Nachricht aus JSON
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
