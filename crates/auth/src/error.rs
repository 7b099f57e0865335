//! Fehlertypen fuer den Verbindungs-Gatekeeper

use std::time::Duration;
use thiserror::Error;

/// Welcher Limiter eine Verbindung abgelehnt hat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitKlasse {
    /// Netzwerk-Missbrauch (pro Client-IP)
    Ip,
    /// Credential-Missbrauch bzw. Flapping (pro Tenant/User)
    Identitaet,
}

impl std::fmt::Display for LimitKlasse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ip => write!(f, "ip"),
            Self::Identitaet => write!(f, "identitaet"),
        }
    }
}

/// Terminale Ablehnung eines Verbindungsversuchs
///
/// Traegt keine Details ueber den versuchten Tenant oder User; die Ursache
/// wird nur serverseitig geloggt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateAblehnung {
    #[error("Authentifizierung fehlgeschlagen")]
    Authentifizierung,

    #[error("Rate-Limit ueberschritten ({klasse})")]
    RateLimitiert {
        klasse: LimitKlasse,
        retry_after: Duration,
    },
}

impl GateAblehnung {
    /// Label fuer Metriken
    pub fn grund(&self) -> &'static str {
        match self {
            Self::Authentifizierung => "auth",
            Self::RateLimitiert { klasse: LimitKlasse::Ip, .. } => "ip_rate_limit",
            Self::RateLimitiert { klasse: LimitKlasse::Identitaet, .. } => "identity_rate_limit",
        }
    }

    /// Meldung fuer den Client
    ///
    /// Identitaets-Limits werden wie Auth-Fehler gemeldet, sonst liesse sich
    /// ueber die Ablehnung feststellen, dass ein Credential gueltig ist.
    pub fn oeffentliche_meldung(&self) -> &'static str {
        match self {
            Self::RateLimitiert { klasse: LimitKlasse::Ip, .. } => "Too many requests",
            _ => "Unauthorized",
        }
    }
}

pub type GateResult<T> = std::result::Result<T, GateAblehnung>;
