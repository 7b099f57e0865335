//! Gemeinsame Identifikationstypen fuer Tally
//!
//! Alle IDs verwenden das Newtype-Pattern um Verwechslungen zwischen
//! verschiedenen ID-Arten zur Compilezeit auszuschliessen.
//!
//! Tenant-, User- und Entitaets-IDs stammen aus externen Systemen und werden
//! beim Erzeugen validiert: nicht leer, hoechstens 128 Zeichen, nur
//! `[A-Za-z0-9_.@-]`. Insbesondere ist `:` verboten, damit Raum-Adressen
//! eindeutig zurueckgeparst werden koennen.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Maximale Laenge eines externen Bezeichners
pub const MAX_ID_LAENGE: usize = 128;

/// Prueft ob ein externer Bezeichner den Regeln entspricht
pub fn id_gueltig(wert: &str) -> bool {
    !wert.is_empty()
        && wert.len() <= MAX_ID_LAENGE
        && wert
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '@' | '-'))
}

macro_rules! externe_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Erstellt eine validierte ID
            pub fn neu(wert: impl Into<String>) -> Result<Self> {
                let wert = wert.into();
                if id_gueltig(&wert) {
                    Ok(Self(wert))
                } else {
                    Err(CoreError::UngueltigeId {
                        art: stringify!($name),
                        wert,
                    })
                }
            }

            /// Gibt die ID als String-Slice zurueck
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = CoreError;

            fn try_from(wert: String) -> Result<Self> {
                Self::neu(wert)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self> {
                Self::neu(s)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

externe_id!(
    /// Tenant-ID (Isolationsgrenze)
    TenantId
);
externe_id!(
    /// Benutzer-ID innerhalb eines Tenants
    UserId
);
impl UserId {
    /// Absender serverseitig erzeugter Ereignisse (Presence-Snapshots)
    pub fn system() -> Self {
        Self(SYSTEM_USER.to_string())
    }
}

/// Reservierte User-ID fuer serverseitig erzeugte Ereignisse
pub const SYSTEM_USER: &str = "system";

externe_id!(
    /// ID eines Geschaeftsobjekts (Konto, Buchung, Karte, Kategorie)
    EntityId
);

/// Eindeutige ID einer physischen Verbindung
///
/// Jede neue Verbindung bekommt eine neue ID, auch fuer dieselbe Identitaet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Erstellt eine neue zufaellige ConnectionId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Gibt die innere UUID zurueck
    pub fn inner(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn:{}", self.0)
    }
}

/// Rolle eines Benutzers innerhalb seines Tenants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rolle {
    Owner,
    Admin,
    Member,
    Viewer,
}

impl Rolle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Admin => "admin",
            Self::Member => "member",
            Self::Viewer => "viewer",
        }
    }

    /// Owner und Admins treten zusaetzlich dem Admin-Raum bei
    pub fn ist_admin(&self) -> bool {
        matches!(self, Self::Owner | Self::Admin)
    }
}

impl FromStr for Rolle {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "owner" => Ok(Self::Owner),
            "admin" => Ok(Self::Admin),
            "member" => Ok(Self::Member),
            "viewer" => Ok(Self::Viewer),
            andere => Err(CoreError::UnbekannteRolle(andere.to_string())),
        }
    }
}

impl std::fmt::Display for Rolle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entitaetstypen, fuer die Raeume angelegt werden duerfen
///
/// Die feste Allow-List begrenzt die Anzahl verschiedener Raeume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntitaetsTyp {
    Account,
    Transaction,
    Card,
    Category,
}

impl EntitaetsTyp {
    /// Alle erlaubten Entitaetstypen
    pub const ALLE: [EntitaetsTyp; 4] = [
        EntitaetsTyp::Account,
        EntitaetsTyp::Transaction,
        EntitaetsTyp::Card,
        EntitaetsTyp::Category,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Account => "account",
            Self::Transaction => "transaction",
            Self::Card => "card",
            Self::Category => "category",
        }
    }

    /// Name des Payload-Felds, das die ID dieser Entitaet traegt
    pub fn id_feld(&self) -> &'static str {
        match self {
            Self::Account => "accountId",
            Self::Transaction => "transactionId",
            Self::Card => "cardId",
            Self::Category => "categoryId",
        }
    }
}

impl FromStr for EntitaetsTyp {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALLE
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CoreError::UnbekannterEntitaetsTyp(s.to_string()))
    }
}

impl std::fmt::Display for EntitaetsTyp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authentifizierte Identitaet einer Verbindung
///
/// Wird vom externen Auth-Collaborator erzeugt und ist fuer die gesamte
/// Lebensdauer der Verbindung unveraenderlich.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identitaet {
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub email: String,
    pub role: Rolle,
}

impl Identitaet {
    /// Schluessel `(tenant, user)` fuer Presence und Rate-Limits
    pub fn schluessel(&self) -> (TenantId, UserId) {
        (self.tenant_id.clone(), self.user_id.clone())
    }
}

/// Online-Eintrag einer Identitaet, wie er an Clients geht
///
/// Aggregiert ueber alle Verbindungen der Identitaet: `connected_at` ist
/// der frueheste Verbindungsbeginn, `last_seen` der juengste Heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineBenutzer {
    pub user_id: UserId,
    pub email: String,
    pub role: Rolle,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub connection_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_eindeutig() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b, "Zwei neue ConnectionIds muessen verschieden sein");
    }

    #[test]
    fn system_user_ist_gueltig() {
        assert!(id_gueltig(SYSTEM_USER));
        assert_eq!(UserId::system().as_str(), "system");
    }

    #[test]
    fn externe_ids_werden_validiert() {
        assert!(TenantId::neu("acme-gmbh").is_ok());
        assert!(UserId::neu("user_42@acme.de").is_ok());
        assert!(TenantId::neu("").is_err());
        assert!(TenantId::neu("a:b").is_err());
        assert!(UserId::neu("mit leerzeichen").is_err());
        assert!(EntityId::neu("x".repeat(MAX_ID_LAENGE + 1)).is_err());
    }

    #[test]
    fn ids_sind_serde_kompatibel() {
        let tid = TenantId::neu("t1").unwrap();
        let json = serde_json::to_string(&tid).unwrap();
        assert_eq!(json, "\"t1\"");

        let ungueltig: std::result::Result<TenantId, _> = serde_json::from_str("\"t:1\"");
        assert!(ungueltig.is_err());
    }

    #[test]
    fn entitaets_typ_allow_list() {
        assert_eq!("account".parse::<EntitaetsTyp>(), Ok(EntitaetsTyp::Account));
        assert!("budget".parse::<EntitaetsTyp>().is_err());
        assert_eq!(EntitaetsTyp::Card.id_feld(), "cardId");
    }

    #[test]
    fn rolle_admin_erkennung() {
        assert!(Rolle::Owner.ist_admin());
        assert!(Rolle::Admin.ist_admin());
        assert!(!Rolle::Member.ist_admin());
        assert_eq!("viewer".parse::<Rolle>(), Ok(Rolle::Viewer));
    }

    #[test]
    fn identitaet_camel_case() {
        let identitaet = Identitaet {
            tenant_id: TenantId::neu("t1").unwrap(),
            user_id: UserId::neu("u1").unwrap(),
            email: "a@b.de".into(),
            role: Rolle::Member,
        };
        let json = serde_json::to_value(&identitaet).unwrap();
        assert_eq!(json["tenantId"], "t1");
        assert_eq!(json["role"], "member");
    }
}
