//! Event-Taxonomie – Katalog aller broadcastbaren Ereignisse
//!
//! Jeder Ereignistyp ist genau einer Raum-Klasse (Tenant-weit,
//! benutzerspezifisch, entitaetsbezogen) und genau einer Prioritaet
//! zugeordnet. Der Broadcaster – nicht der Produzent – waehlt anhand dieser
//! Zuordnung die Ziel-Raeume. Entitaetsbezogene Ereignisse erreichen neben
//! Entitaets- und Typ-Raum immer auch den Tenant-Raum.
//!
//! ## Umschlag
//! ```text
//! { eventType, tenantId, userId, timestamp, data, metadata? }
//! ```
//! `data` ist pro Ereignistyp typisiert (`EventDaten`, tagged union).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;
use tally_core::{EntitaetsTyp, EntityId, OnlineBenutzer, Rolle, TenantId, UserId};

use crate::validation::ValidierungsFehler;

// ---------------------------------------------------------------------------
// Klassifikation
// ---------------------------------------------------------------------------

/// Prioritaet eines Ereignisses
///
/// Nur `Low` darf unter Backpressure verworfen werden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Prioritaet {
    Low,
    Normal,
    High,
    Critical,
}

impl Prioritaet {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Normal => "NORMAL",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }

    pub fn verwerfbar(&self) -> bool {
        matches!(self, Self::Low)
    }
}

/// Teilbereich eines Tenants fuer Tenant-weite Ereignisse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TenantBereich {
    /// Alle Verbindungen des Tenants
    Alle,
    /// Nur Owner/Admins
    Admin,
    /// System-Ankuendigungen
    Benachrichtigungen,
}

/// Ziel-Raum-Klasse eines Ereignistyps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RaumKlasse {
    Tenant(TenantBereich),
    Benutzer,
    Entitaet(EntitaetsTyp),
}

/// Fachlicher Bereich eines Ereignistyps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bereich {
    Presence,
    Transaktion,
    Konto,
    Karte,
    Kategorie,
    Tenant,
    System,
    Fehler,
}

// ---------------------------------------------------------------------------
// EventType
// ---------------------------------------------------------------------------

/// Geschlossene Aufzaehlung aller Ereignistypen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    // Presence
    UserJoined,
    UserLeft,
    OnlineUsers,
    OnlineUsersUpdated,
    // Buchungen
    TransactionCreated,
    TransactionUpdated,
    TransactionDeleted,
    TransactionsImported,
    // Konten
    AccountCreated,
    AccountUpdated,
    AccountDeleted,
    AccountBalanceUpdated,
    // Karten
    CardCreated,
    CardUpdated,
    CardDeleted,
    // Kategorien
    CategoryCreated,
    CategoryUpdated,
    CategoryDeleted,
    // Tenant / Admin
    TenantSettingsUpdated,
    UserInvited,
    UserRemoved,
    UserRoleChanged,
    // System
    SystemAnnouncement,
    SystemMaintenance,
    Notification,
    // Fehler
    Error,
}

impl EventType {
    pub const ALLE: [EventType; 26] = [
        EventType::UserJoined,
        EventType::UserLeft,
        EventType::OnlineUsers,
        EventType::OnlineUsersUpdated,
        EventType::TransactionCreated,
        EventType::TransactionUpdated,
        EventType::TransactionDeleted,
        EventType::TransactionsImported,
        EventType::AccountCreated,
        EventType::AccountUpdated,
        EventType::AccountDeleted,
        EventType::AccountBalanceUpdated,
        EventType::CardCreated,
        EventType::CardUpdated,
        EventType::CardDeleted,
        EventType::CategoryCreated,
        EventType::CategoryUpdated,
        EventType::CategoryDeleted,
        EventType::TenantSettingsUpdated,
        EventType::UserInvited,
        EventType::UserRemoved,
        EventType::UserRoleChanged,
        EventType::SystemAnnouncement,
        EventType::SystemMaintenance,
        EventType::Notification,
        EventType::Error,
    ];

    /// Wire-Name (`SCREAMING_SNAKE_CASE`)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserJoined => "USER_JOINED",
            Self::UserLeft => "USER_LEFT",
            Self::OnlineUsers => "ONLINE_USERS",
            Self::OnlineUsersUpdated => "ONLINE_USERS_UPDATED",
            Self::TransactionCreated => "TRANSACTION_CREATED",
            Self::TransactionUpdated => "TRANSACTION_UPDATED",
            Self::TransactionDeleted => "TRANSACTION_DELETED",
            Self::TransactionsImported => "TRANSACTIONS_IMPORTED",
            Self::AccountCreated => "ACCOUNT_CREATED",
            Self::AccountUpdated => "ACCOUNT_UPDATED",
            Self::AccountDeleted => "ACCOUNT_DELETED",
            Self::AccountBalanceUpdated => "ACCOUNT_BALANCE_UPDATED",
            Self::CardCreated => "CARD_CREATED",
            Self::CardUpdated => "CARD_UPDATED",
            Self::CardDeleted => "CARD_DELETED",
            Self::CategoryCreated => "CATEGORY_CREATED",
            Self::CategoryUpdated => "CATEGORY_UPDATED",
            Self::CategoryDeleted => "CATEGORY_DELETED",
            Self::TenantSettingsUpdated => "TENANT_SETTINGS_UPDATED",
            Self::UserInvited => "USER_INVITED",
            Self::UserRemoved => "USER_REMOVED",
            Self::UserRoleChanged => "USER_ROLE_CHANGED",
            Self::SystemAnnouncement => "SYSTEM_ANNOUNCEMENT",
            Self::SystemMaintenance => "SYSTEM_MAINTENANCE",
            Self::Notification => "NOTIFICATION",
            Self::Error => "ERROR",
        }
    }

    pub fn bereich(&self) -> Bereich {
        use EventType::*;
        match self {
            UserJoined | UserLeft | OnlineUsers | OnlineUsersUpdated => Bereich::Presence,
            TransactionCreated | TransactionUpdated | TransactionDeleted | TransactionsImported => {
                Bereich::Transaktion
            }
            AccountCreated | AccountUpdated | AccountDeleted | AccountBalanceUpdated => {
                Bereich::Konto
            }
            CardCreated | CardUpdated | CardDeleted => Bereich::Karte,
            CategoryCreated | CategoryUpdated | CategoryDeleted => Bereich::Kategorie,
            TenantSettingsUpdated | UserInvited | UserRemoved | UserRoleChanged => Bereich::Tenant,
            SystemAnnouncement | SystemMaintenance | Notification => Bereich::System,
            Error => Bereich::Fehler,
        }
    }

    pub fn klasse(&self) -> RaumKlasse {
        use EventType::*;
        match self {
            UserJoined | UserLeft | OnlineUsersUpdated => RaumKlasse::Tenant(TenantBereich::Alle),
            OnlineUsers => RaumKlasse::Benutzer,
            TransactionCreated | TransactionUpdated | TransactionDeleted | TransactionsImported => {
                RaumKlasse::Entitaet(EntitaetsTyp::Transaction)
            }
            AccountCreated | AccountUpdated | AccountDeleted | AccountBalanceUpdated => {
                RaumKlasse::Entitaet(EntitaetsTyp::Account)
            }
            CardCreated | CardUpdated | CardDeleted => RaumKlasse::Entitaet(EntitaetsTyp::Card),
            CategoryCreated | CategoryUpdated | CategoryDeleted => {
                RaumKlasse::Entitaet(EntitaetsTyp::Category)
            }
            TenantSettingsUpdated | UserInvited | UserRemoved => {
                RaumKlasse::Tenant(TenantBereich::Admin)
            }
            UserRoleChanged | Notification | Error => RaumKlasse::Benutzer,
            SystemAnnouncement | SystemMaintenance => {
                RaumKlasse::Tenant(TenantBereich::Benachrichtigungen)
            }
        }
    }

    pub fn prioritaet(&self) -> Prioritaet {
        use EventType::*;
        match self {
            UserJoined | UserLeft | OnlineUsersUpdated => Prioritaet::Low,
            OnlineUsers
            | TransactionCreated
            | TransactionUpdated
            | TransactionDeleted
            | TransactionsImported
            | AccountCreated
            | AccountUpdated
            | CardCreated
            | CardUpdated
            | CategoryCreated
            | CategoryUpdated
            | CategoryDeleted
            | UserInvited
            | SystemAnnouncement
            | Notification => Prioritaet::Normal,
            AccountDeleted | AccountBalanceUpdated | CardDeleted | TenantSettingsUpdated
            | UserRemoved | UserRoleChanged | Error => Prioritaet::High,
            SystemMaintenance => Prioritaet::Critical,
        }
    }
}

impl FromStr for EventType {
    type Err = ValidierungsFehler;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALLE
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ValidierungsFehler::UnbekannterEventTyp(s.to_string()))
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// USER_JOINED / USER_LEFT
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceAenderung {
    pub user_id: UserId,
    pub email: String,
    pub role: Rolle,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransaktionDaten {
    pub transaction_id: EntityId,
    pub account_id: Option<EntityId>,
    pub category_id: Option<EntityId>,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub description: Option<String>,
    pub booked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportDaten {
    pub account_id: Option<EntityId>,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KontoDaten {
    pub account_id: EntityId,
    pub name: Option<String>,
    pub account_type: Option<String>,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KontostandDaten {
    pub account_id: EntityId,
    pub previous_balance: f64,
    pub new_balance: f64,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KarteDaten {
    pub card_id: EntityId,
    pub account_id: Option<EntityId>,
    pub last_four: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KategorieDaten {
    pub category_id: EntityId,
    pub name: Option<String>,
    pub parent_id: Option<EntityId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantEinstellungenDaten {
    #[serde(default)]
    pub changed_fields: Vec<String>,
}

/// USER_INVITED / USER_REMOVED
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MitgliedDaten {
    pub target_user_id: UserId,
    pub email: Option<String>,
    pub role: Option<Rolle>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollenDaten {
    pub target_user_id: UserId,
    pub previous_role: Option<Rolle>,
    pub new_role: Rolle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemDaten {
    pub message: String,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenachrichtigungDaten {
    pub target_user_id: Option<UserId>,
    pub title: String,
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FehlerDaten {
    pub code: String,
    pub message: String,
}

/// Typisierte Nutzlast, eine Variante pro Ereignistyp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventDaten {
    UserJoined(PresenceAenderung),
    UserLeft(PresenceAenderung),
    OnlineUsers(Vec<OnlineBenutzer>),
    OnlineUsersUpdated(Vec<OnlineBenutzer>),
    TransactionCreated(TransaktionDaten),
    TransactionUpdated(TransaktionDaten),
    TransactionDeleted(TransaktionDaten),
    TransactionsImported(ImportDaten),
    AccountCreated(KontoDaten),
    AccountUpdated(KontoDaten),
    AccountDeleted(KontoDaten),
    AccountBalanceUpdated(KontostandDaten),
    CardCreated(KarteDaten),
    CardUpdated(KarteDaten),
    CardDeleted(KarteDaten),
    CategoryCreated(KategorieDaten),
    CategoryUpdated(KategorieDaten),
    CategoryDeleted(KategorieDaten),
    TenantSettingsUpdated(TenantEinstellungenDaten),
    UserInvited(MitgliedDaten),
    UserRemoved(MitgliedDaten),
    UserRoleChanged(RollenDaten),
    SystemAnnouncement(SystemDaten),
    SystemMaintenance(SystemDaten),
    Notification(BenachrichtigungDaten),
    Error(FehlerDaten),
}

impl EventDaten {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::UserJoined(_) => EventType::UserJoined,
            Self::UserLeft(_) => EventType::UserLeft,
            Self::OnlineUsers(_) => EventType::OnlineUsers,
            Self::OnlineUsersUpdated(_) => EventType::OnlineUsersUpdated,
            Self::TransactionCreated(_) => EventType::TransactionCreated,
            Self::TransactionUpdated(_) => EventType::TransactionUpdated,
            Self::TransactionDeleted(_) => EventType::TransactionDeleted,
            Self::TransactionsImported(_) => EventType::TransactionsImported,
            Self::AccountCreated(_) => EventType::AccountCreated,
            Self::AccountUpdated(_) => EventType::AccountUpdated,
            Self::AccountDeleted(_) => EventType::AccountDeleted,
            Self::AccountBalanceUpdated(_) => EventType::AccountBalanceUpdated,
            Self::CardCreated(_) => EventType::CardCreated,
            Self::CardUpdated(_) => EventType::CardUpdated,
            Self::CardDeleted(_) => EventType::CardDeleted,
            Self::CategoryCreated(_) => EventType::CategoryCreated,
            Self::CategoryUpdated(_) => EventType::CategoryUpdated,
            Self::CategoryDeleted(_) => EventType::CategoryDeleted,
            Self::TenantSettingsUpdated(_) => EventType::TenantSettingsUpdated,
            Self::UserInvited(_) => EventType::UserInvited,
            Self::UserRemoved(_) => EventType::UserRemoved,
            Self::UserRoleChanged(_) => EventType::UserRoleChanged,
            Self::SystemAnnouncement(_) => EventType::SystemAnnouncement,
            Self::SystemMaintenance(_) => EventType::SystemMaintenance,
            Self::Notification(_) => EventType::Notification,
            Self::Error(_) => EventType::Error,
        }
    }

    /// ID der betroffenen Entitaet (nur entitaetsbezogene Ereignisse)
    ///
    /// Massenimporte tragen keine einzelne ID und gehen nur an den
    /// Entitaetstyp-Raum.
    pub fn entitaets_id(&self) -> Option<&EntityId> {
        match self {
            Self::TransactionCreated(d) | Self::TransactionUpdated(d) | Self::TransactionDeleted(d) => {
                Some(&d.transaction_id)
            }
            Self::AccountCreated(d) | Self::AccountUpdated(d) | Self::AccountDeleted(d) => {
                Some(&d.account_id)
            }
            Self::AccountBalanceUpdated(d) => Some(&d.account_id),
            Self::CardCreated(d) | Self::CardUpdated(d) | Self::CardDeleted(d) => Some(&d.card_id),
            Self::CategoryCreated(d) | Self::CategoryUpdated(d) | Self::CategoryDeleted(d) => {
                Some(&d.category_id)
            }
            _ => None,
        }
    }

    /// Ziel-Benutzer benutzerspezifischer Ereignisse, falls im Payload
    pub fn ziel_benutzer(&self) -> Option<&UserId> {
        match self {
            Self::UserRoleChanged(d) => Some(&d.target_user_id),
            Self::Notification(d) => d.target_user_id.as_ref(),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// DomainEvent
// ---------------------------------------------------------------------------

/// Frei belegbare Metadaten; nur Schluessel auf der Allow-List verlassen
/// den Server (siehe `validation::bereinigen`)
pub type EventMetadaten = BTreeMap<String, Value>;

/// Domain-Event mit gemeinsamem Umschlag
///
/// Wird von externen Fachmodulen erzeugt und genau einmal vom Broadcaster
/// verarbeitet; hier nie persistiert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Umschlag", into = "Umschlag")]
pub struct DomainEvent {
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
    pub daten: EventDaten,
    pub metadata: Option<EventMetadaten>,
}

impl DomainEvent {
    /// Erstellt ein Event mit aktuellem Zeitstempel und ohne Metadaten
    pub fn neu(tenant_id: TenantId, user_id: UserId, daten: EventDaten) -> Self {
        Self {
            tenant_id,
            user_id,
            timestamp: Utc::now(),
            daten,
            metadata: None,
        }
    }

    pub fn mit_metadaten(mut self, metadata: EventMetadaten) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn event_type(&self) -> EventType {
        self.daten.event_type()
    }

    pub fn klasse(&self) -> RaumKlasse {
        self.event_type().klasse()
    }

    pub fn prioritaet(&self) -> Prioritaet {
        self.event_type().prioritaet()
    }
}

/// Wire-Form des Umschlags mit untypisiertem `data`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Umschlag {
    pub event_type: EventType,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EventMetadaten>,
}

impl TryFrom<Umschlag> for DomainEvent {
    type Error = serde_json::Error;

    fn try_from(u: Umschlag) -> Result<Self, Self::Error> {
        let daten: EventDaten = serde_json::from_value(serde_json::json!({
            "eventType": u.event_type,
            "data": u.data,
        }))?;
        Ok(Self {
            tenant_id: u.tenant_id,
            user_id: u.user_id,
            timestamp: u.timestamp,
            daten,
            metadata: u.metadata,
        })
    }
}

impl From<DomainEvent> for Umschlag {
    fn from(e: DomainEvent) -> Self {
        let event_type = e.event_type();
        // Adjacently tagged: {"eventType": .., "data": ..}
        let data = serde_json::to_value(&e.daten)
            .ok()
            .and_then(|mut v| v.get_mut("data").map(Value::take))
            .unwrap_or(Value::Null);
        Self {
            event_type,
            tenant_id: e.tenant_id,
            user_id: e.user_id,
            timestamp: e.timestamp,
            data,
            metadata: e.metadata,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
