//! tally-core – Gemeinsame Typen, Raum-Topologie und Fehlertypen
//!
//! Dieses Crate stellt die fundamentalen Bausteine bereit, die von allen
//! anderen Tally-Crates gemeinsam genutzt werden: Identifikations-Newtypes,
//! die authentifizierte `Identitaet` und die deterministische Adressierung
//! der Broadcast-Raeume.

pub mod error;
pub mod rooms;
pub mod types;

// Re-Exporte fuer bequemen Zugriff
pub use error::{CoreError, Result};
pub use rooms::RaumAdresse;
pub use types::{
    ConnectionId, EntitaetsTyp, EntityId, Identitaet, OnlineBenutzer, Rolle, TenantId, UserId,
};
