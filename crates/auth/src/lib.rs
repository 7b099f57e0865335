//! tally-auth – Verbindungs-Gatekeeper
//!
//! Dieses Crate implementiert:
//! - `AuthVerifier`: Schnittstelle zum externen Auth-Dienst
//! - `StatischerTokenVerifier`: Token-Tabelle aus der Konfiguration
//! - IP- und Identitaets-Rate-Limiter (festes Fenster, Cooldown)
//! - `Gatekeeper`: geordnete Pruefkette fuer neue Verbindungen

pub mod error;
pub mod gatekeeper;
pub mod rate_limit;
pub mod verifier;

// Bequeme Re-Exporte
pub use error::{GateAblehnung, GateResult, LimitKlasse};
pub use gatekeeper::Gatekeeper;
pub use rate_limit::{IdentitaetsRateLimiter, IpRateLimiter, RateLimitKonfig};
pub use verifier::{AuthVerifier, StatischerTokenVerifier, TokenEintrag};
