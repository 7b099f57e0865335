//! tally-presence – Online-Buchfuehrung fuer verbundene Identitaeten
//!
//! Dieses Crate stellt bereit:
//! - `PresenceStore`: Adapter-Trait ueber einen Key-Value-Store mit TTL
//! - `SpeicherStore`: prozesslokale Implementierung (lazy TTL)
//! - `RedisStore`: geteilter Store ueber Redis, ueberlebt Neustarts
//! - `PresenceManager`: Online/Offline-Buchfuehrung, Selbstheilung, Bereinigung

pub mod error;
pub mod manager;
pub mod redis_store;
pub mod store;

pub use error::{PresenceError, PresenceResult};
pub use manager::{BereinigungsBericht, PresenceConfig, PresenceDaten, PresenceManager};
pub use redis_store::RedisStore;
pub use store::{AusfallStore, PresenceStore, SpeicherStore, StoreOp, StoreWert};
