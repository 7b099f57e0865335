//! tally-signaling – Realtime-Kern fuer Presence und Event-Broadcast
//!
//! Dieser Crate verbindet Gatekeeper, Presence und Broadcaster zu einem
//! WebSocket-Dienst. Jede Verbindung laeuft als eigener Task; andere Module
//! erreichen verbundene Clients ausschliesslich ueber
//! [`EventBroadcaster::publish`].
//!
//! ## Architektur
//!
//! ```text
//! WebSocket-Route (ws.rs)
//!     |  Verbindungs-Limit -> Gatekeeper (IP, Credential, Identitaet)
//!     v
//! ClientConnection (pro Verbindung ein Task)
//!     |  State Machine: Unauthentifiziert -> Aktiv -> Trennend -> Geschlossen
//!     v
//! MessageDispatcher (heartbeat, subscribe, unsubscribe)
//!
//! POST /internal/events (intern.rs) -> Validierung -> EventBroadcaster::publish
//!
//! EventBroadcaster   – Raeume, Send-Queues, Backpressure
//! Hintergrund-Tasks  – Stale-Bereinigung, Presence-Rebroadcast
//! ```

pub mod background;
pub mod broadcast;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod intern;
pub mod server_state;
pub mod ws;

// Bequeme Re-Exporte
pub use background::{bereinigung_ausfuehren, hintergrund_tasks_starten, rebroadcast_ausfuehren};
pub use broadcast::{BroadcastKonfig, ClientEmpfaenger, EventBroadcaster};
pub use connection::{ClientConnection, Eingang, Trennungsgrund, Verbindung, VerbindungsZustand};
pub use dispatcher::MessageDispatcher;
pub use error::{SignalingError, SignalingResult};
pub use intern::{intern_router, INTERN_EVENTS_PFAD};
pub use server_state::{RealtimeConfig, RealtimeState};
pub use ws::{handshake_pruefen, realtime_router};
