//! tally-protocol – Ereignis-Katalog und Wire-Protokoll
//!
//! Dieses Crate definiert alle broadcastbaren Domain-Events samt
//! Raum-Klasse und Prioritaet, deren Validierung an der Publish-Grenze
//! sowie die Befehle und Antworten zwischen Client und Server.

pub mod control;
pub mod events;
pub mod validation;
pub mod wire;

pub use control::{AbonnementAnfrage, ClientBefehl, ErrorCode, ServerNachricht};
pub use events::{
    Bereich, DomainEvent, EventDaten, EventType, Prioritaet, RaumKlasse, TenantBereich,
};
pub use validation::{bereinigen, validieren, ValidierungsFehler};
pub use wire::{befehl_dekodieren, ereignis_kodieren, nachricht_kodieren, WireFehler};
