//! Wire-Format fuer WebSocket-Textframes
//!
//! Jeder Frame ist ein JSON-Objekt. Server-Frames haben die Form
//!
//! ```text
//! { "event": "<NAME>", "data": <Nutzlast> }
//! ```
//!
//! Presence-Ereignisse (`USER_JOINED`, `USER_LEFT`, `ONLINE_USERS`,
//! `ONLINE_USERS_UPDATED`) tragen direkt ihre Nutzlast als `data`, alle
//! anderen Domain-Events den bereinigten Umschlag.
//!
//! Maximale Frame-Groesse fuer Client-Frames: 64 KiB.

use serde::Serialize;
use thiserror::Error;

use crate::control::{ClientBefehl, ServerNachricht};
use crate::events::{Bereich, DomainEvent, EventDaten};
use crate::validation::bereinigen;

// ---------------------------------------------------------------------------
// Konstanten
// ---------------------------------------------------------------------------

/// Maximale Groesse eines Client-Frames in Bytes
pub const MAX_FRAME_GROESSE: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Fehler
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WireFehler {
    #[error("Frame zu gross: {groesse} Bytes (max {max})")]
    FrameZuGross { groesse: usize, max: usize },

    #[error("Ungueltiger Befehl: {0}")]
    UngueltigerBefehl(serde_json::Error),

    #[error("Serialisierung fehlgeschlagen: {0}")]
    Serialisierung(serde_json::Error),
}

pub type WireResult<T> = std::result::Result<T, WireFehler>;

// ---------------------------------------------------------------------------
// Kodierung
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct Frame<'a, T: Serialize> {
    event: &'a str,
    data: T,
}

/// Dekodiert einen Client-Frame
pub fn befehl_dekodieren(text: &str) -> WireResult<ClientBefehl> {
    if text.len() > MAX_FRAME_GROESSE {
        return Err(WireFehler::FrameZuGross {
            groesse: text.len(),
            max: MAX_FRAME_GROESSE,
        });
    }
    serde_json::from_str(text).map_err(WireFehler::UngueltigerBefehl)
}

/// Kodiert eine Steuernachricht
pub fn nachricht_kodieren(nachricht: &ServerNachricht) -> WireResult<String> {
    nachricht.to_json().map_err(WireFehler::Serialisierung)
}

/// Kodiert ein Domain-Event als Server-Frame
///
/// Metadaten werden vor der Kodierung auf die Allow-List reduziert.
pub fn ereignis_kodieren(event: &DomainEvent) -> WireResult<String> {
    let event_type = event.event_type();
    let name = event_type.as_str();
    let ergebnis = if event_type.bereich() == Bereich::Presence {
        match &event.daten {
            EventDaten::UserJoined(d) | EventDaten::UserLeft(d) => {
                serde_json::to_string(&Frame { event: name, data: d })
            }
            EventDaten::OnlineUsers(l) | EventDaten::OnlineUsersUpdated(l) => {
                serde_json::to_string(&Frame { event: name, data: l })
            }
            _ => serde_json::to_string(&Frame { event: name, data: bereinigen(event) }),
        }
    } else {
        serde_json::to_string(&Frame {
            event: name,
            data: bereinigen(event),
        })
    };
    ergebnis.map_err(WireFehler::Serialisierung)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{KategorieDaten, PresenceAenderung};
    use chrono::Utc;
    use serde_json::{json, Value};
    use tally_core::{EntityId, OnlineBenutzer, Rolle, TenantId, UserId};

    fn tenant() -> TenantId {
        TenantId::neu("t1").unwrap()
    }

    fn user() -> UserId {
        UserId::neu("u1").unwrap()
    }

    #[test]
    fn zu_grosser_frame_abgelehnt() {
        let text = format!(r#"{{"command":"heartbeat","pad":"{}"}}"#, "x".repeat(MAX_FRAME_GROESSE));
        assert!(matches!(
            befehl_dekodieren(&text),
            Err(WireFehler::FrameZuGross { .. })
        ));
    }

    #[test]
    fn kaputtes_json_ist_ungueltiger_befehl() {
        assert!(matches!(
            befehl_dekodieren("{kein json"),
            Err(WireFehler::UngueltigerBefehl(_))
        ));
        assert!(matches!(befehl_dekodieren(r#"{"command":"heartbeat"}"#), Ok(ClientBefehl::Heartbeat)));
    }

    #[test]
    fn domain_event_traegt_umschlag() {
        let event = DomainEvent::neu(
            tenant(),
            user(),
            EventDaten::CategoryCreated(KategorieDaten {
                category_id: EntityId::neu("cat-1").unwrap(),
                name: Some("Lebensmittel".into()),
                parent_id: None,
            }),
        );
        let frame: Value = serde_json::from_str(&ereignis_kodieren(&event).unwrap()).unwrap();
        assert_eq!(frame["event"], "CATEGORY_CREATED");
        assert_eq!(frame["data"]["eventType"], "CATEGORY_CREATED");
        assert_eq!(frame["data"]["tenantId"], "t1");
        assert_eq!(frame["data"]["data"]["categoryId"], "cat-1");
    }

    #[test]
    fn presence_event_traegt_nutzlast_direkt() {
        let jetzt = Utc::now();
        let joined = DomainEvent::neu(
            tenant(),
            user(),
            EventDaten::UserJoined(PresenceAenderung {
                user_id: user(),
                email: "a@b.de".into(),
                role: Rolle::Member,
                timestamp: jetzt,
            }),
        );
        let frame: Value = serde_json::from_str(&ereignis_kodieren(&joined).unwrap()).unwrap();
        assert_eq!(frame["event"], "USER_JOINED");
        assert_eq!(frame["data"]["userId"], "u1");
        assert_eq!(frame["data"]["role"], "member");
        assert!(frame["data"].get("tenantId").is_none());

        let snapshot = DomainEvent::neu(
            tenant(),
            user(),
            EventDaten::OnlineUsers(vec![OnlineBenutzer {
                user_id: user(),
                email: "a@b.de".into(),
                role: Rolle::Admin,
                connected_at: jetzt,
                last_seen: jetzt,
                connection_count: 2,
            }]),
        );
        let frame: Value = serde_json::from_str(&ereignis_kodieren(&snapshot).unwrap()).unwrap();
        assert_eq!(frame["event"], "ONLINE_USERS");
        assert_eq!(frame["data"][0]["connectionCount"], json!(2));
    }
}
