//! Validierung und Bereinigung eingehender Domain-Events
//!
//! Produzenten ausserhalb des Prozesses liefern untypisiertes JSON. Bevor
//! ein Event den Broadcaster erreicht, wird hier geprueft und auf die
//! Allow-Lists reduziert:
//!
//! - Pflichtfelder `eventType` (bekannter Typ), `tenantId`, `userId`, `timestamp`
//! - `data` muss zum Ereignistyp passen; unbekannte Payload-Felder fallen weg
//! - Umschlag-Felder und Metadaten-Schluessel ausserhalb der Allow-List
//!   werden entfernt

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tally_core::{TenantId, UserId};
use thiserror::Error;

use crate::events::{DomainEvent, EventDaten, EventMetadaten, EventType};

/// Metadaten-Schluessel, die an Clients ausgeliefert werden duerfen
pub const ERLAUBTE_METADATEN: [&str; 5] =
    ["source", "correlationId", "version", "actorUserId", "reason"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidierungsFehler {
    #[error("Ereignis ist kein JSON-Objekt")]
    KeinObjekt,

    #[error("Pflichtfeld fehlt: {0}")]
    FehlendesFeld(&'static str),

    #[error("Unbekannter Ereignistyp: {0}")]
    UnbekannterEventTyp(String),

    #[error("Ungueltiges Feld '{feld}': {grund}")]
    UngueltigesFeld { feld: &'static str, grund: String },

    #[error("Nutzlast passt nicht zu {event_type}: {grund}")]
    UngueltigeNutzlast { event_type: EventType, grund: String },
}

pub type ValidierungsResult<T> = std::result::Result<T, ValidierungsFehler>;

/// Validiert ein rohes Event und baut den typisierten Umschlag
pub fn validieren(roh: &Value) -> ValidierungsResult<DomainEvent> {
    let objekt = roh.as_object().ok_or(ValidierungsFehler::KeinObjekt)?;

    let event_type: EventType = pflicht_string(objekt, "eventType")?.parse()?;
    let tenant_id =
        TenantId::neu(pflicht_string(objekt, "tenantId")?).map_err(|e| ungueltig("tenantId", e))?;
    let user_id =
        UserId::neu(pflicht_string(objekt, "userId")?).map_err(|e| ungueltig("userId", e))?;
    let timestamp = zeitstempel_lesen(objekt)?;

    let data = objekt.get("data").cloned().unwrap_or(Value::Null);
    let daten: EventDaten = serde_json::from_value(serde_json::json!({
        "eventType": event_type,
        "data": data,
    }))
    .map_err(|e| ValidierungsFehler::UngueltigeNutzlast {
        event_type,
        grund: e.to_string(),
    })?;

    let metadata = match objekt.get("metadata") {
        None | Some(Value::Null) => None,
        Some(Value::Object(m)) => metadaten_filtern(m.iter()),
        Some(_) => return Err(ungueltig("metadata", "kein Objekt")),
    };

    Ok(DomainEvent {
        tenant_id,
        user_id,
        timestamp,
        daten,
        metadata,
    })
}

/// Entfernt nicht freigegebene Metadaten vor der Auslieferung
///
/// Auch intern erzeugte Events laufen hier durch, da deren Metadaten
/// nicht ueber `validieren` kamen.
pub fn bereinigen(event: &DomainEvent) -> DomainEvent {
    let mut bereinigt = event.clone();
    bereinigt.metadata = event.metadata.as_ref().and_then(|m| metadaten_filtern(m.iter()));
    bereinigt
}

fn metadaten_filtern<'a>(
    eintraege: impl Iterator<Item = (&'a String, &'a Value)>,
) -> Option<EventMetadaten> {
    let gefiltert: EventMetadaten = eintraege
        .filter(|(k, _)| ERLAUBTE_METADATEN.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    (!gefiltert.is_empty()).then_some(gefiltert)
}

fn pflicht_string<'a>(
    objekt: &'a Map<String, Value>,
    feld: &'static str,
) -> ValidierungsResult<&'a str> {
    match objekt.get(feld) {
        None | Some(Value::Null) => Err(ValidierungsFehler::FehlendesFeld(feld)),
        Some(Value::String(s)) if s.is_empty() => Err(ValidierungsFehler::FehlendesFeld(feld)),
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(ungueltig(feld, "kein String")),
    }
}

/// Akzeptiert RFC 3339 oder Epoch-Millisekunden
fn zeitstempel_lesen(objekt: &Map<String, Value>) -> ValidierungsResult<DateTime<Utc>> {
    match objekt.get("timestamp") {
        None | Some(Value::Null) => Err(ValidierungsFehler::FehlendesFeld("timestamp")),
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| ungueltig("timestamp", e)),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| ungueltig("timestamp", "ausserhalb des gueltigen Bereichs")),
        Some(_) => Err(ungueltig("timestamp", "weder String noch Zahl")),
    }
}

fn ungueltig(feld: &'static str, grund: impl std::fmt::Display) -> ValidierungsFehler {
    ValidierungsFehler::UngueltigesFeld {
        feld,
        grund: grund.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
