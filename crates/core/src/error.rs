//! Fehlertypen fuer tally-core

use thiserror::Error;

/// Result-Alias fuer tally-core
pub type Result<T> = std::result::Result<T, CoreError>;

/// Fehler beim Erzeugen oder Parsen von Kern-Typen
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Bezeichner leer, zu lang oder mit unerlaubten Zeichen
    #[error("Ungueltiger Bezeichner fuer {art}: {wert:?}")]
    UngueltigeId { art: &'static str, wert: String },

    /// Entitaetstyp steht nicht auf der Allow-List
    #[error("Unbekannter Entitaetstyp: {0}")]
    UnbekannterEntitaetsTyp(String),

    /// Unbekannte Rolle
    #[error("Unbekannte Rolle: {0}")]
    UnbekannteRolle(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fehler_anzeige() {
        let e = CoreError::UngueltigeId {
            art: "TenantId",
            wert: "a:b".into(),
        };
        assert_eq!(e.to_string(), "Ungueltiger Bezeichner fuer TenantId: \"a:b\"");
    }
}
