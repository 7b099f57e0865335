//! Credential-Pruefung
//!
//! Der eigentliche Auth-Dienst ist ein externer Collaborator; dieses Modul
//! definiert nur die Schnittstelle und einen statischen Verifier fuer
//! Konfigurations-Tokens und Tests.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use tally_core::{Identitaet, Rolle, TenantId, UserId};

/// Prueft ein Bearer-Credential
///
/// `None` bei jedem Fehlschlag; der Grund bleibt beim Verifier.
#[async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn verifizieren(&self, credential: &str) -> Option<Identitaet>;
}

/// Token-Eintrag aus der Konfiguration (`[[auth.tokens]]`)
#[derive(Debug, Clone, Deserialize)]
pub struct TokenEintrag {
    pub token: String,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub email: String,
    pub role: Rolle,
}

/// Verifier ueber eine feste Token-Tabelle
#[derive(Debug, Default)]
pub struct StatischerTokenVerifier {
    tokens: HashMap<String, Identitaet>,
}

impl StatischerTokenVerifier {
    pub fn neu(eintraege: impl IntoIterator<Item = TokenEintrag>) -> Self {
        let tokens = eintraege
            .into_iter()
            .map(|e| {
                (
                    e.token,
                    Identitaet {
                        tenant_id: e.tenant_id,
                        user_id: e.user_id,
                        email: e.email,
                        role: e.role,
                    },
                )
            })
            .collect();
        Self { tokens }
    }

    /// Fuegt ein Token hinzu (Tests, Bootstrapping)
    pub fn mit_token(mut self, token: impl Into<String>, identitaet: Identitaet) -> Self {
        self.tokens.insert(token.into(), identitaet);
        self
    }

    pub fn anzahl(&self) -> usize {
        self.tokens.len()
    }
}

#[async_trait]
impl AuthVerifier for StatischerTokenVerifier {
    async fn verifizieren(&self, credential: &str) -> Option<Identitaet> {
        self.tokens.get(credential).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_aus_konfiguration() {
        let eintrag: TokenEintrag = toml::from_str(
            r#"
            token = "geheim"
            tenant_id = "acme"
            user_id = "u1"
            email = "u1@acme.de"
            role = "admin"
            "#,
        )
        .unwrap();
        let verifier = StatischerTokenVerifier::neu([eintrag]);

        let identitaet = verifier.verifizieren("geheim").await.unwrap();
        assert_eq!(identitaet.tenant_id.as_str(), "acme");
        assert_eq!(identitaet.role, Rolle::Admin);
        assert!(verifier.verifizieren("falsch").await.is_none());
    }

    #[test]
    fn ungueltige_tenant_id_in_konfiguration() {
        let ergebnis: Result<TokenEintrag, _> = toml::from_str(
            r#"
            token = "x"
            tenant_id = "a:b"
            user_id = "u1"
            email = "e"
            role = "member"
            "#,
        );
        assert!(ergebnis.is_err());
    }
}
