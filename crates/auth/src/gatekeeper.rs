//! Verbindungs-Gatekeeper
//!
//! Geordnete, kurzschliessende Pruefkette, guenstigste Pruefung zuerst:
//!
//! 1. IP-Rate-Limit (ohne Auth-Aufruf)
//! 2. Credential-Pruefung ueber den [`AuthVerifier`]
//! 3. Identitaets-Rate-Limit (Versuche pro Fenster, Cooldown nach Trennung)
//!
//! Erst wenn alle drei bestehen, darf die Verbindung Raeumen beitreten.
//! Ablehnungen sind terminal; es gibt keine automatische Wiederholung.

use std::net::IpAddr;
use std::sync::Arc;
use tally_core::Identitaet;

use crate::error::{GateAblehnung, GateResult, LimitKlasse};
use crate::rate_limit::{IdentitaetsRateLimiter, IpRateLimiter, RateLimitKonfig};
use crate::verifier::AuthVerifier;

pub struct Gatekeeper {
    ip_limiter: IpRateLimiter,
    verifier: Arc<dyn AuthVerifier>,
    identitaets_limiter: IdentitaetsRateLimiter,
}

impl Gatekeeper {
    pub fn neu(konfig: &RateLimitKonfig, verifier: Arc<dyn AuthVerifier>) -> Self {
        Self {
            ip_limiter: IpRateLimiter::neu(konfig.ip_max_anfragen, konfig.ip_fenster),
            verifier,
            identitaets_limiter: IdentitaetsRateLimiter::neu(
                konfig.identitaet_max_versuche,
                konfig.identitaet_fenster,
                konfig.identitaet_cooldown,
            ),
        }
    }

    /// Fuehrt die Pruefkette fuer einen Verbindungsversuch aus
    pub async fn pruefen(&self, ip: IpAddr, credential: Option<&str>) -> GateResult<Identitaet> {
        if let Err(retry_after) = self.ip_limiter.pruefen(ip) {
            tracing::warn!(%ip, retry_after_ms = retry_after.as_millis() as u64, "Verbindung abgelehnt: IP-Limit");
            return Err(GateAblehnung::RateLimitiert {
                klasse: LimitKlasse::Ip,
                retry_after,
            });
        }

        let Some(credential) = credential.filter(|c| !c.is_empty()) else {
            tracing::warn!(%ip, "Verbindung abgelehnt: kein Credential");
            return Err(GateAblehnung::Authentifizierung);
        };
        let Some(identitaet) = self.verifier.verifizieren(credential).await else {
            tracing::warn!(%ip, "Verbindung abgelehnt: Credential ungueltig");
            return Err(GateAblehnung::Authentifizierung);
        };

        if let Err(retry_after) = self
            .identitaets_limiter
            .pruefen(&identitaet.tenant_id, &identitaet.user_id)
        {
            tracing::warn!(
                %ip,
                tenant_id = %identitaet.tenant_id,
                user_id = %identitaet.user_id,
                retry_after_ms = retry_after.as_millis() as u64,
                "Verbindung abgelehnt: Identitaets-Limit"
            );
            return Err(GateAblehnung::RateLimitiert {
                klasse: LimitKlasse::Identitaet,
                retry_after,
            });
        }

        Ok(identitaet)
    }

    /// Vermerkt die Trennung einer Identitaet fuer den Cooldown
    pub fn trennung_melden(&self, identitaet: &Identitaet) {
        self.identitaets_limiter
            .trennung_melden(&identitaet.tenant_id, &identitaet.user_id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
