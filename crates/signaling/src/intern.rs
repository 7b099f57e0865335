//! Interner Publish-Eingang fuer Domain-Module anderer Prozesse
//!
//! `POST /internal/events` nimmt ein Event im Umschlag-Format entgegen,
//! validiert es und reicht es an [`EventBroadcaster::publish`] weiter.
//! Die Route gehoert auf den internen Observability-Port, nie auf den
//! oeffentlichen WebSocket-Listener.
//!
//! [`EventBroadcaster::publish`]: crate::broadcast::EventBroadcaster::publish

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::SignalingError;
use crate::server_state::RealtimeState;

pub const INTERN_EVENTS_PFAD: &str = "/internal/events";

pub fn intern_router(state: Arc<RealtimeState>) -> Router {
    Router::new()
        .route(INTERN_EVENTS_PFAD, post(event_annehmen))
        .with_state(state)
}

async fn event_annehmen(
    State(state): State<Arc<RealtimeState>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let Json(roh) = match body {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(fehler = %e, "Interner Publish: Body ist kein JSON");
            return abgelehnt(e.body_text());
        }
    };

    match state.broadcaster.publish_roh(&roh) {
        Ok(empfaenger) => (
            StatusCode::ACCEPTED,
            Json(json!({ "recipients": empfaenger })),
        )
            .into_response(),
        Err(SignalingError::Validierung(e)) => abgelehnt(e.to_string()),
        Err(e) => {
            tracing::error!(fehler = %e, "Interner Publish fehlgeschlagen");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn abgelehnt(grund: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": grund }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use std::sync::Arc;
    use tally_auth::{Gatekeeper, RateLimitKonfig, StatischerTokenVerifier};
    use tally_core::rooms::tenant_raum;
    use tally_core::{ConnectionId, TenantId, UserId};
    use tally_observability::TallyMetriken;
    use tally_presence::{PresenceConfig, PresenceManager, SpeicherStore};
    use tower::ServiceExt;

    use crate::server_state::RealtimeConfig;

    fn state() -> Arc<RealtimeState> {
        RealtimeState::neu(
            RealtimeConfig::default(),
            PresenceManager::neu(Arc::new(SpeicherStore::neu()), PresenceConfig::default()),
            Gatekeeper::neu(
                &RateLimitKonfig::default(),
                Arc::new(StatischerTokenVerifier::default()),
            ),
            TallyMetriken::neu().unwrap(),
        )
    }

    fn anfrage(body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(INTERN_EVENTS_PFAD)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.into())
            .unwrap()
    }

    async fn json_body(antwort: Response) -> Value {
        let bytes = axum::body::to_bytes(antwort.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn gueltiges_event_wird_veroeffentlicht() {
        let state = state();
        let acme = TenantId::neu("acme").unwrap();
        let conn = ConnectionId::new();
        let mut rx = state
            .broadcaster
            .client_registrieren(conn, acme.clone(), UserId::neu("alice").unwrap())
            .rx;
        state.broadcaster.raum_beitreten(conn, &tenant_raum(&acme)).unwrap();

        let event = json!({
            "eventType": "ACCOUNT_BALANCE_UPDATED",
            "tenantId": "acme",
            "userId": "billing",
            "timestamp": "2026-03-01T08:00:00Z",
            "data": { "accountId": "a1", "previousBalance": 100, "newBalance": 150 }
        });
        let antwort = intern_router(Arc::clone(&state))
            .oneshot(anfrage(event.to_string()))
            .await
            .unwrap();
        assert_eq!(antwort.status(), StatusCode::ACCEPTED);
        assert_eq!(json_body(antwort).await["recipients"], 1);

        let frame: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame["event"], "ACCOUNT_BALANCE_UPDATED");
        assert_eq!(frame["data"]["data"]["newBalance"], 150.0);
    }

    #[tokio::test]
    async fn ungueltige_events_ergeben_400() {
        let app = intern_router(state());

        let ohne_tenant = json!({
            "eventType": "ACCOUNT_BALANCE_UPDATED",
            "userId": "billing",
            "timestamp": "2026-03-01T08:00:00Z",
            "data": { "accountId": "a1", "previousBalance": 1, "newBalance": 2 }
        });
        let antwort = app
            .clone()
            .oneshot(anfrage(ohne_tenant.to_string()))
            .await
            .unwrap();
        assert_eq!(antwort.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(antwort).await["error"]
            .as_str()
            .unwrap()
            .contains("tenantId"));

        let unbekannt = json!({
            "eventType": "USER_TELEPORTED",
            "tenantId": "acme",
            "userId": "u",
            "timestamp": "2026-03-01T08:00:00Z"
        });
        let antwort = app
            .clone()
            .oneshot(anfrage(unbekannt.to_string()))
            .await
            .unwrap();
        assert_eq!(antwort.status(), StatusCode::BAD_REQUEST);

        let antwort = app.oneshot(anfrage("kein json")).await.unwrap();
        assert_eq!(antwort.status(), StatusCode::BAD_REQUEST);
    }
}
