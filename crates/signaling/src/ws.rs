//! WebSocket-Route – Handshake, Pruefkette und Upgrade
//!
//! Abgelehnte Handshakes enden als normale HTTP-Antwort vor dem Upgrade.
//! Der Body ist immer generisch; die Ursache steht nur im Server-Log.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{future, SinkExt, StreamExt};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tally_auth::{GateAblehnung, LimitKlasse};
use tally_core::Identitaet;
use tally_protocol::wire::MAX_FRAME_GROESSE;
use tokio::sync::watch;

use crate::connection::{ClientConnection, Eingang};
use crate::server_state::RealtimeState;

/// Router-State der WebSocket-Route
#[derive(Clone)]
pub struct WsKontext {
    pub state: Arc<RealtimeState>,
    pub shutdown: watch::Receiver<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HandshakeQuery {
    pub token: Option<String>,
}

/// Router mit der WebSocket-Route unter `config.ws_pfad`
pub fn realtime_router(state: Arc<RealtimeState>, shutdown: watch::Receiver<bool>) -> Router {
    let pfad = state.config.ws_pfad.clone();
    Router::new()
        .route(&pfad, get(ws_handler))
        .with_state(WsKontext { state, shutdown })
}

async fn ws_handler(
    State(kontext): State<WsKontext>,
    ConnectInfo(adresse): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<HandshakeQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let identitaet =
        match handshake_pruefen(&kontext.state, adresse.ip(), &headers, query.token).await {
            Ok(identitaet) => identitaet,
            Err(antwort) => return antwort,
        };

    let WsKontext { state, shutdown } = kontext;
    ws.max_message_size(MAX_FRAME_GROESSE)
        .on_upgrade(move |socket| socket_betreiben(state, identitaet, socket, shutdown))
}

async fn socket_betreiben(
    state: Arc<RealtimeState>,
    identitaet: Identitaet,
    socket: WebSocket,
    shutdown: watch::Receiver<bool>,
) {
    let (sink, stream) = socket.split();

    // Ping/Pong beantwortet der Transport selbst
    let eingang = Box::pin(stream.filter_map(|nachricht| {
        future::ready(match nachricht {
            Ok(Message::Text(text)) => Some(Eingang::Text(text)),
            Ok(Message::Binary(_)) => Some(Eingang::Binaer),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
            Ok(Message::Close(_)) | Err(_) => Some(Eingang::Geschlossen),
        })
    }));
    let ausgang = sink.with(|text: String| future::ready(Ok::<_, axum::Error>(Message::Text(text))));

    ClientConnection::neu(state)
        .verarbeiten(identitaet, eingang, ausgang, shutdown)
        .await;
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Fuehrt die Pruefkette eines Handshakes aus
///
/// Reihenfolge: Verbindungs-Limit, dann Gatekeeper (IP-Limit,
/// Credential, Identitaets-Limit). Das Credential kommt aus dem
/// `Authorization`-Header, ersatzweise aus `?token=`.
pub async fn handshake_pruefen(
    state: &RealtimeState,
    ip: IpAddr,
    headers: &HeaderMap,
    query_token: Option<String>,
) -> Result<Identitaet, Response> {
    if state.broadcaster.client_anzahl() >= state.config.max_verbindungen {
        state.metriken.ablehnung_zaehlen("server_full");
        tracing::warn!(ip = %ip, max = state.config.max_verbindungen, "Verbindungs-Limit erreicht");
        return Err((StatusCode::SERVICE_UNAVAILABLE, "Service unavailable").into_response());
    }

    let credential = bearer_token(headers).or(query_token);
    match state.gatekeeper.pruefen(ip, credential.as_deref()).await {
        Ok(identitaet) => Ok(identitaet),
        Err(ablehnung) => {
            state.metriken.ablehnung_zaehlen(ablehnung.grund());
            Err(ablehnung_antwort(&ablehnung))
        }
    }
}

fn ablehnung_antwort(ablehnung: &GateAblehnung) -> Response {
    match ablehnung {
        GateAblehnung::RateLimitiert { klasse: LimitKlasse::Ip, retry_after } => {
            let sekunden = retry_after.as_secs().max(1);
            let mut antwort =
                (StatusCode::TOO_MANY_REQUESTS, ablehnung.oeffentliche_meldung()).into_response();
            antwort
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(sekunden));
            antwort
        }
        _ => (StatusCode::UNAUTHORIZED, ablehnung.oeffentliche_meldung()).into_response(),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let wert = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = wert.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
