//! Prometheus-kompatible Metriken fuer den Realtime-Kern
//!
//! Registrierte Metriken:
//! - `tally_connected_clients` – Gauge: Aktuell verbundene Clients
//! - `tally_events_published_total` – Counter: Ausgelieferte Events (event_type)
//! - `tally_events_dropped_total` – Counter: Verworfene Zustellungen (priority)
//! - `tally_connections_rejected_total` – Counter: Abgelehnte Verbindungen (reason)
//! - `tally_slow_consumers_total` – Counter: Zwangsgetrennte langsame Clients
//! - `tally_presence_store_errors_total` – Counter: Fehlgeschlagene Store-Operationen
//! - `tally_http_requests_total` – Counter: HTTP-Anfragen (method, path, status)
//!
//! Die Registry lebt im Kontext-Objekt des Servers, nicht in einem globalen
//! Singleton. Tests erzeugen sich jeweils eine eigene Instanz.

use anyhow::Result;
use axum::{extract::State, http::header, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Alle Tally-Prometheus-Metriken
#[derive(Clone)]
pub struct TallyMetriken {
    pub registry: Arc<Registry>,

    // Verbindungen
    pub connected_clients: IntGauge,
    pub connections_rejected_total: IntCounterVec,
    pub slow_consumers_total: IntCounter,

    // Events
    pub events_published_total: IntCounterVec,
    pub events_dropped_total: IntCounterVec,

    // Presence
    pub presence_store_errors_total: IntCounter,

    // HTTP
    pub http_requests_total: IntCounterVec,
}

impl TallyMetriken {
    /// Erstellt und registriert alle Metriken in einer neuen Registry
    pub fn neu() -> Result<Self> {
        let registry = Registry::new();

        let connected_clients = IntGauge::with_opts(Opts::new(
            "tally_connected_clients",
            "Anzahl aktuell verbundener Clients",
        ))?;
        registry.register(Box::new(connected_clients.clone()))?;

        let connections_rejected_total = IntCounterVec::new(
            Opts::new(
                "tally_connections_rejected_total",
                "Abgelehnte Verbindungsversuche nach Grund",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(connections_rejected_total.clone()))?;

        let slow_consumers_total = IntCounter::with_opts(Opts::new(
            "tally_slow_consumers_total",
            "Wegen voller Send-Queue getrennte Verbindungen",
        ))?;
        registry.register(Box::new(slow_consumers_total.clone()))?;

        let events_published_total = IntCounterVec::new(
            Opts::new(
                "tally_events_published_total",
                "Veroeffentlichte Domain-Events nach Typ",
            ),
            &["event_type"],
        )?;
        registry.register(Box::new(events_published_total.clone()))?;

        let events_dropped_total = IntCounterVec::new(
            Opts::new(
                "tally_events_dropped_total",
                "Unter Backpressure verworfene Zustellungen nach Prioritaet",
            ),
            &["priority"],
        )?;
        registry.register(Box::new(events_dropped_total.clone()))?;

        let presence_store_errors_total = IntCounter::with_opts(Opts::new(
            "tally_presence_store_errors_total",
            "Fehlgeschlagene Operationen gegen den Presence-Store",
        ))?;
        registry.register(Box::new(presence_store_errors_total.clone()))?;

        let http_requests_total = IntCounterVec::new(
            Opts::new("tally_http_requests_total", "Gesamtanzahl HTTP-Anfragen"),
            &["method", "path", "status"],
        )?;
        registry.register(Box::new(http_requests_total.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            connected_clients,
            connections_rejected_total,
            slow_consumers_total,
            events_published_total,
            events_dropped_total,
            presence_store_errors_total,
            http_requests_total,
        })
    }

    /// Zaehlt eine abgelehnte Verbindung
    pub fn ablehnung_zaehlen(&self, grund: &str) {
        self.connections_rejected_total
            .with_label_values(&[grund])
            .inc();
    }

    /// Zaehlt ein veroeffentlichtes Event
    pub fn event_zaehlen(&self, event_type: &str) {
        self.events_published_total
            .with_label_values(&[event_type])
            .inc();
    }

    /// Zaehlt eine verworfene Zustellung
    pub fn verworfen_zaehlen(&self, prioritaet: &str) {
        self.events_dropped_total
            .with_label_values(&[prioritaet])
            .inc();
    }

    /// Exportiert alle Metriken im Prometheus-Text-Format
    pub fn exportieren(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Axum-Router fuer den `/metrics`-Endpunkt
pub fn metrics_router(metriken: TallyMetriken) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metriken)
}

/// `GET /metrics` – Prometheus scrape endpoint
async fn metrics_handler(State(metriken): State<TallyMetriken>) -> impl IntoResponse {
    match metriken.exportieren() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            text,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(fehler = %e, "Metriken-Export fehlgeschlagen");
            axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metriken_erstellen() {
        let m = TallyMetriken::neu().unwrap();
        assert_eq!(m.connected_clients.get(), 0);
    }

    #[test]
    fn zwei_instanzen_sind_unabhaengig() {
        let a = TallyMetriken::neu().unwrap();
        let b = TallyMetriken::neu().unwrap();
        a.connected_clients.inc();
        assert_eq!(a.connected_clients.get(), 1);
        assert_eq!(b.connected_clients.get(), 0);
    }

    #[test]
    fn zaehler_mit_labels() {
        let m = TallyMetriken::neu().unwrap();
        m.event_zaehlen("ACCOUNT_BALANCE_UPDATED");
        m.event_zaehlen("ACCOUNT_BALANCE_UPDATED");
        m.verworfen_zaehlen("LOW");
        m.ablehnung_zaehlen("ip_rate_limit");

        assert_eq!(
            m.events_published_total
                .with_label_values(&["ACCOUNT_BALANCE_UPDATED"])
                .get(),
            2
        );
        assert_eq!(m.events_dropped_total.with_label_values(&["LOW"]).get(), 1);
        assert_eq!(
            m.connections_rejected_total
                .with_label_values(&["ip_rate_limit"])
                .get(),
            1
        );
    }

    #[test]
    fn export_enthaelt_metriken() {
        let m = TallyMetriken::neu().unwrap();
        m.connected_clients.set(3);
        m.presence_store_errors_total.inc();
        m.event_zaehlen("USER_JOINED");

        let text = m.exportieren().unwrap();
        assert!(text.contains("tally_connected_clients 3"));
        assert!(text.contains("tally_presence_store_errors_total 1"));
        assert!(text.contains("tally_events_published_total{event_type=\"USER_JOINED\"} 1"));
    }
}
