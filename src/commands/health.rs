use crate::market::types::ConnectionStatus;
use crate::state::AppState;
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub connection: ConnectionStatus,
    pub candles: usize,
    pub signals: usize,
    pub revision: u64,
}

pub fn build_health_response(state: &AppState) -> HealthResponse {
    let (connection, candles, signals, revision) = state.store.read(|store| {
        (
            store.connection_status(),
            store.candles().len(),
            store.signals().len(),
            store.revision(),
        )
    });

    HealthResponse {
        status: if connection == ConnectionStatus::Connected {
            "ok"
        } else {
            "degraded"
        },
        uptime_ms: state.started_at.elapsed().as_millis(),
        connection,
        candles,
        signals,
        revision,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::store::{MarketStore, MarketStoreHandle};

    #[test]
    fn health_reports_degraded_until_connected() {
        let state = AppState::new(MarketStoreHandle::new(MarketStore::default()));

        let response = build_health_response(&state);
        assert_eq!(response.status, "degraded");
        assert_eq!(response.connection, ConnectionStatus::Disconnected);
        assert_eq!(response.candles, 0);
        assert!(response.uptime_ms <= 1_000);

        state.store.set_connection_status(ConnectionStatus::Connected);
        let response = build_health_response(&state);
        assert_eq!(response.status, "ok");
        assert!(response.revision > 0);
    }
}
