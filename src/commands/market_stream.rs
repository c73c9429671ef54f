use crate::error::AppError;
use crate::market::pipeline::run_market_stream;
use crate::market::types::{
    ConnectionStatus, MarketStreamSession, MarketStreamStatusSnapshot, MarketStreamStopResult,
    StartMarketStreamArgs,
};
use crate::state::{AppState, MarketStreamHandle};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Replaces any running stream with a new one for `args`.
pub async fn start_market_stream(
    state: &AppState,
    args: Option<StartMarketStreamArgs>,
) -> Result<MarketStreamSession, AppError> {
    let config = args.unwrap_or_default().normalize()?;

    let existing_handle = {
        let mut stream_slot = state.market_stream.lock().await;
        stream_slot.take()
    };
    if let Some(handle) = existing_handle {
        handle.cancellation_token.cancel();
        let _ = handle.join_handle.await;
    }

    state.store.select(&config.selection)?;

    let cancellation_token = CancellationToken::new();
    let task_token = cancellation_token.clone();
    let status_store = Arc::clone(&state.market_status);
    let runtime_config = config.clone();
    let store = state.store.clone();

    let join_handle = tokio::spawn(async move {
        run_market_stream(runtime_config, store, status_store, task_token).await;
    });

    {
        let mut stream_slot = state.market_stream.lock().await;
        *stream_slot = Some(MarketStreamHandle {
            cancellation_token,
            join_handle,
        });
    }

    info!(
        symbol = %config.selection.symbol,
        timeframe = %config.selection.timeframe,
        endpoint = %config.ws_url,
        "market stream started"
    );
    Ok(MarketStreamSession::from_config(&config))
}

pub async fn stop_market_stream(state: &AppState) -> Result<MarketStreamStopResult, AppError> {
    let existing_handle = {
        let mut stream_slot = state.market_stream.lock().await;
        stream_slot.take()
    };

    let stopped = if let Some(handle) = existing_handle {
        handle.cancellation_token.cancel();
        let _ = handle.join_handle.await;
        true
    } else {
        false
    };

    state
        .store
        .set_connection_status(ConnectionStatus::Disconnected);
    {
        let selection = state.store.selection();
        let mut writable = state.market_status.write().await;
        let mut stopped_status = MarketStreamStatusSnapshot::idle(
            &selection,
            Some("stream stopped by command".to_string()),
        );
        stopped_status.endpoint = writable.endpoint.take();
        stopped_status.connect_count = writable.connect_count;
        stopped_status.disconnect_count = writable.disconnect_count;
        stopped_status.messages_received = writable.messages_received;
        stopped_status.messages_discarded = writable.messages_discarded;
        stopped_status.last_message_at_ms = writable.last_message_at_ms;
        *writable = stopped_status;
    }

    Ok(MarketStreamStopResult { stopped })
}

pub async fn market_stream_status(
    state: &AppState,
) -> Result<MarketStreamStatusSnapshot, AppError> {
    let snapshot = state.market_status.read().await.clone();
    Ok(snapshot)
}
