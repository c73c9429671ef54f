pub mod commands;
pub mod error;
pub mod logging;
pub mod market;
pub mod state;

use commands::market_stream::{market_stream_status, start_market_stream, stop_market_stream};
use error::AppError;
use market::store::{MarketStore, MarketStoreHandle};
use market::types::{
    ConnectionStatus, MarketSelection, MarketTimeframe, StartMarketStreamArgs, TradeOrdering,
};
use state::AppState;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

const REPORT_INTERVAL_MS: u64 = 1_000;

#[derive(Clone, Default)]
pub struct RunOptions {
    pub stream_args: StartMarketStreamArgs,
    pub trade_ordering: TradeOrdering,
}

/// One-line view of the store used by the periodic reporter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketSummary {
    pub symbol: String,
    pub timeframe: MarketTimeframe,
    pub candles: usize,
    pub last_close: Option<String>,
    pub last_trade_price: Option<String>,
    pub signals: usize,
    pub connection: ConnectionStatus,
}

pub fn summarize(store: &MarketStore) -> MarketSummary {
    MarketSummary {
        symbol: store.selection().symbol.clone(),
        timeframe: store.selection().timeframe,
        candles: store.candles().len(),
        last_close: store.candles().back().map(|candle| candle.close.clone()),
        last_trade_price: store.last_trade().map(|trade| trade.price.clone()),
        signals: store.signals().len(),
        connection: store.connection_status(),
    }
}

async fn run_reporter(store: MarketStoreHandle, cancel_token: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_millis(REPORT_INTERVAL_MS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_reported = None;

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {
                let revision = store.revision();
                if last_reported == Some(revision) {
                    continue;
                }
                last_reported = Some(revision);

                let summary = store.read(summarize);
                info!(
                    symbol = %summary.symbol,
                    timeframe = %summary.timeframe,
                    candles = summary.candles,
                    last_close = summary.last_close.as_deref().unwrap_or("-"),
                    last_trade = summary.last_trade_price.as_deref().unwrap_or("-"),
                    signals = summary.signals,
                    connection = summary.connection.as_str(),
                    "market view"
                );
            }
        }
    }
}

/// Runs the sync client until Ctrl-C.
pub async fn run(options: RunOptions) -> Result<(), AppError> {
    let store = MarketStoreHandle::new(MarketStore::new(
        MarketSelection::default(),
        options.trade_ordering,
    ));
    let state = AppState::new(store);

    let session = start_market_stream(&state, Some(options.stream_args)).await?;
    info!(
        history = session.history_enabled,
        reconnect_delay_ms = session.reconnect_delay_ms,
        trade_ordering = ?options.trade_ordering,
        "market sync running, press Ctrl-C to stop"
    );

    let reporter_cancel = CancellationToken::new();
    let reporter_handle = tokio::spawn(run_reporter(state.store.clone(), reporter_cancel.clone()));

    let shutdown = tokio::signal::ctrl_c().await;
    reporter_cancel.cancel();
    let _ = reporter_handle.await;
    stop_market_stream(&state).await?;
    shutdown?;

    let status = market_stream_status(&state).await?;
    info!(
        connects = status.connect_count,
        disconnects = status.disconnect_count,
        messages = status.messages_received,
        discarded = status.messages_discarded,
        "market sync stopped"
    );
    Ok(())
}
