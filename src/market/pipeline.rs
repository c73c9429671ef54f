use crate::error::AppError;
use crate::market::backend::{connect_market_stream, fetch_klines_history, MarketWsStream};
use crate::market::protocol::{
    decode_inbound_payload, encode_subscription_request, subscription_topics, InboundMessage,
    SubscriptionAction,
};
use crate::market::store::{
    CandleMergeOutcome, MarketStoreHandle, SeriesReplaceOutcome, SignalAppendOutcome,
    TradeApplyOutcome,
};
use crate::market::types::{
    AuthToken, ConnectionStatus, MarketSelection, MarketStreamConfig, MarketStreamStatusSnapshot,
};
use chrono::Utc;
use futures_util::{Sink, SinkExt, StreamExt};
use reqwest::Client;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const STATUS_HEARTBEAT_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, Default)]
struct TelemetrySnapshot {
    reconnect_attempt: u32,
    connect_count: u64,
    disconnect_count: u64,
    messages_received: u64,
    messages_discarded: u64,
    last_message_at_ms: Option<i64>,
}

#[derive(Debug, Default)]
struct StreamTelemetryAtomics {
    reconnect_attempt: AtomicU32,
    connect_count: AtomicU64,
    disconnect_count: AtomicU64,
    messages_received: AtomicU64,
    messages_discarded: AtomicU64,
    has_last_message_at_ms: AtomicBool,
    last_message_at_ms: AtomicI64,
}

impl StreamTelemetryAtomics {
    fn set_reconnect_attempt(&self, attempt: u32) {
        self.reconnect_attempt.store(attempt, Ordering::Relaxed);
    }

    fn record_connect(&self) {
        self.connect_count.fetch_add(1, Ordering::Relaxed);
    }

    fn record_disconnect(&self) {
        self.disconnect_count.fetch_add(1, Ordering::Relaxed);
    }

    fn record_message(&self, received_at_ms: i64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.last_message_at_ms
            .store(received_at_ms, Ordering::Relaxed);
        self.has_last_message_at_ms.store(true, Ordering::Relaxed);
    }

    fn record_discard(&self) {
        self.messages_discarded.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            reconnect_attempt: self.reconnect_attempt.load(Ordering::Relaxed),
            connect_count: self.connect_count.load(Ordering::Relaxed),
            disconnect_count: self.disconnect_count.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_discarded: self.messages_discarded.load(Ordering::Relaxed),
            last_message_at_ms: if self.has_last_message_at_ms.load(Ordering::Relaxed) {
                Some(self.last_message_at_ms.load(Ordering::Relaxed))
            } else {
                None
            },
        }
    }
}

struct StreamRuntimeContext<'a> {
    config: &'a MarketStreamConfig,
    store: &'a MarketStoreHandle,
    telemetry: &'a Arc<StreamTelemetryAtomics>,
    status_store: &'a Arc<RwLock<MarketStreamStatusSnapshot>>,
    cancel_token: &'a CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InboundApplyOutcome {
    Candle(CandleMergeOutcome),
    Trade(TradeApplyOutcome),
    Signal(SignalAppendOutcome),
}

/// Routes a decoded message to the store operation for its kind.
pub fn apply_inbound_message(
    store: &MarketStoreHandle,
    message: InboundMessage,
) -> InboundApplyOutcome {
    match message {
        InboundMessage::Candle(candle) => InboundApplyOutcome::Candle(store.merge_candle(candle)),
        InboundMessage::Trade(trade) => InboundApplyOutcome::Trade(store.replace_last_trade(trade)),
        InboundMessage::Signal(signal) => {
            InboundApplyOutcome::Signal(store.append_signal(signal))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameDirective {
    Continue,
    Reconnect,
}

#[derive(Debug)]
enum SessionEnd {
    Cancelled,
    Lost(String),
}

/// Fetches history for one selection at a time; a newer load aborts the pending one.
struct HistoryLoader {
    client: Client,
    base_url: Option<String>,
    auth_token: Option<AuthToken>,
    store: MarketStoreHandle,
    cancel_token: CancellationToken,
    pending: Option<JoinHandle<()>>,
}

impl HistoryLoader {
    fn new(config: &MarketStreamConfig, store: MarketStoreHandle, cancel_token: CancellationToken) -> Self {
        Self {
            client: Client::new(),
            base_url: config.history_base_url.clone(),
            auth_token: config.auth_token.clone(),
            store,
            cancel_token,
            pending: None,
        }
    }

    fn reload(&mut self, selection: &MarketSelection) {
        let Some(base_url) = self.base_url.clone() else {
            return;
        };
        self.abort();

        let client = self.client.clone();
        let auth_token = self.auth_token.clone();
        let store = self.store.clone();
        let cancel_token = self.cancel_token.clone();
        let selection = selection.clone();

        self.pending = Some(tokio::spawn(async move {
            let fetched = tokio::select! {
                _ = cancel_token.cancelled() => return,
                fetched = fetch_klines_history(&client, &base_url, &selection, auth_token.as_ref()) => fetched,
            };

            match fetched {
                Ok(candles) => match store.replace_candles_for(&selection, candles) {
                    SeriesReplaceOutcome::Replaced { len } => info!(
                        symbol = %selection.symbol,
                        timeframe = %selection.timeframe,
                        candles = len,
                        "loaded candle history"
                    ),
                    SeriesReplaceOutcome::Stale => debug!(
                        symbol = %selection.symbol,
                        timeframe = %selection.timeframe,
                        "dropping history for inactive selection"
                    ),
                },
                Err(error) => warn!(
                    symbol = %selection.symbol,
                    timeframe = %selection.timeframe,
                    %error,
                    "failed to load candle history"
                ),
            }
        }));
    }

    fn abort(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
    }
}

/// Connection manager loop: connect, subscribe, apply frames, and retry on loss
/// with a fixed delay until `cancel_token` fires.
pub async fn run_market_stream(
    config: MarketStreamConfig,
    store: MarketStoreHandle,
    status_store: Arc<RwLock<MarketStreamStatusSnapshot>>,
    cancel_token: CancellationToken,
) {
    let telemetry = Arc::new(StreamTelemetryAtomics::default());
    let mut selection_rx = store.subscribe_selection();
    let mut history = HistoryLoader::new(&config, store.clone(), cancel_token.child_token());

    let heartbeat_cancel = cancel_token.clone();
    let heartbeat_status_store = Arc::clone(&status_store);
    let heartbeat_telemetry = Arc::clone(&telemetry);
    let heartbeat_store = store.clone();
    let heartbeat_endpoint = config.ws_url.clone();
    let heartbeat_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(STATUS_HEARTBEAT_MS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = heartbeat_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    refresh_status(
                        &heartbeat_status_store,
                        &heartbeat_telemetry,
                        &heartbeat_store.selection(),
                        &heartbeat_endpoint,
                    )
                    .await;
                }
            }
        }
    });

    let context = StreamRuntimeContext {
        config: &config,
        store: &store,
        telemetry: &telemetry,
        status_store: &status_store,
        cancel_token: &cancel_token,
    };

    let mut reconnect_attempt = 0_u32;
    while !cancel_token.is_cancelled() {
        telemetry.set_reconnect_attempt(reconnect_attempt);
        let reason = if reconnect_attempt == 0 {
            "opening market stream".to_string()
        } else {
            format!("reconnect attempt {reconnect_attempt}")
        };
        transition(&context, ConnectionStatus::Connecting, Some(reason)).await;

        let connected = tokio::select! {
            _ = cancel_token.cancelled() => break,
            connected = connect_market_stream(&config.ws_url, config.auth_token.as_ref()) => connected,
        };

        let reason = match connected {
            Ok(websocket_stream) => {
                reconnect_attempt = 0;
                telemetry.set_reconnect_attempt(0);
                telemetry.record_connect();
                info!(endpoint = %config.ws_url, "market stream connected");
                transition(
                    &context,
                    ConnectionStatus::Connected,
                    Some("market stream connected".to_string()),
                )
                .await;

                match run_session(websocket_stream, &context, &mut selection_rx, &mut history).await
                {
                    SessionEnd::Cancelled => break,
                    SessionEnd::Lost(reason) => {
                        telemetry.record_disconnect();
                        warn!(endpoint = %config.ws_url, %reason, "market stream lost");
                        reason
                    }
                }
            }
            Err(error) => {
                warn!(endpoint = %config.ws_url, %error, "market stream connect failed");
                format!("connect failed: {error}")
            }
        };

        if cancel_token.is_cancelled() {
            break;
        }

        reconnect_attempt = reconnect_attempt.saturating_add(1);
        telemetry.set_reconnect_attempt(reconnect_attempt);
        transition(&context, ConnectionStatus::Disconnected, Some(reason)).await;

        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_millis(config.reconnect_delay_ms)) => {}
        }
    }

    cancel_token.cancel();
    history.abort();
    let _ = heartbeat_handle.await;

    transition(
        &context,
        ConnectionStatus::Disconnected,
        Some("stream stopped".to_string()),
    )
    .await;
    info!("market stream stopped");
}

async fn run_session(
    websocket_stream: MarketWsStream,
    context: &StreamRuntimeContext<'_>,
    selection_rx: &mut watch::Receiver<MarketSelection>,
    history: &mut HistoryLoader,
) -> SessionEnd {
    let (mut sink, mut source) = websocket_stream.split();

    // Changes made while disconnected coalesce into the latest value here.
    let mut active = selection_rx.borrow_and_update().clone();
    if let Err(error) = send_subscriptions(&mut sink, SubscriptionAction::Subscribe, &active).await
    {
        return SessionEnd::Lost(format!("subscribe failed: {error}"));
    }
    info!(symbol = %active.symbol, timeframe = %active.timeframe, "subscribed to market topics");
    history.reload(&active);

    loop {
        tokio::select! {
            _ = context.cancel_token.cancelled() => {
                let _ = sink.close().await;
                return SessionEnd::Cancelled;
            }
            changed = selection_rx.changed() => {
                if changed.is_err() {
                    let _ = sink.close().await;
                    return SessionEnd::Cancelled;
                }
                let next = selection_rx.borrow_and_update().clone();
                if next == active {
                    continue;
                }

                if context.config.retract_stale_subscriptions {
                    if let Err(error) =
                        send_subscriptions(&mut sink, SubscriptionAction::Unsubscribe, &active).await
                    {
                        return SessionEnd::Lost(format!("unsubscribe failed: {error}"));
                    }
                }
                if let Err(error) =
                    send_subscriptions(&mut sink, SubscriptionAction::Subscribe, &next).await
                {
                    return SessionEnd::Lost(format!("subscribe failed: {error}"));
                }
                info!(symbol = %next.symbol, timeframe = %next.timeframe, "switched market topics");
                active = next;
                history.reload(&active);
            }
            frame = source.next() => {
                let Some(frame_result) = frame else {
                    return SessionEnd::Lost("stream ended".to_string());
                };

                match frame_result {
                    Ok(message) => {
                        if handle_frame(message, context) == FrameDirective::Reconnect {
                            return SessionEnd::Lost("closed by server".to_string());
                        }
                    }
                    Err(error) => return SessionEnd::Lost(format!("frame error: {error}")),
                }
            }
        }
    }
}

async fn send_subscriptions<S>(
    sink: &mut S,
    action: SubscriptionAction,
    selection: &MarketSelection,
) -> Result<(), AppError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    for topic in subscription_topics(selection) {
        let payload = encode_subscription_request(action, &topic)?;
        sink.send(Message::Text(payload)).await?;
        debug!(?action, %topic, "sent subscription request");
    }
    Ok(())
}

fn handle_frame(message: Message, context: &StreamRuntimeContext<'_>) -> FrameDirective {
    let mut payload = match message {
        Message::Text(text_payload) => text_payload.into_bytes(),
        Message::Binary(binary_payload) => binary_payload,
        Message::Close(frame) => {
            debug!(?frame, "server sent close frame");
            return FrameDirective::Reconnect;
        }
        _ => return FrameDirective::Continue,
    };

    context.telemetry.record_message(now_unix_ms());
    match decode_inbound_payload(payload.as_mut_slice()) {
        Ok(Some(message)) => {
            let kind = message.kind();
            let outcome = apply_inbound_message(context.store, message);
            trace!(kind, ?outcome, "applied market message");
        }
        Ok(None) => {
            context.telemetry.record_discard();
            debug!(bytes = payload.len(), "ignoring unrecognized market message");
        }
        Err(error) => {
            context.telemetry.record_discard();
            warn!(%error, "discarding malformed market message");
        }
    }
    FrameDirective::Continue
}

async fn transition(
    context: &StreamRuntimeContext<'_>,
    state: ConnectionStatus,
    reason: Option<String>,
) {
    context.store.set_connection_status(state);
    publish_status(
        context.status_store,
        context.telemetry,
        state,
        &context.store.selection(),
        &context.config.ws_url,
        reason,
    )
    .await;
}

async fn publish_status(
    status_store: &Arc<RwLock<MarketStreamStatusSnapshot>>,
    telemetry: &Arc<StreamTelemetryAtomics>,
    state: ConnectionStatus,
    selection: &MarketSelection,
    endpoint: &str,
    reason: Option<String>,
) {
    let mut writable = status_store.write().await;
    writable.state = state;
    writable.reason = reason;
    apply_telemetry(&mut writable, telemetry, selection, endpoint);
}

/// Heartbeat refresh: counters and selection move, state and reason stay as last published.
async fn refresh_status(
    status_store: &Arc<RwLock<MarketStreamStatusSnapshot>>,
    telemetry: &Arc<StreamTelemetryAtomics>,
    selection: &MarketSelection,
    endpoint: &str,
) {
    let mut writable = status_store.write().await;
    apply_telemetry(&mut writable, telemetry, selection, endpoint);
}

fn apply_telemetry(
    snapshot: &mut MarketStreamStatusSnapshot,
    telemetry: &StreamTelemetryAtomics,
    selection: &MarketSelection,
    endpoint: &str,
) {
    let telemetry_snapshot = telemetry.snapshot();
    snapshot.symbol.clone_from(&selection.symbol);
    snapshot.timeframe = selection.timeframe;
    snapshot.endpoint = Some(endpoint.to_string());
    snapshot.reconnect_attempt = telemetry_snapshot.reconnect_attempt;
    snapshot.connect_count = telemetry_snapshot.connect_count;
    snapshot.disconnect_count = telemetry_snapshot.disconnect_count;
    snapshot.messages_received = telemetry_snapshot.messages_received;
    snapshot.messages_discarded = telemetry_snapshot.messages_discarded;
    snapshot.last_message_at_ms = telemetry_snapshot.last_message_at_ms;
}

fn now_unix_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::store::MarketStore;
    use crate::market::types::StartMarketStreamArgs;
    use tungstenite::protocol::frame::coding::CloseCode;
    use tungstenite::protocol::CloseFrame;

    struct Fixture {
        config: MarketStreamConfig,
        store: MarketStoreHandle,
        telemetry: Arc<StreamTelemetryAtomics>,
        status_store: Arc<RwLock<MarketStreamStatusSnapshot>>,
        cancel_token: CancellationToken,
    }

    impl Fixture {
        fn new() -> Self {
            let config = StartMarketStreamArgs {
                load_history: Some(false),
                ..Default::default()
            }
            .normalize()
            .expect("default args should normalize");
            let status_store = Arc::new(RwLock::new(MarketStreamStatusSnapshot::idle(
                &config.selection,
                None,
            )));

            Self {
                config,
                store: MarketStoreHandle::new(MarketStore::default()),
                telemetry: Arc::new(StreamTelemetryAtomics::default()),
                status_store,
                cancel_token: CancellationToken::new(),
            }
        }

        fn context(&self) -> StreamRuntimeContext<'_> {
            StreamRuntimeContext {
                config: &self.config,
                store: &self.store,
                telemetry: &self.telemetry,
                status_store: &self.status_store,
                cancel_token: &self.cancel_token,
            }
        }
    }

    const CANDLE_FRAME: &str =
        r#"{"s":"BTCUSDT","p":"1m","t":"2024-01-01T00:00:00Z","o":"1","h":"2","l":"1","c":"2","v":"3"}"#;

    #[test]
    fn applies_text_and_binary_frames_to_store() {
        let fixture = Fixture::new();
        let context = fixture.context();

        let directive = handle_frame(Message::Text(CANDLE_FRAME.to_string()), &context);
        assert_eq!(directive, FrameDirective::Continue);

        let trade = r#"{"symbol":"BTCUSDT","price":"42000","amount":"1"}"#;
        handle_frame(Message::Binary(trade.as_bytes().to_vec()), &context);

        let snapshot = fixture.store.snapshot();
        assert_eq!(snapshot.candles.len(), 1);
        assert_eq!(
            snapshot.last_trade.map(|trade| trade.price),
            Some("42000".to_string())
        );

        let telemetry = fixture.telemetry.snapshot();
        assert_eq!(telemetry.messages_received, 2);
        assert_eq!(telemetry.messages_discarded, 0);
        assert!(telemetry.last_message_at_ms.is_some());
    }

    #[test]
    fn malformed_and_unknown_frames_are_counted_and_skipped() {
        let fixture = Fixture::new();
        let context = fixture.context();
        let revision = fixture.store.revision();

        assert_eq!(
            handle_frame(Message::Text("{not json".to_string()), &context),
            FrameDirective::Continue
        );
        assert_eq!(
            handle_frame(Message::Text(r#"{"type":"welcome"}"#.to_string()), &context),
            FrameDirective::Continue
        );

        let telemetry = fixture.telemetry.snapshot();
        assert_eq!(telemetry.messages_received, 2);
        assert_eq!(telemetry.messages_discarded, 2);
        assert_eq!(fixture.store.revision(), revision);
    }

    #[test]
    fn close_frame_requests_reconnect_and_control_frames_are_ignored() {
        let fixture = Fixture::new();
        let context = fixture.context();

        assert_eq!(
            handle_frame(Message::Ping(vec![1, 2, 3]), &context),
            FrameDirective::Continue
        );
        assert_eq!(
            handle_frame(Message::Pong(Vec::new()), &context),
            FrameDirective::Continue
        );
        let close = Message::Close(Some(CloseFrame {
            code: CloseCode::Away,
            reason: "restarting".into(),
        }));
        assert_eq!(handle_frame(close, &context), FrameDirective::Reconnect);
        assert_eq!(fixture.telemetry.snapshot().messages_received, 0);
    }

    #[test]
    fn routes_each_message_kind_to_its_store_operation() {
        let fixture = Fixture::new();
        let mut payload = CANDLE_FRAME.as_bytes().to_vec();
        let message = decode_inbound_payload(payload.as_mut_slice())
            .expect("valid candle")
            .expect("candle shape");

        assert_eq!(
            apply_inbound_message(&fixture.store, message.clone()),
            InboundApplyOutcome::Candle(CandleMergeOutcome::Appended { evicted: false })
        );
        assert_eq!(
            apply_inbound_message(&fixture.store, message),
            InboundApplyOutcome::Candle(CandleMergeOutcome::Replaced)
        );

        let mut payload = br#"{"strategy":"grid","symbol":"ETHUSDT","action":"sell","price":"1"}"#.to_vec();
        let message = decode_inbound_payload(payload.as_mut_slice())
            .expect("valid signal")
            .expect("signal shape");
        assert_eq!(
            apply_inbound_message(&fixture.store, message),
            InboundApplyOutcome::Signal(SignalAppendOutcome { evicted: false })
        );
    }

    #[tokio::test]
    async fn transition_updates_store_and_status_snapshot() {
        let fixture = Fixture::new();
        let context = fixture.context();
        fixture.telemetry.record_connect();

        transition(
            &context,
            ConnectionStatus::Connected,
            Some("market stream connected".to_string()),
        )
        .await;

        assert_eq!(fixture.store.connection_status(), ConnectionStatus::Connected);
        let status = fixture.status_store.read().await.clone();
        assert_eq!(status.state, ConnectionStatus::Connected);
        assert_eq!(status.connect_count, 1);
        assert_eq!(status.endpoint.as_deref(), Some("ws://localhost:8080/ws"));
        assert_eq!(status.reason.as_deref(), Some("market stream connected"));
    }

    #[tokio::test]
    async fn history_loader_without_base_url_is_inert() {
        let fixture = Fixture::new();
        let mut loader = HistoryLoader::new(
            &fixture.config,
            fixture.store.clone(),
            fixture.cancel_token.clone(),
        );

        loader.reload(&fixture.config.selection);

        assert!(loader.pending.is_none());
    }

    #[tokio::test]
    async fn heartbeat_refresh_keeps_published_state_and_reason() {
        let fixture = Fixture::new();
        let context = fixture.context();
        transition(
            &context,
            ConnectionStatus::Connected,
            Some("market stream connected".to_string()),
        )
        .await;

        fixture.telemetry.record_message(42);
        fixture.telemetry.record_discard();
        refresh_status(
            &fixture.status_store,
            &fixture.telemetry,
            &fixture.store.selection(),
            &fixture.config.ws_url,
        )
        .await;

        let status = fixture.status_store.read().await.clone();
        assert_eq!(status.state, ConnectionStatus::Connected);
        assert_eq!(status.reason.as_deref(), Some("market stream connected"));
        assert_eq!(status.messages_received, 1);
        assert_eq!(status.messages_discarded, 1);
        assert_eq!(status.last_message_at_ms, Some(42));
    }
}
