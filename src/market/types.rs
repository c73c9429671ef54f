use crate::error::AppError;
use crate::market::backend::{http_base_for_origin, ws_endpoint_for_origin};
use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_SYMBOL: &str = "BTCUSDT";
pub const DEFAULT_TIMEFRAME: MarketTimeframe = MarketTimeframe::M1;
pub const DEFAULT_ORIGIN: &str = "http://localhost:8080";
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5_000;
pub const DEFAULT_LOAD_HISTORY: bool = true;
pub const DEFAULT_RETRACT_STALE_SUBSCRIPTIONS: bool = false;
pub const MIN_RECONNECT_DELAY_MS: u64 = 100;
pub const MAX_RECONNECT_DELAY_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Connecting,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "Connected",
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MarketTimeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl MarketTimeframe {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }

    pub fn parse_str(value: &str) -> Result<Self, AppError> {
        match value.trim() {
            "1m" => Ok(Self::M1),
            "5m" => Ok(Self::M5),
            "15m" => Ok(Self::M15),
            "1h" => Ok(Self::H1),
            "4h" => Ok(Self::H4),
            "1d" => Ok(Self::D1),
            other => Err(AppError::InvalidArgument(format!(
                "unsupported timeframe '{other}'"
            ))),
        }
    }
}

impl fmt::Display for MarketTimeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instrument and timeframe the market view is currently tracking.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MarketSelection {
    pub symbol: String,
    pub timeframe: MarketTimeframe,
}

impl MarketSelection {
    pub fn new(symbol: &str, timeframe: MarketTimeframe) -> Result<Self, AppError> {
        Ok(Self {
            symbol: normalize_symbol(symbol)?,
            timeframe,
        })
    }

    pub fn matches_symbol(&self, symbol: &str) -> bool {
        self.symbol.eq_ignore_ascii_case(symbol.trim())
    }
}

impl Default for MarketSelection {
    fn default() -> Self {
        Self {
            symbol: DEFAULT_SYMBOL.to_string(),
            timeframe: DEFAULT_TIMEFRAME,
        }
    }
}

/// Uppercases the symbol and strips pair separators, the way the backend keys instruments.
pub fn normalize_symbol(raw: &str) -> Result<String, AppError> {
    let symbol: String = raw
        .trim()
        .chars()
        .filter(|ch| *ch != '-' && *ch != '/')
        .collect::<String>()
        .to_ascii_uppercase();

    if symbol.is_empty() || !symbol.chars().all(|ch| ch.is_ascii_alphanumeric()) {
        return Err(AppError::InvalidArgument(
            "symbol must be non-empty alphanumeric ASCII".to_string(),
        ));
    }
    Ok(symbol)
}

/// How the store treats a trade that arrives after a fresher one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TradeOrdering {
    #[default]
    LastWriteWins,
    EventTime,
}

impl TradeOrdering {
    pub fn parse_str(value: &str) -> Result<Self, AppError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "last-write-wins" => Ok(Self::LastWriteWins),
            "event-time" => Ok(Self::EventTime),
            other => Err(AppError::InvalidArgument(format!(
                "unsupported trade ordering '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub symbol: String,
    pub exchange: String,
    pub timeframe: MarketTimeframe,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn parse_lenient(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("buy") {
            Some(Self::Buy)
        } else if value.eq_ignore_ascii_case("sell") {
            Some(Self::Sell)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub symbol: String,
    pub exchange: String,
    pub price: String,
    pub amount: String,
    pub side: Option<TradeSide>,
    pub time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl SignalAction {
    pub fn parse_str(value: &str) -> Result<Self, AppError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "buy" => Ok(Self::Buy),
            "sell" => Ok(Self::Sell),
            "hold" => Ok(Self::Hold),
            other => Err(AppError::InvalidArgument(format!(
                "unsupported signal action '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StrategySignal {
    pub strategy: String,
    pub symbol: String,
    pub timeframe: String,
    pub action: SignalAction,
    pub price: String,
    pub time: Option<DateTime<Utc>>,
}

/// Decimal value kept as its textual representation; accepts JSON strings or numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecimalText(pub String);

impl DecimalText {
    pub fn is_present(&self) -> bool {
        !self.0.trim().is_empty()
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl<'de> Deserialize<'de> for DecimalText {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DecimalTextVisitor;

        impl Visitor<'_> for DecimalTextVisitor {
            type Value = DecimalText;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a decimal encoded as a string or number")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                Ok(DecimalText(value.to_string()))
            }

            fn visit_string<E: de::Error>(self, value: String) -> Result<Self::Value, E> {
                Ok(DecimalText(value))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
                Ok(DecimalText(value.to_string()))
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
                Ok(DecimalText(value.to_string()))
            }

            fn visit_f64<E: de::Error>(self, value: f64) -> Result<Self::Value, E> {
                if !value.is_finite() {
                    return Err(E::custom("decimal values must be finite"));
                }
                Ok(DecimalText(value.to_string()))
            }
        }

        deserializer.deserialize_any(DecimalTextVisitor)
    }
}

/// Event timestamp; accepts RFC 3339 strings or epoch milliseconds (as number or digit string).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventTime(pub DateTime<Utc>);

impl EventTime {
    pub fn parse_str(value: &str) -> Result<Self, AppError> {
        let trimmed = value.trim();
        if !trimmed.is_empty() && trimmed.chars().all(|ch| ch.is_ascii_digit()) {
            let millis = trimmed.parse::<i64>().map_err(|_| {
                AppError::InvalidArgument(format!("epoch millis '{trimmed}' out of range"))
            })?;
            return Self::from_millis(millis);
        }

        let parsed = DateTime::parse_from_rfc3339(trimmed)?;
        Ok(Self(parsed.with_timezone(&Utc)))
    }

    pub fn from_millis(millis: i64) -> Result<Self, AppError> {
        DateTime::from_timestamp_millis(millis)
            .map(Self)
            .ok_or_else(|| AppError::InvalidArgument(format!("epoch millis {millis} out of range")))
    }
}

impl<'de> Deserialize<'de> for EventTime {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct EventTimeVisitor;

        impl Visitor<'_> for EventTimeVisitor {
            type Value = EventTime;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("an RFC 3339 timestamp or epoch milliseconds")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                EventTime::parse_str(value).map_err(E::custom)
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
                EventTime::from_millis(value).map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
                let millis = i64::try_from(value).map_err(E::custom)?;
                EventTime::from_millis(millis).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(EventTimeVisitor)
    }
}

/// History rows as served by `GET /api/v1/klines/{symbol}`.
#[derive(Debug, Deserialize)]
pub struct HistoryCandleWire {
    #[serde(alias = "s")]
    pub symbol: String,
    #[serde(default, alias = "e")]
    pub exchange: String,
    #[serde(alias = "p")]
    pub period: String,
    #[serde(alias = "o")]
    pub open: DecimalText,
    #[serde(alias = "h")]
    pub high: DecimalText,
    #[serde(alias = "l")]
    pub low: DecimalText,
    #[serde(alias = "c")]
    pub close: DecimalText,
    #[serde(default, alias = "v")]
    pub volume: DecimalText,
    #[serde(alias = "t", alias = "timestamp")]
    pub time: EventTime,
}

impl TryFrom<HistoryCandleWire> for Candle {
    type Error = AppError;

    fn try_from(value: HistoryCandleWire) -> Result<Self, Self::Error> {
        if !value.close.is_present() {
            return Err(AppError::InvalidArgument(
                "history candle is missing its close".to_string(),
            ));
        }

        Ok(Self {
            symbol: value.symbol,
            exchange: value.exchange,
            timeframe: MarketTimeframe::parse_str(&value.period)?,
            open: value.open.into_inner(),
            high: value.high.into_inner(),
            low: value.low.into_inner(),
            close: value.close.into_inner(),
            volume: value.volume.into_inner(),
            time: value.time.0,
        })
    }
}

/// Decodes a history response body and orders it by bucket time ascending.
pub fn parse_history_payload(payload: &mut [u8]) -> Result<Vec<Candle>, AppError> {
    let wire: Vec<HistoryCandleWire> = simd_json::serde::from_slice(payload)?;

    let mut candles = Vec::with_capacity(wire.len());
    for row in wire {
        candles.push(row.try_into()?);
    }
    candles.sort_by_key(|candle: &Candle| candle.time);
    Ok(candles)
}

/// Opaque bearer credential. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(***)")
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketStreamStatusSnapshot {
    pub state: ConnectionStatus,
    pub symbol: String,
    pub timeframe: MarketTimeframe,
    pub endpoint: Option<String>,
    pub reconnect_attempt: u32,
    pub connect_count: u64,
    pub disconnect_count: u64,
    pub messages_received: u64,
    pub messages_discarded: u64,
    pub last_message_at_ms: Option<i64>,
    pub reason: Option<String>,
}

impl MarketStreamStatusSnapshot {
    pub fn idle(selection: &MarketSelection, reason: Option<String>) -> Self {
        Self {
            state: ConnectionStatus::Disconnected,
            symbol: selection.symbol.clone(),
            timeframe: selection.timeframe,
            endpoint: None,
            reconnect_attempt: 0,
            connect_count: 0,
            disconnect_count: 0,
            messages_received: 0,
            messages_discarded: 0,
            last_message_at_ms: None,
            reason,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartMarketStreamArgs {
    pub symbol: Option<String>,
    pub timeframe: Option<MarketTimeframe>,
    pub origin: Option<String>,
    pub ws_url: Option<String>,
    pub history_base_url: Option<String>,
    pub auth_token: Option<String>,
    pub reconnect_delay_ms: Option<u64>,
    pub load_history: Option<bool>,
    pub retract_stale_subscriptions: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct MarketStreamConfig {
    pub selection: MarketSelection,
    pub ws_url: String,
    pub history_base_url: Option<String>,
    pub auth_token: Option<AuthToken>,
    pub reconnect_delay_ms: u64,
    pub retract_stale_subscriptions: bool,
}

impl StartMarketStreamArgs {
    pub fn normalize(self) -> Result<MarketStreamConfig, AppError> {
        let symbol = self.symbol.unwrap_or_else(|| DEFAULT_SYMBOL.to_string());
        let timeframe = self.timeframe.unwrap_or(DEFAULT_TIMEFRAME);
        let selection = MarketSelection::new(&symbol, timeframe)?;

        let origin = non_empty(self.origin).unwrap_or_else(|| DEFAULT_ORIGIN.to_string());

        let ws_url = match non_empty(self.ws_url) {
            Some(url) => {
                if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                    return Err(AppError::InvalidArgument(
                        "wsUrl must use the ws:// or wss:// scheme".to_string(),
                    ));
                }
                url
            }
            None => ws_endpoint_for_origin(&origin)?,
        };

        let load_history = self.load_history.unwrap_or(DEFAULT_LOAD_HISTORY);
        let history_base_url = if load_history {
            let base = match non_empty(self.history_base_url) {
                Some(url) => {
                    if !(url.starts_with("http://") || url.starts_with("https://")) {
                        return Err(AppError::InvalidArgument(
                            "historyBaseUrl must use the http:// or https:// scheme".to_string(),
                        ));
                    }
                    url
                }
                None => http_base_for_origin(&origin)?,
            };
            Some(base.trim_end_matches('/').to_string())
        } else {
            None
        };

        let reconnect_delay_ms = self
            .reconnect_delay_ms
            .unwrap_or(DEFAULT_RECONNECT_DELAY_MS);
        if !(MIN_RECONNECT_DELAY_MS..=MAX_RECONNECT_DELAY_MS).contains(&reconnect_delay_ms) {
            return Err(AppError::InvalidArgument(format!(
                "reconnectDelayMs must be between {MIN_RECONNECT_DELAY_MS} and {MAX_RECONNECT_DELAY_MS}"
            )));
        }

        Ok(MarketStreamConfig {
            selection,
            ws_url,
            history_base_url,
            auth_token: self.auth_token.as_deref().and_then(AuthToken::new),
            reconnect_delay_ms,
            retract_stale_subscriptions: self
                .retract_stale_subscriptions
                .unwrap_or(DEFAULT_RETRACT_STALE_SUBSCRIPTIONS),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketStreamSession {
    pub running: bool,
    pub symbol: String,
    pub timeframe: MarketTimeframe,
    pub ws_url: String,
    pub history_enabled: bool,
    pub reconnect_delay_ms: u64,
    pub retract_stale_subscriptions: bool,
}

impl MarketStreamSession {
    pub fn from_config(config: &MarketStreamConfig) -> Self {
        Self {
            running: true,
            symbol: config.selection.symbol.clone(),
            timeframe: config.selection.timeframe,
            ws_url: config.ws_url.clone(),
            history_enabled: config.history_base_url.is_some(),
            reconnect_delay_ms: config.reconnect_delay_ms,
            retract_stale_subscriptions: config.retract_stale_subscriptions,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketStreamStopResult {
    pub stopped: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn normalizes_start_args_defaults() {
        let config = StartMarketStreamArgs::default()
            .normalize()
            .expect("defaults should be valid");

        assert_eq!(config.selection.symbol, DEFAULT_SYMBOL);
        assert_eq!(config.selection.timeframe, DEFAULT_TIMEFRAME);
        assert_eq!(config.ws_url, "ws://localhost:8080/ws");
        assert_eq!(
            config.history_base_url.as_deref(),
            Some("http://localhost:8080")
        );
        assert_eq!(config.reconnect_delay_ms, DEFAULT_RECONNECT_DELAY_MS);
        assert!(config.auth_token.is_none());
        assert!(!config.retract_stale_subscriptions);
    }

    #[test]
    fn derives_endpoints_from_secure_origin() {
        let config = StartMarketStreamArgs {
            origin: Some("https://terminal.example.com/app".to_string()),
            ..Default::default()
        }
        .normalize()
        .expect("secure origin should be valid");

        assert_eq!(config.ws_url, "wss://terminal.example.com/ws");
        assert_eq!(
            config.history_base_url.as_deref(),
            Some("https://terminal.example.com")
        );
    }

    #[test]
    fn explicit_ws_url_wins_over_origin() {
        let config = StartMarketStreamArgs {
            origin: Some("http://localhost:5173".to_string()),
            ws_url: Some("ws://127.0.0.1:9000/ws".to_string()),
            load_history: Some(false),
            ..Default::default()
        }
        .normalize()
        .expect("explicit endpoint should be valid");

        assert_eq!(config.ws_url, "ws://127.0.0.1:9000/ws");
        assert!(config.history_base_url.is_none());
    }

    #[test]
    fn normalizes_symbol_case_and_separators() {
        let config = StartMarketStreamArgs {
            symbol: Some(" eth/usdt ".to_string()),
            ..Default::default()
        }
        .normalize()
        .expect("symbol should normalize");

        assert_eq!(config.selection.symbol, "ETHUSDT");
    }

    #[test]
    fn rejects_non_alphanumeric_symbol() {
        let result = StartMarketStreamArgs {
            symbol: Some("BTC USDT".to_string()),
            ..Default::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn validates_reconnect_delay_range() {
        let result = StartMarketStreamArgs {
            reconnect_delay_ms: Some(10),
            ..Default::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn rejects_http_scheme_for_ws_url() {
        let result = StartMarketStreamArgs {
            ws_url: Some("http://localhost:8080/ws".to_string()),
            ..Default::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn blank_auth_token_is_dropped_and_debug_is_redacted() {
        assert!(AuthToken::new("   ").is_none());

        let token = AuthToken::new("secret-value").expect("token should be kept");
        assert_eq!(token.expose(), "secret-value");
        assert_eq!(format!("{token:?}"), "AuthToken(***)");
    }

    #[test]
    fn parses_timeframes_and_rejects_unknown() {
        assert_eq!(
            MarketTimeframe::parse_str("15m").expect("15m is supported"),
            MarketTimeframe::M15
        );
        assert!(MarketTimeframe::parse_str("1w").is_err());
    }

    #[test]
    fn event_time_accepts_rfc3339_and_epoch_millis() {
        let expected = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .expect("valid date");

        let from_text = EventTime::parse_str("2024-01-01T00:00:00Z").expect("rfc3339 parses");
        let from_offset =
            EventTime::parse_str("2024-01-01T08:00:00+08:00").expect("offset form parses");
        let from_millis = EventTime::parse_str("1704067200000").expect("millis parse");

        assert_eq!(from_text.0, expected);
        assert_eq!(from_offset.0, expected);
        assert_eq!(from_millis.0, expected);
        assert!(EventTime::parse_str("yesterday").is_err());
    }

    #[test]
    fn parses_history_payload_and_sorts_ascending() {
        let mut payload = br#"[
            {"symbol":"BTCUSDT","exchange":"binance","period":"1m","open":"101","high":"102","low":"100","close":"101.5","volume":"3","time":"2024-01-01T00:02:00Z"},
            {"symbol":"BTCUSDT","exchange":"binance","period":"1m","o":"100","h":"101","l":"99","c":"100.5","v":"2","timestamp":"2024-01-01T00:00:00Z"},
            {"symbol":"BTCUSDT","exchange":"binance","period":"1m","open":100.5,"high":101,"low":100,"close":101,"volume":1,"time":1704067260000}
        ]"#
        .to_vec();

        let candles = parse_history_payload(&mut payload).expect("history payload should parse");

        assert_eq!(candles.len(), 3);
        assert!(candles.windows(2).all(|pair| pair[0].time < pair[1].time));
        assert_eq!(candles[0].close, "100.5");
        assert_eq!(candles[1].close, "101");
        assert_eq!(candles[2].close, "101.5");
        assert_eq!(candles[2].exchange, "binance");
    }

    #[test]
    fn rejects_history_rows_with_unknown_period() {
        let mut payload = br#"[{"symbol":"BTCUSDT","period":"7m","open":"1","high":"1","low":"1","close":"1","volume":"1","time":"2024-01-01T00:00:00Z"}]"#.to_vec();

        assert!(parse_history_payload(&mut payload).is_err());
    }
}
