//! Wire protocol spoken over the market stream.
//!
//! Outbound traffic is limited to topic subscription requests. Inbound records
//! carry no type tag, so [`decode_inbound_payload`] parses each payload once
//! into an all-optional record and classifies it by which fields are present,
//! in the order candle, trade, signal.

use crate::error::AppError;
use crate::market::types::{
    Candle, DecimalText, EventTime, MarketSelection, MarketTimeframe, SignalAction,
    StrategySignal, Trade, TradeSide,
};
use crate::market::{
    ANY_TIMEFRAME_TOKEN, CANDLE_TOPIC_CATEGORY, SIGNAL_TOPIC_CATEGORY, TRADE_TOPIC_CATEGORY,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionAction {
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Serialize)]
struct SubscriptionRequest<'a> {
    action: SubscriptionAction,
    topic: &'a str,
}

pub fn topic(category: &str, timeframe: &str, symbol: &str) -> String {
    format!("{category}.{timeframe}.{symbol}")
}

/// Candle stream for the exact timeframe, trade and signal streams across all timeframes.
pub fn subscription_topics(selection: &MarketSelection) -> [String; 3] {
    let symbol = selection.symbol.as_str();
    [
        topic(CANDLE_TOPIC_CATEGORY, selection.timeframe.as_str(), symbol),
        topic(TRADE_TOPIC_CATEGORY, ANY_TIMEFRAME_TOKEN, symbol),
        topic(SIGNAL_TOPIC_CATEGORY, ANY_TIMEFRAME_TOKEN, symbol),
    ]
}

pub fn encode_subscription_request(
    action: SubscriptionAction,
    topic: &str,
) -> Result<String, AppError> {
    let request = SubscriptionRequest { action, topic };
    Ok(simd_json::serde::to_string(&request)?)
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Candle(Candle),
    Trade(Trade),
    Signal(StrategySignal),
}

impl InboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Candle(_) => "candle",
            Self::Trade(_) => "trade",
            Self::Signal(_) => "signal",
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct InboundWire {
    #[serde(default, alias = "symbol")]
    s: Option<String>,
    #[serde(default, alias = "exchange")]
    e: Option<String>,
    #[serde(default, alias = "period")]
    p: Option<String>,
    #[serde(default, alias = "open")]
    o: Option<DecimalText>,
    #[serde(default, alias = "high")]
    h: Option<DecimalText>,
    #[serde(default, alias = "low")]
    l: Option<DecimalText>,
    #[serde(default, alias = "close")]
    c: Option<DecimalText>,
    #[serde(default, alias = "volume")]
    v: Option<DecimalText>,
    #[serde(default, alias = "time", alias = "timestamp", alias = "ts")]
    t: Option<EventTime>,
    #[serde(default)]
    price: Option<DecimalText>,
    #[serde(default)]
    amount: Option<DecimalText>,
    #[serde(default)]
    side: Option<String>,
    #[serde(default)]
    strategy: Option<String>,
    #[serde(default)]
    action: Option<String>,
}

fn has_text(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|text| !text.trim().is_empty())
}

fn has_decimal(value: &Option<DecimalText>) -> bool {
    value.as_ref().is_some_and(DecimalText::is_present)
}

fn decimal_or_empty(value: Option<DecimalText>) -> String {
    value.map(DecimalText::into_inner).unwrap_or_default()
}

impl InboundWire {
    fn is_candle(&self) -> bool {
        has_decimal(&self.c) && self.t.is_some() && has_text(&self.s)
    }

    // Signals also carry price and symbol; their discriminators keep them out of the trade shape.
    fn is_trade(&self) -> bool {
        has_decimal(&self.price)
            && has_text(&self.s)
            && self.strategy.is_none()
            && self.action.is_none()
    }

    fn is_signal(&self) -> bool {
        has_text(&self.strategy) && has_text(&self.action)
    }

    fn into_candle(self) -> Result<Candle, AppError> {
        let period = self.p.as_deref().ok_or_else(|| {
            AppError::InvalidArgument("candle payload is missing its period".to_string())
        })?;
        let timeframe = MarketTimeframe::parse_str(period)?;

        Ok(Candle {
            symbol: self.s.unwrap_or_default(),
            exchange: self.e.unwrap_or_default(),
            timeframe,
            open: decimal_or_empty(self.o),
            high: decimal_or_empty(self.h),
            low: decimal_or_empty(self.l),
            close: decimal_or_empty(self.c),
            volume: decimal_or_empty(self.v),
            time: self.t.map(|time| time.0).ok_or_else(|| {
                AppError::InvalidArgument("candle payload is missing its bucket time".to_string())
            })?,
        })
    }

    fn into_trade(self) -> Trade {
        Trade {
            symbol: self.s.unwrap_or_default(),
            exchange: self.e.unwrap_or_default(),
            price: decimal_or_empty(self.price),
            amount: decimal_or_empty(self.amount),
            side: self.side.as_deref().and_then(TradeSide::parse_lenient),
            time: self.t.map(|time| time.0),
        }
    }

    fn into_signal(self) -> Result<StrategySignal, AppError> {
        let action = SignalAction::parse_str(self.action.as_deref().unwrap_or_default())?;

        Ok(StrategySignal {
            strategy: self.strategy.unwrap_or_default(),
            symbol: self.s.unwrap_or_default(),
            timeframe: self.p.unwrap_or_default(),
            action,
            price: decimal_or_empty(self.price),
            time: self.t.map(|time| time.0),
        })
    }
}

/// Decodes one inbound payload.
///
/// Returns `Ok(None)` when the record matches no known shape and `Err` when the
/// payload is not a valid record or a matched shape carries an invalid field.
pub fn decode_inbound_payload(payload: &mut [u8]) -> Result<Option<InboundMessage>, AppError> {
    let wire: InboundWire = simd_json::serde::from_slice(payload)?;

    if wire.is_candle() {
        return wire.into_candle().map(|candle| Some(InboundMessage::Candle(candle)));
    }
    if wire.is_trade() {
        return Ok(Some(InboundMessage::Trade(wire.into_trade())));
    }
    if wire.is_signal() {
        return wire.into_signal().map(|signal| Some(InboundMessage::Signal(signal)));
    }
    Ok(None)
}
