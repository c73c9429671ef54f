pub mod backend;
pub mod pipeline;
pub mod protocol;
pub mod store;
pub mod types;

pub const CANDLE_TOPIC_CATEGORY: &str = "market.kline";
pub const TRADE_TOPIC_CATEGORY: &str = "market.raw";
pub const SIGNAL_TOPIC_CATEGORY: &str = "strategy.signal";
pub const ANY_TIMEFRAME_TOKEN: &str = "*";
