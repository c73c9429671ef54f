use clap::Parser;
use market_sync_lib::error::AppError;
use market_sync_lib::logging::init_tracing;
use market_sync_lib::market::types::{
    MarketTimeframe, StartMarketStreamArgs, TradeOrdering, DEFAULT_RECONNECT_DELAY_MS,
    DEFAULT_SYMBOL,
};
use market_sync_lib::{run, RunOptions};

#[derive(Debug, Parser)]
#[command(
    name = "market-sync",
    about = "Keeps a live candle, trade and signal view in sync with the trading backend"
)]
struct Cli {
    /// Instrument to track, e.g. BTCUSDT.
    #[arg(long, default_value = DEFAULT_SYMBOL)]
    symbol: String,

    #[arg(long, default_value = "1m", value_parser = parse_timeframe)]
    timeframe: MarketTimeframe,

    /// Page origin the stream endpoint is derived from.
    #[arg(long, env = "MARKET_SYNC_ORIGIN")]
    origin: Option<String>,

    /// Explicit stream endpoint; overrides --origin.
    #[arg(long, env = "MARKET_SYNC_WS_URL")]
    ws_url: Option<String>,

    #[arg(long, env = "MARKET_SYNC_HISTORY_URL")]
    history_url: Option<String>,

    /// Skip the candle history backfill.
    #[arg(long)]
    no_history: bool,

    #[arg(long, env = "MARKET_SYNC_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[arg(long, default_value_t = DEFAULT_RECONNECT_DELAY_MS)]
    reconnect_delay_ms: u64,

    /// last-write-wins or event-time.
    #[arg(long, default_value = "last-write-wins", value_parser = parse_trade_ordering)]
    trade_ordering: TradeOrdering,

    /// Unsubscribe from the previous topics when the selection changes.
    #[arg(long)]
    retract_subscriptions: bool,

    #[arg(long)]
    json_logs: bool,
}

fn parse_timeframe(value: &str) -> Result<MarketTimeframe, String> {
    MarketTimeframe::parse_str(value).map_err(|error| error.to_string())
}

fn parse_trade_ordering(value: &str) -> Result<TradeOrdering, String> {
    TradeOrdering::parse_str(value).map_err(|error| error.to_string())
}

impl Cli {
    fn into_run_options(self) -> RunOptions {
        RunOptions {
            stream_args: StartMarketStreamArgs {
                symbol: Some(self.symbol),
                timeframe: Some(self.timeframe),
                origin: self.origin,
                ws_url: self.ws_url,
                history_base_url: self.history_url,
                auth_token: self.token,
                reconnect_delay_ms: Some(self.reconnect_delay_ms),
                load_history: Some(!self.no_history),
                retract_stale_subscriptions: Some(self.retract_subscriptions),
            },
            trade_ordering: self.trade_ordering,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);
    run(cli.into_run_options()).await
}
