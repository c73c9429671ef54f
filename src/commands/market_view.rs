use crate::error::AppError;
use crate::market::store::MarketSnapshot;
use crate::market::types::MarketTimeframe;
use crate::state::AppState;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SelectMarketArgs {
    pub symbol: Option<String>,
    pub timeframe: Option<MarketTimeframe>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectMarketResult {
    pub symbol: String,
    pub timeframe: MarketTimeframe,
    pub changed: bool,
}

pub fn market_snapshot(state: &AppState) -> MarketSnapshot {
    state.store.snapshot()
}

/// Switches the tracked instrument and/or timeframe. A running stream resubscribes on its own.
pub fn select_market(state: &AppState, args: SelectMarketArgs) -> Result<SelectMarketResult, AppError> {
    let changed = state
        .store
        .update_selection(args.symbol.as_deref(), args.timeframe)?;

    let selection = state.store.selection();
    Ok(SelectMarketResult {
        symbol: selection.symbol,
        timeframe: selection.timeframe,
        changed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::store::{MarketStore, MarketStoreHandle};

    fn state() -> AppState {
        AppState::new(MarketStoreHandle::new(MarketStore::default()))
    }

    #[test]
    fn selects_symbol_and_timeframe() {
        let state = state();
        let mut selection_rx = state.store.subscribe_selection();
        selection_rx.borrow_and_update();

        let result = select_market(
            &state,
            SelectMarketArgs {
                symbol: Some(" sol/usdt ".to_string()),
                timeframe: Some(MarketTimeframe::H4),
            },
        )
        .expect("selection should apply");

        assert!(result.changed);
        assert_eq!(result.symbol, "SOLUSDT");
        assert_eq!(result.timeframe, MarketTimeframe::H4);
        assert!(selection_rx.has_changed().expect("store alive"));
    }

    #[test]
    fn reselecting_current_market_reports_no_change() {
        let state = state();

        let result = select_market(
            &state,
            SelectMarketArgs {
                symbol: Some("BTCUSDT".to_string()),
                timeframe: None,
            },
        )
        .expect("selection should apply");

        assert!(!result.changed);
    }

    #[test]
    fn rejects_invalid_symbol_without_touching_store() {
        let state = state();
        let revision = state.store.revision();

        let result = select_market(
            &state,
            SelectMarketArgs {
                symbol: Some("BTC USDT!".to_string()),
                timeframe: Some(MarketTimeframe::D1),
            },
        );

        assert!(result.is_err());
        assert_eq!(state.store.revision(), revision);
        assert_eq!(market_snapshot(&state).timeframe, MarketTimeframe::M1);
    }

    #[test]
    fn symbol_and_timeframe_arrive_as_one_selection_change() {
        let state = state();
        let mut selection_rx = state.store.subscribe_selection();
        selection_rx.borrow_and_update();
        let revision = state.store.revision();

        select_market(
            &state,
            SelectMarketArgs {
                symbol: Some("ethusdt".to_string()),
                timeframe: Some(MarketTimeframe::M15),
            },
        )
        .expect("selection should apply");

        assert!(selection_rx.has_changed().expect("store alive"));
        let observed = selection_rx.borrow_and_update().clone();
        assert_eq!(observed.symbol, "ETHUSDT");
        assert_eq!(observed.timeframe, MarketTimeframe::M15);
        assert_eq!(state.store.revision(), revision + 2);
    }
}
