//! Market State Store.
//!
//! [`MarketStore`] is the single authoritative snapshot of the market view and
//! encodes the merge, filter and bounding rules for streamed events. Display
//! code and the stream pipeline share it through [`MarketStoreHandle`], which
//! serializes every mutation behind one write lock and announces changes on
//! `watch` channels.

use crate::error::AppError;
use crate::market::types::{
    normalize_symbol, Candle, ConnectionStatus, MarketSelection, MarketTimeframe, StrategySignal,
    Trade, TradeOrdering,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;

pub const MAX_CANDLES: usize = 1_000;
pub const MAX_SIGNALS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    SymbolMismatch,
    TimeframeMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandleMergeOutcome {
    Ignored(IgnoreReason),
    Replaced,
    Appended { evicted: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeApplyOutcome {
    Applied,
    Ignored,
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesReplaceOutcome {
    Replaced { len: usize },
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalAppendOutcome {
    pub evicted: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketSnapshot {
    pub revision: u64,
    pub symbol: String,
    pub timeframe: MarketTimeframe,
    pub candles: Vec<Candle>,
    pub last_trade: Option<Trade>,
    pub signals: Vec<StrategySignal>,
    pub connection_status: ConnectionStatus,
}

#[derive(Debug, Clone)]
pub struct MarketStore {
    selection: MarketSelection,
    candles: VecDeque<Candle>,
    last_trade: Option<Trade>,
    signals: VecDeque<StrategySignal>,
    connection_status: ConnectionStatus,
    trade_ordering: TradeOrdering,
    revision: u64,
}

impl Default for MarketStore {
    fn default() -> Self {
        Self::new(MarketSelection::default(), TradeOrdering::default())
    }
}

impl MarketStore {
    pub fn new(selection: MarketSelection, trade_ordering: TradeOrdering) -> Self {
        Self {
            selection,
            candles: VecDeque::with_capacity(MAX_CANDLES + 1),
            last_trade: None,
            signals: VecDeque::with_capacity(MAX_SIGNALS + 1),
            connection_status: ConnectionStatus::Disconnected,
            trade_ordering,
            revision: 0,
        }
    }

    pub fn selection(&self) -> &MarketSelection {
        &self.selection
    }

    pub fn candles(&self) -> &VecDeque<Candle> {
        &self.candles
    }

    pub fn last_trade(&self) -> Option<&Trade> {
        self.last_trade.as_ref()
    }

    /// Most recent first.
    pub fn signals(&self) -> &VecDeque<StrategySignal> {
        &self.signals
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection_status
    }

    pub fn trade_ordering(&self) -> TradeOrdering {
        self.trade_ordering
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn bump(&mut self) {
        self.revision = self.revision.wrapping_add(1);
    }

    /// Existing candles are kept; the caller reloads history for the new key.
    pub fn select_symbol(&mut self, symbol: &str) -> Result<bool, AppError> {
        let symbol = normalize_symbol(symbol)?;
        if self.selection.symbol == symbol {
            return Ok(false);
        }
        self.selection.symbol = symbol;
        self.bump();
        Ok(true)
    }

    pub fn select_timeframe(&mut self, timeframe: MarketTimeframe) -> bool {
        if self.selection.timeframe == timeframe {
            return false;
        }
        self.selection.timeframe = timeframe;
        self.bump();
        true
    }

    /// Bulk history load. Input must already be ordered by bucket time ascending.
    pub fn replace_candles(&mut self, candles: Vec<Candle>) {
        self.candles = VecDeque::from(candles);
        self.bump();
    }

    /// Like [`Self::replace_candles`], but only while `selection` is still the active one.
    pub fn replace_candles_for(
        &mut self,
        selection: &MarketSelection,
        candles: Vec<Candle>,
    ) -> SeriesReplaceOutcome {
        if !self.selection.matches_symbol(&selection.symbol)
            || self.selection.timeframe != selection.timeframe
        {
            return SeriesReplaceOutcome::Stale;
        }
        let len = candles.len();
        self.replace_candles(candles);
        SeriesReplaceOutcome::Replaced { len }
    }

    pub fn merge_candle(&mut self, candle: Candle) -> CandleMergeOutcome {
        if !self.selection.matches_symbol(&candle.symbol) {
            return CandleMergeOutcome::Ignored(IgnoreReason::SymbolMismatch);
        }
        if candle.timeframe != self.selection.timeframe {
            return CandleMergeOutcome::Ignored(IgnoreReason::TimeframeMismatch);
        }

        let outcome = match self.candles.back_mut() {
            Some(last) if last.time == candle.time => {
                *last = candle;
                CandleMergeOutcome::Replaced
            }
            _ => {
                self.candles.push_back(candle);
                let evicted = self.candles.len() > MAX_CANDLES;
                if evicted {
                    self.candles.pop_front();
                }
                CandleMergeOutcome::Appended { evicted }
            }
        };
        self.bump();
        outcome
    }

    pub fn replace_last_trade(&mut self, trade: Trade) -> TradeApplyOutcome {
        if !self.selection.matches_symbol(&trade.symbol) {
            return TradeApplyOutcome::Ignored;
        }

        if self.trade_ordering == TradeOrdering::EventTime {
            if let (Some(current), Some(incoming)) = (
                self.last_trade.as_ref().and_then(|last| last.time),
                trade.time,
            ) {
                if incoming < current {
                    return TradeApplyOutcome::Stale;
                }
            }
        }

        self.last_trade = Some(trade);
        self.bump();
        TradeApplyOutcome::Applied
    }

    /// Signals are kept for every instrument, newest first.
    pub fn append_signal(&mut self, signal: StrategySignal) -> SignalAppendOutcome {
        self.signals.push_front(signal);
        let evicted = self.signals.len() > MAX_SIGNALS;
        self.signals.truncate(MAX_SIGNALS);
        self.bump();
        SignalAppendOutcome { evicted }
    }

    pub fn set_connection_status(&mut self, status: ConnectionStatus) -> bool {
        if self.connection_status == status {
            return false;
        }
        self.connection_status = status;
        self.bump();
        true
    }

    pub fn snapshot(&self) -> MarketSnapshot {
        MarketSnapshot {
            revision: self.revision,
            symbol: self.selection.symbol.clone(),
            timeframe: self.selection.timeframe,
            candles: self.candles.iter().cloned().collect(),
            last_trade: self.last_trade.clone(),
            signals: self.signals.iter().cloned().collect(),
            connection_status: self.connection_status,
        }
    }
}

struct StoreShared {
    store: RwLock<MarketStore>,
    revision_tx: watch::Sender<u64>,
    selection_tx: watch::Sender<MarketSelection>,
}

/// Cloneable handle to the process-wide store.
#[derive(Clone)]
pub struct MarketStoreHandle {
    shared: Arc<StoreShared>,
}

impl MarketStoreHandle {
    pub fn new(store: MarketStore) -> Self {
        let (revision_tx, _) = watch::channel(store.revision());
        let (selection_tx, _) = watch::channel(store.selection().clone());
        Self {
            shared: Arc::new(StoreShared {
                store: RwLock::new(store),
                revision_tx,
                selection_tx,
            }),
        }
    }

    /// Runs `f` under the write lock and publishes the new revision and selection if they moved.
    ///
    /// Publishing happens before the guard drops so concurrent writers announce in commit order.
    fn mutate<R>(&self, f: impl FnOnce(&mut MarketStore) -> R) -> R {
        let mut writable = self.shared.store.write();
        let before = writable.revision();
        let result = f(&mut *writable);
        let after = writable.revision();
        if before == after {
            return result;
        }

        self.shared.revision_tx.send_replace(after);
        self.shared.selection_tx.send_if_modified(|current| {
            if *current == *writable.selection() {
                false
            } else {
                *current = writable.selection().clone();
                true
            }
        });
        result
    }

    pub fn read<R>(&self, f: impl FnOnce(&MarketStore) -> R) -> R {
        let readable = self.shared.store.read();
        f(&*readable)
    }

    pub fn snapshot(&self) -> MarketSnapshot {
        self.read(MarketStore::snapshot)
    }

    pub fn selection(&self) -> MarketSelection {
        self.read(|store| store.selection().clone())
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.read(MarketStore::connection_status)
    }

    pub fn revision(&self) -> u64 {
        self.read(MarketStore::revision)
    }

    pub fn subscribe_revisions(&self) -> watch::Receiver<u64> {
        self.shared.revision_tx.subscribe()
    }

    pub fn subscribe_selection(&self) -> watch::Receiver<MarketSelection> {
        self.shared.selection_tx.subscribe()
    }

    /// Applies a symbol and/or timeframe change under one lock so subscribers never see a mixed key.
    /// An invalid symbol leaves the selection untouched.
    pub fn update_selection(
        &self,
        symbol: Option<&str>,
        timeframe: Option<MarketTimeframe>,
    ) -> Result<bool, AppError> {
        self.mutate(|store| {
            let mut changed = false;
            if let Some(symbol) = symbol {
                changed |= store.select_symbol(symbol)?;
            }
            if let Some(timeframe) = timeframe {
                changed |= store.select_timeframe(timeframe);
            }
            Ok(changed)
        })
    }

    pub fn select(&self, selection: &MarketSelection) -> Result<bool, AppError> {
        self.update_selection(Some(&selection.symbol), Some(selection.timeframe))
    }

    pub fn replace_candles(&self, candles: Vec<Candle>) {
        self.mutate(|store| store.replace_candles(candles))
    }

    pub fn replace_candles_for(
        &self,
        selection: &MarketSelection,
        candles: Vec<Candle>,
    ) -> SeriesReplaceOutcome {
        self.mutate(|store| store.replace_candles_for(selection, candles))
    }

    pub fn merge_candle(&self, candle: Candle) -> CandleMergeOutcome {
        self.mutate(|store| store.merge_candle(candle))
    }

    pub fn replace_last_trade(&self, trade: Trade) -> TradeApplyOutcome {
        self.mutate(|store| store.replace_last_trade(trade))
    }

    pub fn append_signal(&self, signal: StrategySignal) -> SignalAppendOutcome {
        self.mutate(|store| store.append_signal(signal))
    }

    pub fn set_connection_status(&self, status: ConnectionStatus) -> bool {
        self.mutate(|store| store.set_connection_status(status))
    }
}
