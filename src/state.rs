use crate::market::store::MarketStoreHandle;
use crate::market::types::MarketStreamStatusSnapshot;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct MarketStreamHandle {
    pub cancellation_token: CancellationToken,
    pub join_handle: JoinHandle<()>,
}

pub struct AppState {
    pub started_at: Instant,
    pub store: MarketStoreHandle,
    pub market_stream: Mutex<Option<MarketStreamHandle>>,
    pub market_status: Arc<RwLock<MarketStreamStatusSnapshot>>,
}

impl AppState {
    pub fn new(store: MarketStoreHandle) -> Self {
        let market_status = MarketStreamStatusSnapshot::idle(
            &store.selection(),
            Some("stream idle".to_string()),
        );

        Self {
            started_at: Instant::now(),
            store,
            market_stream: Mutex::new(None),
            market_status: Arc::new(RwLock::new(market_status)),
        }
    }
}
