pub mod health;
pub mod market_stream;
pub mod market_view;
