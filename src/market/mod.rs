pub mod backfill;
pub mod candles;
pub mod config;
pub mod feed;
pub mod history;
pub mod multiplexer;
pub mod registry;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;
