use crate::error::MarketError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_WS_BASE_URL: &str = "ws://localhost:8001";
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000";
pub const DEFAULT_AUTH_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_AUTO_RECONNECT: bool = false;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_INITIAL_HISTORY_BARS: usize = 200;
pub const DEFAULT_SCROLL_THRESHOLD_BARS: usize = 10;
pub const DEFAULT_SCROLL_BATCH_BARS: usize = 50;
pub const DEFAULT_TICK_BUFFER_CAPACITY: usize = 4_096;
pub const MIN_AUTH_TIMEOUT_MS: u64 = 1_000;
pub const MAX_AUTH_TIMEOUT_MS: u64 = 60_000;
pub const MIN_RECONNECT_ATTEMPTS: u32 = 1;
pub const MAX_RECONNECT_ATTEMPTS: u32 = 50;
pub const MIN_INITIAL_HISTORY_BARS: usize = 10;
pub const MAX_INITIAL_HISTORY_BARS: usize = 5_000;
pub const MIN_SCROLL_THRESHOLD_BARS: usize = 1;
pub const MAX_SCROLL_THRESHOLD_BARS: usize = 500;
pub const MIN_SCROLL_BATCH_BARS: usize = 1;
pub const MAX_SCROLL_BATCH_BARS: usize = 1_000;
pub const MIN_TICK_BUFFER_CAPACITY: usize = 16;
pub const MAX_TICK_BUFFER_CAPACITY: usize = 100_000;

const WS_URL_ENV: &str = "MARKET_WS_URL";
const API_URL_ENV: &str = "MARKET_API_URL";
const AUTO_RECONNECT_ENV: &str = "MARKET_AUTO_RECONNECT";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MarketCoreArgs {
    pub ws_base_url: Option<String>,
    pub api_base_url: Option<String>,
    pub auth_timeout_ms: Option<u64>,
    pub auto_reconnect: Option<bool>,
    pub max_reconnect_attempts: Option<u32>,
    pub initial_history_bars: Option<usize>,
    pub scroll_threshold_bars: Option<usize>,
    pub scroll_batch_bars: Option<usize>,
    pub tick_buffer_capacity: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarketCoreConfig {
    pub ws_base_url: String,
    pub api_base_url: String,
    pub auth_timeout_ms: u64,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub initial_history_bars: usize,
    pub scroll_threshold_bars: usize,
    pub scroll_batch_bars: usize,
    pub tick_buffer_capacity: usize,
}

impl MarketCoreConfig {
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }
}

impl Default for MarketCoreConfig {
    fn default() -> Self {
        Self {
            ws_base_url: DEFAULT_WS_BASE_URL.to_string(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            auth_timeout_ms: DEFAULT_AUTH_TIMEOUT_MS,
            auto_reconnect: DEFAULT_AUTO_RECONNECT,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            initial_history_bars: DEFAULT_INITIAL_HISTORY_BARS,
            scroll_threshold_bars: DEFAULT_SCROLL_THRESHOLD_BARS,
            scroll_batch_bars: DEFAULT_SCROLL_BATCH_BARS,
            tick_buffer_capacity: DEFAULT_TICK_BUFFER_CAPACITY,
        }
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn normalize_base_url(value: String, schemes: &[&str], field: &str) -> Result<String, MarketError> {
    let trimmed = value.trim().trim_end_matches('/').to_string();
    let has_scheme = schemes
        .iter()
        .any(|scheme| trimmed.starts_with(&format!("{scheme}://")));
    if !has_scheme || trimmed.len() <= "ws://".len() {
        return Err(MarketError::InvalidArgument(format!(
            "{field} must start with one of {}",
            schemes.join("/")
        )));
    }
    Ok(trimmed)
}

impl MarketCoreArgs {
    pub fn from_env() -> Self {
        Self {
            ws_base_url: read_env(WS_URL_ENV),
            api_base_url: read_env(API_URL_ENV),
            auto_reconnect: read_env(AUTO_RECONNECT_ENV)
                .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes")),
            ..Self::default()
        }
    }

    pub fn normalize(self) -> Result<MarketCoreConfig, MarketError> {
        let ws_base_url = normalize_base_url(
            self.ws_base_url
                .unwrap_or_else(|| DEFAULT_WS_BASE_URL.to_string()),
            &["ws", "wss"],
            "wsBaseUrl",
        )?;
        let api_base_url = normalize_base_url(
            self.api_base_url
                .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
            &["http", "https"],
            "apiBaseUrl",
        )?;

        let auth_timeout_ms = self.auth_timeout_ms.unwrap_or(DEFAULT_AUTH_TIMEOUT_MS);
        if !(MIN_AUTH_TIMEOUT_MS..=MAX_AUTH_TIMEOUT_MS).contains(&auth_timeout_ms) {
            return Err(MarketError::InvalidArgument(format!(
                "authTimeoutMs must be between {MIN_AUTH_TIMEOUT_MS} and {MAX_AUTH_TIMEOUT_MS}"
            )));
        }

        let auto_reconnect = self.auto_reconnect.unwrap_or(DEFAULT_AUTO_RECONNECT);
        let max_reconnect_attempts = self
            .max_reconnect_attempts
            .unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS);
        if !(MIN_RECONNECT_ATTEMPTS..=MAX_RECONNECT_ATTEMPTS).contains(&max_reconnect_attempts) {
            return Err(MarketError::InvalidArgument(format!(
                "maxReconnectAttempts must be between {MIN_RECONNECT_ATTEMPTS} and {MAX_RECONNECT_ATTEMPTS}"
            )));
        }

        let initial_history_bars = self
            .initial_history_bars
            .unwrap_or(DEFAULT_INITIAL_HISTORY_BARS);
        if !(MIN_INITIAL_HISTORY_BARS..=MAX_INITIAL_HISTORY_BARS).contains(&initial_history_bars) {
            return Err(MarketError::InvalidArgument(format!(
                "initialHistoryBars must be between {MIN_INITIAL_HISTORY_BARS} and {MAX_INITIAL_HISTORY_BARS}"
            )));
        }

        let scroll_threshold_bars = self
            .scroll_threshold_bars
            .unwrap_or(DEFAULT_SCROLL_THRESHOLD_BARS);
        if !(MIN_SCROLL_THRESHOLD_BARS..=MAX_SCROLL_THRESHOLD_BARS).contains(&scroll_threshold_bars)
        {
            return Err(MarketError::InvalidArgument(format!(
                "scrollThresholdBars must be between {MIN_SCROLL_THRESHOLD_BARS} and {MAX_SCROLL_THRESHOLD_BARS}"
            )));
        }

        let scroll_batch_bars = self.scroll_batch_bars.unwrap_or(DEFAULT_SCROLL_BATCH_BARS);
        if !(MIN_SCROLL_BATCH_BARS..=MAX_SCROLL_BATCH_BARS).contains(&scroll_batch_bars) {
            return Err(MarketError::InvalidArgument(format!(
                "scrollBatchBars must be between {MIN_SCROLL_BATCH_BARS} and {MAX_SCROLL_BATCH_BARS}"
            )));
        }

        let tick_buffer_capacity = self
            .tick_buffer_capacity
            .unwrap_or(DEFAULT_TICK_BUFFER_CAPACITY);
        if !(MIN_TICK_BUFFER_CAPACITY..=MAX_TICK_BUFFER_CAPACITY).contains(&tick_buffer_capacity) {
            return Err(MarketError::InvalidArgument(format!(
                "tickBufferCapacity must be between {MIN_TICK_BUFFER_CAPACITY} and {MAX_TICK_BUFFER_CAPACITY}"
            )));
        }

        Ok(MarketCoreConfig {
            ws_base_url,
            api_base_url,
            auth_timeout_ms,
            auto_reconnect,
            max_reconnect_attempts,
            initial_history_bars,
            scroll_threshold_bars,
            scroll_batch_bars,
            tick_buffer_capacity,
        })
    }
}
