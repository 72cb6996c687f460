use crate::auth::AccessTokenProvider;
use crate::error::MarketError;
use crate::market::types::{Bar, CandleResponseWire, Interval};
use async_trait::async_trait;
use chrono::DateTime;
use reqwest::Client;
use std::sync::Arc;

const CANDLE_END_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRequest {
    pub broker: String,
    pub symbol: String,
    pub interval: Interval,
    /// Exclusive upper bound, seconds since epoch.
    pub end_time: i64,
    pub limit: usize,
}

/// External source of historical bars.
#[async_trait]
pub trait HistoricalBars: Send + Sync {
    async fn fetch_bars(&self, request: &HistoryRequest) -> Result<Vec<Bar>, MarketError>;
}

fn format_end_time(end_time: i64) -> Result<String, MarketError> {
    let timestamp = DateTime::from_timestamp(end_time, 0).ok_or_else(|| {
        MarketError::InvalidArgument(format!("end time {end_time} is out of range"))
    })?;
    Ok(timestamp.format(CANDLE_END_TIME_FORMAT).to_string())
}

fn candles_endpoint(base_url: &str, request: &HistoryRequest) -> Result<String, MarketError> {
    let end_time = format_end_time(request.end_time)?.replace(' ', "%20");
    Ok(format!(
        "{base_url}/candle/{}?symbol={}&interval={}&end_time={end_time}&limit={}",
        request.broker,
        request.symbol.to_ascii_uppercase(),
        request.interval,
        request.limit
    ))
}

pub struct HttpHistoricalBars {
    client: Client,
    base_url: String,
    tokens: Arc<dyn AccessTokenProvider>,
}

impl HttpHistoricalBars {
    pub fn new(client: Client, base_url: impl Into<String>, tokens: Arc<dyn AccessTokenProvider>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            tokens,
        }
    }
}

#[async_trait]
impl HistoricalBars for HttpHistoricalBars {
    async fn fetch_bars(&self, request: &HistoryRequest) -> Result<Vec<Bar>, MarketError> {
        let token = self
            .tokens
            .access_token()
            .ok_or(MarketError::Unauthenticated)?;
        let endpoint = candles_endpoint(&self.base_url, request)?;

        let response = self
            .client
            .get(endpoint)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|error| MarketError::FetchFailed(error.to_string()))?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            self.tokens.on_token_expired();
        }
        let payload = response
            .error_for_status()
            .map_err(|error| MarketError::FetchFailed(error.to_string()))?
            .json::<CandleResponseWire>()
            .await
            .map_err(|error| MarketError::FetchFailed(error.to_string()))?;

        candles_from_response(payload)
    }
}

pub fn candles_from_response(payload: CandleResponseWire) -> Result<Vec<Bar>, MarketError> {
    if payload.message != "success" {
        return Err(MarketError::FetchFailed(
            payload
                .error
                .unwrap_or_else(|| format!("unexpected response message '{}'", payload.message)),
        ));
    }

    let wire_candles = payload.candles.ok_or_else(|| {
        MarketError::FetchFailed("success response without candles".to_string())
    })?;

    let mut bars = Vec::with_capacity(wire_candles.len());
    for candle in wire_candles {
        let bar = Bar::try_from(candle).map_err(|error| MarketError::FetchFailed(error.to_string()))?;
        bars.push(bar);
    }
    bars.sort_unstable_by_key(|bar| bar.open_time);
    bars.dedup_by_key(|bar| bar.open_time);
    Ok(bars)
}
