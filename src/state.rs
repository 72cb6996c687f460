use crate::auth::AccessTokenProvider;
use crate::error::MarketError;
use crate::market::config::MarketCoreConfig;
use crate::market::feed::ChartFeed;
use crate::market::history::{HistoricalBars, HttpHistoricalBars};
use crate::market::registry::{ConnectionRegistry, RegistrySettings};
use crate::market::transport::{Transport, WsTransport};
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const HISTORY_REQUEST_TIMEOUT_SECS: u64 = 15;

/// Everything one logged-in application session shares: the connection
/// registry, the history source and the active chart feed.
pub struct MarketSession {
    pub started_at: Instant,
    pub config: MarketCoreConfig,
    pub registry: ConnectionRegistry,
    pub history: Arc<dyn HistoricalBars>,
    pub chart_feed: Mutex<Option<Arc<ChartFeed>>>,
}

impl MarketSession {
    pub fn new(
        config: MarketCoreConfig,
        transport: Arc<dyn Transport>,
        history: Arc<dyn HistoricalBars>,
        tokens: Arc<dyn AccessTokenProvider>,
    ) -> Self {
        let registry = ConnectionRegistry::new(transport, tokens, RegistrySettings::from(&config));
        Self {
            started_at: Instant::now(),
            config,
            registry,
            history,
            chart_feed: Mutex::new(None),
        }
    }

    /// Session against the configured websocket and REST endpoints.
    pub fn connect(
        config: MarketCoreConfig,
        tokens: Arc<dyn AccessTokenProvider>,
    ) -> Result<Self, MarketError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(HISTORY_REQUEST_TIMEOUT_SECS))
            .build()?;
        let transport = Arc::new(WsTransport::new(config.ws_base_url.clone()));
        let history = Arc::new(HttpHistoricalBars::new(
            client,
            config.api_base_url.clone(),
            Arc::clone(&tokens),
        ));
        Ok(Self::new(config, transport, history, tokens))
    }

    /// Stops the chart feed and closes every shared connection.
    pub async fn shutdown(&self) {
        if let Some(feed) = self.chart_feed.lock().await.take() {
            feed.stop();
        }
        self.registry.shutdown();
    }
}
