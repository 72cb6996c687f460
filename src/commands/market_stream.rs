use crate::error::MarketError;
use crate::market::backfill::{BackfillPage, BackfillQuery};
use crate::market::feed::{ChartEvent, ChartFeed, ChartFeedSettings, ChartFeedSnapshot};
use crate::market::types::{normalize_symbol, Interval, DEFAULT_BROKER, DEFAULT_INTERVAL, DEFAULT_SYMBOL};
use crate::state::MarketSession;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartChartFeedArgs {
    pub broker: Option<String>,
    pub symbol: Option<String>,
    pub interval: Option<String>,
}

impl StartChartFeedArgs {
    pub fn normalize(self) -> Result<BackfillQuery, MarketError> {
        let broker = self
            .broker
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_BROKER.to_string());
        let symbol = normalize_symbol(
            &broker,
            self.symbol.as_deref().unwrap_or(DEFAULT_SYMBOL),
        )?;
        let interval: Interval = self
            .interval
            .as_deref()
            .unwrap_or(DEFAULT_INTERVAL)
            .parse()?;

        Ok(BackfillQuery {
            broker,
            symbol,
            interval,
        })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartFeedSession {
    pub broker: String,
    pub symbol: String,
    pub interval: Interval,
    pub bars_loaded: usize,
    pub history_error: Option<String>,
}

impl ChartFeedSession {
    fn from_load(scope: &BackfillQuery, loaded: Result<BackfillPage, MarketError>) -> Self {
        let (bars_loaded, history_error) = match loaded {
            Ok(page) => (page.bars.len(), None),
            Err(error) => {
                tracing::warn!(symbol = %scope.symbol, %error, "initial history load failed");
                (0, Some(error.to_string()))
            }
        };
        Self {
            broker: scope.broker.clone(),
            symbol: scope.symbol.clone(),
            interval: scope.interval,
            bars_loaded,
            history_error,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartFeedStopResult {
    pub stopped: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibleRangeArgs {
    pub from: f64,
}

/// Opens the live trade stream for the requested scope, then loads its
/// initial history. Any previous feed is stopped first.
pub async fn start_chart_feed(
    session: &MarketSession,
    args: Option<StartChartFeedArgs>,
) -> Result<ChartFeedSession, MarketError> {
    let scope = args.unwrap_or_default().normalize()?;

    let mut feed_slot = session.chart_feed.lock().await;
    if let Some(previous) = feed_slot.take() {
        previous.stop();
    }

    let feed = Arc::new(ChartFeed::start(
        session.registry.clone(),
        Arc::clone(&session.history),
        scope.clone(),
        ChartFeedSettings::from(&session.config),
    )?);
    *feed_slot = Some(Arc::clone(&feed));
    drop(feed_slot);

    let loaded = feed.load_initial().await;
    Ok(ChartFeedSession::from_load(&scope, loaded))
}

/// Points the running feed at a new scope without replacing it, so existing
/// event receivers keep listening.
pub async fn switch_chart_scope(
    session: &MarketSession,
    args: StartChartFeedArgs,
) -> Result<ChartFeedSession, MarketError> {
    let scope = args.normalize()?;
    let feed = current_feed(session)
        .await
        .ok_or_else(|| MarketError::InvalidArgument("no chart feed is running".to_string()))?;

    // Subscription failures leave the feed without a stream; history
    // failures are reported alongside the new scope.
    let loaded = match feed.switch_scope(scope.clone()).await {
        Err(error @ (MarketError::Unauthenticated | MarketError::NoRuntime)) => return Err(error),
        loaded => loaded,
    };
    Ok(ChartFeedSession::from_load(&scope, loaded))
}

pub async fn stop_chart_feed(session: &MarketSession) -> Result<ChartFeedStopResult, MarketError> {
    let existing = session.chart_feed.lock().await.take();
    let stopped = match existing {
        Some(feed) => {
            feed.stop();
            true
        }
        None => false,
    };
    Ok(ChartFeedStopResult { stopped })
}

pub async fn chart_feed_status(
    session: &MarketSession,
) -> Result<Option<ChartFeedSnapshot>, MarketError> {
    Ok(current_feed(session).await.map(|feed| feed.snapshot()))
}

pub async fn chart_visible_range_changed(
    session: &MarketSession,
    args: VisibleRangeArgs,
) -> Result<Option<BackfillPage>, MarketError> {
    match current_feed(session).await {
        Some(feed) => feed.on_visible_range(args.from).await,
        None => Ok(None),
    }
}

pub async fn chart_events(session: &MarketSession) -> Option<broadcast::Receiver<ChartEvent>> {
    current_feed(session).await.map(|feed| feed.subscribe())
}

async fn current_feed(session: &MarketSession) -> Option<Arc<ChartFeed>> {
    session.chart_feed.lock().await.as_ref().map(Arc::clone)
}
