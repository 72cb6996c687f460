use crate::error::MarketError;
use crate::market::backfill::{
    scroll_batch_size, BackfillPage, BackfillPager, BackfillQuery, PageStatus, PagingCursor,
    SharedAggregator,
};
use crate::market::candles::{AggregatorPhase, CandleAggregator, TickOutcome};
use crate::market::config::MarketCoreConfig;
use crate::market::history::HistoricalBars;
use crate::market::registry::{ConnectionRegistry, SubscriptionHandle};
use crate::market::types::{Bar, ChannelEvent, ConnectionStatus, SubscriptionKey};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

const CHART_EVENT_CAPACITY: usize = 1_024;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ChartEvent {
    #[serde(rename_all = "camelCase")]
    BarUpdated { generation: u64, bar: Bar },
    #[serde(rename_all = "camelCase")]
    BarAppended { generation: u64, sealed: Bar, bar: Bar },
    #[serde(rename_all = "camelCase")]
    HistoryMerged {
        generation: u64,
        added: usize,
        exhausted: bool,
        bars: Vec<Bar>,
    },
    #[serde(rename_all = "camelCase")]
    Reset { generation: u64, scope: BackfillQuery },
    #[serde(rename_all = "camelCase")]
    Connection { status: ConnectionStatus },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChartFeedSettings {
    pub initial_history_bars: usize,
    pub scroll_threshold_bars: usize,
    pub scroll_batch_bars: usize,
    pub tick_buffer_capacity: usize,
}

impl From<&MarketCoreConfig> for ChartFeedSettings {
    fn from(config: &MarketCoreConfig) -> Self {
        Self {
            initial_history_bars: config.initial_history_bars,
            scroll_threshold_bars: config.scroll_threshold_bars,
            scroll_batch_bars: config.scroll_batch_bars,
            tick_buffer_capacity: config.tick_buffer_capacity,
        }
    }
}

impl Default for ChartFeedSettings {
    fn default() -> Self {
        Self::from(&MarketCoreConfig::default())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartFeedSnapshot {
    pub scope: BackfillQuery,
    pub phase: AggregatorPhase,
    pub generation: u64,
    pub bar_count: usize,
    pub open_bar: Option<Bar>,
    pub cursor: PagingCursor,
    pub connection: Option<ConnectionStatus>,
}

/// One chart's live candles: a shared trade subscription feeding an
/// aggregator that a pager extends backwards on demand.
pub struct ChartFeed {
    registry: ConnectionRegistry,
    pager: BackfillPager,
    settings: ChartFeedSettings,
    events: broadcast::Sender<ChartEvent>,
    subscription: Mutex<Option<SubscriptionHandle>>,
}

impl ChartFeed {
    /// Subscribes to live trades for `scope` right away; history is loaded
    /// separately by `load_initial` so ticks received meanwhile are buffered.
    pub fn start(
        registry: ConnectionRegistry,
        history: Arc<dyn HistoricalBars>,
        scope: BackfillQuery,
        settings: ChartFeedSettings,
    ) -> Result<Self, MarketError> {
        let key = SubscriptionKey::trade(&scope.broker, &scope.symbol)?;
        let aggregator: SharedAggregator = Arc::new(Mutex::new(CandleAggregator::new(
            scope.interval,
            settings.tick_buffer_capacity,
        )));
        let (events, _) = broadcast::channel(CHART_EVENT_CAPACITY);
        let pager = BackfillPager::new(history, Arc::clone(&aggregator), scope);

        let handle = registry.acquire(
            key,
            tick_router(Arc::clone(&aggregator), events.clone(), 0),
        )?;

        Ok(Self {
            registry,
            pager,
            settings,
            events,
            subscription: Mutex::new(Some(handle)),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChartEvent> {
        self.events.subscribe()
    }

    pub fn settings(&self) -> ChartFeedSettings {
        self.settings
    }

    pub fn scope(&self) -> BackfillQuery {
        self.pager.query()
    }

    pub fn bars(&self) -> Vec<Bar> {
        self.pager.aggregator().lock().bars().to_vec()
    }

    pub fn snapshot(&self) -> ChartFeedSnapshot {
        let scope = self.pager.query();
        let cursor = self.pager.cursor();
        let connection = self
            .subscription
            .lock()
            .as_ref()
            .map(SubscriptionHandle::status);
        let aggregator = self.pager.aggregator().lock();
        ChartFeedSnapshot {
            scope,
            phase: aggregator.phase(),
            generation: aggregator.generation(),
            bar_count: aggregator.bars().len(),
            open_bar: aggregator.open_bar().cloned(),
            cursor,
            connection,
        }
    }

    pub async fn load_initial(&self) -> Result<BackfillPage, MarketError> {
        self.load(self.settings.initial_history_bars).await
    }

    /// Scroll trigger: loads more history once the left edge of the visible
    /// range comes within the threshold of the first loaded bar.
    pub async fn on_visible_range(&self, from: f64) -> Result<Option<BackfillPage>, MarketError> {
        let Some(count) = scroll_batch_size(
            from,
            self.settings.scroll_threshold_bars,
            self.settings.scroll_batch_bars,
        ) else {
            return Ok(None);
        };
        self.load(count).await.map(Some)
    }

    async fn load(&self, count: usize) -> Result<BackfillPage, MarketError> {
        let page = self.pager.load_page(count).await?;
        if let Some(event) = history_event(&page) {
            let _ = self.events.send(event);
        }
        Ok(page)
    }

    /// Moves the feed to another broker, symbol or interval: the old trade
    /// subscription is released, the sequence discarded and the new scope
    /// subscribed before its history is loaded.
    pub async fn switch_scope(&self, scope: BackfillQuery) -> Result<BackfillPage, MarketError> {
        let key = SubscriptionKey::trade(&scope.broker, &scope.symbol)?;

        if let Some(previous) = self.subscription.lock().take() {
            previous.release();
        }
        let generation = self.pager.reset(scope.clone());
        tracing::info!(%key, interval = %scope.interval, generation, "chart scope switched");
        let _ = self.events.send(ChartEvent::Reset { generation, scope });

        let handle = self.registry.acquire(
            key,
            tick_router(
                Arc::clone(self.pager.aggregator()),
                self.events.clone(),
                generation,
            ),
        )?;
        *self.subscription.lock() = Some(handle);

        self.load_initial().await
    }

    pub fn stop(&self) {
        if let Some(handle) = self.subscription.lock().take() {
            tracing::info!(key = %handle.key(), "chart feed stopped");
            handle.release();
        }
    }
}

impl Drop for ChartFeed {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Event for a page that reached the history source, tagged with the
/// generation its bars belong to.
fn history_event(page: &BackfillPage) -> Option<ChartEvent> {
    if !page.fetched || !matches!(page.status, PageStatus::Merged | PageStatus::Exhausted) {
        return None;
    }
    Some(ChartEvent::HistoryMerged {
        generation: page.generation,
        added: page.added,
        exhausted: page.status == PageStatus::Exhausted,
        bars: page.bars.clone(),
    })
}

fn tick_router(
    aggregator: SharedAggregator,
    events: broadcast::Sender<ChartEvent>,
    generation: u64,
) -> impl Fn(&ChannelEvent) + Send + Sync + 'static {
    move |event: &ChannelEvent| match event {
        ChannelEvent::Trade(tick) => {
            let outcome = {
                let mut aggregator = aggregator.lock();
                if aggregator.generation() != generation {
                    return;
                }
                aggregator.on_tick(tick)
            };
            let chart_event = match outcome {
                TickOutcome::Updated(bar) => ChartEvent::BarUpdated { generation, bar },
                TickOutcome::Appended { sealed, opened } => ChartEvent::BarAppended {
                    generation,
                    sealed,
                    bar: opened,
                },
                TickOutcome::Buffered => return,
                TickOutcome::Stale { open_time, timestamp } => {
                    tracing::debug!(open_time, timestamp, "ignoring tick older than the open bar");
                    return;
                }
            };
            let _ = events.send(chart_event);
        }
        ChannelEvent::Status(status) => {
            let _ = events.send(ChartEvent::Connection {
                status: status.clone(),
            });
        }
        ChannelEvent::Orderbook(_) | ChannelEvent::OrderUpdate(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AccessTokenProvider, StaticTokenProvider};
    use crate::market::registry::RegistrySettings;
    use crate::market::testing::{bar_run, wait_until, MockHistory, MockServer, MockTransport};
    use crate::market::types::NORMAL_CLOSE_CODE;
    use rust_decimal_macros::dec;

    const HOUR: i64 = 3_600;

    struct Fixture {
        transport: MockTransport,
        history: Arc<MockHistory>,
        registry: ConnectionRegistry,
    }

    fn fixture() -> Fixture {
        let transport = MockTransport::default();
        let tokens: Arc<dyn AccessTokenProvider> =
            Arc::new(StaticTokenProvider::new(Some("abc".to_string())));
        let registry = ConnectionRegistry::new(
            Arc::new(transport.clone()),
            tokens,
            RegistrySettings::default(),
        );
        Fixture {
            transport,
            history: Arc::new(MockHistory::new()),
            registry,
        }
    }

    fn scope(symbol: &str, interval: &str) -> BackfillQuery {
        BackfillQuery {
            broker: "Binance".to_string(),
            symbol: symbol.to_string(),
            interval: interval.parse().expect("interval"),
        }
    }

    fn start_feed(fx: &Fixture, settings: ChartFeedSettings) -> ChartFeed {
        ChartFeed::start(
            fx.registry.clone(),
            Arc::clone(&fx.history) as Arc<dyn HistoricalBars>,
            scope("btcusdt", "1h"),
            settings,
        )
        .expect("feed should start")
    }

    fn push_trade(server: &MockServer, price: &str, timestamp_secs: i64) {
        server.push_text(&format!(
            r#"{{"price":"{price}","quantity":"1","timestamp":{},"isBuyerMaker":false}}"#,
            timestamp_secs * 1_000 + 250
        ));
    }

    async fn next_bar_event(events: &mut broadcast::Receiver<ChartEvent>) -> ChartEvent {
        loop {
            let event = tokio::time::timeout(std::time::Duration::from_secs(2), events.recv())
                .await
                .expect("event should arrive")
                .expect("channel open");
            if !matches!(event, ChartEvent::Connection { .. }) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn opens_live_stream_before_history_and_replays_buffered_ticks() {
        let fx = fixture();
        fx.history.push_bars(bar_run(100 * HOUR, HOUR, 30));
        let feed = start_feed(&fx, ChartFeedSettings::default());

        let server = fx.transport.wait_for_server(0).await;
        assert!(fx.history.requests().is_empty());
        server.authenticate();
        push_trade(&server, "130.5", 100 * HOUR + 60);
        wait_until(|| feed.pager.aggregator().lock().pending_ticks() == 1).await;

        let mut events = feed.subscribe();
        let page = feed.load_initial().await.expect("initial history");

        assert_eq!(page.bars.len(), 30);
        assert_eq!(fx.history.requests()[0].limit, 200);
        let open = feed.snapshot().open_bar.expect("open bar");
        assert_eq!(open.high, dec!(130.5));
        assert_eq!(open.volume, dec!(2));
        match next_bar_event(&mut events).await {
            ChartEvent::HistoryMerged { added, exhausted, .. } => {
                assert_eq!(added, 30);
                assert!(!exhausted);
            }
            other => panic!("expected history event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn live_ticks_update_and_append_bars() {
        let fx = fixture();
        fx.history.push_bars(bar_run(100 * HOUR, HOUR, 5));
        let feed = start_feed(&fx, ChartFeedSettings::default());
        feed.load_initial().await.expect("initial history");
        let mut events = feed.subscribe();

        let server = fx.transport.wait_for_server(0).await;
        server.authenticate();
        push_trade(&server, "101", 100 * HOUR + 10);
        push_trade(&server, "99", 101 * HOUR + 1);

        match next_bar_event(&mut events).await {
            ChartEvent::BarUpdated { bar, .. } => assert_eq!(bar.high, dec!(101)),
            other => panic!("expected update, got {other:?}"),
        }
        match next_bar_event(&mut events).await {
            ChartEvent::BarAppended { sealed, bar, .. } => {
                assert_eq!(sealed.open_time, 100 * HOUR);
                assert_eq!(bar.open_time, 101 * HOUR);
                assert_eq!(bar.open, dec!(99));
            }
            other => panic!("expected append, got {other:?}"),
        }
        assert_eq!(feed.bars().len(), 6);
    }

    #[tokio::test]
    async fn scrolling_near_the_start_loads_older_bars() {
        let fx = fixture();
        fx.history.push_bars(bar_run(100 * HOUR, HOUR, 20));
        fx.history.push_bars(bar_run(80 * HOUR, HOUR, 47));
        let feed = start_feed(&fx, ChartFeedSettings::default());
        feed.load_initial().await.expect("initial history");

        assert!(feed.on_visible_range(40.0).await.expect("far").is_none());
        assert_eq!(fx.history.requests().len(), 1);

        let page = feed
            .on_visible_range(3.0)
            .await
            .expect("near start")
            .expect("should load");
        assert_eq!(fx.history.requests()[1].limit, 47);
        assert_eq!(fx.history.requests()[1].end_time, 81 * HOUR - 1);
        assert_eq!(page.added, 47);
        assert_eq!(feed.snapshot().cursor.earliest_loaded_time, Some(34 * HOUR));
    }

    #[tokio::test]
    async fn scrolling_an_exhausted_history_stays_quiet() {
        let fx = fixture();
        fx.history.push_bars(bar_run(100 * HOUR, HOUR, 20));
        let feed = start_feed(&fx, ChartFeedSettings::default());
        feed.load_initial().await.expect("initial history");
        let mut events = feed.subscribe();

        // The source has nothing older, so this fetch exhausts the cursor.
        feed.on_visible_range(0.0).await.expect("exhausting load");
        match next_bar_event(&mut events).await {
            ChartEvent::HistoryMerged { added, exhausted, .. } => {
                assert_eq!(added, 0);
                assert!(exhausted);
            }
            other => panic!("expected history event, got {other:?}"),
        }

        let page = feed
            .on_visible_range(0.0)
            .await
            .expect("no-op")
            .expect("trigger fired");
        assert_eq!(page.status, PageStatus::Exhausted);
        assert!(!page.fetched);
        assert_eq!(fx.history.requests().len(), 2);
        while let Ok(event) = events.try_recv() {
            assert!(
                matches!(event, ChartEvent::Connection { .. }),
                "unexpected event {event:?}"
            );
        }
    }

    #[tokio::test]
    async fn history_event_keeps_the_generation_it_was_loaded_under() {
        let fx = fixture();
        fx.history.push_bars(bar_run(100 * HOUR, HOUR, 12));
        let feed = start_feed(&fx, ChartFeedSettings::default());

        let page = feed.pager.load_page(12).await.expect("old scope page");
        feed.pager.reset(scope("ethusdt", "1h"));

        match history_event(&page) {
            Some(ChartEvent::HistoryMerged { generation, bars, .. }) => {
                assert_eq!(generation, 0);
                assert_eq!(bars.len(), 12);
            }
            other => panic!("expected history event, got {other:?}"),
        }
        assert_eq!(feed.pager.aggregator().lock().generation(), 1);
    }

    #[tokio::test]
    async fn switching_scope_releases_old_key_and_resets_history() {
        let fx = fixture();
        fx.history.push_bars(bar_run(100 * HOUR, HOUR, 10));
        let feed = start_feed(&fx, ChartFeedSettings::default());
        feed.load_initial().await.expect("initial history");
        let old_server = fx.transport.wait_for_server(0).await;
        old_server.authenticate();
        let mut events = feed.subscribe();

        fx.history.push_bars(bar_run(200 * 900, 900, 8));
        let page = feed
            .switch_scope(scope("ETHUSDT", "15m"))
            .await
            .expect("switch");

        assert_eq!(page.bars.len(), 8);
        assert_eq!(feed.scope().interval.duration_secs(), 900);
        match next_bar_event(&mut events).await {
            ChartEvent::Reset { generation, scope } => {
                assert_eq!(generation, 1);
                assert_eq!(scope.symbol, "ETHUSDT");
            }
            other => panic!("expected reset, got {other:?}"),
        }

        wait_until(|| old_server.close_code() == Some(NORMAL_CLOSE_CODE)).await;
        let new_server = fx.transport.wait_for_server(1).await;
        assert_eq!(new_server.key.symbol(), "ethusdt");
        assert_eq!(fx.history.requests()[1].symbol, "ETHUSDT");
        assert_eq!(fx.history.requests()[1].interval.to_string(), "15m");

        // Late ticks from the released stream cannot reach the new sequence.
        push_trade(&old_server, "1", 200 * 900 + 5);
        new_server.authenticate();
        push_trade(&new_server, "2500", 200 * 900 + 5);
        match next_bar_event(&mut events).await {
            ChartEvent::HistoryMerged { generation, .. } => assert_eq!(generation, 1),
            other => panic!("expected history event, got {other:?}"),
        }
        match next_bar_event(&mut events).await {
            ChartEvent::BarUpdated { generation, bar } => {
                assert_eq!(generation, 1);
                assert_eq!(bar.high, dec!(2500));
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_releases_the_trade_subscription() {
        let fx = fixture();
        let feed = start_feed(&fx, ChartFeedSettings::default());
        let key = SubscriptionKey::trade("Binance", "btcusdt").expect("key");
        assert_eq!(fx.registry.subscriber_count(&key), 1);

        feed.stop();

        assert!(!fx.registry.has_connection(&key));
        assert!(feed.snapshot().connection.is_none());
    }
}
