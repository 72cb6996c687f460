use crate::error::MarketError;
use crate::market::candles::CandleAggregator;
use crate::market::config::MAX_SCROLL_BATCH_BARS;
use crate::market::history::{HistoricalBars, HistoryRequest};
use crate::market::types::{Bar, Interval};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

pub type SharedAggregator = Arc<Mutex<CandleAggregator>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillQuery {
    pub broker: String,
    pub symbol: String,
    pub interval: Interval,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PagingCursor {
    pub earliest_loaded_time: Option<i64>,
    pub exhausted: bool,
    pub loading: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PageStatus {
    Merged,
    /// Another fetch for this cursor is still running.
    InFlight,
    Exhausted,
    /// The scope was reset while the fetch ran; its bars were discarded.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillPage {
    pub status: PageStatus,
    pub added: usize,
    /// Aggregator generation the bars were read under.
    pub generation: u64,
    /// Whether this call reached the history source.
    pub fetched: bool,
    pub bars: Vec<Bar>,
}

#[derive(Debug)]
struct PagerState {
    query: BackfillQuery,
    cursor: PagingCursor,
    generation: u64,
}

/// Clears `loading` when a fetch is abandoned before it completes, unless
/// the pager has moved to another generation meanwhile.
struct LoadingGuard<'a> {
    state: &'a Mutex<PagerState>,
    generation: u64,
    armed: bool,
}

impl LoadingGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.state.lock();
        if state.generation == self.generation {
            state.cursor.loading = false;
        }
    }
}

/// Extends the aggregator's sequence backwards, one fetch at a time.
pub struct BackfillPager {
    source: Arc<dyn HistoricalBars>,
    aggregator: SharedAggregator,
    // Lock order: `state` before `aggregator`.
    state: Mutex<PagerState>,
}

impl BackfillPager {
    pub fn new(source: Arc<dyn HistoricalBars>, aggregator: SharedAggregator, query: BackfillQuery) -> Self {
        let generation = aggregator.lock().generation();
        Self {
            source,
            aggregator,
            state: Mutex::new(PagerState {
                query,
                cursor: PagingCursor::default(),
                generation,
            }),
        }
    }

    pub fn aggregator(&self) -> &SharedAggregator {
        &self.aggregator
    }

    pub fn cursor(&self) -> PagingCursor {
        self.state.lock().cursor
    }

    pub fn query(&self) -> BackfillQuery {
        self.state.lock().query.clone()
    }

    pub async fn load_more(&self, count: usize) -> Result<Vec<Bar>, MarketError> {
        self.load_page(count).await.map(|page| page.bars)
    }

    /// Fetches up to `count` bars older than the earliest loaded one (or
    /// older than now on the first call) and merges them.
    pub async fn load_page(&self, count: usize) -> Result<BackfillPage, MarketError> {
        let (request, generation, pager_generation) = {
            let mut state = self.state.lock();
            let mut aggregator = self.aggregator.lock();
            if state.cursor.loading {
                return Ok(page(PageStatus::InFlight, 0, false, &aggregator));
            }
            if state.cursor.exhausted || count == 0 {
                return Ok(page(PageStatus::Exhausted, 0, false, &aggregator));
            }

            aggregator.begin_backfill();
            let end_time = match aggregator.earliest_open_time() {
                Some(earliest) => earliest - 1,
                None => chrono::Utc::now().timestamp(),
            };
            state.cursor.loading = true;
            let request = HistoryRequest {
                broker: state.query.broker.clone(),
                symbol: state.query.symbol.clone(),
                interval: aggregator.interval(),
                end_time,
                limit: count,
            };
            (request, aggregator.generation(), state.generation)
        };

        let mut loading = LoadingGuard {
            state: &self.state,
            generation: pager_generation,
            armed: true,
        };
        let result = self.source.fetch_bars(&request).await;
        loading.disarm();

        let mut state = self.state.lock();
        let mut aggregator = self.aggregator.lock();
        if aggregator.generation() != generation {
            if state.generation == generation {
                // The aggregator was reset without going through the pager.
                state.cursor = PagingCursor::default();
                state.generation = aggregator.generation();
            }
            tracing::debug!(
                symbol = %request.symbol,
                interval = %request.interval,
                "discarding backfill for a previous scope"
            );
            return Ok(page(PageStatus::Stale, 0, true, &aggregator));
        }

        state.cursor.loading = false;
        let batch = match result {
            Ok(batch) => batch,
            Err(error) => {
                tracing::warn!(symbol = %request.symbol, %error, "backfill fetch failed");
                return Err(error);
            }
        };

        let fetched = batch.len();
        let added = aggregator.merge_history(batch, count);
        state.cursor.earliest_loaded_time = aggregator.earliest_open_time();
        if added == 0 {
            state.cursor.exhausted = true;
            tracing::info!(
                symbol = %request.symbol,
                interval = %request.interval,
                fetched,
                "history exhausted"
            );
            return Ok(page(PageStatus::Exhausted, 0, true, &aggregator));
        }

        tracing::debug!(symbol = %request.symbol, fetched, added, "merged history page");
        Ok(page(PageStatus::Merged, added, true, &aggregator))
    }

    /// Starts over for a new scope. Any fetch still running is discarded when
    /// it completes. Returns the new generation.
    pub fn reset(&self, query: BackfillQuery) -> u64 {
        let mut state = self.state.lock();
        let generation = self.aggregator.lock().reset(query.interval);
        state.query = query;
        state.cursor = PagingCursor::default();
        state.generation = generation;
        generation
    }
}

fn page(status: PageStatus, added: usize, fetched: bool, aggregator: &CandleAggregator) -> BackfillPage {
    BackfillPage {
        status,
        added,
        generation: aggregator.generation(),
        fetched,
        bars: aggregator.bars().to_vec(),
    }
}

/// Bars to request when the visible range starts `visible_from` bars into the
/// loaded sequence, or `None` while it is far enough from the start.
pub fn scroll_batch_size(visible_from: f64, threshold_bars: usize, batch_bars: usize) -> Option<usize> {
    if !visible_from.is_finite() || visible_from >= threshold_bars as f64 {
        return None;
    }
    let wanted = (batch_bars as f64 - visible_from).ceil();
    Some(wanted.clamp(1.0, MAX_SCROLL_BATCH_BARS as f64) as usize)
}
