use crate::market::types::{Bar, Interval, TickEvent};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AggregatorPhase {
    Uninitialized,
    Backfilling,
    Live,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The open bar absorbed the tick.
    Updated(Bar),
    /// The open bar was sealed and a new one started.
    Appended { sealed: Bar, opened: Bar },
    /// Held until the sequence is seeded.
    Buffered,
    /// Older than the open bar; ignored.
    Stale { open_time: i64, timestamp: i64 },
}

/// Sole owner of one (broker, symbol, interval) bar sequence.
///
/// Bars are kept ascending by `open_time` with no duplicates; the last one is
/// the open bar. Live ticks and history merges both go through `&mut self`
/// so they serialize on whatever lock the owner wraps this in.
#[derive(Debug)]
pub struct CandleAggregator {
    interval: Interval,
    phase: AggregatorPhase,
    bars: Vec<Bar>,
    generation: u64,
    pending_ticks: VecDeque<TickEvent>,
    tick_buffer_capacity: usize,
    dropped_ticks: u64,
}

impl CandleAggregator {
    pub fn new(interval: Interval, tick_buffer_capacity: usize) -> Self {
        Self {
            interval,
            phase: AggregatorPhase::Uninitialized,
            bars: Vec::new(),
            generation: 0,
            pending_ticks: VecDeque::new(),
            tick_buffer_capacity: tick_buffer_capacity.max(1),
            dropped_ticks: 0,
        }
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn phase(&self) -> AggregatorPhase {
        self.phase
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn open_bar(&self) -> Option<&Bar> {
        self.bars.last()
    }

    pub fn earliest_open_time(&self) -> Option<i64> {
        self.bars.first().map(|bar| bar.open_time)
    }

    pub fn pending_ticks(&self) -> usize {
        self.pending_ticks.len()
    }

    pub fn dropped_ticks(&self) -> u64 {
        self.dropped_ticks
    }

    pub fn begin_backfill(&mut self) {
        if self.phase == AggregatorPhase::Uninitialized {
            self.phase = AggregatorPhase::Backfilling;
        }
    }

    /// Replaces the sequence with `bars` and goes live. An empty batch leaves
    /// the aggregator waiting. Returns how many buffered ticks were replayed.
    pub fn seed(&mut self, mut bars: Vec<Bar>) -> usize {
        normalize_bars(&mut bars);
        if bars.is_empty() {
            return 0;
        }

        self.bars = bars;
        self.phase = AggregatorPhase::Live;

        let buffered: Vec<TickEvent> = self.pending_ticks.drain(..).collect();
        let replayed = buffered.len();
        for tick in &buffered {
            self.on_tick(tick);
        }
        replayed
    }

    /// Adds the bars of `batch` not already present, at most `limit` of them
    /// (newest first), keeping the sequence sorted. Existing bars are never
    /// overwritten. Returns the number of bars added.
    pub fn merge_history(&mut self, mut batch: Vec<Bar>, limit: usize) -> usize {
        let known: HashSet<i64> = self.bars.iter().map(|bar| bar.open_time).collect();
        normalize_bars(&mut batch);
        batch.retain(|bar| !known.contains(&bar.open_time));
        if batch.len() > limit {
            batch.drain(..batch.len() - limit);
        }

        let added = batch.len();
        if self.phase != AggregatorPhase::Live {
            // Nothing is loaded before the first seed.
            self.seed(batch);
            return added;
        }

        if added > 0 {
            self.bars.extend(batch);
            self.bars.sort_unstable_by_key(|bar| bar.open_time);
        }
        added
    }

    pub fn on_tick(&mut self, tick: &TickEvent) -> TickOutcome {
        if self.phase != AggregatorPhase::Live {
            if self.pending_ticks.len() >= self.tick_buffer_capacity {
                self.pending_ticks.pop_front();
                self.dropped_ticks += 1;
            }
            self.pending_ticks.push_back(tick.clone());
            return TickOutcome::Buffered;
        }

        let duration = self.interval.duration_secs();
        let Some(open) = self.bars.last_mut() else {
            self.pending_ticks.push_back(tick.clone());
            return TickOutcome::Buffered;
        };

        let elapsed = tick.timestamp - open.open_time;
        if elapsed < 0 {
            return TickOutcome::Stale {
                open_time: open.open_time,
                timestamp: tick.timestamp,
            };
        }

        if elapsed < duration {
            open.apply_tick(tick);
            return TickOutcome::Updated(open.clone());
        }

        // Idle intervals are skipped, not filled with empty bars.
        let sealed = open.clone();
        let open_time = sealed.open_time + (elapsed / duration) * duration;
        let opened = Bar::from_tick(open_time, tick);
        self.bars.push(opened.clone());
        TickOutcome::Appended { sealed, opened }
    }

    /// Discards every bar and buffered tick. Results computed against the
    /// previous generation must be dropped by their owners.
    pub fn reset(&mut self, interval: Interval) -> u64 {
        self.interval = interval;
        self.phase = AggregatorPhase::Uninitialized;
        self.bars.clear();
        self.pending_ticks.clear();
        self.dropped_ticks = 0;
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }
}

fn normalize_bars(bars: &mut Vec<Bar>) {
    bars.sort_by_key(|bar| bar.open_time);
    bars.dedup_by_key(|bar| bar.open_time);
}
