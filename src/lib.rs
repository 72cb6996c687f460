pub mod auth;
pub mod commands;
pub mod error;
pub mod market;
pub mod state;

use auth::{AccessTokenProvider, StaticTokenProvider};
use commands::market_stream::{chart_events, start_chart_feed, StartChartFeedArgs};
use error::MarketError;
use market::config::MarketCoreArgs;
use market::feed::ChartEvent;
use state::MarketSession;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

const BROKER_ENV: &str = "MARKET_BROKER";
const SYMBOL_ENV: &str = "MARKET_SYMBOL";
const INTERVAL_ENV: &str = "MARKET_INTERVAL";
const ACCESS_TOKEN_ENV: &str = "MARKET_ACCESS_TOKEN";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}

/// Streams one chart scope configured from the environment and logs its bar
/// events until Ctrl-C.
pub async fn run() -> Result<(), MarketError> {
    let config = MarketCoreArgs::from_env().normalize()?;
    let tokens: Arc<dyn AccessTokenProvider> = Arc::new(StaticTokenProvider::new(
        std::env::var(ACCESS_TOKEN_ENV).ok(),
    ));
    let session = MarketSession::connect(config, tokens)?;

    let args = StartChartFeedArgs {
        broker: std::env::var(BROKER_ENV).ok(),
        symbol: std::env::var(SYMBOL_ENV).ok(),
        interval: std::env::var(INTERVAL_ENV).ok(),
    };
    let started = start_chart_feed(&session, Some(args)).await?;
    tracing::info!(
        broker = %started.broker,
        symbol = %started.symbol,
        interval = %started.interval,
        bars = started.bars_loaded,
        history_error = ?started.history_error,
        "chart feed started"
    );

    let Some(mut events) = chart_events(&session).await else {
        session.shutdown().await;
        return Ok(());
    };

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(error) = signal {
                    tracing::warn!(%error, "failed to listen for ctrl-c");
                }
                break;
            }
            event = events.recv() => match event {
                Ok(event) => log_chart_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "chart event consumer lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    session.shutdown().await;
    tracing::info!("market core stopped");
    Ok(())
}

fn log_chart_event(event: &ChartEvent) {
    match event {
        ChartEvent::BarUpdated { bar, .. } => {
            tracing::debug!(open_time = bar.open_time, close = %bar.close, volume = %bar.volume, "bar updated");
        }
        ChartEvent::BarAppended { sealed, bar, .. } => {
            tracing::info!(
                sealed_open_time = sealed.open_time,
                sealed_close = %sealed.close,
                open_time = bar.open_time,
                open = %bar.open,
                "bar appended"
            );
        }
        ChartEvent::HistoryMerged { added, exhausted, bars, .. } => {
            tracing::info!(added, exhausted, total = bars.len(), "history merged");
        }
        ChartEvent::Reset { generation, scope } => {
            tracing::info!(generation, symbol = %scope.symbol, interval = %scope.interval, "chart reset");
        }
        ChartEvent::Connection { status } => {
            tracing::info!(key = %status.key, state = ?status.state, fault = ?status.fault, "connection status");
        }
    }
}
