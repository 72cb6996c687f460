use crate::{error::MarketError, state::MarketSession};
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub open_connections: usize,
    pub chart_feed: &'static str,
}

pub fn build_health_response(
    started_at: Instant,
    open_connections: usize,
    chart_feed_running: bool,
) -> HealthResponse {
    HealthResponse {
        status: "ok",
        uptime_ms: started_at.elapsed().as_millis(),
        open_connections,
        chart_feed: if chart_feed_running { "running" } else { "idle" },
    }
}

pub async fn health(session: &MarketSession) -> Result<HealthResponse, MarketError> {
    let chart_feed_running = session.chart_feed.lock().await.is_some();
    Ok(build_health_response(
        session.started_at,
        session.registry.connection_count(),
        chart_feed_running,
    ))
}
