//! In-memory doubles for the transport, history source and clock-free waits.

use crate::error::MarketError;
use crate::market::history::{HistoricalBars, HistoryRequest};
use crate::market::transport::{Connection, Transport, WireFrame};
use crate::market::types::{Bar, SubscriptionKey};
use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let waited = tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached within timeout");
}

#[derive(Debug, Default)]
struct MockTransportState {
    servers: Vec<MockServer>,
    open_connections: usize,
    max_open_connections: usize,
    refuse_connects: bool,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockTransportState>>,
}

/// Server side of one mocked connection.
#[derive(Debug, Clone)]
pub struct MockServer {
    pub key: SubscriptionKey,
    frames: mpsc::UnboundedSender<WireFrame>,
    sent: Arc<Mutex<Vec<String>>>,
    close_code: Arc<Mutex<Option<u16>>>,
}

impl MockServer {
    pub fn push_text(&self, text: &str) {
        let _ = self.frames.send(WireFrame::Text(text.to_string()));
    }

    pub fn push_frame(&self, frame: WireFrame) {
        let _ = self.frames.send(frame);
    }

    pub fn authenticate(&self) {
        self.push_text(r#"{"type":"authenticated","user_id":"u-1"}"#);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn close_code(&self) -> Option<u16> {
        *self.close_code.lock()
    }
}

impl MockTransport {
    pub fn refuse_connects(&self, refuse: bool) {
        self.state.lock().refuse_connects = refuse;
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().servers.len()
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().open_connections
    }

    pub fn max_open_connections(&self) -> usize {
        self.state.lock().max_open_connections
    }

    pub fn server(&self, index: usize) -> MockServer {
        self.state.lock().servers[index].clone()
    }

    pub async fn wait_for_server(&self, index: usize) -> MockServer {
        wait_until(|| self.connect_count() > index).await;
        self.server(index)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, key: &SubscriptionKey) -> Result<Box<dyn Connection>, MarketError> {
        let mut state = self.state.lock();
        if state.refuse_connects {
            return Err(MarketError::ConnectFailed("connection refused".to_string()));
        }

        let (frames, inbound) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let close_code = Arc::new(Mutex::new(None));
        state.servers.push(MockServer {
            key: key.clone(),
            frames,
            sent: Arc::clone(&sent),
            close_code: Arc::clone(&close_code),
        });
        state.open_connections += 1;
        state.max_open_connections = state.max_open_connections.max(state.open_connections);

        Ok(Box::new(MockConnection {
            inbound,
            sent,
            close_code,
            transport: Arc::clone(&self.state),
            released: false,
        }))
    }
}

struct MockConnection {
    inbound: mpsc::UnboundedReceiver<WireFrame>,
    sent: Arc<Mutex<Vec<String>>>,
    close_code: Arc<Mutex<Option<u16>>>,
    transport: Arc<Mutex<MockTransportState>>,
    released: bool,
}

impl MockConnection {
    fn release(&mut self) {
        if !self.released {
            self.released = true;
            let mut state = self.transport.lock();
            state.open_connections = state.open_connections.saturating_sub(1);
        }
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn send_text(&mut self, text: String) -> Result<(), MarketError> {
        self.sent.lock().push(text);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<WireFrame, MarketError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self, code: u16, _reason: &str) -> Result<(), MarketError> {
        *self.close_code.lock() = Some(code);
        self.release();
        Ok(())
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.release();
    }
}

/// Scripted history source. Each fetch pops the next response; an optional
/// gate holds fetches in flight until released.
#[derive(Default)]
pub struct MockHistory {
    responses: Mutex<VecDeque<Result<Vec<Bar>, String>>>,
    requests: Mutex<Vec<HistoryRequest>>,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl MockHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bars(&self, bars: Vec<Bar>) {
        self.responses.lock().push_back(Ok(bars));
    }

    pub fn push_error(&self, message: &str) {
        self.responses.lock().push_back(Err(message.to_string()));
    }

    pub fn hold_fetches(&self) {
        *self.gate.lock() = Some(Arc::new(Notify::new()));
    }

    /// Lets the one held fetch complete; later fetches run straight through.
    pub fn release_fetches(&self) {
        if let Some(gate) = self.gate.lock().take() {
            gate.notify_one();
        }
    }

    pub fn requests(&self) -> Vec<HistoryRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl HistoricalBars for MockHistory {
    async fn fetch_bars(&self, request: &HistoryRequest) -> Result<Vec<Bar>, MarketError> {
        self.requests.lock().push(request.clone());
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        match self.responses.lock().pop_front() {
            Some(Ok(bars)) => Ok(bars),
            Some(Err(message)) => Err(MarketError::FetchFailed(message)),
            None => Ok(Vec::new()),
        }
    }
}

pub fn flat_bar(open_time: i64, price: i64) -> Bar {
    let price = Decimal::from(price);
    Bar {
        open_time,
        open: price,
        high: price,
        low: price,
        close: price,
        volume: Decimal::ONE,
    }
}

/// `count` consecutive flat bars ending with the bar that opens at `last_open`.
pub fn bar_run(last_open: i64, interval_secs: i64, count: usize) -> Vec<Bar> {
    (0..count)
        .rev()
        .map(|offset| flat_bar(last_open - offset as i64 * interval_secs, 100))
        .collect()
}
