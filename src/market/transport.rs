use crate::error::MarketError;
use crate::market::types::{Channel, SubscriptionKey};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

pub type MarketWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Application-level frame read from a physical connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
    Close(Option<u16>),
}

/// One open duplex socket.
#[async_trait]
pub trait Connection: Send {
    async fn send_text(&mut self, text: String) -> Result<(), MarketError>;

    /// Next application frame; `None` once the peer is gone.
    async fn recv(&mut self) -> Option<Result<WireFrame, MarketError>>;

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), MarketError>;
}

/// Opens physical connections for subscription keys.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, key: &SubscriptionKey) -> Result<Box<dyn Connection>, MarketError>;
}

pub fn ws_endpoint(base_url: &str, key: &SubscriptionKey) -> String {
    // Symbols such as `BTC/KRW` stay one path segment.
    let symbol = key.symbol().replace('/', "%2F");
    match key.channel() {
        Channel::Orderbook => format!("{base_url}/ws/orderbook/{}/{symbol}", key.broker()),
        Channel::Trade => format!("{base_url}/ws/trade/{}/{symbol}", key.broker()),
        Channel::UserOrders => format!("{base_url}/ws/userdata/{}", key.broker()),
    }
}

#[derive(Debug, Clone)]
pub struct WsTransport {
    base_url: String,
}

impl WsTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, key: &SubscriptionKey) -> Result<Box<dyn Connection>, MarketError> {
        let ws_config = WebSocketConfig {
            max_message_size: Some(16 << 20),
            max_frame_size: Some(4 << 20),
            ..Default::default()
        };

        let request = ws_endpoint(&self.base_url, key);
        let (stream, _) = connect_async_with_config(request, Some(ws_config), true).await?;
        Ok(Box::new(WsConnection { stream }))
    }
}

pub struct WsConnection {
    stream: MarketWsStream,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send_text(&mut self, text: String) -> Result<(), MarketError> {
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<WireFrame, MarketError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(error) => return Some(Err(error.into())),
            };

            match message {
                Message::Text(text) => return Some(Ok(WireFrame::Text(text))),
                Message::Binary(payload) => return Some(Ok(WireFrame::Binary(payload))),
                Message::Close(frame) => {
                    return Some(Ok(WireFrame::Close(frame.map(|frame| u16::from(frame.code)))))
                }
                // Protocol-level ping/pong is answered by tungstenite itself.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), MarketError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        self.stream.close(Some(frame)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_channel_endpoints() {
        let trade = SubscriptionKey::trade("Binance", "BTCUSDT").expect("key");
        assert_eq!(
            ws_endpoint("ws://localhost:8001", &trade),
            "ws://localhost:8001/ws/trade/Binance/btcusdt"
        );

        let book = SubscriptionKey::orderbook("UPBit", "krwbtc").expect("key");
        assert_eq!(
            ws_endpoint("wss://feed.example.com", &book),
            "wss://feed.example.com/ws/orderbook/UPBit/krwbtc"
        );

        let dashed = SubscriptionKey::trade("UPBit", "KRW-BTC").expect("key");
        assert_eq!(
            ws_endpoint("ws://localhost:8001", &dashed),
            "ws://localhost:8001/ws/trade/UPBit/KRW-BTC"
        );

        let slashed = SubscriptionKey::trade("Bithumb", "BTC/KRW").expect("key");
        assert_eq!(
            ws_endpoint("ws://localhost:8001", &slashed),
            "ws://localhost:8001/ws/trade/Bithumb/BTC%2FKRW"
        );

        let orders = SubscriptionKey::user_orders("Binance").expect("key");
        assert_eq!(
            ws_endpoint("ws://localhost:8001", &orders),
            "ws://localhost:8001/ws/userdata/Binance"
        );
    }
}
