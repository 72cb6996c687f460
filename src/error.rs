use serde::ser::Serializer;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MarketError {
    #[error("no access token available")]
    Unauthenticated,
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("historical fetch failed: {0}")]
    FetchFailed(String),
    #[error("invalid interval: {0}")]
    InvalidInterval(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no async runtime available to drive the connection")]
    NoRuntime,
    #[error("request error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("json decode error: {0}")]
    SimdJson(#[from] simd_json::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for MarketError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}

impl serde::Serialize for MarketError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
