use crate::error::MarketError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_BROKER: &str = "Binance";
pub const DEFAULT_SYMBOL: &str = "btcusdt";
pub const DEFAULT_INTERVAL: &str = "1h";
pub const AUTH_POLICY_CLOSE_CODE: u16 = 1008;
pub const NORMAL_CLOSE_CODE: u16 = 1000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub enum Channel {
    Orderbook,
    Trade,
    UserOrders,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Orderbook => "orderbook",
            Self::Trade => "trade",
            Self::UserOrders => "userOrders",
        }
    }
}

/// Identity of one physical stream. Symbols are stored lowercase; the
/// user-orders channel is per broker, so its symbol is always empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionKey {
    broker: String,
    symbol: String,
    channel: Channel,
}

impl SubscriptionKey {
    pub fn new(broker: &str, symbol: &str, channel: Channel) -> Result<Self, MarketError> {
        let broker = broker.trim();
        if broker.is_empty()
            || !broker
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
        {
            return Err(MarketError::InvalidArgument(
                "broker must be non-empty ASCII (alphanumeric, '-' or '_')".to_string(),
            ));
        }

        let symbol = match channel {
            Channel::UserOrders => String::new(),
            Channel::Orderbook | Channel::Trade => normalize_symbol(broker, symbol)?,
        };

        Ok(Self {
            broker: broker.to_string(),
            symbol,
            channel,
        })
    }

    pub fn orderbook(broker: &str, symbol: &str) -> Result<Self, MarketError> {
        Self::new(broker, symbol, Channel::Orderbook)
    }

    pub fn trade(broker: &str, symbol: &str) -> Result<Self, MarketError> {
        Self::new(broker, symbol, Channel::Trade)
    }

    pub fn user_orders(broker: &str) -> Result<Self, MarketError> {
        Self::new(broker, "", Channel::UserOrders)
    }

    pub fn broker(&self) -> &str {
        &self.broker
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.channel {
            Channel::UserOrders => write!(f, "{}-{}", self.broker, self.channel.as_str()),
            _ => write!(
                f,
                "{}-{}-{}",
                self.broker,
                self.symbol,
                self.channel.as_str()
            ),
        }
    }
}

/// Validates a market symbol such as `btcusdt`, `KRW-BTC` or `BTC/KRW`.
/// Binance streams are keyed lowercase; other brokers keep the caller's
/// casing.
pub fn normalize_symbol(broker: &str, symbol: &str) -> Result<String, MarketError> {
    let symbol = symbol.trim();
    if symbol.is_empty()
        || !symbol
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '/'))
    {
        return Err(MarketError::InvalidArgument(
            "symbol must be non-empty ASCII (alphanumeric, '-', '_' or '/')".to_string(),
        ));
    }

    if broker.trim().eq_ignore_ascii_case(DEFAULT_BROKER) {
        Ok(symbol.to_ascii_lowercase())
    } else {
        Ok(symbol.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Open,
    Reconnecting,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "kind", content = "reason")]
pub enum ConnectionFault {
    ConnectFailed(String),
    AuthenticationFailed(String),
    Lost(String),
}

impl From<ConnectionFault> for MarketError {
    fn from(value: ConnectionFault) -> Self {
        match value {
            ConnectionFault::ConnectFailed(reason) => Self::ConnectFailed(reason),
            ConnectionFault::AuthenticationFailed(reason) => Self::AuthenticationFailed(reason),
            ConnectionFault::Lost(reason) => Self::ConnectionLost(reason),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub key: SubscriptionKey,
    pub state: ConnectionState,
    pub fault: Option<ConnectionFault>,
}

impl ConnectionStatus {
    pub fn new(key: SubscriptionKey, state: ConnectionState) -> Self {
        Self {
            key,
            state,
            fault: None,
        }
    }

    pub fn failed(key: SubscriptionKey, fault: ConnectionFault) -> Self {
        Self {
            key,
            state: ConnectionState::Closed,
            fault: Some(fault),
        }
    }

    pub fn is_usable(&self) -> bool {
        self.state == ConnectionState::Open
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum IntervalUnit {
    #[serde(rename = "s")]
    Second,
    #[serde(rename = "m")]
    Minute,
    #[serde(rename = "h")]
    Hour,
    #[serde(rename = "d")]
    Day,
    #[serde(rename = "w")]
    Week,
}

impl IntervalUnit {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Second => "s",
            Self::Minute => "m",
            Self::Hour => "h",
            Self::Day => "d",
            Self::Week => "w",
        }
    }

    pub fn seconds(self) -> i64 {
        match self {
            Self::Second => 1,
            Self::Minute => 60,
            Self::Hour => 3_600,
            Self::Day => 86_400,
            Self::Week => 604_800,
        }
    }
}

/// Candle width such as `15m` or `1H`. Units are case-insensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    magnitude: u32,
    unit: IntervalUnit,
}

impl Interval {
    pub fn new(magnitude: u32, unit: IntervalUnit) -> Result<Self, MarketError> {
        if magnitude == 0 {
            return Err(MarketError::InvalidInterval(
                "interval magnitude must be positive".to_string(),
            ));
        }
        Ok(Self { magnitude, unit })
    }

    pub fn magnitude(self) -> u32 {
        self.magnitude
    }

    pub fn unit(self) -> IntervalUnit {
        self.unit
    }

    pub fn duration_secs(self) -> i64 {
        i64::from(self.magnitude).saturating_mul(self.unit.seconds())
    }
}

impl FromStr for Interval {
    type Err = MarketError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let token = value.trim();
        let digits_end = token
            .find(|ch: char| !ch.is_ascii_digit())
            .unwrap_or(token.len());
        let (digits, unit) = token.split_at(digits_end);

        let magnitude = digits
            .parse::<u32>()
            .map_err(|_| MarketError::InvalidInterval(value.to_string()))?;
        let unit = match unit.to_ascii_lowercase().as_str() {
            "s" => IntervalUnit::Second,
            "m" => IntervalUnit::Minute,
            "h" => IntervalUnit::Hour,
            "d" => IntervalUnit::Day,
            "w" => IntervalUnit::Week,
            _ => return Err(MarketError::InvalidInterval(value.to_string())),
        };

        Self::new(magnitude, unit).map_err(|_| MarketError::InvalidInterval(value.to_string()))
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.magnitude, self.unit.as_str())
    }
}

impl Serialize for Interval {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Interval {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let token = String::deserialize(deserializer)?;
        token.parse().map_err(serde::de::Error::custom)
    }
}

/// One trade execution. `timestamp` is in seconds, matching bar open times.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TickEvent {
    pub price: Decimal,
    pub quantity: Decimal,
    pub timestamp: i64,
    pub is_seller_initiated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bar {
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Bar {
    pub fn from_tick(open_time: i64, tick: &TickEvent) -> Self {
        Self {
            open_time,
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: tick.quantity,
        }
    }

    pub fn apply_tick(&mut self, tick: &TickEvent) {
        self.high = self.high.max(tick.price);
        self.low = self.low.min(tick.price);
        self.close = tick.price;
        self.volume += tick.quantity;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderbookLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderbookSnapshot {
    pub symbol: Option<String>,
    pub bids: Vec<OrderbookLevel>,
    pub asks: Vec<OrderbookLevel>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    Trade,
    #[serde(alias = "CANCELLED")]
    Canceled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    #[serde(alias = "BUY", alias = "Buy")]
    Buy,
    #[serde(alias = "SELL", alias = "Sell")]
    Sell,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderUpdate {
    pub order_id: String,
    pub status: OrderStatus,
    pub symbol: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
}

/// What a subscriber callback observes for its key.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Orderbook(OrderbookSnapshot),
    Trade(TickEvent),
    OrderUpdate(OrderUpdate),
    Status(ConnectionStatus),
}

// Wire formats shared by the websocket channels and the candle endpoint.

#[derive(Debug, Deserialize)]
pub struct OrderbookLevelWire {
    pub price: Decimal,
    pub quantity: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum OrderIdWire {
    Text(String),
    Number(u64),
}

#[derive(Debug, Deserialize)]
pub struct OrderUpdateWire {
    pub order_id: OrderIdWire,
    pub order_status: OrderStatus,
    pub symbol: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
}

impl From<OrderUpdateWire> for OrderUpdate {
    fn from(value: OrderUpdateWire) -> Self {
        let order_id = match value.order_id {
            OrderIdWire::Text(text) => text,
            OrderIdWire::Number(number) => number.to_string(),
        };
        Self {
            order_id,
            status: value.order_status,
            symbol: value.symbol,
            side: value.side,
            price: value.price,
            quantity: value.quantity,
        }
    }
}

/// Every server frame shape in one envelope; unrelated fields stay `None`.
#[derive(Debug, Default, Deserialize)]
pub struct FrameWire {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub message: Option<String>,
    pub symbol: Option<String>,
    pub bids: Option<Vec<OrderbookLevelWire>>,
    pub asks: Option<Vec<OrderbookLevelWire>>,
    pub price: Option<Decimal>,
    pub quantity: Option<Decimal>,
    pub timestamp: Option<i64>,
    #[serde(rename = "isBuyerMaker")]
    pub is_buyer_maker: Option<bool>,
    pub data: Option<OrderUpdateWire>,
}

#[derive(Debug, Serialize)]
pub struct AuthFrame<'a> {
    pub token: &'a str,
}

pub fn tick_from_trade_wire(
    price: Decimal,
    quantity: Decimal,
    timestamp_ms: i64,
    is_buyer_maker: bool,
) -> Result<TickEvent, MarketError> {
    if price <= Decimal::ZERO || quantity < Decimal::ZERO {
        return Err(MarketError::Parse(
            "trade price must be positive and quantity non-negative".to_string(),
        ));
    }

    Ok(TickEvent {
        price,
        quantity,
        timestamp: timestamp_ms.div_euclid(1_000),
        is_seller_initiated: is_buyer_maker,
    })
}

#[derive(Debug, Deserialize)]
pub struct CandleWire {
    pub time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl TryFrom<CandleWire> for Bar {
    type Error = MarketError;

    fn try_from(value: CandleWire) -> Result<Self, Self::Error> {
        if value.low > value.high || value.volume < Decimal::ZERO {
            return Err(MarketError::Parse(format!(
                "candle at {} has low above high or negative volume",
                value.time
            )));
        }

        Ok(Self {
            open_time: value.time,
            open: value.open,
            high: value.high,
            low: value.low,
            close: value.close,
            volume: value.volume,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct CandleResponseWire {
    pub message: String,
    #[serde(default)]
    pub candles: Option<Vec<CandleWire>>,
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_interval_tokens_case_insensitively() {
        let hourly: Interval = "1H".parse().expect("1H should parse");
        assert_eq!(hourly.duration_secs(), 3_600);
        assert_eq!(hourly.to_string(), "1h");

        let daily: Interval = "1d".parse().expect("1d should parse");
        assert_eq!(daily.duration_secs(), 86_400);

        let quarter: Interval = "15m".parse().expect("15m should parse");
        assert_eq!(quarter.duration_secs(), 900);
        assert_eq!(quarter.unit(), IntervalUnit::Minute);

        let weekly: Interval = "2w".parse().expect("2w should parse");
        assert_eq!(weekly.duration_secs(), 1_209_600);
    }

    #[test]
    fn rejects_unknown_interval_units_instead_of_defaulting() {
        for token in ["1x", "h", "0h", "", "1hh", "-1h", "1.5h"] {
            let result = token.parse::<Interval>();
            assert!(
                matches!(result, Err(MarketError::InvalidInterval(_))),
                "token {token:?} should be rejected"
            );
        }
    }

    #[test]
    fn normalizes_subscription_keys() {
        let key = SubscriptionKey::trade(" Binance ", "BTCUSDT").expect("key should build");
        assert_eq!(key.broker(), "Binance");
        assert_eq!(key.symbol(), "btcusdt");
        assert_eq!(key.to_string(), "Binance-btcusdt-trade");

        let same = SubscriptionKey::trade("Binance", "btcusdt").expect("key should build");
        assert_eq!(key, same);

        let orders = SubscriptionKey::new("Binance", "ETHUSDT", Channel::UserOrders)
            .expect("user orders key should build");
        assert_eq!(orders, SubscriptionKey::user_orders("Binance").expect("key"));
        assert_eq!(orders.to_string(), "Binance-userOrders");
    }

    #[test]
    fn keeps_symbol_casing_outside_binance() {
        let upbit = SubscriptionKey::trade("UPBit", "KRW-BTC").expect("dashed symbol");
        assert_eq!(upbit.symbol(), "KRW-BTC");
        assert_eq!(upbit.to_string(), "UPBit-KRW-BTC-trade");

        let slashed = SubscriptionKey::orderbook("Bithumb", "BTC/KRW").expect("slashed symbol");
        assert_eq!(slashed.symbol(), "BTC/KRW");

        let binance = SubscriptionKey::trade("binance", "BTC_USDT").expect("binance symbol");
        assert_eq!(binance.symbol(), "btc_usdt");
    }

    #[test]
    fn rejects_malformed_subscription_keys() {
        assert!(SubscriptionKey::trade("", "btcusdt").is_err());
        assert!(SubscriptionKey::trade("Binance", "btc usdt").is_err());
        assert!(SubscriptionKey::trade("UPBit", "KRW$BTC").is_err());
        assert!(SubscriptionKey::orderbook("Bin ance", "btcusdt").is_err());
    }

    #[test]
    fn applies_tick_to_bar() {
        let first = TickEvent {
            price: dec!(100.1),
            quantity: dec!(0.2),
            timestamp: 60,
            is_seller_initiated: false,
        };
        let second = TickEvent {
            price: dec!(99.7),
            quantity: dec!(0.1),
            timestamp: 61,
            is_seller_initiated: true,
        };

        let mut bar = Bar::from_tick(60, &first);
        bar.apply_tick(&second);

        assert_eq!(bar.open, dec!(100.1));
        assert_eq!(bar.high, dec!(100.1));
        assert_eq!(bar.low, dec!(99.7));
        assert_eq!(bar.close, dec!(99.7));
        assert_eq!(bar.volume, dec!(0.3));
    }

    #[test]
    fn converts_trade_wire_timestamp_to_seconds() {
        let tick = tick_from_trade_wire(dec!(42000.5), dec!(0.01), 1_700_000_123_456, true)
            .expect("trade should convert");
        assert_eq!(tick.timestamp, 1_700_000_123);
        assert!(tick.is_seller_initiated);

        assert!(tick_from_trade_wire(dec!(0), dec!(1), 0, false).is_err());
        assert!(tick_from_trade_wire(dec!(1), dec!(-1), 0, false).is_err());
    }

    #[test]
    fn rejects_inverted_candles() {
        let wire = CandleWire {
            time: 3_600,
            open: dec!(10),
            high: dec!(9),
            low: dec!(11),
            close: dec!(10),
            volume: dec!(1),
        };
        assert!(Bar::try_from(wire).is_err());
    }
}
