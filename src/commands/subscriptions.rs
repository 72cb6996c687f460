use crate::error::MarketError;
use crate::market::registry::SubscriptionHandle;
use crate::market::types::{
    ChannelEvent, ConnectionStatus, OrderUpdate, OrderbookSnapshot, SubscriptionKey, TickEvent,
    DEFAULT_BROKER, DEFAULT_SYMBOL,
};
use crate::state::MarketSession;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MarketChannelArgs {
    pub broker: Option<String>,
    pub symbol: Option<String>,
}

impl MarketChannelArgs {
    fn broker(&self) -> &str {
        self.broker
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_BROKER)
    }

    fn symbol(&self) -> &str {
        self.symbol.as_deref().unwrap_or(DEFAULT_SYMBOL)
    }
}

/// Typed stream of one channel's payloads. Status changes stay on the
/// handle; dropping the subscription releases the shared connection.
pub struct ChannelSubscription<T> {
    handle: SubscriptionHandle,
    updates: mpsc::UnboundedReceiver<T>,
}

impl<T> ChannelSubscription<T> {
    pub fn key(&self) -> &SubscriptionKey {
        self.handle.key()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.handle.status()
    }

    pub async fn recv(&mut self) -> Option<T> {
        self.updates.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.updates.try_recv().ok()
    }

    pub fn close(self) {
        self.handle.release();
    }
}

fn subscribe_channel<T, F>(
    session: &MarketSession,
    key: SubscriptionKey,
    select: F,
) -> Result<ChannelSubscription<T>, MarketError>
where
    T: Send + 'static,
    F: Fn(&ChannelEvent) -> Option<T> + Send + Sync + 'static,
{
    let (sender, updates) = mpsc::unbounded_channel();
    let handle = session.registry.acquire(key, move |event: &ChannelEvent| {
        if let Some(update) = select(event) {
            // The receiver is gone only while the subscription is being dropped.
            let _ = sender.send(update);
        }
    })?;
    Ok(ChannelSubscription { handle, updates })
}

pub fn subscribe_orderbook(
    session: &MarketSession,
    args: MarketChannelArgs,
) -> Result<ChannelSubscription<OrderbookSnapshot>, MarketError> {
    let key = SubscriptionKey::orderbook(args.broker(), args.symbol())?;
    subscribe_channel(session, key, |event| match event {
        ChannelEvent::Orderbook(book) => Some(book.clone()),
        _ => None,
    })
}

pub fn subscribe_trade_price(
    session: &MarketSession,
    args: MarketChannelArgs,
) -> Result<ChannelSubscription<TickEvent>, MarketError> {
    let key = SubscriptionKey::trade(args.broker(), args.symbol())?;
    subscribe_channel(session, key, |event| match event {
        ChannelEvent::Trade(tick) => Some(tick.clone()),
        _ => None,
    })
}

pub fn subscribe_user_orders(
    session: &MarketSession,
    args: MarketChannelArgs,
) -> Result<ChannelSubscription<OrderUpdate>, MarketError> {
    let key = SubscriptionKey::user_orders(args.broker())?;
    subscribe_channel(session, key, |event| match event {
        ChannelEvent::OrderUpdate(update) => Some(update.clone()),
        _ => None,
    })
}
