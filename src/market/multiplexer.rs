use crate::error::MarketError;
use crate::market::transport::WireFrame;
use crate::market::types::{
    tick_from_trade_wire, Channel, ChannelEvent, FrameWire, OrderbookLevel, OrderbookLevelWire,
    OrderbookSnapshot,
};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

pub type FrameCallback = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;

/// Registered callback; `id` is unique within one registry.
#[derive(Clone)]
pub struct Subscriber {
    pub id: u64,
    pub callback: FrameCallback,
}

/// Classification of one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Heartbeat,
    Authenticated,
    Rejected { message: String },
    Payload(ChannelEvent),
}

pub fn classify_wire_frame(channel: Channel, frame: WireFrame) -> Result<InboundFrame, MarketError> {
    match frame {
        WireFrame::Text(text) => classify_frame(channel, &mut text.into_bytes()),
        WireFrame::Binary(mut payload) => classify_frame(channel, &mut payload),
        WireFrame::Close(_) => Err(MarketError::Parse(
            "close frames are handled by the connection".to_string(),
        )),
    }
}

/// Parses a raw frame. Control frames are recognised by their `type` field;
/// anything else must match the payload shape of `channel`.
pub fn classify_frame(channel: Channel, bytes: &mut [u8]) -> Result<InboundFrame, MarketError> {
    let frame: FrameWire = simd_json::serde::from_slice(bytes)?;

    match frame.kind.as_deref() {
        Some("ping") => return Ok(InboundFrame::Heartbeat),
        Some("authenticated") => return Ok(InboundFrame::Authenticated),
        Some("error") => {
            return Ok(InboundFrame::Rejected {
                message: frame
                    .message
                    .unwrap_or_else(|| "server rejected the connection".to_string()),
            })
        }
        _ => {}
    }

    let event = match channel {
        Channel::Orderbook => orderbook_event(frame)?,
        Channel::Trade => trade_event(frame)?,
        Channel::UserOrders => order_update_event(frame)?,
    };
    Ok(InboundFrame::Payload(event))
}

fn levels(wire: Vec<OrderbookLevelWire>) -> Vec<OrderbookLevel> {
    wire.into_iter()
        .map(|level| OrderbookLevel {
            price: level.price,
            quantity: level.quantity,
        })
        .collect()
}

fn orderbook_event(frame: FrameWire) -> Result<ChannelEvent, MarketError> {
    match (frame.bids, frame.asks) {
        (Some(bids), Some(asks)) => Ok(ChannelEvent::Orderbook(OrderbookSnapshot {
            symbol: frame.symbol,
            bids: levels(bids),
            asks: levels(asks),
        })),
        _ => Err(MarketError::Parse(
            "orderbook frame without bids/asks".to_string(),
        )),
    }
}

fn trade_event(frame: FrameWire) -> Result<ChannelEvent, MarketError> {
    match (frame.price, frame.quantity, frame.timestamp) {
        (Some(price), Some(quantity), Some(timestamp_ms)) => {
            let tick = tick_from_trade_wire(
                price,
                quantity,
                timestamp_ms,
                frame.is_buyer_maker.unwrap_or(false),
            )?;
            Ok(ChannelEvent::Trade(tick))
        }
        _ => Err(MarketError::Parse(
            "trade frame without price/quantity/timestamp".to_string(),
        )),
    }
}

fn order_update_event(frame: FrameWire) -> Result<ChannelEvent, MarketError> {
    if frame.kind.as_deref() != Some("userdata") {
        return Err(MarketError::Parse(format!(
            "unexpected user data frame type {:?}",
            frame.kind
        )));
    }
    let data = frame
        .data
        .ok_or_else(|| MarketError::Parse("userdata frame without data".to_string()))?;
    Ok(ChannelEvent::OrderUpdate(data.into()))
}

/// Delivers `event` to every subscriber in order. A panicking callback is
/// logged and skipped; the rest still receive the event.
pub fn dispatch(key: &str, subscribers: &[Subscriber], event: &ChannelEvent) -> usize {
    let mut delivered = 0;
    for subscriber in subscribers {
        let callback = &subscriber.callback;
        match catch_unwind(AssertUnwindSafe(|| callback(event))) {
            Ok(()) => delivered += 1,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|message| (*message).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                tracing::error!(
                    key,
                    subscriber = subscriber.id,
                    %reason,
                    "subscriber callback panicked"
                );
            }
        }
    }
    delivered
}
