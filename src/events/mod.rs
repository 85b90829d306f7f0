use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Events emitted by the order lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    OrderCreated(Uuid),
    OrderPaid(Uuid),
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },
    OrderCancelled(Uuid),
    OrderShipped {
        order_id: Uuid,
        tracking_number: String,
    },
    OrderRefunded {
        order_id: Uuid,
        amount: Decimal,
        partial: bool,
    },
    CouponRedeemed {
        coupon_id: Uuid,
        order_id: Uuid,
    },
    StockDepleted {
        variant_id: Uuid,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event; lifecycle events are advisory, so a full or closed
    /// channel is logged and swallowed.
    pub async fn send(&self, event: Event) {
        if let Err(e) = self.sender.send(event).await {
            warn!("Failed to publish event: {}", e);
        }
    }
}

/// Creates a connected sender/receiver pair.
pub fn channel(capacity: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender::new(tx), rx)
}

/// Drains the event channel, logging each event. Spawned as a background
/// task by the binary.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    while let Some(event) = rx.recv().await {
        info!(?event, "Event processed");
    }
    info!("Event channel closed; processor exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_after_receiver_drop_does_not_panic() {
        let (tx, rx) = channel(4);
        drop(rx);
        tx.send(Event::OrderCreated(Uuid::new_v4())).await;
    }
}
