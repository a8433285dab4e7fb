use super::SeenEvents;
use async_trait::async_trait;
use broker_runtime::subscription::{DeliveryInfo, EventHandler};
use broker_runtime::{EventType, OrderEvent};
use chrono::{DateTime, Utc};
use std::sync::Mutex;
use tracing::info;

/// 发给客户的通知
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub order_id: String,
    pub event_type: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

/// 订单生命周期通知（`order.*`）
#[derive(Debug, Default)]
pub struct NotificationHandler {
    seen: SeenEvents,
    sent: Mutex<Vec<Notification>>,
}

impl NotificationHandler {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn render(event: &OrderEvent) -> String {
        if !event.message().is_empty() {
            return event.message().to_string();
        }
        let id = event.order_id();
        match event.known_type() {
            Some(EventType::OrderCreated) => format!("Your order {id} has been received."),
            Some(EventType::OrderShipped) => format!("Your order {id} is on its way."),
            Some(EventType::OrderDelivered) => format!("Your order {id} has been delivered."),
            Some(EventType::OrderCancelled) => format!("Your order {id} has been cancelled."),
            _ => format!("Your order {id} was updated ({}).", event.event_type()),
        }
    }
}

#[async_trait]
impl EventHandler for NotificationHandler {
    fn handler_name(&self) -> &str {
        "notification"
    }

    async fn handle(&self, event: &OrderEvent, _delivery: &DeliveryInfo) -> anyhow::Result<()> {
        if !self.seen.first_time(event.event_id()) {
            return Ok(());
        }

        let notification = Notification {
            order_id: event.order_id().to_string(),
            event_type: event.event_type().to_string(),
            text: Self::render(event),
            sent_at: Utc::now(),
        };
        info!(order_id = event.order_id(), event_type = event.event_type(), "notification sent");
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notification);
        Ok(())
    }
}
