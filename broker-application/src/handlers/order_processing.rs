use super::SeenEvents;
use async_trait::async_trait;
use broker_runtime::subscription::{DeliveryInfo, EventHandler};
use broker_runtime::{EventType, OrderEvent};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::info;

/// 新订单进入处理流程
#[derive(Debug, Default)]
pub struct OrderProcessingHandler {
    seen: SeenEvents,
    accepted: DashMap<String, DateTime<Utc>>,
}

impl OrderProcessingHandler {
    pub fn is_accepted(&self, order_id: &str) -> bool {
        self.accepted.contains_key(order_id)
    }

    pub fn accepted_count(&self) -> usize {
        self.accepted.len()
    }
}

#[async_trait]
impl EventHandler for OrderProcessingHandler {
    fn handler_name(&self) -> &str {
        "order_processing"
    }

    async fn handle(&self, event: &OrderEvent, delivery: &DeliveryInfo) -> anyhow::Result<()> {
        anyhow::ensure!(
            event.known_type() == Some(EventType::OrderCreated),
            "unexpected event type {} on {}",
            event.event_type(),
            delivery.queue
        );
        anyhow::ensure!(
            event.payload().is_some_and(|p| !p.is_null()),
            "order {} created without payload",
            event.order_id()
        );

        if !self.seen.first_time(event.event_id()) {
            info!(order_id = event.order_id(), event_id = %event.event_id(), "duplicate order.created skipped");
            return Ok(());
        }

        self.accepted
            .insert(event.order_id().to_string(), event.timestamp());
        info!(order_id = event.order_id(), "order accepted for processing");
        Ok(())
    }
}
