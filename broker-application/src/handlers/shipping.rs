use super::SeenEvents;
use async_trait::async_trait;
use broker_runtime::subscription::{DeliveryInfo, EventHandler};
use broker_runtime::OrderEvent;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::info;

/// 发货登记（`order.shipped`）
#[derive(Debug, Default)]
pub struct ShippingHandler {
    seen: SeenEvents,
    shipments: DashMap<String, DateTime<Utc>>,
}

impl ShippingHandler {
    pub fn shipped_at(&self, order_id: &str) -> Option<DateTime<Utc>> {
        self.shipments.get(order_id).map(|t| *t)
    }

    pub fn shipment_count(&self) -> usize {
        self.shipments.len()
    }
}

#[async_trait]
impl EventHandler for ShippingHandler {
    fn handler_name(&self) -> &str {
        "shipping"
    }

    async fn handle(&self, event: &OrderEvent, delivery: &DeliveryInfo) -> anyhow::Result<()> {
        if !self.seen.first_time(event.event_id()) {
            info!(order_id = event.order_id(), delivery_tag = delivery.delivery_tag, "duplicate shipment skipped");
            return Ok(());
        }
        self.shipments
            .insert(event.order_id().to_string(), event.timestamp());
        info!(order_id = event.order_id(), "shipment registered");
        Ok(())
    }
}
