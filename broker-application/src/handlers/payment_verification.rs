use super::SeenEvents;
use async_trait::async_trait;
use broker_runtime::subscription::{DeliveryInfo, EventHandler};
use broker_runtime::OrderEvent;
use dashmap::DashMap;
use serde::Deserialize;
use tracing::info;

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifiedPayment {
    pub amount: f64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub transaction_id: Option<String>,
}

/// 支付核验（`payment.*`）
#[derive(Debug, Default)]
pub struct PaymentVerificationHandler {
    seen: SeenEvents,
    verified: DashMap<String, VerifiedPayment>,
}

impl PaymentVerificationHandler {
    pub fn verified(&self, order_id: &str) -> Option<VerifiedPayment> {
        self.verified.get(order_id).map(|p| p.clone())
    }
}

#[async_trait]
impl EventHandler for PaymentVerificationHandler {
    fn handler_name(&self) -> &str {
        "payment_verification"
    }

    async fn handle(&self, event: &OrderEvent, _delivery: &DeliveryInfo) -> anyhow::Result<()> {
        let payment: VerifiedPayment = event
            .payload_as()?
            .ok_or_else(|| anyhow::anyhow!("payment event for {} has no payload", event.order_id()))?;
        anyhow::ensure!(
            payment.amount.is_finite() && payment.amount > 0.0,
            "invalid payment amount {} for order {}",
            payment.amount,
            event.order_id()
        );

        if !self.seen.first_time(event.event_id()) {
            return Ok(());
        }
        info!(order_id = event.order_id(), amount = payment.amount, "payment verified");
        self.verified.insert(event.order_id().to_string(), payment);
        Ok(())
    }
}
