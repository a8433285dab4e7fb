//! 订单领域的订阅者
//!
//! | 队列 | 绑定模式 |
//! |---|---|
//! | order_processing_queue | `order.created` |
//! | notification_queue | `order.*` |
//! | payment_verification_queue | `payment.*` |
//! | shipping_queue | `order.shipped` |
//!
//! 投递语义为至少一次，各处理器以事件 ID 去重（仅保留最近 `DEFAULT_SEEN_CAPACITY` 个）。
//!
mod notification;
mod order_processing;
mod payment_verification;
mod shipping;

pub use notification::{Notification, NotificationHandler};
pub use order_processing::OrderProcessingHandler;
pub use payment_verification::{PaymentVerificationHandler, VerifiedPayment};
pub use shipping::ShippingHandler;

use crate::error::AppResult;
use crate::registry::SubscriberRegistry;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const ORDER_PROCESSING_QUEUE: &str = "order_processing_queue";
pub const NOTIFICATION_QUEUE: &str = "notification_queue";
pub const PAYMENT_VERIFICATION_QUEUE: &str = "payment_verification_queue";
pub const SHIPPING_QUEUE: &str = "shipping_queue";

/// 每个处理器记住的事件 ID 上限
pub const DEFAULT_SEEN_CAPACITY: usize = 10_000;

/// 已处理事件集合，超过容量时淘汰最早的记录
#[derive(Debug)]
pub(crate) struct SeenEvents {
    inner: DashMap<Uuid, ()>,
    order: Mutex<VecDeque<Uuid>>,
    capacity: usize,
}

impl Default for SeenEvents {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_SEEN_CAPACITY)
    }
}

impl SeenEvents {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// 首次出现时返回 `true`
    pub(crate) fn first_time(&self, event_id: Uuid) -> bool {
        if self.inner.insert(event_id, ()).is_some() {
            return false;
        }

        let mut order = self.order.lock().unwrap_or_else(|e| e.into_inner());
        order.push_back(event_id);
        while order.len() > self.capacity {
            if let Some(oldest) = order.pop_front() {
                self.inner.remove(&oldest);
            }
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }
}

/// 订单系统的全部处理器
#[derive(Clone, Default)]
pub struct OrderHandlers {
    pub order_processing: Arc<OrderProcessingHandler>,
    pub notification: Arc<NotificationHandler>,
    pub payment_verification: Arc<PaymentVerificationHandler>,
    pub shipping: Arc<ShippingHandler>,
}

impl OrderHandlers {
    /// 按路由表注册四个订阅者
    pub fn register(&self, registry: &SubscriberRegistry) -> AppResult<()> {
        registry.register_handler(
            ORDER_PROCESSING_QUEUE,
            "order.created",
            self.order_processing.clone(),
        )?;
        registry.register_handler(NOTIFICATION_QUEUE, "order.*", self.notification.clone())?;
        registry.register_handler(
            PAYMENT_VERIFICATION_QUEUE,
            "payment.*",
            self.payment_verification.clone(),
        )?;
        registry.register_handler(SHIPPING_QUEUE, "order.shipped", self.shipping.clone())?;
        Ok(())
    }
}
