use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::BrokerError;

/// 订单领域事件类型
///
/// 路由键来自固定映射表而非运行期字符串变换，
/// 重命名枚举成员不会改变线上的路由键。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    OrderCreated,
    PaymentVerified,
    OrderShipped,
    OrderDelivered,
    OrderCancelled,
}

impl EventType {
    pub const ALL: [EventType; 5] = [
        EventType::OrderCreated,
        EventType::PaymentVerified,
        EventType::OrderShipped,
        EventType::OrderDelivered,
        EventType::OrderCancelled,
    ];

    /// 发布时使用的路由键（同时作为信封中的事件类型标签）
    pub const fn routing_key(&self) -> &'static str {
        match self {
            EventType::OrderCreated => "order.created",
            EventType::PaymentVerified => "payment.verified",
            EventType::OrderShipped => "order.shipped",
            EventType::OrderDelivered => "order.delivered",
            EventType::OrderCancelled => "order.cancelled",
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            EventType::OrderCreated => "OrderCreated",
            EventType::PaymentVerified => "PaymentVerified",
            EventType::OrderShipped => "OrderShipped",
            EventType::OrderDelivered => "OrderDelivered",
            EventType::OrderCancelled => "OrderCancelled",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.routing_key())
    }
}

/// 同时接受路由键（`order.created`）与类型名（`OrderCreated`）
impl FromStr for EventType {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.routing_key() == s || t.name() == s)
            .ok_or_else(|| BrokerError::UnknownEventType(s.to_string()))
    }
}
