//! 订阅（subscription）
//!
//! - `handler`：业务处理器能力与闭包适配；
//! - `redelivery`：失败重投递策略与死信上限；
//! - `runtime`：单队列消费运行时及其句柄。
//!
mod handler;
mod redelivery;
mod runtime;

pub use handler::{DeliveryInfo, EventHandler, handler_fn};
pub use redelivery::RedeliveryPolicy;
pub use runtime::{
    SubscriptionConfig, SubscriptionHandle, SubscriptionRuntime, SubscriptionState,
    SubscriptionStats,
};
