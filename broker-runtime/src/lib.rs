//! 消息中间件客户端运行时（broker-runtime）
//!
//! 将进程接入 topic 路由的消息中间件（AMQP 0-9-1），提供：
//! - 连接管理（`connection`）：指数退避建连、通道创建、断线自动恢复；
//! - 拓扑声明（`topology`）：幂等声明交换机、队列与绑定；
//! - 事件发布（`publisher`）：持久化 JSON 事件，按固定映射表的路由键发布；
//! - 订阅运行时（`subscription`）：声明 → 消费 → 分发处理 → ack / requeue；
//! - 传输层（`transport`）：lapin AMQP 实现与进程内 broker。
//!
//! 投递语义为至少一次，处理器需自行保证幂等。
//!
//! 典型用法：
//! 1. 以 `BrokerConfig` 创建 `ConnectionManager` 并 `connect()`；
//! 2. 构造 `EventPublisher` 发布 `OrderEvent`；
//! 3. 为每个队列构造 `SubscriptionRuntime` 并 `start()`，关闭时 `shutdown()` + `join()`。
//!
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod publisher;
pub mod subscription;
pub mod topology;
pub mod transport;

pub use config::{BrokerConfig, ExchangeKind, RetryPolicy};
pub use connection::{ConnectionHealth, ConnectionManager, ConnectionStatus};
pub use error::{BrokerError, BrokerResult};
pub use event::{EventType, OrderEvent};
pub use publisher::{EventPublisher, PublishAck, PublishEvent};
pub use subscription::{
    DeliveryInfo, EventHandler, RedeliveryPolicy, SubscriptionConfig, SubscriptionHandle,
    SubscriptionRuntime, SubscriptionState, SubscriptionStats, handler_fn,
};
pub use topology::{Binding, RoutingPattern, TopologyDeclarer};
pub use transport::memory::InMemoryBroker;
