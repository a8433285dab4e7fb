//! 传输层协议（transport）
//!
//! 将 broker 的标准操作（连接、通道、声明、绑定、发布、消费、确认）抽象为
//! `Transport` / `TransportConnection` / `Channel` 三层 trait，运行时仅依赖这些协议：
//! - `amqp`：基于 lapin 的 AMQP 0-9-1 实现（生产）；
//! - `memory`：进程内 broker（测试、示例与本地开发）。
//!
//! 路由匹配与消息存储属于 broker 本身，运行时不做任何假设。
//!
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

use crate::config::{BrokerConfig, ExchangeKind};
use crate::error::BrokerResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::stream::BoxStream;
use std::fmt;
use std::sync::Arc;

/// 连接丢失回调，参数为丢失原因
pub type ConnectionLostCallback = Box<dyn Fn(String) + Send + Sync>;

/// 消费者收到的投递流；流结束表示通道已失效
pub type DeliveryStream = BoxStream<'static, BrokerResult<Delivery>>;

/// 传输层入口：负责建立连接
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, config: &BrokerConfig) -> BrokerResult<Arc<dyn TransportConnection>>;
}

/// 单条物理连接
#[async_trait]
pub trait TransportConnection: Send + Sync {
    /// 在当前连接上打开新通道
    async fn open_channel(&self) -> BrokerResult<Box<dyn Channel>>;

    fn is_connected(&self) -> bool;

    /// 注册连接丢失通知（仅在非主动关闭时触发）
    fn on_lost(&self, callback: ConnectionLostCallback);

    async fn close(&self) -> BrokerResult<()>;
}

/// 队列声明选项
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    /// 被拒绝（不重回队列）的消息转投的交换机，对应 `x-dead-letter-exchange`
    pub dead_letter_exchange: Option<String>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            dead_letter_exchange: None,
        }
    }
}

/// 消息属性
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub kind: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    /// 持久化投递（delivery_mode = 2）
    pub persistent: bool,
}

/// 待发布的消息
#[derive(Clone, Debug)]
pub struct OutboundMessage {
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
}

/// 多路复用的会话通道，同一时刻只归属一个操作
#[async_trait]
pub trait Channel: Send + Sync {
    /// 声明交换机；同名不同类型时返回 `TopologyConflict`
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool)
    -> BrokerResult<()>;

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> BrokerResult<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> BrokerResult<()>;

    /// 设置未确认投递上限
    async fn set_prefetch(&self, count: u16) -> BrokerResult<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> BrokerResult<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> BrokerResult<DeliveryStream>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> BrokerResult<()>;
}

/// 单条投递的确认句柄
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> BrokerResult<()>;

    /// 否定确认；`requeue = false` 时消息按队列的死信配置处理
    async fn nack(&self, requeue: bool) -> BrokerResult<()>;
}

/// 消费端收到的一条消息
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        redelivered: bool,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: Vec<u8>,
        properties: MessageProperties,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            delivery_tag,
            redelivered,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            payload,
            properties,
            acker,
        }
    }

    pub async fn ack(&self) -> BrokerResult<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("payload_len", &self.payload.len())
            .field("properties", &self.properties)
            .finish()
    }
}
