//! 事件发布（EventPublisher）
//!
//! 序列化事件、附加投递元数据（持久化、`application/json`、时间戳、消息 ID），
//! 以路由键发布到配置的交换机。
//!
//! 失败策略：
//! - 序列化失败直接返回，不重试；
//! - 取通道或发送时的可恢复错误：通过 ConnectionManager 重新打开一次通道并重试一次，
//!   仍失败则以 `Publish` 上抛；
//! - 可选的整体超时（`with_timeout`）。
//!
use crate::connection::ConnectionManager;
use crate::error::{BrokerError, BrokerResult};
use crate::event::{CONTENT_TYPE, OrderEvent};
use crate::topology::TopologyDeclarer;
use crate::transport::{Channel, MessageProperties, OutboundMessage};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// 面向请求层的发布能力
#[async_trait]
pub trait PublishEvent: Send + Sync {
    async fn publish_event(&self, event: &OrderEvent, routing_key: &str) -> BrokerResult<PublishAck>;
}

/// 发布成功的回执
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PublishAck {
    pub event_id: Uuid,
    pub exchange: String,
    pub routing_key: String,
    /// 实际发送次数（1 或 2）
    pub attempts: u32,
}

const DEFAULT_MAX_IDLE_CHANNELS: usize = 4;

pub struct EventPublisher {
    connection: Arc<ConnectionManager>,
    topology: TopologyDeclarer,
    exchange: String,
    /// 空闲通道；取出后由单个发布操作独占
    idle: Mutex<Vec<Box<dyn Channel>>>,
    max_idle: usize,
    timeout: Option<Duration>,
}

impl EventPublisher {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        let exchange = connection.exchange().to_string();
        let topology = TopologyDeclarer::new(connection.config().exchange_kind);

        Self {
            connection,
            topology,
            exchange,
            idle: Mutex::new(Vec::new()),
            max_idle: DEFAULT_MAX_IDLE_CHANNELS,
            timeout: None,
        }
    }

    /// 为整个发布过程（含一次重试）设置超时
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// 空闲通道上限，0 表示每次发布使用新通道
    pub fn with_max_idle_channels(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub async fn publish(&self, event: &OrderEvent, routing_key: &str) -> BrokerResult<PublishAck> {
        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.publish_once(event, routing_key))
                .await
                .map_err(|_| BrokerError::PublishTimeout {
                    routing_key: routing_key.to_string(),
                    timeout_ms: timeout.as_millis(),
                })?,
            None => self.publish_once(event, routing_key).await,
        }
    }

    /// 使用事件自身的类型查表得到路由键
    pub async fn publish_known(&self, event: &OrderEvent) -> BrokerResult<PublishAck> {
        let event_type = event
            .known_type()
            .ok_or_else(|| BrokerError::UnknownEventType(event.event_type().to_string()))?;
        self.publish(event, event_type.routing_key()).await
    }

    async fn publish_once(&self, event: &OrderEvent, routing_key: &str) -> BrokerResult<PublishAck> {
        let message = OutboundMessage {
            payload: event.encode()?,
            properties: MessageProperties {
                content_type: Some(CONTENT_TYPE.to_string()),
                message_id: Some(event.event_id().to_string()),
                kind: Some(event.event_type().to_string()),
                timestamp: Some(event.timestamp()),
                persistent: true,
            },
        };
        let ack = |attempts| PublishAck {
            event_id: event.event_id(),
            exchange: self.exchange.clone(),
            routing_key: routing_key.to_string(),
            attempts,
        };

        let first = match self.acquire().await {
            Ok(channel) => match channel
                .publish(&self.exchange, routing_key, message.clone())
                .await
            {
                Ok(()) => {
                    self.release(channel);
                    debug!(event_id = %event.event_id(), routing_key, "event published");
                    return Ok(ack(1));
                }
                Err(e) => e,
            },
            Err(e) => e,
        };
        if !first.is_transient() {
            return Err(first);
        }

        warn!(
            event_id = %event.event_id(),
            routing_key,
            error = %first,
            "publish failed, retrying once on a fresh channel"
        );
        let retry = async {
            let channel = self.open_fresh().await?;
            channel.publish(&self.exchange, routing_key, message).await?;
            Ok::<_, BrokerError>(channel)
        };
        match retry.await {
            Ok(channel) => {
                self.release(channel);
                debug!(event_id = %event.event_id(), routing_key, "event published on retry");
                Ok(ack(2))
            }
            Err(e) => Err(BrokerError::Publish {
                routing_key: routing_key.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn acquire(&self) -> BrokerResult<Box<dyn Channel>> {
        loop {
            let idle = self.idle.lock().unwrap_or_else(|e| e.into_inner()).pop();
            match idle {
                Some(channel) if channel.is_open() => return Ok(channel),
                Some(_) => continue,
                None => return self.open_fresh().await,
            }
        }
    }

    /// 新通道上先声明交换机，重连后的拓扑因此总是完整的
    async fn open_fresh(&self) -> BrokerResult<Box<dyn Channel>> {
        let channel = self.connection.open_channel().await?;
        self.topology
            .declare_exchange(channel.as_ref(), &self.exchange)
            .await?;
        Ok(channel)
    }

    fn release(&self, channel: Box<dyn Channel>) {
        if !channel.is_open() {
            return;
        }
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        if idle.len() < self.max_idle {
            idle.push(channel);
        }
    }
}

#[async_trait]
impl PublishEvent for EventPublisher {
    async fn publish_event(&self, event: &OrderEvent, routing_key: &str) -> BrokerResult<PublishAck> {
        self.publish(event, routing_key).await
    }
}
