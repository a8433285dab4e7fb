//! AMQP 0-9-1 传输实现（基于 lapin）
//!
//! 仅做协议映射：声明、绑定、发布、消费、确认，以及 lapin 错误到 `BrokerError` 的归类。
//! 路由匹配与消息持久化完全由 broker 负责。
//!
use super::{
    Acker, Channel, ConnectionLostCallback, Delivery, DeliveryStream, MessageProperties,
    OutboundMessage, QueueOptions, Transport, TransportConnection,
};
use crate::config::{BrokerConfig, ExchangeKind};
use crate::error::{BrokerError, BrokerResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, ConnectionProperties};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const REPLY_SUCCESS: u16 = 200;

/// 基于 lapin 的传输
#[derive(Clone, Debug, Default)]
pub struct AmqpTransport;

impl AmqpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(&self, config: &BrokerConfig) -> BrokerResult<Arc<dyn TransportConnection>> {
        let mut properties = ConnectionProperties::default();
        if let Some(name) = &config.connection_name {
            properties = properties.with_connection_name(name.clone().into());
        }

        let connection = lapin::Connection::connect(&config.amqp_uri(), properties)
            .await
            .map_err(map_error)?;

        Ok(Arc::new(AmqpConnection { inner: connection }))
    }
}

struct AmqpConnection {
    inner: lapin::Connection,
}

#[async_trait]
impl TransportConnection for AmqpConnection {
    async fn open_channel(&self) -> BrokerResult<Box<dyn Channel>> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel {
                reason: e.to_string(),
            })?;

        Ok(Box::new(AmqpChannel {
            inner: channel,
            confirms: AtomicBool::new(false),
        }))
    }

    fn is_connected(&self) -> bool {
        self.inner.status().connected()
    }

    fn on_lost(&self, callback: ConnectionLostCallback) {
        self.inner.on_error(move |err| callback(err.to_string()));
    }

    async fn close(&self) -> BrokerResult<()> {
        if !self.is_connected() {
            return Ok(());
        }
        self.inner
            .close(REPLY_SUCCESS, "client shutdown")
            .await
            .map_err(map_error)
    }
}

struct AmqpChannel {
    inner: lapin::Channel,
    /// 是否已开启 publisher confirms（首次发布时开启）
    confirms: AtomicBool,
}

impl AmqpChannel {
    fn conflict(entity: &'static str, name: &str, err: lapin::Error) -> BrokerError {
        match map_error(err) {
            BrokerError::TopologyConflict { reason, .. } => BrokerError::TopologyConflict {
                entity,
                name: name.to_string(),
                reason,
            },
            other => other,
        }
    }

    async fn ensure_confirms(&self) -> BrokerResult<()> {
        if self.confirms.load(Ordering::Acquire) {
            return Ok(());
        }
        self.inner
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(map_error)?;
        self.confirms.store(true, Ordering::Release);
        Ok(())
    }
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> BrokerResult<()> {
        self.inner
            .exchange_declare(
                name,
                exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Self::conflict("exchange", name, e))
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> BrokerResult<()> {
        let mut arguments = FieldTable::default();
        if let Some(dlx) = &options.dead_letter_exchange {
            arguments.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(dlx.clone().into()),
            );
        }

        self.inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    ..QueueDeclareOptions::default()
                },
                arguments,
            )
            .await
            .map(|_| ())
            .map_err(|e| Self::conflict("queue", name, e))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> BrokerResult<()> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_error)
    }

    async fn set_prefetch(&self, count: u16) -> BrokerResult<()> {
        self.inner
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(map_error)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> BrokerResult<()> {
        self.ensure_confirms().await?;

        let publish_err = |reason: String| BrokerError::Publish {
            routing_key: routing_key.to_string(),
            reason,
        };

        let confirm = self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.payload,
                to_basic_properties(&message.properties),
            )
            .await
            .map_err(|e| match map_error(e) {
                BrokerError::ChannelInvalidated { reason } => BrokerError::ChannelInvalidated { reason },
                other => publish_err(other.to_string()),
            })?;

        match confirm.await.map_err(|e| publish_err(e.to_string()))? {
            Confirmation::Nack(_) => Err(publish_err("broker nacked the message".into())),
            Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> BrokerResult<DeliveryStream> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_error)?;

        Ok(consumer
            .map(|item| item.map(into_delivery).map_err(map_error))
            .boxed())
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn close(&self) -> BrokerResult<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.inner
            .close(REPLY_SUCCESS, "channel closed")
            .await
            .map_err(map_error)
    }
}

struct AmqpAcker {
    delivery: lapin::message::Delivery,
}

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> BrokerResult<()> {
        self.delivery
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(map_error)
    }

    async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        self.delivery
            .acker
            .nack(BasicNackOptions {
                requeue,
                multiple: false,
            })
            .await
            .map_err(map_error)
    }
}

fn into_delivery(mut delivery: lapin::message::Delivery) -> Delivery {
    let payload = std::mem::take(&mut delivery.data);
    let properties = from_basic_properties(&delivery.properties);
    let exchange = delivery.exchange.to_string();
    let routing_key = delivery.routing_key.to_string();

    Delivery::new(
        delivery.delivery_tag,
        delivery.redelivered,
        exchange,
        routing_key,
        payload,
        properties,
        Box::new(AmqpAcker { delivery }),
    )
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

fn to_basic_properties(props: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if props.persistent {
        basic = basic.with_delivery_mode(2);
    }
    if let Some(content_type) = &props.content_type {
        basic = basic.with_content_type(content_type.as_str().into());
    }
    if let Some(id) = &props.message_id {
        basic = basic.with_message_id(id.as_str().into());
    }
    if let Some(kind) = &props.kind {
        basic = basic.with_type(kind.as_str().into());
    }
    if let Some(ts) = props.timestamp {
        // AMQP 时间戳精度为秒
        basic = basic.with_timestamp(ts.timestamp().max(0) as u64);
    }
    basic
}

fn from_basic_properties(basic: &BasicProperties) -> MessageProperties {
    MessageProperties {
        content_type: basic.content_type().as_ref().map(|s| s.to_string()),
        message_id: basic.message_id().as_ref().map(|s| s.to_string()),
        kind: basic.kind().as_ref().map(|s| s.to_string()),
        timestamp: (*basic.timestamp())
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
        persistent: *basic.delivery_mode() == Some(2),
    }
}

/// lapin 错误归类
fn map_error(err: lapin::Error) -> BrokerError {
    match &err {
        lapin::Error::ProtocolError(amqp)
            if matches!(
                amqp.kind(),
                AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
            ) =>
        {
            BrokerError::TopologyConflict {
                entity: "entity",
                name: String::new(),
                reason: amqp.to_string(),
            }
        }
        lapin::Error::InvalidChannelState(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::IOError(_) => BrokerError::channel_invalidated(err.to_string()),
        _ => BrokerError::transport(err.to_string()),
    }
}
