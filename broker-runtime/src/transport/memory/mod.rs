//! 内存版 broker（InMemoryBroker）
//!
//! 在进程内实现 `Transport` 协议，覆盖运行时依赖的 broker 行为：
//! - 交换机/队列/绑定声明（幂等，类型冲突报错）；
//! - topic/direct/fanout 路由，持久化队列；
//! - 每通道 prefetch、ack / nack(requeue) / 死信交换机；
//! - 断开连接：通道失效、未确认消息标记 redelivered 后回到队首。
//!
//! 典型用途：测试环境、示例与本地开发；并提供 `set_available` / `sever_connections`
//! 等故障注入手段。
//!
mod routing;

pub use routing::topic_matches;

use super::{
    Acker, Channel, ConnectionLostCallback, Delivery, DeliveryStream, MessageProperties,
    OutboundMessage, QueueOptions, Transport, TransportConnection,
};
use crate::config::{BrokerConfig, ExchangeKind};
use crate::error::{BrokerError, BrokerResult};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

type Shared = Arc<Mutex<BrokerState>>;

fn lock(state: &Shared) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Clone, Debug)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    payload: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

struct Unacked {
    message: StoredMessage,
    channel_id: u64,
}

struct Consumer {
    channel_id: u64,
    tx: mpsc::UnboundedSender<BrokerResult<Delivery>>,
}

struct QueueEntry {
    options: QueueOptions,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, Unacked>,
    consumers: Vec<Consumer>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct BindingEntry {
    exchange: String,
    queue: String,
    pattern: String,
}

struct ConnectionEntry {
    callbacks: Vec<ConnectionLostCallback>,
}

struct ChannelEntry {
    connection_id: u64,
    prefetch: u16,
}

#[derive(Default)]
struct BrokerState {
    available: bool,
    connect_attempts: u64,
    published: u64,
    next_id: u64,
    next_delivery_tag: u64,
    connections: HashMap<u64, ConnectionEntry>,
    channels: HashMap<u64, ChannelEntry>,
    exchanges: HashMap<String, (ExchangeKind, bool)>,
    queues: HashMap<String, QueueEntry>,
    bindings: Vec<BindingEntry>,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_open(&self, channel_id: u64) -> bool {
        self.channels.contains_key(&channel_id)
    }

    fn ensure_open(&self, channel_id: u64) -> BrokerResult<()> {
        if self.channel_open(channel_id) {
            Ok(())
        } else {
            Err(BrokerError::channel_invalidated(format!(
                "channel {channel_id} is closed"
            )))
        }
    }

    /// 将消息路由到所有匹配的队列（同一队列只投一份），返回命中的队列数
    fn route(&mut self, exchange: &str, routing_key: &str, message: StoredMessage) -> usize {
        let Some((kind, _)) = self.exchanges.get(exchange).copied() else {
            return 0;
        };

        let mut targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && routing::routes(kind, &b.pattern, routing_key))
            .map(|b| b.queue.clone())
            .collect();
        targets.sort();
        targets.dedup();

        for queue in &targets {
            if let Some(q) = self.queues.get_mut(queue) {
                q.ready.push_back(message.clone());
            }
        }
        targets.len()
    }

    fn in_flight(&self, channel_id: u64) -> usize {
        self.queues
            .values()
            .map(|q| q.unacked.values().filter(|u| u.channel_id == channel_id).count())
            .sum()
    }

    /// 将就绪消息按 prefetch 推送给队列上的消费者
    fn dispatch(&mut self, shared: &Shared, queue_name: &str) {
        loop {
            let mut progressed = false;
            let consumer_count = self
                .queues
                .get(queue_name)
                .map_or(0, |q| q.consumers.len());

            for idx in 0..consumer_count {
                let Some(queue) = self.queues.get(queue_name) else {
                    return;
                };
                if queue.ready.is_empty() {
                    return;
                }
                let Some(channel_id) = queue.consumers.get(idx).map(|c| c.channel_id) else {
                    break;
                };
                let prefetch = self.channels.get(&channel_id).map_or(0, |c| c.prefetch);
                if prefetch > 0 && self.in_flight(channel_id) >= prefetch as usize {
                    continue;
                }

                self.next_delivery_tag += 1;
                let tag = self.next_delivery_tag;
                let Some(queue) = self.queues.get_mut(queue_name) else {
                    return;
                };
                let Some(message) = queue.ready.pop_front() else {
                    return;
                };

                let delivery = Delivery::new(
                    tag,
                    message.redelivered,
                    message.exchange.clone(),
                    message.routing_key.clone(),
                    message.payload.clone(),
                    message.properties.clone(),
                    Box::new(MemoryAcker {
                        state: shared.clone(),
                        queue: queue_name.to_string(),
                        tag,
                        channel_id,
                    }),
                );

                if queue.consumers[idx].tx.send(Ok(delivery)).is_ok() {
                    queue.unacked.insert(tag, Unacked { message, channel_id });
                    progressed = true;
                } else {
                    // 消费端已丢弃接收流
                    queue.ready.push_front(message);
                    queue.consumers.remove(idx);
                    progressed = true;
                    break;
                }
            }

            if !progressed {
                return;
            }
        }
    }

    fn dispatch_all(&mut self, shared: &Shared) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.dispatch(shared, &name);
        }
    }

    /// 关闭通道：移除其消费者，未确认消息以 redelivered 标记回到队首
    fn close_channel(&mut self, channel_id: u64) {
        if self.channels.remove(&channel_id).is_none() {
            return;
        }

        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel_id != channel_id);

            let mut returned: Vec<(u64, StoredMessage)> = queue
                .unacked
                .iter()
                .filter(|(_, u)| u.channel_id == channel_id)
                .map(|(tag, u)| (*tag, u.message.clone()))
                .collect();
            returned.sort_by_key(|(tag, _)| *tag);

            for (tag, mut message) in returned.into_iter().rev() {
                queue.unacked.remove(&tag);
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }
    }

    fn close_connection(&mut self, connection_id: u64) -> Option<ConnectionEntry> {
        let entry = self.connections.remove(&connection_id)?;
        let channel_ids: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection_id == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for id in channel_ids {
            self.close_channel(id);
        }
        Some(entry)
    }
}

/// 内存 broker，可克隆共享
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Shared,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                available: true,
                ..Default::default()
            })),
        }
    }

    /// 模拟 broker 可达/不可达；不可达时新的连接尝试全部失败
    pub fn set_available(&self, available: bool) {
        lock(&self.state).available = available;
    }

    /// 模拟网络中断：断开全部连接并触发连接丢失通知
    pub fn sever_connections(&self, reason: &str) {
        let lost: Vec<ConnectionEntry> = {
            let mut state = lock(&self.state);
            let ids: Vec<u64> = state.connections.keys().copied().collect();
            let lost = ids
                .into_iter()
                .filter_map(|id| state.close_connection(id))
                .collect();
            state.dispatch_all(&self.state);
            lost
        };

        for entry in lost {
            for callback in &entry.callbacks {
                callback(reason.to_string());
            }
        }
    }

    pub fn connect_attempts(&self) -> u64 {
        lock(&self.state).connect_attempts
    }

    pub fn open_connections(&self) -> usize {
        lock(&self.state).connections.len()
    }

    pub fn published_count(&self) -> u64 {
        lock(&self.state).published
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        lock(&self.state).exchanges.get(name).map(|(kind, _)| *kind)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        lock(&self.state).queues.contains_key(name)
    }

    /// 队列上的绑定模式
    pub fn bindings_for(&self, queue: &str) -> Vec<String> {
        lock(&self.state)
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .map(|b| b.pattern.clone())
            .collect()
    }

    pub fn binding_count(&self) -> usize {
        lock(&self.state).bindings.len()
    }

    /// 就绪（未投递）消息数
    pub fn ready_count(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// 已投递未确认消息数
    pub fn unacked_count(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    /// 取出队列中全部就绪消息的载荷（不经过消费者）
    pub fn drain(&self, queue: &str) -> Vec<Vec<u8>> {
        lock(&self.state)
            .queues
            .get_mut(queue)
            .map(|q| q.ready.drain(..).map(|m| m.payload).collect())
            .unwrap_or_default()
    }

    /// 队列中就绪消息的属性快照
    pub fn ready_properties(&self, queue: &str) -> Vec<MessageProperties> {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.properties.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn connect(&self, _config: &BrokerConfig) -> BrokerResult<Arc<dyn TransportConnection>> {
        let mut state = lock(&self.state);
        state.connect_attempts += 1;
        if !state.available {
            return Err(BrokerError::transport("connection refused"));
        }

        let id = state.next_id();
        state.connections.insert(
            id,
            ConnectionEntry {
                callbacks: Vec::new(),
            },
        );

        Ok(Arc::new(MemoryConnection {
            state: self.state.clone(),
            id,
        }))
    }
}

struct MemoryConnection {
    state: Shared,
    id: u64,
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    async fn open_channel(&self) -> BrokerResult<Box<dyn Channel>> {
        let mut state = lock(&self.state);
        if !state.connections.contains_key(&self.id) {
            return Err(BrokerError::Channel {
                reason: "connection is closed".into(),
            });
        }
        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelEntry {
                connection_id: self.id,
                prefetch: 0,
            },
        );

        Ok(Box::new(MemoryChannel {
            state: self.state.clone(),
            id,
        }))
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connections.contains_key(&self.id)
    }

    fn on_lost(&self, callback: ConnectionLostCallback) {
        let mut state = lock(&self.state);
        match state.connections.get_mut(&self.id) {
            Some(entry) => entry.callbacks.push(callback),
            None => {
                drop(state);
                callback("connection already closed".into());
            }
        }
    }

    async fn close(&self) -> BrokerResult<()> {
        let mut state = lock(&self.state);
        // 主动关闭不触发丢失通知
        state.close_connection(self.id);
        state.dispatch_all(&self.state);
        Ok(())
    }
}

struct MemoryChannel {
    state: Shared,
    id: u64,
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> BrokerResult<()> {
        let mut state = lock(&self.state);
        state.ensure_open(self.id)?;

        match state.exchanges.get(name).copied() {
            Some((existing, existing_durable)) if existing != kind || existing_durable != durable => {
                let reason = format!(
                    "inequivalent arg: declared kind={kind} durable={durable}, existing kind={existing} durable={existing_durable}"
                );
                // 与 AMQP 一致：PRECONDITION_FAILED 会关闭通道
                state.close_channel(self.id);
                Err(BrokerError::TopologyConflict {
                    entity: "exchange",
                    name: name.to_string(),
                    reason,
                })
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), (kind, durable));
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> BrokerResult<()> {
        let mut state = lock(&self.state);
        state.ensure_open(self.id)?;

        match state.queues.get(name).map(|q| q.options.clone()) {
            Some(existing) if existing != *options => {
                let reason =
                    format!("inequivalent arg: declared {options:?}, existing {existing:?}");
                state.close_channel(self.id);
                Err(BrokerError::TopologyConflict {
                    entity: "queue",
                    name: name.to_string(),
                    reason,
                })
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_string(),
                    QueueEntry {
                        options: options.clone(),
                        ready: VecDeque::new(),
                        unacked: HashMap::new(),
                        consumers: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> BrokerResult<()> {
        let mut state = lock(&self.state);
        state.ensure_open(self.id)?;

        if !state.exchanges.contains_key(exchange) {
            state.close_channel(self.id);
            return Err(BrokerError::transport(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        }
        if !state.queues.contains_key(queue) {
            state.close_channel(self.id);
            return Err(BrokerError::transport(format!("NOT_FOUND - no queue '{queue}'")));
        }

        let binding = BindingEntry {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            pattern: pattern.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> BrokerResult<()> {
        let mut state = lock(&self.state);
        match state.channels.get_mut(&self.id) {
            Some(channel) => {
                channel.prefetch = count;
                Ok(())
            }
            None => Err(BrokerError::channel_invalidated(format!(
                "channel {} is closed",
                self.id
            ))),
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> BrokerResult<()> {
        let mut state = lock(&self.state);
        state.ensure_open(self.id)?;

        if !state.exchanges.contains_key(exchange) {
            state.close_channel(self.id);
            return Err(BrokerError::Publish {
                routing_key: routing_key.to_string(),
                reason: format!("NOT_FOUND - no exchange '{exchange}'"),
            });
        }

        state.published += 1;
        state.route(
            exchange,
            routing_key,
            StoredMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                payload: message.payload,
                properties: message.properties,
                redelivered: false,
            },
        );
        state.dispatch_all(&self.state);
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> BrokerResult<DeliveryStream> {
        let mut state = lock(&self.state);
        state.ensure_open(self.id)?;

        if !state.queues.contains_key(queue) {
            state.close_channel(self.id);
            return Err(BrokerError::transport(format!("NOT_FOUND - no queue '{queue}'")));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(q) = state.queues.get_mut(queue) {
            q.consumers.push(Consumer {
                channel_id: self.id,
                tx,
            });
        }
        state.dispatch(&self.state, queue);

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    fn is_open(&self) -> bool {
        lock(&self.state).channel_open(self.id)
    }

    async fn close(&self) -> BrokerResult<()> {
        let mut state = lock(&self.state);
        state.close_channel(self.id);
        state.dispatch_all(&self.state);
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        state.close_channel(self.id);
        state.dispatch_all(&self.state);
    }
}

struct MemoryAcker {
    state: Shared,
    queue: String,
    tag: u64,
    channel_id: u64,
}

impl MemoryAcker {
    fn take_unacked(&self, state: &mut BrokerState) -> BrokerResult<StoredMessage> {
        state.ensure_open(self.channel_id)?;
        state
            .queues
            .get_mut(&self.queue)
            .and_then(|q| q.unacked.remove(&self.tag))
            .map(|u| u.message)
            .ok_or_else(|| {
                BrokerError::channel_invalidated(format!("unknown delivery tag {}", self.tag))
            })
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> BrokerResult<()> {
        let mut state = lock(&self.state);
        self.take_unacked(&mut state)?;
        state.dispatch(&self.state, &self.queue);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        let mut state = lock(&self.state);
        let mut message = self.take_unacked(&mut state)?;

        if requeue {
            message.redelivered = true;
            if let Some(q) = state.queues.get_mut(&self.queue) {
                q.ready.push_front(message);
            }
        } else {
            let dlx = state
                .queues
                .get(&self.queue)
                .and_then(|q| q.options.dead_letter_exchange.clone());
            if let Some(dlx) = dlx {
                let routing_key = message.routing_key.clone();
                message.exchange = dlx.clone();
                state.route(&dlx, &routing_key, message);
            }
        }

        state.dispatch_all(&self.state);
        Ok(())
    }
}
