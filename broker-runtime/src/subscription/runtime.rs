//! 订阅运行时（SubscriptionRuntime）
//!
//! 单个队列的长驻消费者：
//! `Starting → Declaring → Consuming → Draining → Stopped`。
//!
//! - 声明交换机、队列与绑定，prefetch 默认为 1，保证队列内严格有序；
//! - 每条投递：解码 → 调用处理器 → 成功 ack，失败 nack(requeue)；解码失败视同处理失败；
//! - 通道失效（连接断开）后等待 ConnectionManager 恢复，再重新声明并订阅；
//! - 取消时不再接收新投递，已分发的投递处理完毕并确认后关闭通道。
//!
use super::handler::{DeliveryInfo, EventHandler};
use super::redelivery::{FailureTracker, RedeliveryPolicy, Resolution};
use crate::connection::ConnectionManager;
use crate::error::{BrokerError, BrokerResult};
use crate::event::OrderEvent;
use crate::topology::{Binding, TopologyDeclarer};
use crate::transport::{Channel, Delivery, DeliveryStream};
use bon::Builder;
use futures_util::{FutureExt, StreamExt};
use serde::Serialize;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 订阅运行状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum SubscriptionState {
    Starting,
    Declaring,
    Consuming,
    Draining,
    Stopped,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 订阅配置
#[derive(Builder, Clone, Debug)]
pub struct SubscriptionConfig {
    /// 未确认投递上限
    #[builder(default = 1)]
    pub prefetch: u16,
    /// 消费者标签，缺省为 `<queue>-consumer`
    #[builder(into)]
    pub consumer_tag: Option<String>,
    /// 通道失效后重新订阅前的等待
    #[builder(default = Duration::from_secs(1))]
    pub resubscribe_delay: Duration,
    #[builder(default)]
    pub redelivery: RedeliveryPolicy,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// 订阅统计快照
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SubscriptionStats {
    pub queue: String,
    pub state: SubscriptionState,
    pub delivered: u64,
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub resubscribes: u64,
    /// 致命错误原因（订阅已停止）
    pub failure: Option<String>,
}

struct StatsCell {
    queue: String,
    state: Mutex<SubscriptionState>,
    delivered: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
    resubscribes: AtomicU64,
    failure: Mutex<Option<String>>,
    failed: CancellationToken,
}

impl StatsCell {
    fn new(queue: &str) -> Self {
        Self {
            queue: queue.to_string(),
            state: Mutex::new(SubscriptionState::Starting),
            delivered: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            resubscribes: AtomicU64::new(0),
            failure: Mutex::new(None),
            failed: CancellationToken::new(),
        }
    }

    fn fail(&self, err: &BrokerError) {
        *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = Some(err.to_string());
        self.failed.cancel();
    }

    fn failure(&self) -> Option<String> {
        self.failure.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_state(&self, state: SubscriptionState) {
        let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *current != state {
            debug!(queue = %self.queue, from = %*current, to = %state, "subscription state changed");
            *current = state;
        }
    }

    fn snapshot(&self) -> SubscriptionStats {
        SubscriptionStats {
            queue: self.queue.clone(),
            state: *self.state.lock().unwrap_or_else(|e| e.into_inner()),
            delivered: self.delivered.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            resubscribes: self.resubscribes.load(Ordering::Relaxed),
            failure: self.failure(),
        }
    }
}

/// 消费循环的退出原因
enum LoopExit {
    Cancelled,
    ChannelLost,
}

pub struct SubscriptionRuntime {
    connection: Arc<ConnectionManager>,
    topology: TopologyDeclarer,
    binding: Binding,
    handler: Arc<dyn EventHandler>,
    config: SubscriptionConfig,
    stats: Arc<StatsCell>,
}

impl SubscriptionRuntime {
    pub fn new(
        connection: Arc<ConnectionManager>,
        binding: Binding,
        handler: Arc<dyn EventHandler>,
        config: SubscriptionConfig,
    ) -> Self {
        let topology = TopologyDeclarer::new(connection.config().exchange_kind);
        let binding = binding.with_dead_letter(config.redelivery.uses_dead_letter());
        let stats = Arc::new(StatsCell::new(&binding.queue));

        Self {
            connection,
            topology,
            binding,
            handler,
            config,
            stats,
        }
    }

    pub fn binding(&self) -> &Binding {
        &self.binding
    }

    pub fn stats(&self) -> SubscriptionStats {
        self.stats.snapshot()
    }

    /// 在独立任务中运行，返回可关闭/等待的句柄
    pub fn start(self) -> SubscriptionHandle {
        self.start_with(CancellationToken::new())
    }

    /// 使用外部令牌运行（例如服务级的子令牌）
    pub fn start_with(self, token: CancellationToken) -> SubscriptionHandle {
        let stats = self.stats.clone();
        let queue = self.binding.queue.clone();
        let task = tokio::spawn(self.run(token.clone()));

        SubscriptionHandle {
            queue,
            token,
            stats,
            task: Some(task),
        }
    }

    /// 运行直至取消；仅在致命错误时返回 `Err`
    pub async fn run(self, token: CancellationToken) -> BrokerResult<()> {
        let queue = self.binding.queue.clone();
        let mut tracker = FailureTracker::default();
        self.stats.set_state(SubscriptionState::Starting);
        info!(%queue, binding = %self.binding, handler = self.handler.handler_name(), "subscriber starting");

        let result = loop {
            if token.is_cancelled() {
                break Ok(());
            }

            tokio::select! {
                _ = token.cancelled() => break Ok(()),
                res = self.connection.wait_until_connected() => {
                    if let Err(e) = res {
                        break Err(e);
                    }
                }
            }

            self.stats.set_state(SubscriptionState::Declaring);
            let (channel, mut stream) = match self.subscribe().await {
                Ok(pair) => pair,
                Err(e) if e.is_fatal() => {
                    error!(%queue, error = %e, "subscriber topology declaration failed");
                    break Err(e);
                }
                Err(e) => {
                    warn!(%queue, error = %e, "subscribe failed, retrying");
                    if self.pause(&token).await {
                        break Ok(());
                    }
                    continue;
                }
            };

            self.stats.set_state(SubscriptionState::Consuming);
            info!(%queue, pattern = %self.binding.pattern, "subscriber consuming");

            match self.consume(&mut stream, &token, &mut tracker).await {
                LoopExit::Cancelled => {
                    self.stats.set_state(SubscriptionState::Draining);
                    drop(stream);
                    if let Err(e) = channel.close().await {
                        debug!(%queue, error = %e, "channel close failed during drain");
                    }
                    break Ok(());
                }
                LoopExit::ChannelLost => {
                    self.stats.resubscribes.fetch_add(1, Ordering::Relaxed);
                    warn!(%queue, "consumer channel lost, resubscribing");
                    drop(stream);
                    drop(channel);
                    if self.pause(&token).await {
                        break Ok(());
                    }
                }
            }
        };

        self.stats.set_state(SubscriptionState::Stopped);
        match &result {
            Ok(()) => info!(%queue, "subscriber stopped"),
            Err(e) => {
                error!(%queue, error = %e, "subscriber stopped on fatal error");
                self.stats.fail(e);
            }
        }
        result
    }

    async fn subscribe(&self) -> BrokerResult<(Box<dyn Channel>, DeliveryStream)> {
        let channel = self.connection.open_channel().await?;
        self.topology
            .declare_all(channel.as_ref(), &self.binding)
            .await?;
        channel.set_prefetch(self.config.prefetch).await?;

        let tag = self
            .config
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("{}-consumer", self.binding.queue));
        let stream = channel.consume(&self.binding.queue, &tag).await?;
        Ok((channel, stream))
    }

    /// 可取消的等待；返回 `true` 表示已取消
    async fn pause(&self, token: &CancellationToken) -> bool {
        tokio::select! {
            _ = token.cancelled() => true,
            _ = tokio::time::sleep(self.config.resubscribe_delay) => false,
        }
    }

    async fn consume(
        &self,
        stream: &mut DeliveryStream,
        token: &CancellationToken,
        tracker: &mut FailureTracker,
    ) -> LoopExit {
        loop {
            tokio::select! {
                // 优先响应取消：已分发的投递在分支内完成，不会被中断
                biased;
                _ = token.cancelled() => return LoopExit::Cancelled,
                next = stream.next() => match next {
                    Some(Ok(delivery)) => self.dispatch(delivery, tracker).await,
                    Some(Err(e)) => {
                        warn!(queue = %self.binding.queue, error = %e, "consumer stream error");
                        return LoopExit::ChannelLost;
                    }
                    None => return LoopExit::ChannelLost,
                },
            }
        }
    }

    async fn dispatch(&self, delivery: Delivery, tracker: &mut FailureTracker) {
        self.stats.delivered.fetch_add(1, Ordering::Relaxed);
        let info = DeliveryInfo {
            queue: self.binding.queue.clone(),
            routing_key: delivery.routing_key.clone(),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
        };
        let key = FailureTracker::key(delivery.properties.message_id.as_deref(), &delivery.payload);

        match self.process(&delivery, &info).await {
            Ok(()) => match delivery.ack().await {
                Ok(()) => {
                    tracker.on_success(&key);
                    self.stats.acked.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        queue = %info.queue,
                        routing_key = %info.routing_key,
                        delivery_tag = info.delivery_tag,
                        "delivery acked"
                    );
                }
                // 通道已失效：broker 会重新投递
                Err(e) => warn!(
                    queue = %info.queue,
                    routing_key = %info.routing_key,
                    delivery_tag = info.delivery_tag,
                    error = %e,
                    "ack failed, message will be redelivered"
                ),
            },
            Err(err) => {
                let resolution = tracker.on_failure(self.config.redelivery, &key);
                let requeue = resolution == Resolution::Requeue;
                warn!(
                    queue = %info.queue,
                    routing_key = %info.routing_key,
                    delivery_tag = info.delivery_tag,
                    redelivered = info.redelivered,
                    requeue,
                    error = %err,
                    "delivery failed"
                );

                match delivery.nack(requeue).await {
                    Ok(()) if requeue => {
                        self.stats.requeued.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(()) => {
                        self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => warn!(
                        queue = %info.queue,
                        delivery_tag = info.delivery_tag,
                        error = %e,
                        "nack failed, message will be redelivered"
                    ),
                }
            }
        }
    }

    /// 解码并调用处理器；处理器的 panic 按处理失败对待
    async fn process(&self, delivery: &Delivery, info: &DeliveryInfo) -> BrokerResult<()> {
        let event = OrderEvent::decode(&delivery.payload)?;
        let name = self.handler.handler_name();

        match AssertUnwindSafe(self.handler.handle(&event, info))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BrokerError::Handler {
                handler: name.to_string(),
                reason: format!("{e:#}"),
            }),
            Err(_) => Err(BrokerError::Handler {
                handler: name.to_string(),
                reason: "handler panicked".into(),
            }),
        }
    }
}

/// 订阅运行句柄：用于优雅关闭与等待任务结束
pub struct SubscriptionHandle {
    queue: String,
    token: CancellationToken,
    stats: Arc<StatsCell>,
    task: Option<JoinHandle<BrokerResult<()>>>,
}

impl SubscriptionHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn stats(&self) -> SubscriptionStats {
        self.stats.snapshot()
    }

    /// 订阅因致命错误停止时被取消
    pub fn failure_signal(&self) -> CancellationToken {
        self.stats.failed.child_token()
    }

    /// 致命错误原因
    pub fn failure(&self) -> Option<String> {
        self.stats.failure()
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|t| t.is_finished())
    }

    pub async fn join(mut self) -> BrokerResult<()> {
        match self.task.take() {
            Some(task) => task.await.map_err(|e| BrokerError::Handler {
                handler: self.queue.clone(),
                reason: format!("subscriber task aborted: {e}"),
            })?,
            None => Ok(()),
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::event::EventType;
    use crate::publisher::EventPublisher;
    use crate::subscription::handler_fn;
    use crate::transport::memory::InMemoryBroker;
    use std::sync::atomic::AtomicUsize;

    async fn connected(broker: &InMemoryBroker) -> Arc<ConnectionManager> {
        let cm = ConnectionManager::new(Arc::new(broker.clone()), BrokerConfig::default());
        cm.connect().await.unwrap();
        cm
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn acks_after_successful_handling() {
        let broker = InMemoryBroker::new();
        let cm = connected(&broker).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let handler = handler_fn("ok", move |_ev, _info| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let binding = Binding::new("order_exchange", "q", "order.created").unwrap();
        let handle =
            SubscriptionRuntime::new(cm.clone(), binding, handler, SubscriptionConfig::default())
                .start();
        wait_until(|| handle.stats().state == SubscriptionState::Consuming).await;

        let publisher = EventPublisher::new(cm.clone());
        let ev = OrderEvent::new("1", EventType::OrderCreated, &(), "").unwrap();
        publisher.publish(&ev, "order.created").await.unwrap();

        wait_until(|| handle.stats().acked == 1).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.ready_count("q"), 0);
        assert_eq!(broker.unacked_count("q"), 0);

        handle.shutdown();
        assert_eq!(handle.stats().queue, "q");
        let stats = {
            let stats = handle.stats.clone();
            handle.join().await.unwrap();
            stats.snapshot()
        };
        assert_eq!(stats.state, SubscriptionState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn malformed_payload_is_requeued_like_a_handler_error() {
        let broker = InMemoryBroker::new();
        let cm = connected(&broker).await;
        let handler = handler_fn("never", |_ev, _info| async { Ok(()) });
        let binding = Binding::new("order_exchange", "q", "#").unwrap();
        let config = SubscriptionConfig::builder()
            .redelivery(RedeliveryPolicy::DeadLetter { max_attempts: 2 })
            .build();

        let handle = SubscriptionRuntime::new(cm.clone(), binding, handler, config).start();
        wait_until(|| handle.stats().state == SubscriptionState::Consuming).await;

        let ch = cm.open_channel().await.unwrap();
        ch.publish(
            "order_exchange",
            "order.created",
            crate::transport::OutboundMessage {
                payload: b"{not json".to_vec(),
                properties: Default::default(),
            },
        )
        .await
        .unwrap();

        wait_until(|| handle.stats().dead_lettered == 1).await;
        let stats = handle.stats();
        assert_eq!(stats.requeued, 1);
        assert_eq!(stats.acked, 0);
        assert_eq!(broker.drain("q.dead_letter"), vec![b"{not json".to_vec()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn panicking_handler_does_not_kill_subscriber() {
        let broker = InMemoryBroker::new();
        let cm = connected(&broker).await;
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = attempts.clone();
        let handler = handler_fn("flaky", move |_ev, _info| {
            let seen = seen.clone();
            async move {
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("boom");
                }
                Ok(())
            }
        });
        let binding = Binding::new("order_exchange", "q", "#").unwrap();
        let handle =
            SubscriptionRuntime::new(cm.clone(), binding, handler, SubscriptionConfig::default())
                .start();
        wait_until(|| handle.stats().state == SubscriptionState::Consuming).await;

        let ev = OrderEvent::new("1", EventType::OrderCreated, &(), "").unwrap();
        EventPublisher::new(cm.clone())
            .publish(&ev, "order.created")
            .await
            .unwrap();

        wait_until(|| handle.stats().acked == 1).await;
        assert_eq!(handle.stats().requeued, 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(!handle.is_finished());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn topology_conflict_raises_failure_signal() {
        let broker = InMemoryBroker::new();
        let cm = connected(&broker).await;
        let ch = cm.open_channel().await.unwrap();
        ch.declare_queue(
            "q",
            &crate::transport::QueueOptions {
                durable: true,
                dead_letter_exchange: Some("elsewhere.dlx".into()),
            },
        )
        .await
        .unwrap();

        let handler = handler_fn("never", |_ev, _info| async { Ok(()) });
        let binding = Binding::new("order_exchange", "q", "#").unwrap();
        let handle =
            SubscriptionRuntime::new(cm.clone(), binding, handler, SubscriptionConfig::default())
                .start();

        tokio::time::timeout(Duration::from_secs(5), handle.failure_signal().cancelled())
            .await
            .expect("failure not signalled");
        let stats = handle.stats();
        assert_eq!(stats.state, SubscriptionState::Stopped);
        assert!(stats.failure.is_some());
        assert!(matches!(
            handle.join().await,
            Err(BrokerError::TopologyConflict { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn clean_shutdown_leaves_failure_unset() {
        let broker = InMemoryBroker::new();
        let cm = connected(&broker).await;
        let handler = handler_fn("ok", |_ev, _info| async { Ok(()) });
        let binding = Binding::new("order_exchange", "q", "#").unwrap();
        let handle =
            SubscriptionRuntime::new(cm.clone(), binding, handler, SubscriptionConfig::default())
                .start();
        wait_until(|| handle.stats().state == SubscriptionState::Consuming).await;

        let signal = handle.failure_signal();
        handle.shutdown();
        assert!(handle.failure().is_none());
        handle.join().await.unwrap();
        assert!(!signal.is_cancelled());
    }
}
