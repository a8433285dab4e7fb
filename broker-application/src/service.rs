//! 服务装配（BrokerService）
//!
//! 启动顺序：建连 → 发布者 → 注册订阅者 → 启动全部订阅。
//! 关闭顺序相反：停止订阅并等待在途消息处理完毕，最后关闭连接。
//! 订阅者因致命错误停止时取消 `subscriber_failure_signal`，交由进程决定退出。
//!
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::handlers::OrderHandlers;
use crate::registry::SubscriberRegistry;
use broker_runtime::subscription::{SubscriptionConfig, SubscriptionHandle, SubscriptionStats};
use broker_runtime::transport::Transport;
use broker_runtime::{ConnectionHealth, ConnectionManager, EventPublisher, PublishEvent};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct BrokerService {
    connection: Arc<ConnectionManager>,
    publisher: Arc<EventPublisher>,
    registry: SubscriberRegistry,
    subscriptions: Vec<SubscriptionHandle>,
    /// 任一订阅因致命错误停止时取消
    subscriber_failed: CancellationToken,
    stopping: CancellationToken,
}

impl BrokerService {
    /// 建连失败（退避耗尽）时返回错误，调用方应以非零状态退出
    pub async fn start(
        config: AppConfig,
        transport: Arc<dyn Transport>,
        handlers: OrderHandlers,
    ) -> AppResult<Self> {
        let connection = ConnectionManager::new(transport, config.broker.clone());
        connection.connect().await?;

        let mut publisher = EventPublisher::new(connection.clone());
        if let Some(timeout) = config.publish_timeout {
            publisher = publisher.with_timeout(timeout);
        }

        let subscription = SubscriptionConfig::builder()
            .redelivery(config.redelivery)
            .build();
        let registry = SubscriberRegistry::new(connection.clone(), subscription);
        handlers.register(&registry)?;
        let subscriptions = registry.start_all();

        let subscriber_failed = CancellationToken::new();
        let stopping = CancellationToken::new();
        for handle in &subscriptions {
            let signal = handle.failure_signal();
            let failed = subscriber_failed.clone();
            let stopping = stopping.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = signal.cancelled() => failed.cancel(),
                    _ = stopping.cancelled() => {}
                }
            });
        }

        info!(
            endpoint = %config.broker.endpoint(),
            exchange = %config.broker.exchange,
            subscribers = subscriptions.len(),
            "broker service started"
        );

        Ok(Self {
            connection,
            publisher: Arc::new(publisher),
            registry,
            subscriptions,
            subscriber_failed,
            stopping,
        })
    }

    pub fn publisher(&self) -> Arc<dyn PublishEvent> {
        self.publisher.clone()
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn health(&self) -> ConnectionHealth {
        self.connection.health()
    }

    /// 连接恢复彻底失败时被取消
    pub fn fatal_signal(&self) -> CancellationToken {
        self.connection.fatal_signal()
    }

    /// 任一订阅者因致命错误（拓扑冲突等）停止时被取消
    pub fn subscriber_failure_signal(&self) -> CancellationToken {
        self.subscriber_failed.child_token()
    }

    /// 已因致命错误停止的订阅者
    pub fn failures(&self) -> Vec<AppError> {
        self.subscriptions
            .iter()
            .filter_map(|h| {
                h.failure().map(|reason| AppError::Subscriber {
                    queue: h.queue().to_string(),
                    reason,
                })
            })
            .collect()
    }

    pub fn registrations(&self) -> Vec<(String, String)> {
        self.registry.registrations()
    }

    pub fn stats(&self) -> Vec<SubscriptionStats> {
        self.subscriptions.iter().map(|s| s.stats()).collect()
    }

    pub async fn shutdown(self) -> AppResult<()> {
        info!("broker service shutting down");
        self.stopping.cancel();
        self.registry.shutdown_all();

        for handle in self.subscriptions {
            let queue = handle.queue().to_string();
            if let Err(e) = handle.join().await {
                warn!(%queue, error = %e, "subscription ended with error");
            }
        }

        self.connection.close().await?;
        info!("broker service stopped");
        Ok(())
    }
}
