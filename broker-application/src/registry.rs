//! 订阅者注册表（SubscriberRegistry）
//!
//! 业务侧唯一可见的 broker 入口：以 `(队列, 绑定模式, 处理器)` 注册订阅者，
//! 统一启动与关闭。每个队列只允许一个处理器。
//!
use crate::error::{AppError, AppResult};
use broker_runtime::subscription::{
    EventHandler, SubscriptionConfig, SubscriptionHandle, SubscriptionRuntime,
};
use broker_runtime::topology::Binding;
use broker_runtime::ConnectionManager;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Clone)]
struct Registration {
    binding: Binding,
    handler: Arc<dyn EventHandler>,
}

pub struct SubscriberRegistry {
    connection: Arc<ConnectionManager>,
    config: SubscriptionConfig,
    entries: DashMap<String, Registration>,
    token: CancellationToken,
}

impl SubscriberRegistry {
    pub fn new(connection: Arc<ConnectionManager>, config: SubscriptionConfig) -> Self {
        Self {
            connection,
            config,
            entries: DashMap::new(),
            token: CancellationToken::new(),
        }
    }

    /// 注册处理器；模式非法或队列已注册时返回错误
    pub fn register_handler(
        &self,
        queue: &str,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
    ) -> AppResult<()> {
        let binding = Binding::new(self.connection.exchange(), queue, pattern)?;

        match self.entries.entry(queue.to_string()) {
            Entry::Occupied(_) => Err(AppError::AlreadyRegistered {
                queue: queue.to_string(),
            }),
            Entry::Vacant(slot) => {
                info!(queue, pattern, handler = handler.handler_name(), "subscriber registered");
                slot.insert(Registration { binding, handler });
                Ok(())
            }
        }
    }

    /// 已注册的 (队列, 模式)，按队列名排序
    pub fn registrations(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().binding.pattern.to_string()))
            .collect();
        out.sort();
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 为每个注册项启动订阅运行时；关闭由 `shutdown_all` 统一触发
    pub fn start_all(&self) -> Vec<SubscriptionHandle> {
        let mut registrations: Vec<Registration> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        registrations.sort_by(|a, b| a.binding.queue.cmp(&b.binding.queue));

        registrations
            .into_iter()
            .map(|r| {
                SubscriptionRuntime::new(
                    self.connection.clone(),
                    r.binding,
                    r.handler,
                    self.config.clone(),
                )
                .start_with(self.token.child_token())
            })
            .collect()
    }

    pub fn shutdown_all(&self) {
        self.token.cancel();
    }
}
