//! 事件处理器（EventHandler）
//!
//! 订阅方的业务能力：接收解码后的事件与投递信息，成功返回 `Ok(())`，
//! 失败返回错误（消息将被重新入队或转入死信）。
//!
use crate::event::OrderEvent;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// 当前投递的元信息
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryInfo {
    pub queue: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    /// broker 标记的重投递
    pub redelivered: bool,
}

/// 事件处理器
///
/// 投递语义为至少一次，处理逻辑需自行保证幂等。
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// 处理器名称（用于日志）
    fn handler_name(&self) -> &str;

    async fn handle(&self, event: &OrderEvent, delivery: &DeliveryInfo) -> anyhow::Result<()>;
}

struct FnHandler<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(OrderEvent, DeliveryInfo) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    fn handler_name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &OrderEvent, delivery: &DeliveryInfo) -> anyhow::Result<()> {
        (self.f)(event.clone(), delivery.clone()).await
    }
}

/// 以闭包构造处理器
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn EventHandler>
where
    F: Fn(OrderEvent, DeliveryInfo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn closure_adapter_forwards_calls() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let handler = handler_fn("counter", move |event: OrderEvent, _info| {
            let seen = seen.clone();
            async move {
                anyhow::ensure!(event.order_id() == "9", "unexpected order");
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let info = DeliveryInfo {
            queue: "q".into(),
            routing_key: "order.created".into(),
            delivery_tag: 1,
            redelivered: false,
        };
        let ok = OrderEvent::new("9", EventType::OrderCreated, &(), "").unwrap();
        let bad = OrderEvent::new("10", EventType::OrderCreated, &(), "").unwrap();

        assert_eq!(handler.handler_name(), "counter");
        handler.handle(&ok, &info).await.unwrap();
        assert!(handler.handle(&bad, &info).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
