/// 内存 broker 示例
/// 展示 连接 → 订阅（通知队列 `order.*`）→ 发布 → 处理失败重投 → 优雅关闭 的完整流程
use anyhow::Result as AnyResult;
use broker_runtime::subscription::{DeliveryInfo, SubscriptionConfig, SubscriptionRuntime, handler_fn};
use broker_runtime::topology::Binding;
use broker_runtime::{
    BrokerConfig, ConnectionManager, EventPublisher, EventType, InMemoryBroker, OrderEvent,
};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Serialize)]
struct OrderCreated {
    customer: String,
    total_cents: u64,
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,broker_runtime=debug".into()),
        )
        .init();

    let broker = InMemoryBroker::new();
    let config = BrokerConfig::builder().connection_name("inmemory-demo").build();
    let connection = ConnectionManager::new(Arc::new(broker.clone()), config);
    connection.connect().await?;

    // 第一次处理失败，演示 requeue 后的重新投递
    let failed_once = Arc::new(AtomicBool::new(false));
    let flag = failed_once.clone();
    let handler = handler_fn("notification", move |event: OrderEvent, info: DeliveryInfo| {
        let flag = flag.clone();
        async move {
            if !flag.swap(true, Ordering::SeqCst) {
                anyhow::bail!("smtp relay unavailable");
            }
            println!(
                "[{}] {} order={} redelivered={} message={:?}",
                info.queue,
                event.event_type(),
                event.order_id(),
                info.redelivered,
                event.message()
            );
            Ok(())
        }
    });

    let binding = Binding::new(connection.exchange(), "notification_queue", "order.*")?;
    let handle = SubscriptionRuntime::new(
        connection.clone(),
        binding,
        handler,
        SubscriptionConfig::default(),
    )
    .start();

    let publisher = EventPublisher::new(connection.clone());
    let created = OrderEvent::new(
        "1001",
        EventType::OrderCreated,
        &OrderCreated {
            customer: "alice".into(),
            total_cents: 4200,
        },
        "Order 1001 created",
    )?;
    let ack = publisher.publish_known(&created).await?;
    println!("published {} -> {}", ack.event_id, ack.routing_key);

    let shipped = OrderEvent::new("1001", EventType::OrderShipped, &(), "Order 1001 shipped")?;
    publisher.publish_known(&shipped).await?;

    tokio::time::sleep(Duration::from_millis(300)).await;
    println!("stats: {:?}", handle.stats());
    println!("health: {:?}", connection.health());

    handle.shutdown();
    handle.join().await?;
    connection.close().await?;
    Ok(())
}
