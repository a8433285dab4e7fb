use anyhow::Result as AnyResult;
use broker_runtime::subscription::{
    DeliveryInfo, SubscriptionConfig, SubscriptionRuntime, SubscriptionState, handler_fn,
};
use broker_runtime::topology::Binding;
use broker_runtime::{
    BrokerConfig, ConnectionManager, ConnectionStatus, EventPublisher, EventType, InMemoryBroker,
    OrderEvent,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn connected(broker: &InMemoryBroker) -> AnyResult<Arc<ConnectionManager>> {
    let cm = ConnectionManager::new(Arc::new(broker.clone()), BrokerConfig::default());
    cm.connect().await?;
    Ok(cm)
}

fn fast_config() -> SubscriptionConfig {
    SubscriptionConfig::builder()
        .resubscribe_delay(Duration::from_millis(20))
        .build()
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_handler_requeues_until_success() -> AnyResult<()> {
    let broker = InMemoryBroker::new();
    let cm = connected(&broker).await?;

    // 前两次失败，第三次成功
    let calls = Arc::new(AtomicUsize::new(0));
    let redelivered = Arc::new(Mutex::new(Vec::new()));
    let (seen, flags) = (calls.clone(), redelivered.clone());
    let handler = handler_fn("flaky", move |_event: OrderEvent, info: DeliveryInfo| {
        let seen = seen.clone();
        let flags = flags.clone();
        async move {
            flags.lock().unwrap().push(info.redelivered);
            let n = seen.fetch_add(1, Ordering::SeqCst);
            anyhow::ensure!(n >= 2, "transient failure #{n}");
            Ok(())
        }
    });

    let binding = Binding::new("order_exchange", "order_processing_queue", "order.created")?;
    let handle = SubscriptionRuntime::new(cm.clone(), binding, handler, fast_config()).start();
    wait_until(|| handle.stats().state == SubscriptionState::Consuming).await;

    let event = OrderEvent::new("7", EventType::OrderCreated, &(), "created")?;
    EventPublisher::new(cm.clone()).publish_known(&event).await?;

    wait_until(|| handle.stats().acked == 1).await;
    let stats = handle.stats();
    assert_eq!(stats.requeued, 2);
    assert_eq!(stats.delivered, 3);
    assert_eq!(*redelivered.lock().unwrap(), vec![false, true, true]);

    // 成功确认后不再投递
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(broker.ready_count("order_processing_queue"), 0);
    assert_eq!(broker.unacked_count("order_processing_queue"), 0);

    handle.shutdown();
    handle.join().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn recovers_after_connection_drop_without_loss() -> AnyResult<()> {
    let broker = InMemoryBroker::new();
    let cm = connected(&broker).await?;

    let gate = Arc::new(Notify::new());
    let seen: Arc<Mutex<Vec<(String, bool)>>> = Arc::default();
    let (g, s) = (gate.clone(), seen.clone());
    let handler = handler_fn("gated", move |event: OrderEvent, info: DeliveryInfo| {
        let gate = g.clone();
        let seen = s.clone();
        async move {
            let first = {
                let mut seen = seen.lock().unwrap();
                seen.push((event.order_id().to_string(), info.redelivered));
                seen.len() == 1
            };
            if first {
                gate.notified().await;
            }
            Ok(())
        }
    });

    let binding = Binding::new("order_exchange", "shipping_queue", "order.shipped")?;
    let handle = SubscriptionRuntime::new(cm.clone(), binding, handler, fast_config()).start();
    wait_until(|| handle.stats().state == SubscriptionState::Consuming).await;

    let publisher = EventPublisher::new(cm.clone());
    let first = OrderEvent::new("1", EventType::OrderShipped, &(), "")?;
    publisher.publish_known(&first).await?;
    wait_until(|| seen.lock().unwrap().len() == 1).await;

    // 处理中断开连接：该投递无法确认，将以 redelivered 重新投递
    broker.sever_connections("network partition");
    gate.notify_one();

    let mut status = cm.subscribe_status();
    tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| *s == ConnectionStatus::Connected),
    )
    .await??;
    wait_until(|| handle.stats().acked == 1).await;

    let second = OrderEvent::new("2", EventType::OrderShipped, &(), "")?;
    publisher.publish_known(&second).await?;
    wait_until(|| handle.stats().acked == 2).await;

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            ("1".to_string(), false),
            ("1".to_string(), true),
            ("2".to_string(), false)
        ]
    );
    let stats = handle.stats();
    assert_eq!(stats.resubscribes, 1);
    assert_eq!(cm.health().recoveries, 1);
    assert_eq!(broker.ready_count("shipping_queue"), 0);
    assert_eq!(broker.unacked_count("shipping_queue"), 0);

    handle.shutdown();
    handle.join().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_lets_in_flight_delivery_finish() -> AnyResult<()> {
    let broker = InMemoryBroker::new();
    let cm = connected(&broker).await?;

    let gate = Arc::new(Notify::new());
    let started = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let (g, st, fin) = (gate.clone(), started.clone(), finished.clone());
    let handler = handler_fn("slow", move |_event, _info| {
        let (gate, started, finished) = (g.clone(), st.clone(), fin.clone());
        async move {
            started.fetch_add(1, Ordering::SeqCst);
            gate.notified().await;
            finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    let binding = Binding::new("order_exchange", "notification_queue", "order.*")?;
    let handle = SubscriptionRuntime::new(cm.clone(), binding, handler, fast_config()).start();
    wait_until(|| handle.stats().state == SubscriptionState::Consuming).await;

    let publisher = EventPublisher::new(cm.clone());
    for id in ["1", "2"] {
        let event = OrderEvent::new(id, EventType::OrderDelivered, &(), "")?;
        publisher.publish_known(&event).await?;
    }
    wait_until(|| started.load(Ordering::SeqCst) == 1).await;

    handle.shutdown();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!handle.is_finished());
    gate.notify_one();

    let stats_probe = {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !handle.is_finished() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.stats()
    };
    handle.join().await?;

    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(stats_probe.acked, 1);
    assert_eq!(stats_probe.state, SubscriptionState::Stopped);
    // 第二条未被处理，仍在队列中
    assert_eq!(broker.ready_count("notification_queue"), 1);
    assert_eq!(broker.unacked_count("notification_queue"), 0);
    Ok(())
}
