use crate::helpers::{
    builder, direct_exchange, eventually_async, forwarding_handler, get_consumer, get_pool,
    next_body, random_name,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use warren::amqp::memory::MemoryBroker;
use warren::amqp::session::{BindingOptions, Exchange, ExchangeKind};
use warren::pool::{Error, Role};
use warren::publishers::Producer;

#[tokio::test]
async fn producers_with_the_same_key_share_a_single_channel() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = builder(&broker)
        .max_connections(1)
        .max_producer_channels(1)
        .build()
        .await
        .unwrap();
    let exchange = direct_exchange();
    let mut first = Producer::new(pool.clone(), exchange.clone(), BindingOptions::new("k"));
    let mut second = Producer::new(pool.clone(), exchange, BindingOptions::new("k"));
    assert_eq!(first.key(), second.key());

    // Act
    let first_connection = first.publish("one").await.unwrap();
    let second_connection = second.publish("two").await.unwrap();

    // Assert
    assert_eq!(first_connection.id(), second_connection.id());
    let stats = pool.connections(Role::Producer).await.unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!((stats[0].idle, stats[0].used), (0, 1));
    assert_eq!(broker.open_channels(), 1);
    assert_eq!(broker.published().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_producers_with_the_same_key_share_a_single_channel() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = builder(&broker)
        .max_connections(1)
        .max_producer_channels(1)
        .build()
        .await
        .unwrap();
    broker.set_latency(Duration::from_millis(20));
    let exchange = direct_exchange();
    let mut first = Producer::new(pool.clone(), exchange.clone(), BindingOptions::new("k"));
    let mut second = Producer::new(pool.clone(), exchange, BindingOptions::new("k"));

    // Act
    let (first_outcome, second_outcome) = tokio::join!(first.publish("one"), second.publish("two"));

    // Assert
    let first_connection = first_outcome.unwrap();
    let second_connection = second_outcome.unwrap();
    assert_eq!(first_connection.id(), second_connection.id());
    let stats = pool.connections(Role::Producer).await.unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!((stats[0].idle, stats[0].used), (0, 1));
    assert_eq!(broker.open_channels(), 1);
    assert_eq!(broker.published().len(), 2);
}

#[tokio::test]
async fn a_shared_channel_stays_in_use_until_its_last_producer_shuts_down() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_pool(&broker).await;
    let exchange = direct_exchange();
    let mut first = Producer::new(pool.clone(), exchange.clone(), BindingOptions::new("k"));
    let mut second = Producer::new(pool.clone(), exchange.clone(), BindingOptions::new("k"));
    let mut other = Producer::new_safe(pool.clone(), exchange, BindingOptions::new("k"), "other");
    let connection = first.publish("one").await.unwrap();
    second.publish("two").await.unwrap();

    // Act
    second.shutdown(&connection).await.unwrap();

    // Assert
    let stats = connection.stats().await.unwrap();
    assert_eq!((stats.idle, stats.used), (0, 1));
    // The remaining holder keeps publishing on the same channel.
    assert_eq!(first.publish("three").await.unwrap().id(), connection.id());
    assert_eq!(broker.open_channels(), 1);
    // A producer with another key cannot be handed the shared channel.
    other.publish("four").await.unwrap();
    assert_eq!(broker.open_channels(), 2);

    first.shutdown(&connection).await.unwrap();
    let stats = connection.stats().await.unwrap();
    assert_eq!((stats.idle, stats.used), (1, 1));
    assert_eq!(broker.published().len(), 4);
}

#[tokio::test]
async fn producers_with_distinct_keys_hit_the_capacity_limit() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = builder(&broker)
        .max_connections(1)
        .max_producer_channels(1)
        .build()
        .await
        .unwrap();
    let exchange = direct_exchange();
    let mut first = Producer::new_safe(pool.clone(), exchange.clone(), BindingOptions::new("k"), "a");
    let mut second = Producer::new_safe(pool.clone(), exchange, BindingOptions::new("k"), "b");

    // Act
    first.publish("one").await.unwrap();
    let outcome = second.publish("two").await;

    // Assert
    assert!(matches!(outcome, Err(Error::CapacityExceeded(1))));
    assert_eq!(broker.open_connections(), 1);
    assert_eq!(broker.open_channels(), 1);
}

#[tokio::test]
async fn a_producer_keeps_publishing_on_the_channel_it_acquired() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_pool(&broker).await;
    let mut producer = Producer::new(pool.clone(), direct_exchange(), BindingOptions::new("k"));

    // Act
    let mut connections = Vec::new();
    for _ in 0..3 {
        connections.push(producer.publish("payload").await.unwrap().id());
    }

    // Assert
    assert!(connections.iter().all(|id| *id == connections[0]));
    assert_eq!(broker.open_channels(), 1);
    assert_eq!(broker.published().len(), 3);
}

#[tokio::test]
async fn shutting_a_producer_down_twice_is_rejected_without_corrupting_the_pool() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_pool(&broker).await;
    let mut producer = Producer::new(pool.clone(), direct_exchange(), BindingOptions::new("k"));
    let connection = producer.publish("one").await.unwrap();

    // Act
    producer.shutdown(&connection).await.unwrap();
    let second = producer.shutdown(&connection).await;

    // Assert
    assert!(matches!(second, Err(Error::KeyNotFound { .. })));
    let stats = connection.stats().await.unwrap();
    assert_eq!((stats.idle, stats.used), (1, 0));

    // The idle channel is picked up again.
    let again = producer.publish("two").await.unwrap();
    assert_eq!(again.id(), connection.id());
    assert_eq!(broker.open_channels(), 1);
    let stats = connection.stats().await.unwrap();
    assert_eq!((stats.idle, stats.used), (0, 1));
}

#[tokio::test]
async fn a_producer_republishes_on_a_new_connection_after_a_broker_restart() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_pool(&broker).await;
    let mut producer = Producer::new(pool.clone(), direct_exchange(), BindingOptions::new("k"));
    let before = producer.publish("one").await.unwrap();

    // Act
    broker.disconnect_all("CONNECTION_FORCED - broker forced connection closure");
    let pool_handle = pool.clone();
    assert!(
        eventually_async(|| {
            let pool = pool_handle.clone();
            async move { pool.connection_count().await.unwrap() == 0 }
        })
        .await
    );
    let after = producer.publish("two").await.unwrap();

    // Assert
    assert!(before.is_closed());
    assert_ne!(before.id(), after.id());
    assert_eq!(broker.published().len(), 2);
}

#[tokio::test]
async fn published_messages_are_persistent_and_identified() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_pool(&broker).await;
    let exchange = direct_exchange();
    let mut producer = Producer::new(pool, exchange.clone(), BindingOptions::new("k"));

    // Act
    producer.publish("hello").await.unwrap();

    // Assert
    let published = broker.published();
    assert_eq!(published.len(), 1);
    let message = &published[0];
    assert_eq!(message.exchange, exchange.name);
    assert_eq!(message.routing_key, "k");
    assert_eq!(message.data, b"hello");
    let properties = &message.properties;
    assert_eq!(
        properties.content_type().as_ref().map(|c| c.as_str()),
        Some("text/plain")
    );
    assert_eq!(*properties.delivery_mode(), Some(2));
    assert!(properties.message_id().is_some());
    assert!(properties.timestamp().is_some());
}

#[tokio::test]
async fn unroutable_messages_are_handed_to_the_return_callback() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_pool(&broker).await;
    let exchange = direct_exchange();
    let mut producer = Producer::new(pool, exchange.clone(), BindingOptions::new("nowhere"));
    let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
    producer.notify_return(move |message| {
        let _ = sender.send(message);
    });

    // Act
    producer.publish("lost").await.unwrap();

    // Assert
    let returned = tokio::time::timeout(Duration::from_secs(2), receiver.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(returned.reply_code, 312);
    assert_eq!(returned.exchange, exchange.name);
    assert_eq!(returned.routing_key, "nowhere");
    assert_eq!(returned.data, b"lost");
}

#[tokio::test]
async fn confirmations_carry_the_sequence_number_of_each_publishing() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_pool(&broker).await;
    let mut producer = Producer::new(pool, direct_exchange(), BindingOptions::new("k"));
    let acked = Arc::new(Mutex::new(Vec::new()));
    let nacked = Arc::new(Mutex::new(Vec::new()));
    {
        let acked = Arc::clone(&acked);
        let nacked = Arc::clone(&nacked);
        producer.notify_confirm(
            move |sequence| acked.lock().unwrap().push(sequence),
            move |sequence| nacked.lock().unwrap().push(sequence),
        );
    }

    // Act
    producer.publish("one").await.unwrap();
    producer.publish("two").await.unwrap();

    // Assert
    assert!(
        crate::helpers::eventually(|| acked.lock().unwrap().len() == 2).await,
        "Missing confirmations"
    );
    assert_eq!(*acked.lock().unwrap(), vec![1, 2]);
    assert!(nacked.lock().unwrap().is_empty());
}

#[tokio::test]
async fn without_publisher_confirms_nothing_is_confirmed_or_returned() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = builder(&broker).publisher_confirms(false).build().await.unwrap();
    let mut producer = Producer::new(pool, direct_exchange(), BindingOptions::new("nowhere"));
    let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
    {
        let returns = sender.clone();
        producer.notify_return(move |_| {
            let _ = returns.send("returned");
        });
        producer.notify_confirm(
            move |_| {
                let _ = sender.send("acked");
            },
            |_| {},
        );
    }

    // Act
    producer.publish("lost").await.unwrap();

    // Assert
    let outcome = tokio::time::timeout(Duration::from_millis(100), receiver.recv()).await;
    assert!(outcome.is_err(), "Unexpected notification: {outcome:?}");
}

#[tokio::test]
async fn publishing_to_the_default_exchange_routes_by_queue_name() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_pool(&broker).await;
    let queue = random_name();
    let consumer = get_consumer(&pool, Exchange::new("", ExchangeKind::Direct), &queue, "");
    let (handler, mut bodies) = forwarding_handler();
    let running = consumer.clone();
    let handle = tokio::spawn(async move { running.consume(handler).await });
    assert!(crate::helpers::eventually(|| broker.consumer_count(&queue) == 1).await);

    // Act
    let mut producer = Producer::new(
        pool.clone(),
        Exchange::new("", ExchangeKind::Direct),
        BindingOptions::new(&queue),
    );
    producer.publish("direct to queue").await.unwrap();

    // Assert
    assert_eq!(next_body(&mut bodies).await, b"direct to queue");
    assert!(broker.bindings().is_empty());
    consumer.shutdown().await.unwrap();
    handle.await.unwrap().unwrap();
}
