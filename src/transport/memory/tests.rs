use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;

use super::*;

fn body(s: &str) -> Bytes {
    Bytes::from(s.to_string())
}

async fn expect_delivery(consumer: &mut Consumer) -> Delivery {
    timeout(Duration::from_secs(1), consumer.next())
        .await
        .expect("timed out waiting for delivery")
        .expect("consumer stream ended")
}

async fn expect_silence(consumer: &mut Consumer) {
    let result = timeout(Duration::from_millis(50), consumer.next()).await;
    assert!(result.is_err(), "unexpected delivery: {:?}", result);
}

#[tokio::test]
async fn test_exact_binding_routes_only_its_key() {
    let transport = MemoryTransport::new();
    let mut consumer = transport.consume("events", "node.added").await.unwrap();

    transport
        .publish("events", "node.added", body("a"), None)
        .await
        .unwrap();
    transport
        .publish("events", "node.removed", body("b"), None)
        .await
        .unwrap();

    let delivery = expect_delivery(&mut consumer).await;
    assert_eq!(delivery.routing_key, "node.added");
    assert_eq!(delivery.payload, body("a"));
    assert!(delivery.reply_to.is_none());

    expect_silence(&mut consumer).await;
}

#[tokio::test]
async fn test_wildcard_bindings() {
    let transport = MemoryTransport::new();
    let mut all = transport.consume("events", "#").await.unwrap();
    let mut one_word = transport.consume("events", "node.*").await.unwrap();

    transport
        .publish("events", "node.added", body("x"), None)
        .await
        .unwrap();
    transport
        .publish("events", "task.done", body("y"), None)
        .await
        .unwrap();

    assert_eq!(expect_delivery(&mut all).await.routing_key, "node.added");
    assert_eq!(expect_delivery(&mut all).await.routing_key, "task.done");

    assert_eq!(
        expect_delivery(&mut one_word).await.routing_key,
        "node.added"
    );
    expect_silence(&mut one_word).await;
}

#[tokio::test]
async fn test_fanout_to_multiple_consumers() {
    let transport = MemoryTransport::new();
    let mut first = transport.consume("events", "ping").await.unwrap();
    let mut second = transport.consume("events", "ping").await.unwrap();

    transport
        .publish("events", "ping", body("hello"), None)
        .await
        .unwrap();

    assert_eq!(expect_delivery(&mut first).await.payload, body("hello"));
    assert_eq!(expect_delivery(&mut second).await.payload, body("hello"));
}

#[tokio::test]
async fn test_exchanges_are_isolated() {
    let transport = MemoryTransport::new();
    let mut consumer = transport.consume("events", "#").await.unwrap();

    transport
        .publish("tasks", "anything", body("x"), None)
        .await
        .unwrap();

    expect_silence(&mut consumer).await;
}

#[tokio::test]
async fn test_publish_without_consumers_is_accepted() {
    let transport = MemoryTransport::new();
    transport
        .publish("events", "nobody.listens", body("x"), None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_deliveries_arrive_in_publish_order() {
    let transport = MemoryTransport::new();
    let mut consumer = transport.consume("events", "seq").await.unwrap();

    for i in 0..5 {
        transport
            .publish("events", "seq", body(&i.to_string()), None)
            .await
            .unwrap();
    }

    for i in 0..5 {
        assert_eq!(expect_delivery(&mut consumer).await.payload, body(&i.to_string()));
    }
}

#[tokio::test]
async fn test_reply_queue_round_trip() {
    let transport = MemoryTransport::new();
    let mut reply_consumer = transport.reply_queue().await.unwrap();
    let address = reply_consumer.reply_address().unwrap().clone();

    transport.send_reply(&address, body("pong")).await.unwrap();

    let delivery = expect_delivery(&mut reply_consumer).await;
    assert_eq!(delivery.payload, body("pong"));
    assert_eq!(delivery.routing_key, address.as_str());
    assert!(delivery.reply_to.is_none());
}

#[tokio::test]
async fn test_reply_queues_are_unique_and_private() {
    let transport = MemoryTransport::new();
    let mut first = transport.reply_queue().await.unwrap();
    let mut second = transport.reply_queue().await.unwrap();
    assert_ne!(
        first.reply_address().unwrap(),
        second.reply_address().unwrap()
    );

    let to_first = first.reply_address().unwrap().clone();
    transport.send_reply(&to_first, body("for-first")).await.unwrap();

    assert_eq!(expect_delivery(&mut first).await.payload, body("for-first"));
    expect_silence(&mut second).await;
}

#[tokio::test]
async fn test_reply_to_unknown_queue_is_dropped_silently() {
    let transport = MemoryTransport::new();
    transport
        .send_reply(&ReplyAddress::new("reply.gone"), body("late"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_cancel_unbinds_and_ends_the_stream() {
    let transport = MemoryTransport::new();
    let mut consumer = transport.consume("events", "#").await.unwrap();
    let tag = consumer.tag().clone();

    transport.cancel(&tag).await.unwrap();
    transport
        .publish("events", "after.cancel", body("x"), None)
        .await
        .unwrap();

    // Binding gone: the stream ends instead of delivering.
    let next = timeout(Duration::from_secs(1), consumer.next())
        .await
        .expect("timed out");
    assert!(next.is_none());
    assert_eq!(transport.binding_count().await, 0);
}

#[tokio::test]
async fn test_cancel_is_idempotent() {
    let transport = MemoryTransport::new();
    let consumer = transport.consume("events", "#").await.unwrap();
    let tag = consumer.tag().clone();

    transport.cancel(&tag).await.unwrap();
    transport.cancel(&tag).await.unwrap();
    transport
        .cancel(&ConsumerTag::new("never-existed"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_cancel_removes_reply_queue() {
    let transport = MemoryTransport::new();
    let consumer = transport.reply_queue().await.unwrap();
    let address = consumer.reply_address().unwrap().clone();
    let tag = consumer.tag().clone();

    assert_eq!(transport.reply_queue_count().await, 1);
    transport.cancel(&tag).await.unwrap();
    assert_eq!(transport.reply_queue_count().await, 0);

    // Late reply after teardown: dropped, not an error.
    transport.send_reply(&address, body("late")).await.unwrap();
}

#[tokio::test]
async fn test_dropped_consumer_is_pruned_on_publish() {
    let transport = MemoryTransport::new();
    let consumer = transport.consume("events", "#").await.unwrap();
    drop(consumer);

    transport
        .publish("events", "x", body("x"), None)
        .await
        .unwrap();
    assert_eq!(transport.binding_count().await, 0);
}

#[tokio::test]
async fn test_close_fails_later_calls() {
    let transport = MemoryTransport::new();
    let mut consumer = transport.consume("events", "#").await.unwrap();

    transport.close().await;
    assert!(transport.is_closed().await);

    // Live consumers observe end-of-stream.
    let next = timeout(Duration::from_secs(1), consumer.next())
        .await
        .expect("timed out");
    assert!(next.is_none());

    let err = transport
        .publish("events", "x", body("x"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Connection(_)));

    assert!(matches!(
        transport.consume("events", "#").await.unwrap_err(),
        TransportError::Connection(_)
    ));
    assert!(matches!(
        transport.reply_queue().await.unwrap_err(),
        TransportError::Connection(_)
    ));
    assert!(matches!(
        transport
            .send_reply(&ReplyAddress::new("reply.x"), body("x"))
            .await
            .unwrap_err(),
        TransportError::Connection(_)
    ));
}
