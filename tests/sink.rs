//! MQTT sink against an in-process broker

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use pretty_assertions::assert_eq;

use common::{fast_backoff, temperature, transfer, FakeBroker};
use uabridge::config::TransferSpec;
use uabridge::credentials::{Credential, Secret, StaticCredentials};
use uabridge::leg::LegStatus;
use uabridge::protocol::{ProtocolVersion, QoS, ReasonCode};
use uabridge::sink::{MqttSink, SinkError, SinkOptions};
use uabridge::translate::SinkMessage;

fn options() -> SinkOptions {
    SinkOptions {
        connect_timeout: Duration::from_secs(2),
        backoff: fast_backoff(3),
        channel_capacity: 16,
        max_inflight: 8,
        keep_alive: 30,
    }
}

fn message(topic: &str, payload: &'static str, qos: QoS) -> SinkMessage {
    SinkMessage {
        topic: topic.to_string(),
        payload: Bytes::from_static(payload.as_bytes()),
        qos,
        retain: false,
    }
}

fn spec(broker: &FakeBroker, qos: QoS) -> TransferSpec {
    transfer("tp-1", vec![temperature()], &broker.url(), qos)
}

fn clean_starts(broker: &FakeBroker) -> Vec<bool> {
    broker.connects().iter().map(|c| c.clean_start).collect()
}

async fn open(spec: &TransferSpec, options: SinkOptions) -> MqttSink {
    MqttSink::open(spec, Arc::new(StaticCredentials::default()), options)
        .await
        .unwrap()
}

#[tokio::test]
async fn qos0_resolves_once_written() {
    let broker = FakeBroker::start().await;
    let mut sink = open(&spec(&broker, QoS::AtMostOnce), options()).await;
    assert_eq!(sink.health(), LegStatus::Up);

    sink.publish(message("plant/a", "1", QoS::AtMostOnce))
        .await
        .unwrap();

    let publishes = broker.wait_for_publishes(1).await;
    assert_eq!(publishes[0].topic, "plant/a");
    assert_eq!(publishes[0].packet_id, None);
    assert_eq!(broker.connects()[0].client_id, "uabridge-tp-1");

    sink.close(Duration::from_secs(1)).await.unwrap();
    assert_eq!(sink.health(), LegStatus::Closed);
}

#[tokio::test]
async fn qos1_resolves_on_puback() {
    let broker = FakeBroker::start().await;
    let mut sink = open(&spec(&broker, QoS::AtLeastOnce), options()).await;

    sink.publish(message("plant/a", "21.5", QoS::AtLeastOnce))
        .await
        .unwrap();

    let publishes = broker.publishes();
    assert_eq!(publishes.len(), 1);
    assert_eq!(publishes[0].qos, QoS::AtLeastOnce);
    assert_eq!(publishes[0].payload, Bytes::from_static(b"21.5"));
    assert!(!publishes[0].dup);
    assert_eq!(sink.pending(), 0);

    sink.close(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn qos2_completes_the_release_handshake() {
    let broker = FakeBroker::start().await;
    let mut sink = open(&spec(&broker, QoS::ExactlyOnce), options()).await;

    sink.publish(message("plant/a", "x", QoS::ExactlyOnce))
        .await
        .unwrap();

    assert_eq!(broker.publishes().len(), 1);
    assert_eq!(broker.releases(), 1);
    sink.close(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn rejected_publish_does_not_stop_the_sink() {
    let broker = FakeBroker::start().await;
    broker.reject_topic("plant/secret", ReasonCode::NOT_AUTHORIZED);
    let mut spec = spec(&broker, QoS::AtLeastOnce);
    spec.sink.protocol_version = ProtocolVersion::V5;
    let mut sink = open(&spec, options()).await;

    let err = sink
        .publish(message("plant/secret", "1", QoS::AtLeastOnce))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        SinkError::PublishRejected {
            topic: "plant/secret".to_string(),
            reason: ReasonCode::NOT_AUTHORIZED,
        }
    );

    sink.publish(message("plant/open", "2", QoS::AtLeastOnce))
        .await
        .unwrap();
    assert_eq!(sink.health(), LegStatus::Up);
    sink.close(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn full_buffer_fails_fast_with_backpressure() {
    let broker = FakeBroker::start().await;
    broker.withhold_acks(true);
    let options = SinkOptions {
        channel_capacity: 2,
        max_inflight: 1,
        ..options()
    };
    let mut sink = open(&spec(&broker, QoS::AtLeastOnce), options).await;

    let _first = sink
        .submit(message("plant/a", "1", QoS::AtLeastOnce))
        .unwrap();
    broker.wait_for_publishes(1).await;

    // The in-flight window is full, so these stay queued
    let _second = sink
        .submit(message("plant/a", "2", QoS::AtLeastOnce))
        .unwrap();
    let _third = sink
        .submit(message("plant/a", "3", QoS::AtLeastOnce))
        .unwrap();
    let err = sink
        .submit(message("plant/a", "4", QoS::AtLeastOnce))
        .unwrap_err();
    assert_eq!(err, SinkError::Backpressure);
    assert_eq!(sink.pending(), 3);

    let _ = sink.close(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn unacknowledged_publish_is_resent_with_dup_after_reconnect() {
    let broker = FakeBroker::start().await;
    broker.drop_at(1);
    let mut sink = open(&spec(&broker, QoS::AtLeastOnce), options()).await;

    sink.publish(message("plant/a", "21.5", QoS::AtLeastOnce))
        .await
        .unwrap();

    let publishes = broker.publishes();
    assert_eq!(publishes.len(), 2);
    assert!(!publishes[0].dup);
    assert!(publishes[1].dup);
    assert_eq!(publishes[0].packet_id, publishes[1].packet_id);
    assert_eq!(publishes[0].payload, publishes[1].payload);
    assert_eq!(clean_starts(&broker), vec![true, false]);
    assert_eq!(sink.health(), LegStatus::Up);

    sink.close(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn qos2_publish_is_resumed_after_reconnect() {
    let broker = FakeBroker::start().await;
    broker.drop_at(1);
    let mut sink = open(&spec(&broker, QoS::ExactlyOnce), options()).await;

    sink.publish(message("plant/a", "21.5", QoS::ExactlyOnce))
        .await
        .unwrap();

    let publishes = broker.publishes();
    assert_eq!(publishes.len(), 2);
    assert!(!publishes[0].dup);
    assert!(publishes[1].dup);
    assert_eq!(publishes[0].packet_id, publishes[1].packet_id);
    assert_eq!(broker.releases(), 1);
    assert_eq!(clean_starts(&broker), vec![true, false]);

    sink.close(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn release_is_repeated_in_a_resumed_session() {
    let broker = FakeBroker::start().await;
    broker.drop_release_at(1);
    let mut sink = open(&spec(&broker, QoS::ExactlyOnce), options()).await;

    sink.publish(message("plant/a", "21.5", QoS::ExactlyOnce))
        .await
        .unwrap();

    assert_eq!(broker.publishes().len(), 1);
    assert_eq!(broker.releases(), 2);
    assert_eq!(broker.connects().len(), 2);

    sink.close(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn release_pending_in_a_lost_session_counts_as_delivered() {
    let broker = FakeBroker::start().await;
    broker.forget_sessions();
    broker.drop_release_at(1);
    let mut sink = open(&spec(&broker, QoS::ExactlyOnce), options()).await;

    sink.publish(message("plant/a", "21.5", QoS::ExactlyOnce))
        .await
        .unwrap();

    // Accepted once; neither the publish nor the release is repeated
    assert_eq!(broker.publishes().len(), 1);
    assert_eq!(broker.releases(), 1);
    assert_eq!(broker.connects().len(), 2);
    assert_eq!(sink.pending(), 0);

    sink.close(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn publish_is_resent_as_new_when_the_session_is_gone() {
    let broker = FakeBroker::start().await;
    broker.forget_sessions();
    broker.drop_at(1);
    let mut sink = open(&spec(&broker, QoS::AtLeastOnce), options()).await;

    sink.publish(message("plant/a", "21.5", QoS::AtLeastOnce))
        .await
        .unwrap();

    let publishes = broker.publishes();
    assert_eq!(publishes.len(), 2);
    assert!(!publishes[1].dup);
    assert_eq!(publishes[0].payload, publishes[1].payload);

    sink.close(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn clean_start_spec_never_resumes() {
    let broker = FakeBroker::start().await;
    broker.drop_at(1);
    let mut spec = spec(&broker, QoS::AtLeastOnce);
    spec.sink.clean_start = true;
    let mut sink = open(&spec, options()).await;

    sink.publish(message("plant/a", "21.5", QoS::AtLeastOnce))
        .await
        .unwrap();

    assert_eq!(clean_starts(&broker), vec![true, true]);
    assert!(!broker.publishes()[1].dup);

    sink.close(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn v5_connect_asks_the_broker_to_keep_the_session() {
    let broker = FakeBroker::start().await;
    let mut spec = spec(&broker, QoS::AtLeastOnce);
    spec.sink.protocol_version = ProtocolVersion::V5;
    let mut sink = open(&spec, options()).await;

    let connect = &broker.connects()[0];
    assert!(connect.clean_start);
    assert!(connect.session_expiry_interval.is_some_and(|s| s > 0));

    sink.close(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn refused_connection_becomes_unavailable() {
    let broker = FakeBroker::start().await;
    broker.refuse_with(ReasonCode::NOT_AUTHORIZED);

    let err = MqttSink::open(
        &spec(&broker, QoS::AtLeastOnce),
        Arc::new(StaticCredentials::default()),
        options(),
    )
    .await
    .unwrap_err();

    match err {
        SinkError::Unavailable {
            attempts,
            last_error,
        } => {
            assert_eq!(attempts, 3);
            assert!(last_error.contains("refused"), "{}", last_error);
        }
        other => panic!("expected Unavailable, got {:?}", other),
    }
    assert_eq!(broker.connects().len(), 3);
}

#[tokio::test]
async fn credentials_are_presented_on_connect() {
    let broker = FakeBroker::start().await;
    let mut spec = spec(&broker, QoS::AtLeastOnce);
    spec.sink.credentials = Some("broker-login".to_string());
    let credentials = StaticCredentials::default().with(
        "broker-login",
        Credential::UserPassword {
            username: "bridge".to_string(),
            password: Secret::new("s3cret"),
        },
    );

    let mut sink = MqttSink::open(&spec, Arc::new(credentials), options())
        .await
        .unwrap();

    let connect = &broker.connects()[0];
    assert_eq!(connect.username.as_deref(), Some("bridge"));
    assert_eq!(connect.password, Some(Bytes::from_static(b"s3cret")));
    sink.close(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn close_flushes_accepted_publishes() {
    let broker = FakeBroker::start().await;
    let mut sink = open(&spec(&broker, QoS::AtLeastOnce), options()).await;

    let deliveries: Vec<_> = (0..5)
        .map(|i| {
            let topic = format!("plant/{}", i);
            sink.submit(SinkMessage {
                topic,
                payload: Bytes::from(i.to_string()),
                qos: QoS::AtLeastOnce,
                retain: false,
            })
            .unwrap()
        })
        .collect();

    sink.close(Duration::from_secs(2)).await.unwrap();
    for delivery in deliveries {
        assert_eq!(delivery.await, Ok(()));
    }
    assert_eq!(broker.publishes().len(), 5);
}

#[tokio::test]
async fn close_times_out_when_broker_never_acknowledges() {
    let broker = FakeBroker::start().await;
    broker.withhold_acks(true);
    let mut sink = open(&spec(&broker, QoS::AtLeastOnce), options()).await;

    let delivery = sink
        .submit(message("plant/a", "1", QoS::AtLeastOnce))
        .unwrap();
    broker.wait_for_publishes(1).await;

    let err = sink.close(Duration::from_millis(100)).await.unwrap_err();
    assert_eq!(err, SinkError::FlushTimeout { pending: 1 });
    assert_eq!(delivery.await, Err(SinkError::Closed));
    assert_eq!(
        sink.submit(message("plant/a", "2", QoS::AtLeastOnce))
            .unwrap_err(),
        SinkError::Closed
    );
}

#[tokio::test]
async fn close_with_nothing_pending_returns_at_once() {
    let broker = FakeBroker::start().await;
    let mut sink = open(&spec(&broker, QoS::AtLeastOnce), options()).await;
    sink.publish(message("plant/a", "1", QoS::AtLeastOnce))
        .await
        .unwrap();

    assert_eq!(sink.close(Duration::ZERO).await, Ok(()));
    assert_eq!(sink.health(), LegStatus::Closed);
}

#[tokio::test]
async fn abort_fails_unacknowledged_publishes() {
    let broker = FakeBroker::start().await;
    broker.withhold_acks(true);
    let mut sink = open(&spec(&broker, QoS::AtLeastOnce), options()).await;

    let delivery = sink
        .submit(message("plant/a", "1", QoS::AtLeastOnce))
        .unwrap();
    broker.wait_for_publishes(1).await;

    sink.abort().await;
    assert_eq!(delivery.await, Err(SinkError::Closed));
    assert_eq!(sink.health(), LegStatus::Closed);
    assert_eq!(sink.close(Duration::from_secs(1)).await, Ok(()));
}
