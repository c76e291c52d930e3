//! End-to-end client scenarios against a scripted broker over in-memory
//! duplex transports.

mod common;

use common::*;
use photon::{AsyncClient, ConnectOptions, MessageHandler, Qos, ReasonCode, SystemClock};
use std::sync::Arc;
use tokio::sync::mpsc;

fn client_with(streams: Vec<Option<tokio::io::DuplexStream>>) -> (AsyncClient, Arc<ScriptedConnector>) {
    let connector = ScriptedConnector::new(streams);
    let client = AsyncClient::with_connector(
        "tcp://broker:1883",
        "test-client",
        Box::new(SharedMemoryStore::new()),
        connector.clone(),
        SystemClock,
    )
    .unwrap();
    (client, connector)
}

fn no_keepalive() -> ConnectOptions {
    ConnectOptions {
        keep_alive_interval: 0,
        ..ConnectOptions::default()
    }
}

#[tokio::test]
async fn qos1_publish_completes_on_puback() {
    let (client_half, mut broker) = tokio::io::duplex(1024);
    let (client, _) = client_with(vec![Some(client_half)]);

    let broker_task = tokio::spawn(async move {
        accept_connect(&mut broker, false, 0).await;
        let (first, body) = expect_frame(&mut broker, PUBLISH).await;
        let publish = parse_publish(first, &body);
        assert_eq!(publish.topic, "sensors/temp");
        assert_eq!(publish.payload, b"21.5");
        assert_eq!(publish.qos, 1);
        assert!(!publish.dup);
        let id = publish.message_id.unwrap();
        send(&mut broker, &puback(id)).await;
        broker
    });

    client.connect(no_keepalive()).unwrap().wait().await.unwrap();
    assert!(client.is_connected());

    let token = client
        .publish("sensors/temp", "21.5", Qos::AtLeastOnce, false)
        .unwrap();
    token.wait().await.unwrap();
    assert_eq!(client.in_flight_message_count(), 0);
    assert!(token.error().is_none());

    let _broker = broker_task.await.unwrap();
    client.close(true).unwrap();
}

#[tokio::test]
async fn qos0_publish_completes_after_write() {
    let (client_half, mut broker) = tokio::io::duplex(1024);
    let (client, _) = client_with(vec![Some(client_half)]);

    let broker_task = tokio::spawn(async move {
        accept_connect(&mut broker, false, 0).await;
        let (first, body) = expect_frame(&mut broker, PUBLISH).await;
        let publish = parse_publish(first, &body);
        assert_eq!(publish.qos, 0);
        assert!(publish.message_id.is_none());
        assert_eq!(publish.payload, b"fire-and-forget");
        broker
    });

    client.connect(no_keepalive()).unwrap().wait().await.unwrap();
    client
        .publish("events", "fire-and-forget", Qos::AtMostOnce, false)
        .unwrap()
        .wait()
        .await
        .unwrap();
    let _broker = broker_task.await.unwrap();
    client.close(true).unwrap();
}

#[tokio::test]
async fn qos2_publish_walks_rec_rel_comp() {
    let (client_half, mut broker) = tokio::io::duplex(1024);
    let (client, _) = client_with(vec![Some(client_half)]);

    let broker_task = tokio::spawn(async move {
        accept_connect(&mut broker, false, 0).await;
        let (first, body) = expect_frame(&mut broker, PUBLISH).await;
        let publish = parse_publish(first, &body);
        assert_eq!(publish.qos, 2);
        let id = publish.message_id.unwrap();
        send(&mut broker, &pubrec(id)).await;
        let (_, body) = expect_frame(&mut broker, PUBREL).await;
        assert_eq!(message_id_of(&body), id);
        send(&mut broker, &pubcomp(id)).await;
        broker
    });

    client.connect(no_keepalive()).unwrap().wait().await.unwrap();
    client
        .publish("x", "", Qos::ExactlyOnce, false)
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(client.in_flight_message_count(), 0);
    let _broker = broker_task.await.unwrap();
    client.close(true).unwrap();
}

#[tokio::test]
async fn subscribe_grants_and_dispatches_per_matching_filter() {
    let (client_half, mut broker) = tokio::io::duplex(1024);
    let (client, _) = client_with(vec![Some(client_half)]);

    let broker_task = tokio::spawn(async move {
        accept_connect(&mut broker, false, 0).await;
        let (_, body) = expect_frame(&mut broker, SUBSCRIBE).await;
        let (id, filters) = parse_subscribe(&body);
        assert_eq!(
            filters,
            vec![("a/+".to_string(), 1), ("a/#".to_string(), 2)]
        );
        send(&mut broker, &suback(id, &[1, 2])).await;
        // Matches both filters, then only the multi-level one.
        send(&mut broker, &broker_publish("a/b", b"both", 0, None)).await;
        send(&mut broker, &broker_publish("a/b/c", b"deep", 0, None)).await;
        broker
    });

    client.connect(no_keepalive()).unwrap().wait().await.unwrap();

    let (hits_tx, mut hits_rx) = mpsc::unbounded_channel();
    let handlers: Vec<Option<MessageHandler>> = ["a/+", "a/#"]
        .iter()
        .map(|filter| {
            let hits_tx = hits_tx.clone();
            let filter = (*filter).to_string();
            Some(Arc::new(move |message: &photon::Message| {
                hits_tx.send((filter.clone(), message.topic.clone())).unwrap();
            }) as MessageHandler)
        })
        .collect();

    let token = client
        .subscribe_with_handlers(&[("a/+", Qos::AtLeastOnce), ("a/#", Qos::ExactlyOnce)], handlers)
        .unwrap();
    token.wait().await.unwrap();
    assert_eq!(token.granted_qos(), vec![1, 2]);

    let mut arrivals = Vec::new();
    for _ in 0..3 {
        arrivals.push(hits_rx.recv().await.unwrap());
    }
    arrivals.sort();
    assert_eq!(
        arrivals,
        vec![
            ("a/#".to_string(), "a/b".to_string()),
            ("a/#".to_string(), "a/b/c".to_string()),
            ("a/+".to_string(), "a/b".to_string()),
        ]
    );

    let _broker = broker_task.await.unwrap();
    client.close(true).unwrap();
}

#[tokio::test]
async fn failed_grant_fails_token_and_drops_handlers() {
    let (client_half, mut broker) = tokio::io::duplex(1024);
    let (client, _) = client_with(vec![Some(client_half)]);

    let broker_task = tokio::spawn(async move {
        accept_connect(&mut broker, false, 0).await;
        let (_, body) = expect_frame(&mut broker, SUBSCRIBE).await;
        let (id, _) = parse_subscribe(&body);
        send(&mut broker, &suback(id, &[0x80])).await;
        broker
    });

    client.connect(no_keepalive()).unwrap().wait().await.unwrap();
    let token = client.subscribe(&[("denied/#", Qos::AtLeastOnce)]).unwrap();
    let err = token.wait().await.unwrap_err();
    assert_eq!(err.reason_code(), ReasonCode::SubscribeFailed);
    assert_eq!(token.granted_qos(), vec![0x80]);

    let _broker = broker_task.await.unwrap();
    client.close(true).unwrap();
}

#[tokio::test]
async fn unsubscribe_completes_on_unsuback() {
    let (client_half, mut broker) = tokio::io::duplex(1024);
    let (client, _) = client_with(vec![Some(client_half)]);

    let broker_task = tokio::spawn(async move {
        accept_connect(&mut broker, false, 0).await;
        let (_, body) = expect_frame(&mut broker, SUBSCRIBE).await;
        send(&mut broker, &suback(message_id_of(&body), &[0])).await;
        let (_, body) = expect_frame(&mut broker, UNSUBSCRIBE).await;
        send(&mut broker, &unsuback(message_id_of(&body))).await;
        broker
    });

    client.connect(no_keepalive()).unwrap().wait().await.unwrap();
    client
        .subscribe(&[("a/b", Qos::AtMostOnce)])
        .unwrap()
        .wait()
        .await
        .unwrap();
    client.unsubscribe(&["a/b"]).unwrap().wait().await.unwrap();

    let _broker = broker_task.await.unwrap();
    client.close(true).unwrap();
}

#[tokio::test]
async fn second_uri_wins_when_first_refuses() {
    let (client_half, mut broker) = tokio::io::duplex(1024);
    let (client, connector) = client_with(vec![None, Some(client_half)]);

    let broker_task = tokio::spawn(async move {
        accept_connect(&mut broker, false, 0).await;
        broker
    });

    let options = ConnectOptions {
        keep_alive_interval: 0,
        server_uris: vec!["tcp://bad:1883".into(), "tcp://good:1883".into()],
        ..ConnectOptions::default()
    };
    client.connect(options).unwrap().wait().await.unwrap();
    assert_eq!(connector.attempts(), 2);
    assert_eq!(client.current_server_uri().unwrap(), "tcp://good:1883");

    let _broker = broker_task.await.unwrap();
    client.close(true).unwrap();
}

#[tokio::test]
async fn broker_rejection_is_classified() {
    let (client_half, mut broker) = tokio::io::duplex(1024);
    let (client, _) = client_with(vec![Some(client_half)]);

    tokio::spawn(async move {
        accept_connect(&mut broker, false, 4).await;
        broker
    });

    let err = client
        .connect(no_keepalive())
        .unwrap()
        .wait()
        .await
        .unwrap_err();
    assert_eq!(err.reason_code(), ReasonCode::FailedAuthentication);
    assert!(!client.is_connected());
    // The client is reusable after a failed connect.
    client.close(false).unwrap();
}

#[tokio::test]
async fn state_prechecks_guard_the_api() {
    let (client_half, mut broker) = tokio::io::duplex(1024);
    let (client, _) = client_with(vec![Some(client_half)]);

    // Not connected, no buffer: publish and subscribe are refused.
    let err = client
        .publish("t", "x", Qos::AtMostOnce, false)
        .unwrap_err();
    assert_eq!(err.reason_code(), ReasonCode::ClientNotConnected);
    let err = client.subscribe(&[("t", Qos::AtMostOnce)]).unwrap_err();
    assert_eq!(err.reason_code(), ReasonCode::ClientNotConnected);

    let broker_task = tokio::spawn(async move {
        accept_connect(&mut broker, false, 0).await;
        expect_frame(&mut broker, DISCONNECT).await;
        broker
    });

    client.connect(no_keepalive()).unwrap().wait().await.unwrap();
    let err = client.connect(no_keepalive()).unwrap_err();
    assert_eq!(err.reason_code(), ReasonCode::ClientConnected);

    client.disconnect().unwrap().wait().await.unwrap();
    assert!(!client.is_connected());

    let _broker = broker_task.await.unwrap();
    client.close(false).unwrap();
    let err = client.connect(no_keepalive()).unwrap_err();
    assert_eq!(err.reason_code(), ReasonCode::ClientClosed);
}

#[tokio::test]
async fn invalid_topics_are_rejected_before_send() {
    let (client, _) = client_with(vec![]);
    for topic in ["", "a/+/c", "a/#"] {
        let err = client
            .publish(topic, "x", Qos::AtMostOnce, false)
            .unwrap_err();
        assert_eq!(err.reason_code(), ReasonCode::InvalidTopic);
    }
    let err = client.subscribe(&[("a/#/b", Qos::AtMostOnce)]).unwrap_err();
    assert_eq!(err.reason_code(), ReasonCode::InvalidTopic);
}

#[tokio::test]
async fn inbound_qos1_is_acked_and_dispatched_to_default_callback() {
    let (client_half, mut broker) = tokio::io::duplex(1024);
    let (client, _) = client_with(vec![Some(client_half)]);

    struct Events {
        arrived: mpsc::UnboundedSender<photon::Message>,
    }
    impl photon::ClientEvents for Events {
        fn message_arrived(&self, message: &photon::Message) {
            self.arrived.send(message.clone()).unwrap();
        }
    }
    let (arrived_tx, mut arrived_rx) = mpsc::unbounded_channel();
    client.set_callback(Arc::new(Events { arrived: arrived_tx }));

    let broker_task = tokio::spawn(async move {
        accept_connect(&mut broker, false, 0).await;
        send(&mut broker, &broker_publish("inbox", b"ping", 1, Some(41))).await;
        // Client must PUBACK id 41.
        let (first, body) = read_frame(&mut broker).await;
        assert_eq!(first >> 4, 4);
        assert_eq!(message_id_of(&body), 41);
        broker
    });

    client.connect(no_keepalive()).unwrap().wait().await.unwrap();
    let message = arrived_rx.recv().await.unwrap();
    assert_eq!(message.topic, "inbox");
    assert_eq!(message.payload, b"ping");
    assert_eq!(message.qos, Qos::AtLeastOnce);

    let _broker = broker_task.await.unwrap();
    client.close(true).unwrap();
}

#[tokio::test]
async fn inbound_qos2_duplicate_dispatches_once() {
    let (client_half, mut broker) = tokio::io::duplex(1024);
    let (client, _) = client_with(vec![Some(client_half)]);

    struct Events {
        arrived: mpsc::UnboundedSender<String>,
    }
    impl photon::ClientEvents for Events {
        fn message_arrived(&self, message: &photon::Message) {
            self.arrived.send(message.topic.clone()).unwrap();
        }
    }
    let (arrived_tx, mut arrived_rx) = mpsc::unbounded_channel();
    client.set_callback(Arc::new(Events { arrived: arrived_tx }));

    let broker_task = tokio::spawn(async move {
        accept_connect(&mut broker, false, 0).await;
        send(&mut broker, &broker_publish("exactly", b"once", 2, Some(7))).await;
        let (first, _) = read_frame(&mut broker).await;
        assert_eq!(first >> 4, 5, "PUBREC expected");
        // Broker retransmits the publish before releasing.
        send(&mut broker, &broker_publish("exactly", b"once", 2, Some(7))).await;
        let (first, _) = read_frame(&mut broker).await;
        assert_eq!(first >> 4, 5, "second PUBREC expected");
        send(&mut broker, &pubrel(7)).await;
        let (first, body) = read_frame(&mut broker).await;
        assert_eq!(first >> 4, 7, "PUBCOMP expected");
        assert_eq!(message_id_of(&body), 7);
        broker
    });

    client.connect(no_keepalive()).unwrap().wait().await.unwrap();
    assert_eq!(arrived_rx.recv().await.unwrap(), "exactly");
    let _broker = broker_task.await.unwrap();
    // No second dispatch happened.
    assert!(arrived_rx.try_recv().is_err());
    client.close(true).unwrap();
}

#[tokio::test]
async fn offline_publishes_fail_without_buffer_and_queue_with_it() {
    let (client, _) = client_with(vec![]);
    let err = client
        .publish("t", "lost", Qos::AtLeastOnce, false)
        .unwrap_err();
    assert_eq!(err.reason_code(), ReasonCode::ClientNotConnected);

    client.set_buffer_opts(photon::BufferOptions::enabled(2, false));
    client.publish("t", "one", Qos::AtLeastOnce, false).unwrap();
    client.publish("t", "two", Qos::AtLeastOnce, false).unwrap();
    assert_eq!(client.buffered_message_count(), 2);

    // Full buffer with reject policy fails the new token.
    let token = client.publish("t", "three", Qos::AtLeastOnce, false).unwrap();
    assert_eq!(
        token.error().unwrap().reason_code(),
        ReasonCode::DisconnectedBufferFull
    );
    assert_eq!(client.buffered_message_count(), 2);

    assert_eq!(client.buffered_message(0).unwrap().payload, b"one");
    assert!(client.delete_buffered_message(1));
    assert_eq!(client.buffered_message_count(), 1);
}
