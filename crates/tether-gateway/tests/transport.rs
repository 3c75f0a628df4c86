use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tether_gateway::{
    AckScript, ActivityRecorder, ConnectionState, GatewayError, LoopbackConnection,
    RealtimeTransport, SendOutcome, TransportConfig,
};
use tether_types::events::{JOIN_ROOM, SEND_ATTACHMENTS, SEND_MESSAGE};
use tether_types::media::LocalMedia;
use tether_types::{AttachmentKind, Author, Message, MessageId, RoomId};

fn author() -> Author {
    Author {
        id: "u1".into(),
        display_name: "Ada".into(),
    }
}

fn room() -> RoomId {
    RoomId::from("r1")
}

fn transport(conn: &LoopbackConnection) -> RealtimeTransport {
    RealtimeTransport::new(Arc::new(conn.clone()), TransportConfig::default(), None)
}

async fn wait_for_state(transport: &RealtimeTransport, want: ConnectionState) {
    for _ in 0..100 {
        if transport.state().await == want {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("transport never reached {:?}", want);
}

#[tokio::test(start_paused = true)]
async fn disconnected_send_publishes_exactly_one_failure_copy() {
    let conn = LoopbackConnection::new();
    let transport = transport(&conn);
    let mut stream = transport.subscribe(&room()).await;

    let message = Message::text(room(), &author(), "hello");
    let outcome = transport.send(&room(), message.clone()).await;

    let SendOutcome::Failed { message: failed, .. } = outcome else {
        panic!("expected failure");
    };
    assert!(failed.failed);
    assert_eq!(failed.id, message.id);
    assert_eq!(failed.text, message.text);

    let published = stream.recv().await.unwrap();
    assert_eq!(published, failed);
    assert!(
        tokio::time::timeout(Duration::from_millis(50), stream.recv())
            .await
            .is_err()
    );
    assert!(conn.emitted_payloads(SEND_MESSAGE).is_empty());
}

#[tokio::test]
async fn duplicate_ack_counts_as_delivered() {
    let conn = LoopbackConnection::new();
    conn.script_ack(AckScript::Reply(json!({ "ok": false, "isDuplicate": true, "seq": 9 })));
    let transport = transport(&conn);
    transport.connect().await.unwrap();

    let outcome = transport.send(&room(), Message::text(room(), &author(), "again")).await;
    match outcome {
        SendOutcome::Delivered {
            message,
            seq,
            duplicate,
        } => {
            assert!(duplicate);
            assert_eq!(seq, Some(9));
            assert_eq!(message.seq, Some(9));
            assert!(!message.failed);
        }
        SendOutcome::Failed { reason, .. } => panic!("unexpected failure: {}", reason),
    }
}

#[tokio::test]
async fn rejected_ack_publishes_failure() {
    let conn = LoopbackConnection::new();
    conn.script_ack(AckScript::Reply(json!({ "ok": false, "error": "banned" })));
    let transport = transport(&conn);
    transport.connect().await.unwrap();
    let mut stream = transport.subscribe(&room()).await;

    let outcome = transport.send(&room(), Message::text(room(), &author(), "hi")).await;
    let SendOutcome::Failed { reason, .. } = outcome else {
        panic!("expected failure");
    };
    assert_eq!(reason, "banned");
    assert!(stream.recv().await.unwrap().failed);
}

#[tokio::test(start_paused = true)]
async fn text_send_times_out_after_five_seconds() {
    let conn = LoopbackConnection::new();
    conn.script_ack(AckScript::Silent);
    let transport = transport(&conn);
    transport.connect().await.unwrap();

    let started = tokio::time::Instant::now();
    let outcome = transport.send(&room(), Message::text(room(), &author(), "slow")).await;
    assert!(!outcome.is_delivered());
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn attachment_send_waits_fifteen_seconds() {
    let conn = LoopbackConnection::new();
    conn.script_ack(AckScript::Silent);
    let transport = transport(&conn);
    transport.connect().await.unwrap();

    let mut message = Message::text(room(), &author(), "look");
    message.attachments.push(tether_types::Attachment {
        kind: AttachmentKind::Image,
        index: 0,
        thumbnail: "https://cdn/t.jpg".into(),
        original: "https://cdn/o.jpg".into(),
        width: 640,
        height: 480,
        byte_size: 1024,
        content_hash: "ab".into(),
        perceptual_hash: None,
        duration_ms: None,
    });

    let started = tokio::time::Instant::now();
    let outcome = transport.send_attachments_meta(&room(), message).await;
    assert!(!outcome.is_delivered());
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(15) && waited < Duration::from_secs(16));

    let payload = &conn.emitted_payloads(SEND_ATTACHMENTS)[0];
    assert_eq!(payload["attachments"][0]["originalPath"], "https://cdn/o.jpg");
    assert!(payload.get("seq").is_none());
}

#[tokio::test(start_paused = true)]
async fn concurrent_connects_share_one_attempt() {
    let conn = LoopbackConnection::new();
    conn.set_open_delay(Duration::from_millis(100));
    let transport = transport(&conn);

    let (a, b) = tokio::join!(transport.connect(), transport.connect());
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(conn.open_count(), 1);

    transport.close().await;
    conn.fail_next_opens(1);
    let (a, b) = tokio::join!(transport.connect(), transport.connect());
    assert!(matches!(a, Err(GatewayError::ConnectFailed(_))));
    assert_eq!(a, b);
    assert_eq!(conn.open_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn cancelled_connect_does_not_strand_later_callers() {
    let conn = LoopbackConnection::new();
    conn.set_open_delay(Duration::from_millis(200));
    let transport = transport(&conn);

    let first = tokio::spawn({
        let transport = transport.clone();
        async move { transport.connect().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    first.abort();
    assert!(first.await.unwrap_err().is_cancelled());

    let second = tokio::time::timeout(Duration::from_secs(2), transport.connect()).await;
    assert_eq!(second.expect("connect stuck after a cancelled attempt"), Ok(()));
    assert_eq!(transport.state().await, ConnectionState::Connected);
    assert_eq!(conn.open_count(), 1);
}

#[tokio::test]
async fn dropped_connection_rejoins_on_reconnect() {
    let conn = LoopbackConnection::new();
    let transport = transport(&conn);
    transport.connect().await.unwrap();
    transport.join_room(&room()).await.unwrap();

    conn.drop_connection();
    wait_for_state(&transport, ConnectionState::Disconnected).await;
    assert_eq!(transport.pending_joins().await, [room()]);

    transport.connect().await.unwrap();
    assert_eq!(conn.emitted_payloads(JOIN_ROOM).len(), 2);
    assert!(transport.is_joined(&room()).await);
}

#[tokio::test]
async fn last_unsubscribe_ends_streams() {
    let conn = LoopbackConnection::new();
    let transport = transport(&conn);
    let mut first = transport.subscribe(&room()).await;
    let mut second = transport.subscribe(&room()).await;
    assert_eq!(transport.subscriber_count(&room()).await, 2);
    assert_eq!(conn.listener_count("chat_message"), 1);

    transport.unsubscribe(&room()).await;
    assert_eq!(conn.listener_count("chat_message"), 1);

    transport.unsubscribe(&room()).await;
    assert_eq!(transport.subscriber_count(&room()).await, 0);
    assert_eq!(conn.listener_count("chat_message"), 0);
    assert!(first.recv().await.is_none());
    assert!(second.recv().await.is_none());
}

#[derive(Default)]
struct Recorder(Mutex<Vec<(RoomId, MessageId)>>);

#[async_trait]
impl ActivityRecorder for Recorder {
    async fn record_activity(&self, room_id: &RoomId, message: &Message) {
        self.0.lock().unwrap().push((room_id.clone(), message.id.clone()));
    }
}

#[tokio::test]
async fn accepted_sends_reach_the_activity_recorder() {
    let conn = LoopbackConnection::new();
    let recorder = Arc::new(Recorder::default());
    let transport = RealtimeTransport::new(
        Arc::new(conn.clone()),
        TransportConfig::default(),
        Some(recorder.clone()),
    );
    transport.connect().await.unwrap();

    let message = Message::text(room(), &author(), "ok");
    assert!(transport.send(&room(), message.clone()).await.is_delivered());

    conn.script_ack(AckScript::Fail(GatewayError::Closed));
    assert!(!transport.send(&room(), Message::text(room(), &author(), "lost")).await.is_delivered());

    assert_eq!(*recorder.0.lock().unwrap(), [(room(), message.id)]);
}

#[tokio::test]
async fn synthesized_attachment_is_published_with_local_hash() {
    let dir = std::env::temp_dir().join(format!("tether-gw-{}", MessageId::generate()));
    std::fs::create_dir_all(&dir).unwrap();
    let path: PathBuf = dir.join("photo.jpg");
    std::fs::File::create(&path).unwrap().write_all(b"abc").unwrap();

    let conn = LoopbackConnection::new();
    let transport = transport(&conn);
    let mut stream = transport.subscribe(&room()).await;

    let files = [LocalMedia {
        path: path.clone(),
        thumbnail_path: None,
        kind: AttachmentKind::Image,
        width: 1,
        height: 1,
        duration_ms: None,
    }];
    let message = transport
        .synthesize_failed_attachment(&room(), &author(), &files, Some("caption".into()))
        .await;

    assert!(message.failed);
    assert_eq!(message.attachments[0].byte_size, 3);
    assert_eq!(
        message.attachments[0].content_hash,
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
    assert_eq!(stream.recv().await.unwrap(), message);
    assert!(conn.emitted().is_empty());

    std::fs::remove_dir_all(dir).unwrap();
}
