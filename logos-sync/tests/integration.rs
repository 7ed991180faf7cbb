//! Integration tests for end-to-end WebSocket sync.
//!
//! These tests start a real server and connect real clients,
//! verifying the handshake, live fan-out and catch-up over the wire.

use logos_sync::{Epoch, Message, RoomName, ServerConfig, SubscriptionEntry, SyncServer, SESSION_HEADER};

use futures_util::{SinkExt, StreamExt};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Start a server on a free port, return the port and its storage dir.
async fn start_test_server() -> (u16, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let server = SyncServer::new(ServerConfig::for_testing(dir.path())).unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    (port, dir)
}

struct WsClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    session: String,
}

impl WsClient {
    async fn connect(port: u16, session: Option<&str>) -> Self {
        let url = match session {
            Some(id) => format!("ws://127.0.0.1:{port}/?session={id}"),
            None => format!("ws://127.0.0.1:{port}/"),
        };
        let (ws, response) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let session = response
            .headers()
            .get(SESSION_HEADER)
            .expect("session header")
            .to_str()
            .unwrap()
            .to_string();
        Self { ws, session }
    }

    async fn send(&mut self, message: &Message) {
        self.ws
            .send(WsMessage::Binary(message.encode().into()))
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> Message {
        loop {
            let frame = timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("stream ended")
                .unwrap();
            if let WsMessage::Binary(data) = frame {
                let mut messages = Message::decode_frame(&data).unwrap();
                assert_eq!(messages.len(), 1);
                return messages.remove(0);
            }
        }
    }

    async fn recv_until(&mut self, done: impl Fn(&Message) -> bool) -> Vec<Message> {
        let mut seen = Vec::new();
        loop {
            let message = self.recv().await;
            let finished = done(&message);
            seen.push(message);
            if finished {
                return seen;
            }
        }
    }

    /// Subscribe from scratch; returns the room epoch the server reports.
    async fn subscribe(&mut self, confirmation: u64, room: &RoomName) -> Epoch {
        self.send(&Message::Subscribe {
            confirmation,
            entries: vec![SubscriptionEntry {
                room: room.clone(),
                offset: 0,
                epoch: Epoch(0),
            }],
        })
        .await;
        match self.recv().await {
            Message::SubscribeConfirm { entries } => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].offset, 0);
                entries[0].epoch
            }
            other => panic!("expected SubscribeConfirm, got {other:?}"),
        }
    }

    async fn publish(&mut self, confirmation: u64, room: &RoomName, payload: &[u8]) {
        self.send(&Message::Update {
            confirmation,
            room: room.clone(),
            payload: payload.to_vec(),
        })
        .await;
    }
}

fn room(name: &str) -> RoomName {
    RoomName::new(name).unwrap()
}

// ─── Handshake ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_server_assigns_session() {
    let (port, _dir) = start_test_server().await;
    let a = WsClient::connect(port, None).await;
    let b = WsClient::connect(port, None).await;
    assert!(a.session.parse::<uuid::Uuid>().is_ok());
    assert_ne!(a.session, b.session);
}

#[tokio::test]
async fn test_malformed_session_rejected() {
    let (port, _dir) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}/?session=not-a-uuid");
    assert!(tokio_tungstenite::connect_async(&url).await.is_err());
}

#[tokio::test]
async fn test_unknown_session_gets_fresh_id() {
    let (port, _dir) = start_test_server().await;
    let stale = uuid::Uuid::new_v4().to_string();
    let client = WsClient::connect(port, Some(&stale)).await;
    assert_ne!(client.session, stale);
}

// ─── Live Sync ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_update_fans_out_to_other_subscribers() {
    let (port, _dir) = start_test_server().await;
    let doc = room("doc1");

    let mut a = WsClient::connect(port, None).await;
    let mut b = WsClient::connect(port, None).await;
    let epoch_a = a.subscribe(0, &doc).await;
    let epoch_b = b.subscribe(0, &doc).await;
    assert_eq!(epoch_a, epoch_b);
    assert_eq!(a.recv().await, Message::Confirmation { number: 0 });
    assert_eq!(b.recv().await, Message::Confirmation { number: 0 });

    a.publish(1, &doc, &[1, 2, 3]).await;

    assert_eq!(
        a.recv().await,
        Message::HostUnconfirmedByClient { confirmation: 1, offset: 3 }
    );
    assert_eq!(a.recv().await, Message::Confirmation { number: 1 });
    assert_eq!(
        a.recv().await,
        Message::ConfirmedByHost { room: doc.clone(), offset: 3 }
    );

    match b.recv().await {
        Message::Update { confirmation, room, payload } => {
            assert_eq!(confirmation, 0);
            assert_eq!(room, doc);
            assert_eq!(payload, vec![1, 2, 3]);
        }
        other => panic!("expected Update, got {other:?}"),
    }
    assert_eq!(
        b.recv().await,
        Message::ConfirmedByHost { room: doc, offset: 3 }
    );
    // Acknowledge the server's update.
    b.send(&Message::Confirmation { number: 0 }).await;
}

#[tokio::test]
async fn test_late_subscriber_catches_up() {
    let (port, _dir) = start_test_server().await;
    let doc = room("history");

    let mut writer = WsClient::connect(port, None).await;
    writer.publish(0, &doc, b"hello ").await;
    writer.publish(1, &doc, b"world").await;
    writer
        .recv_until(|m| matches!(m, Message::Confirmation { number: 1 }))
        .await;

    let mut reader = WsClient::connect(port, None).await;
    reader.subscribe(0, &doc).await;
    let seen = reader
        .recv_until(|m| matches!(m, Message::ConfirmedByHost { .. }))
        .await;
    let replayed: Vec<&Vec<u8>> = seen
        .iter()
        .filter_map(|m| match m {
            Message::Update { payload, .. } => Some(payload),
            _ => None,
        })
        .collect();
    assert_eq!(replayed, vec![&b"hello world".to_vec()]);
    assert!(seen.contains(&Message::ConfirmedByHost { room: doc, offset: 11 }));
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection() {
    let (port, _dir) = start_test_server().await;
    let mut client = WsClient::connect(port, None).await;

    client.ws.send(WsMessage::Binary(vec![0, 0, 0xff].into())).await.unwrap();
    client.subscribe(0, &room("still-alive")).await;
    assert_eq!(client.recv().await, Message::Confirmation { number: 0 });
}

// ─── Reconnect ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_second_connection_takes_over_session() {
    let (port, _dir) = start_test_server().await;
    let doc = room("handover");

    let mut first = WsClient::connect(port, None).await;
    first.subscribe(0, &doc).await;
    assert_eq!(first.recv().await, Message::Confirmation { number: 0 });

    let mut second = WsClient::connect(port, Some(&first.session)).await;
    assert_eq!(second.session, first.session);

    first.ws.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut writer = WsClient::connect(port, None).await;
    writer.publish(0, &doc, b"for you").await;

    match second.recv().await {
        Message::Update { payload, .. } => assert_eq!(payload, b"for you"),
        other => panic!("expected Update, got {other:?}"),
    }
}

// ─── Consistency ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_reused_update_confirmation_ends_session() {
    let (port, _dir) = start_test_server().await;
    let doc = room("dup");

    let mut client = WsClient::connect(port, None).await;
    client.publish(0, &doc, b"a").await;
    client.publish(0, &doc, b"b").await;
    client
        .recv_until(|m| matches!(m, Message::Confirmation { number: 0 }))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The next frame is refused and the server hangs up.
    let _ = client
        .ws
        .send(WsMessage::Binary(Message::Confirmation { number: 0 }.encode().into()))
        .await;
    let ended = timeout(Duration::from_secs(5), async {
        loop {
            match client.ws.next().await {
                None | Some(Err(_)) | Some(Ok(WsMessage::Close(_))) => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok());

    let again = WsClient::connect(port, Some(&client.session)).await;
    assert_ne!(again.session, client.session);
}
