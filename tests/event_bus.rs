use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use murmur_client::api::events::NEW_MESSAGE;
use murmur_client::api::models::OutboundChat;
use murmur_client::{ChatTransport, ConnectionState, Error, EventBus, ReconnectPolicy};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

struct Loopback {
    url: Url,
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<Message>,
}

/// A one-connection websocket server that records what the client writes
/// and forwards whatever the test queues.
async fn loopback() -> Loopback {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = Url::parse(&format!("ws://{}/ws", listener.local_addr().unwrap())).unwrap();
    let (in_tx, from_client) = mpsc::unbounded_channel();
    let (to_client, mut out_rx) = mpsc::unbounded_channel::<Message>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (mut sink, mut source) = ws.split();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
        });
        while let Some(Ok(frame)) = source.next().await {
            if let Message::Text(text) = frame {
                let _ = in_tx.send(text);
            }
        }
    });

    Loopback { url, from_client, to_client }
}

/// Closes the first `drops` sessions right after the handshake. If `then`
/// is set, the next session receives those frames and stays open; otherwise
/// the listener goes away and later connects are refused.
async fn dropping_server(drops: usize, then: Option<Vec<Message>>) -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = Url::parse(&format!("ws://{}/ws", listener.local_addr().unwrap())).unwrap();

    tokio::spawn(async move {
        for _ in 0..drops {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = ws.close(None).await;
            while let Some(Ok(_)) = ws.next().await {}
        }
        let Some(frames) = then else {
            return;
        };
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        for frame in frames {
            ws.send(frame).await.unwrap();
        }
        while let Some(Ok(_)) = ws.next().await {}
    });

    url
}

async fn wait_for_state(bus: &EventBus, want: ConnectionState) {
    timeout(Duration::from_secs(5), async {
        while bus.state() != Some(want) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("state never reached");
}

#[tokio::test]
async fn pushes_reach_subscribers_in_arrival_order() {
    let server = loopback().await;
    let bus = EventBus::new(server.url.clone());
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let _sub = bus.subscribe(NEW_MESSAGE, move |payload: &Value| {
        let _ = tx.send(payload.clone());
    });

    bus.connect().await.unwrap();
    assert_eq!(bus.state(), Some(ConnectionState::Open));

    for raw in [
        r#"{"event":"new_message","payload":{"n":1}}"#,
        "definitely not json",
        r#"{"type":"new_message","data":{"n":2}}"#,
    ] {
        server.to_client.send(Message::Text(raw.to_string())).unwrap();
    }

    let first = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    let second = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(first, json!({"n": 1}));
    assert_eq!(second, json!({"n": 2}));
    bus.disconnect();
}

#[tokio::test]
async fn chat_frames_reach_the_server() {
    let mut server = loopback().await;
    let bus = EventBus::new(server.url.clone());
    bus.connect().await.unwrap();

    let frame = OutboundChat { recipient_id: "peer".into(), content: "hello".into() };
    bus.send_chat(&frame).unwrap();

    let raw = timeout(Duration::from_secs(5), server.from_client.recv()).await.unwrap().unwrap();
    let received: OutboundChat = serde_json::from_str(&raw).unwrap();
    assert_eq!(received, frame);
    bus.disconnect();
}

#[tokio::test]
async fn server_close_is_not_reconnected_by_default() {
    let server = loopback().await;
    let bus = EventBus::new(server.url.clone());
    bus.connect().await.unwrap();

    server.to_client.send(Message::Close(None)).unwrap();
    wait_for_state(&bus, ConnectionState::Closed).await;

    let frame = OutboundChat { recipient_id: "peer".into(), content: "late".into() };
    assert!(matches!(bus.send_chat(&frame), Err(Error::NotConnected)));
}

#[tokio::test]
async fn disconnect_closes_and_connect_is_single_use() {
    let server = loopback().await;
    let bus = EventBus::new(server.url.clone());
    let _sub = bus.subscribe(NEW_MESSAGE, |_: &Value| {});
    bus.connect().await.unwrap();

    bus.disconnect();
    bus.disconnect();
    assert_eq!(bus.state(), Some(ConnectionState::Closed));
    assert_eq!(bus.subscriber_count(NEW_MESSAGE), 0);
    assert!(matches!(bus.connect().await, Err(Error::AlreadyConnected)));
}

#[tokio::test]
async fn dropped_session_is_reopened_under_fixed_policy() {
    let push = Message::Text(r#"{"event":"new_message","payload":7}"#.to_string());
    let url = dropping_server(1, Some(vec![push])).await;
    let bus = EventBus::with_reconnect(url, ReconnectPolicy::Fixed { max_attempts: 3, delay_ms: 20 });
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let _sub = bus.subscribe(NEW_MESSAGE, move |payload: &Value| {
        let _ = tx.send(payload.clone());
    });

    bus.connect().await.unwrap();

    let payload = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(payload, json!(7));
    assert_eq!(bus.state(), Some(ConnectionState::Open));
    assert_eq!(bus.subscriber_count(NEW_MESSAGE), 1);
    bus.disconnect();
}

#[tokio::test]
async fn exhausted_reconnects_leave_the_bus_closed() {
    let url = dropping_server(1, None).await;
    let bus = EventBus::with_reconnect(url, ReconnectPolicy::Fixed { max_attempts: 2, delay_ms: 10 });
    bus.connect().await.unwrap();

    wait_for_state(&bus, ConnectionState::Closed).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(bus.state(), Some(ConnectionState::Closed));

    let frame = OutboundChat { recipient_id: "peer".into(), content: "late".into() };
    assert!(matches!(bus.send_chat(&frame), Err(Error::NotConnected)));
}
