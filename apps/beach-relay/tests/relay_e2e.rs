use beach_relay::{
    serve, IceServer, Identity, IdentityIssuer, MessageRouter, RelayState, StaticIceServers,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct ScriptedIssuer(Mutex<VecDeque<&'static str>>);

impl IdentityIssuer for ScriptedIssuer {
    fn next(&self) -> Identity {
        let next = self
            .0
            .lock()
            .unwrap()
            .pop_front()
            .expect("issuer exhausted");
        Identity::from(next)
    }
}

struct TestServer {
    addr: std::net::SocketAddr,
    state: RelayState,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    async fn start(ids: &[&'static str]) -> Self {
        let issuer = Arc::new(ScriptedIssuer(Mutex::new(ids.iter().copied().collect())));
        let ice = Arc::new(StaticIceServers::new(vec![IceServer::stun(
            "stun:stun.test.invalid:3478",
        )]));
        let state = RelayState::new(MessageRouter::new(issuer, ice));

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener bind");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let server_state = state.clone();
        tokio::spawn(async move {
            serve(listener, server_state, async {
                let _ = shutdown_rx.await;
            })
            .await
            .ok();
        });

        Self {
            addr,
            state,
            shutdown: Some(shutdown_tx),
        }
    }

    async fn connect(&self) -> Client {
        let (ws, _) = connect_async(format!("ws://{}/ws", self.addr))
            .await
            .expect("websocket connect");
        ws
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn next_json(ws: &mut Client) -> Value {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(_) = frame {
            return serde_json::from_str(frame.to_text().unwrap()).expect("json frame");
        }
    }
}

async fn send_json(ws: &mut Client, value: Value) {
    ws.send(Message::text(value.to_string()))
        .await
        .expect("send frame");
}

#[test_timeout::tokio_timeout_test]
async fn offer_answer_then_disconnect_notifies_peer() {
    let server = TestServer::start(&["A", "B"]).await;

    let mut a = server.connect().await;
    assert_eq!(next_json(&mut a).await, json!({"type": "hello", "id": "A"}));
    assert_eq!(
        next_json(&mut a).await,
        json!({"type": "iceServers", "iceServers": [{"urls": "stun:stun.test.invalid:3478"}]})
    );

    let mut b = server.connect().await;
    assert_eq!(next_json(&mut b).await, json!({"type": "hello", "id": "B"}));
    assert_eq!(next_json(&mut b).await["type"], "iceServers");

    send_json(&mut a, json!({"id": "B", "type": "offer", "sdp": "o1"})).await;
    assert_eq!(
        next_json(&mut b).await,
        json!({"id": "A", "type": "offer", "sdp": "o1"})
    );

    send_json(&mut b, json!({"id": "A", "type": "answer", "sdp": "a1"})).await;
    assert_eq!(
        next_json(&mut a).await,
        json!({"id": "B", "type": "answer", "sdp": "a1"})
    );

    let registry = server.state.router().registry();
    assert_eq!(
        registry.subscribers(&Identity::from("A")),
        Some(vec![Identity::from("B")])
    );
    assert_eq!(
        registry.subscribers(&Identity::from("B")),
        Some(vec![Identity::from("A")])
    );

    b.close(None).await.expect("close b");
    drop(b);

    assert_eq!(next_json(&mut a).await, json!({"type": "bye", "id": "B"}));
    assert!(registry.lookup(&Identity::from("B")).is_none());
    assert!(registry.lookup(&Identity::from("A")).is_some());
}

#[test_timeout::tokio_timeout_test]
async fn bad_and_unroutable_envelopes_get_no_reply() {
    let server = TestServer::start(&["A", "B"]).await;
    let mut a = server.connect().await;
    next_json(&mut a).await;
    next_json(&mut a).await;
    let mut b = server.connect().await;
    next_json(&mut b).await;
    next_json(&mut b).await;

    a.send(Message::text("definitely not json".to_string())).await.unwrap();
    send_json(&mut a, json!({"type": "offer", "sdp": "no target"})).await;
    send_json(&mut a, json!({"type": "offer", "id": "ghost", "sdp": "x"})).await;
    a.send(Message::binary(
        json!({"type": "candidate", "id": "B", "candidate": "c1"})
            .to_string()
            .into_bytes(),
    ))
    .await
    .unwrap();

    // The binary-framed candidate is the only thing B sees.
    assert_eq!(
        next_json(&mut b).await,
        json!({"type": "candidate", "id": "A", "candidate": "c1"})
    );

    // A's next frame is B's sentinel, so none of A's bad sends produced a reply.
    send_json(&mut b, json!({"type": "sentinel", "id": "A"})).await;
    assert_eq!(
        next_json(&mut a).await,
        json!({"type": "sentinel", "id": "B"})
    );
    assert_eq!(server.state.router().registry().len(), 2);
}

#[test_timeout::tokio_timeout_test]
async fn duplicate_identity_connection_is_closed() {
    let server = TestServer::start(&["A", "A"]).await;
    let mut first = server.connect().await;
    assert_eq!(next_json(&mut first).await["id"], "A");

    let mut second = server.connect().await;
    let frame = timeout(Duration::from_secs(2), second.next())
        .await
        .expect("timed out waiting for close");
    assert!(
        matches!(frame, None | Some(Ok(Message::Close(_))) | Some(Err(_))),
        "expected close, got {frame:?}"
    );

    assert_eq!(server.state.router().registry().len(), 1);
    assert_eq!(next_json(&mut first).await["type"], "iceServers");
}

#[test_timeout::tokio_timeout_test]
async fn health_reports_live_connections() {
    let server = TestServer::start(&["A"]).await;
    let mut a = server.connect().await;
    next_json(&mut a).await;

    let body: Value = reqwest::get(format!("http://{}/healthz", server.addr))
        .await
        .expect("health request")
        .json()
        .await
        .expect("health body");
    assert_eq!(body, json!({"status": "ok", "connections": 1}));

    let metrics = reqwest::get(format!("http://{}/metrics", server.addr))
        .await
        .expect("metrics request");
    assert_eq!(metrics.status(), reqwest::StatusCode::NOT_FOUND);
}
