use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use std::borrow::Cow;
use std::net::SocketAddr;
use tracing::{debug, warn};

use crate::registry::ConnectionHandle;
use crate::router::MessageRouter;

pub const DEFAULT_OUTBOUND_BUFFER: usize = 64;
/// `hello` and `iceServers` can both be queued before the writer task starts draining.
pub const MIN_OUTBOUND_BUFFER: usize = 2;

/// Shared state handed to every HTTP/WebSocket handler.
#[derive(Clone)]
pub struct RelayState {
    router: MessageRouter,
    outbound_buffer: usize,
    metrics: Option<PrometheusHandle>,
}

impl RelayState {
    pub fn new(router: MessageRouter) -> Self {
        Self {
            router,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            metrics: None,
        }
    }

    /// Depths below [`MIN_OUTBOUND_BUFFER`] are raised to it.
    pub fn with_outbound_buffer(mut self, depth: usize) -> Self {
        self.outbound_buffer = depth.max(MIN_OUTBOUND_BUFFER);
        self
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn render_metrics(&self) -> Option<String> {
        self.metrics.as_ref().map(PrometheusHandle::render)
    }
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

async fn handle_socket(mut socket: WebSocket, state: RelayState, remote_addr: SocketAddr) {
    let (handle, mut rx) = ConnectionHandle::channel(state.outbound_buffer);
    let peer = match state.router.on_connect(handle) {
        Ok(peer) => peer,
        Err(err) => {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: Cow::Owned(err.to_string()),
                })))
                .await;
            return;
        }
    };
    debug!(peer = %peer, remote_addr = %remote_addr, "websocket connected");

    let (mut sender, mut receiver) = socket.split();

    let writer_peer = peer.clone();
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        debug!(peer = %writer_peer, "writer task finished");
    });

    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let _ = state.router.on_message(&peer, &text);
            }
            // Some clients ship JSON in binary frames.
            Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                Ok(text) => {
                    let _ = state.router.on_message(&peer, text);
                }
                Err(_) => debug!(peer = %peer, bytes = data.len(), "ignoring non-utf8 binary frame"),
            },
            Ok(Message::Close(frame)) => {
                debug!(
                    peer = %peer,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(peer = %peer, error = %err, "error receiving message");
                break;
            }
        }
    }

    state.router.on_close(&peer);
    writer.abort();
    debug!(peer = %peer, remote_addr = %remote_addr, "websocket disconnected");
}
