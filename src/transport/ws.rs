//! axum WebSocket binding: one socket per connection, the URL path picks the
//! namespace.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Path, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tracing::{debug, info, warn};

use super::{ClientEvent, Connection, Outbound, Peer, PeerSender};
use crate::backend::MESSAGE_EVENT;
use crate::gateway::{Chain, Gateway};

struct AppState {
    gateway: Arc<Gateway>,
    cors: Vec<String>,
}

pub fn router(gateway: Arc<Gateway>, cors: Vec<String>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/{*nsp}", get(upgrade))
        .with_state(Arc::new(AppState { gateway, cors }))
}

/// Bind `addr` and serve until the listener fails.
pub async fn serve(addr: SocketAddr, gateway: Arc<Gateway>, cors: Vec<String>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on {}", addr);
    for namespace in gateway.namespaces() {
        info!("  namespace {}", namespace);
    }

    let app = router(gateway, cors);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("WebSocket server failed")
}

async fn health() -> &'static str {
    "ok"
}

async fn upgrade(
    State(state): State<Arc<AppState>>,
    Path(nsp): Path<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if !origin_allowed(&state.cors, origin) {
        warn!("{} rejected origin {:?}", peer, origin);
        return StatusCode::FORBIDDEN.into_response();
    }

    let Some(chain) = state.gateway.route(&nsp) else {
        debug!("{} unknown namespace /{}", peer, nsp);
        return StatusCode::NOT_FOUND.into_response();
    };

    ws.on_upgrade(move |socket| relay(socket, peer, chain))
        .into_response()
}

/// An empty list or `*` allows every origin; requests without `Origin` are
/// not from a browser and always pass.
fn origin_allowed(cors: &[String], origin: Option<&str>) -> bool {
    let Some(origin) = origin else {
        return true;
    };
    cors.is_empty()
        || cors
            .iter()
            .any(|allowed| allowed == "*" || allowed.trim_end_matches('/') == origin)
}

/// Run the session on `chain` and bridge it to the socket.
async fn relay(socket: WebSocket, peer: SocketAddr, chain: Arc<Chain>) {
    let (conn, session_peer) = Connection::pair(peer.to_string());
    let label = conn.to_string();
    let session = tokio::spawn(async move { chain.serve(conn).await });

    let (ws_tx, ws_rx) = socket.split();
    pump(ws_tx, ws_rx, session_peer, &label).await;

    if let Err(e) = session.await {
        warn!("{} session task failed: {}", label, e);
    }
    debug!("{} socket closed", label);
}

/// Move frames both ways until either side is done. Client frames are read on
/// their own task, so a session that is not reading input never holds up its
/// output, and a full outbound queue never holds up input.
async fn pump<Tx, Rx, E>(mut ws_tx: Tx, ws_rx: Rx, peer: Peer, label: &str)
where
    Tx: Sink<Message> + Unpin,
    Rx: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let (events, mut outbound) = peer.split();
    let mut reader = tokio::spawn(read_frames(ws_rx, events, label.to_string()));

    loop {
        tokio::select! {
            item = outbound.recv() => match item {
                Some(Outbound::Event(event)) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("{} failed to encode event: {}", label, e);
                            continue;
                        }
                    };
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        debug!("{} socket write failed", label);
                        break;
                    }
                }
                Some(Outbound::Disconnect) | None => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            },
            // Client gone; dropping the sender tells the session.
            _ = &mut reader => break,
        }
    }
    reader.abort();
}

async fn read_frames<Rx, E>(mut ws_rx: Rx, events: PeerSender, label: String)
where
    Rx: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    while let Some(frame) = ws_rx.next().await {
        let event = match frame {
            Ok(Message::Text(text)) => match ClientEvent::from_text(text.as_str()) {
                Ok(event) => event,
                Err(e) => {
                    debug!("{} malformed frame: {}", label, e);
                    continue;
                }
            },
            Ok(Message::Binary(data)) => ClientEvent::binary(MESSAGE_EVENT, data),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("{} socket error: {}", label, e);
                break;
            }
        };
        if !events.send(event).await {
            break;
        }
    }
    debug!("{} client stream ended", label);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ServerEvent;
    use std::time::Duration;

    #[test]
    fn test_origin_allowed() {
        let cors = vec!["https://console.example.com/".to_string()];
        assert!(origin_allowed(&cors, Some("https://console.example.com")));
        assert!(!origin_allowed(&cors, Some("https://evil.example.com")));
        assert!(origin_allowed(&cors, None));
        assert!(origin_allowed(&[], Some("https://evil.example.com")));
        assert!(origin_allowed(&["*".to_string()], Some("https://any.example.com")));
    }

    type Frames = futures::channel::mpsc::UnboundedSender<Result<Message, axum::Error>>;

    fn frames() -> (
        Frames,
        futures::channel::mpsc::UnboundedReceiver<Result<Message, axum::Error>>,
    ) {
        futures::channel::mpsc::unbounded()
    }

    fn message_frame(text: &str) -> Result<Message, axum::Error> {
        let frame = serde_json::json!({"event": "message", "data": text}).to_string();
        Ok(Message::Text(frame.into()))
    }

    #[tokio::test]
    async fn test_flooding_session_does_not_stall_input() {
        const OUTPUT: usize = 1000;
        const INPUT: usize = 200;

        let (mut conn, peer) = Connection::pair("127.0.0.1:1");
        let (frames_tx, frames_rx) = frames();
        let (socket_tx, mut socket_rx) = futures::channel::mpsc::unbounded::<Message>();
        for i in 0..INPUT {
            frames_tx.unbounded_send(message_frame(&i.to_string())).unwrap();
        }

        // Writes all of its output before reading any input.
        let session = async {
            for i in 0..OUTPUT {
                conn.emit(ServerEvent::Message(i.to_string())).await;
            }
            let mut received = 0;
            while received < INPUT && conn.recv().await.is_some() {
                received += 1;
            }
            conn.disconnect().await;
            received
        };
        let client = async {
            let mut texts = 0;
            while let Some(message) = socket_rx.next().await {
                match message {
                    Message::Text(_) => texts += 1,
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            texts
        };

        let (received, (), texts) = tokio::time::timeout(Duration::from_secs(10), async {
            tokio::join!(session, pump(socket_tx, frames_rx, peer, "test"), client)
        })
        .await
        .expect("relay stalled");
        assert_eq!(received, INPUT);
        assert_eq!(texts, OUTPUT);
    }

    #[tokio::test]
    async fn test_client_close_reaches_session() {
        let (mut conn, peer) = Connection::pair("127.0.0.1:1");
        let (frames_tx, frames_rx) = frames();
        let (socket_tx, _socket_rx) = futures::channel::mpsc::unbounded::<Message>();
        frames_tx.unbounded_send(message_frame("ls\n")).unwrap();
        frames_tx.unbounded_send(Ok(Message::Close(None))).unwrap();

        let session = async {
            let first = conn.recv().await.map(|event| event.bytes());
            let after_close = conn.recv().await;
            (first, after_close.is_none())
        };
        let ((first, closed), ()) = tokio::time::timeout(Duration::from_secs(10), async {
            tokio::join!(session, pump(socket_tx, frames_rx, peer, "test"))
        })
        .await
        .expect("relay stalled");
        assert_eq!(first, Some(Some(bytes::Bytes::from_static(b"ls\n"))));
        assert!(closed);
        drop(frames_tx);
    }
}
