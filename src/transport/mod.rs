//! Per-connection event channel shared by the WebSocket binding and the
//! authenticators/backends.
//!
//! A [`Connection`] is the session side: it receives named client events in
//! arrival order and emits [`ServerEvent`]s. The transport holds the matching
//! [`Peer`] and pumps frames between it and the socket. Dropping the peer's
//! event sender is the disconnect notification; [`Connection::recv`] reports
//! it exactly once by returning `None`.

pub mod ws;

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

const INBOUND_CAPACITY: usize = 64;
const OUTBOUND_CAPACITY: usize = 256;
const MAX_CELLS: u32 = u16::MAX as u32;

/// Stable identity of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Body of a client event.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(serde_json::Value),
    Binary(Bytes),
}

/// A named event sent by the client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientEvent {
    pub name: String,
    pub data: Payload,
}

#[derive(Deserialize)]
struct Frame {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl ClientEvent {
    pub fn json(name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            data: Payload::Json(data),
        }
    }

    pub fn binary(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: Payload::Binary(data.into()),
        }
    }

    /// Parse a `{"event": ..., "data": ...}` text frame.
    pub fn from_text(text: &str) -> serde_json::Result<Self> {
        let frame: Frame = serde_json::from_str(text)?;
        Ok(Self::json(frame.event, frame.data))
    }

    /// Deserialize a JSON payload. Binary payloads never match.
    pub fn parse<T: DeserializeOwned>(&self) -> Option<T> {
        match &self.data {
            Payload::Json(value) => serde_json::from_value(value.clone()).ok(),
            Payload::Binary(_) => None,
        }
    }

    /// Raw bytes of a `message` payload: binary frames as-is, strings as UTF-8.
    pub fn bytes(&self) -> Option<Bytes> {
        match &self.data {
            Payload::Binary(data) => Some(data.clone()),
            Payload::Json(serde_json::Value::String(s)) => Some(Bytes::from(s.clone())),
            Payload::Json(_) => None,
        }
    }
}

/// Payload of a client `resize` event. Pixel sizes are optional.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Resize {
    pub cols: f64,
    pub rows: f64,
    #[serde(default)]
    pub width: Option<f64>,
    #[serde(default)]
    pub height: Option<f64>,
}

impl Resize {
    /// Character geometry, if both dimensions are positive finite numbers.
    /// Each dimension is capped at `u16::MAX` cells.
    pub fn cells(&self) -> Option<(u32, u32)> {
        let valid = |v: f64| v.is_finite() && v > 0.0;
        if !valid(self.cols) || !valid(self.rows) {
            return None;
        }
        let cells = |v: f64| (v.round() as u32).clamp(1, MAX_CELLS);
        Some((cells(self.cols), cells(self.rows)))
    }

    /// Pixel geometry, substituting `cols * 9` / `rows * 19` for absent or
    /// non-positive sizes.
    pub fn pixels(&self, cols: u32, rows: u32) -> (u32, u32) {
        let given = |v: Option<f64>| {
            v.filter(|v| v.is_finite() && *v > 0.0)
                .map(|v| v.round() as u32)
        };
        let width = given(self.width).unwrap_or(cols.saturating_mul(9));
        let height = given(self.height).unwrap_or(rows.saturating_mul(19));
        (width, height)
    }
}

/// Events the gateway sends to clients. Serialized as
/// `{"event": "<kebab-case name>", "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    Timeout,
    UsernameOrPasswordIncorrect,
    Authenticated,
    /// `[static salt or decoy, dynamic salt]`
    Salts([String; 2]),
    Message(String),
    Size {
        cols: u16,
        rows: u16,
    },
    Ready,
    RemoteReady,
    Exit {
        code: Option<u32>,
        signal: Option<String>,
    },
    RemoteExit {
        code: Option<u32>,
        signal: Option<String>,
        #[serde(rename = "coreDumped")]
        core_dumped: bool,
        description: Option<String>,
    },
    Failed(Option<String>),
}

/// What the session side hands to the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(ServerEvent),
    /// Close the socket after everything queued before it.
    Disconnect,
}

/// Transport side of a connection.
pub struct Peer {
    events: mpsc::Sender<ClientEvent>,
    outbound: mpsc::Receiver<Outbound>,
}

impl Peer {
    /// Deliver a client event. Returns false once the session side is gone.
    pub async fn send(&self, event: ClientEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    /// Next item queued by the session side; `None` once it has been dropped.
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.outbound.recv().await
    }

    /// Separate the two directions so each can be driven by its own task.
    pub fn split(self) -> (PeerSender, mpsc::Receiver<Outbound>) {
        (PeerSender { events: self.events }, self.outbound)
    }

    #[cfg(test)]
    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.outbound.try_recv().ok()
    }
}

/// Client-to-session half of a [`Peer`]. The session sees a disconnect once
/// it is dropped.
pub struct PeerSender {
    events: mpsc::Sender<ClientEvent>,
}

impl PeerSender {
    pub async fn send(&self, event: ClientEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}

/// Session side of a connection.
pub struct Connection {
    id: ConnectionId,
    remote_addr: String,
    connected_at: DateTime<Utc>,
    inbound: mpsc::Receiver<ClientEvent>,
    outbound: mpsc::Sender<Outbound>,
    disconnected: bool,
}

impl Connection {
    /// Create a connected pair with a fresh identity.
    pub fn pair(remote_addr: impl Into<String>) -> (Connection, Peer) {
        let (events_tx, events_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let conn = Connection {
            id: ConnectionId::generate(),
            remote_addr: remote_addr.into(),
            connected_at: Utc::now(),
            inbound: events_rx,
            outbound: outbound_tx,
            disconnected: false,
        };
        let peer = Peer {
            events: events_tx,
            outbound: outbound_rx,
        };
        (conn, peer)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    /// Next client event, or `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        if self.disconnected {
            return None;
        }
        match self.inbound.recv().await {
            Some(event) => Some(event),
            None => {
                self.disconnected = true;
                debug!("{} client disconnected", self);
                None
            }
        }
    }

    /// Queue an event for the client. No-op after disconnect.
    pub async fn emit(&self, event: ServerEvent) {
        if self.disconnected {
            return;
        }
        if self.outbound.send(Outbound::Event(event)).await.is_err() {
            debug!("{} transport gone, event dropped", self);
        }
    }

    /// Close the connection. Safe to call any number of times.
    pub async fn disconnect(&mut self) {
        if self.disconnected {
            return;
        }
        self.disconnected = true;
        let _ = self.outbound.send(Outbound::Disconnect).await;
        self.inbound.close();
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - \"{}\"", self.remote_addr, self.id)
    }
}

/// Incremental UTF-8 decoder for terminal output.
///
/// Reads can split a multi-byte sequence; the incomplete tail is carried into
/// the next chunk instead of being replaced.
#[derive(Debug, Default)]
pub struct TextDecoder {
    pending: Vec<u8>,
}

impl TextDecoder {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let end = utf8_boundary(&self.pending);
        let rest = self.pending.split_off(end);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = rest;
        text
    }

    /// Whatever is left, lossily.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }
}

/// Length of the prefix of `data` that does not end in a truncated UTF-8 sequence.
fn utf8_boundary(data: &[u8]) -> usize {
    let len = data.len();
    // A sequence is at most 4 bytes, so only the last 3 can start an unfinished one.
    for back in 1..=len.min(3) {
        let byte = data[len - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let width = match byte {
            b if b & 0b1000_0000 == 0 => 1,
            b if b & 0b1110_0000 == 0b1100_0000 => 2,
            b if b & 0b1111_0000 == 0b1110_0000 => 3,
            b if b & 0b1111_1000 == 0b1111_0000 => 4,
            _ => 1,
        };
        return if width > back { len - back } else { len };
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_server_event_wire_shape() {
        let size = serde_json::to_value(ServerEvent::Size { cols: 80, rows: 30 }).unwrap();
        assert_eq!(size, json!({"event": "size", "data": {"cols": 80, "rows": 30}}));

        let timeout = serde_json::to_value(ServerEvent::Timeout).unwrap();
        assert_eq!(timeout, json!({"event": "timeout"}));

        let rejected = serde_json::to_value(ServerEvent::UsernameOrPasswordIncorrect).unwrap();
        assert_eq!(rejected["event"], "username-or-password-incorrect");

        let salts = serde_json::to_value(ServerEvent::Salts(["a".into(), "b".into()])).unwrap();
        assert_eq!(salts, json!({"event": "salts", "data": ["a", "b"]}));

        let exit = serde_json::to_value(ServerEvent::RemoteExit {
            code: Some(1),
            signal: None,
            core_dumped: false,
            description: None,
        })
        .unwrap();
        assert_eq!(exit["event"], "remote-exit");
        assert_eq!(exit["data"]["coreDumped"], false);
    }

    #[test]
    fn test_client_event_from_text() {
        let event = ClientEvent::from_text(r#"{"event":"resize","data":{"cols":100,"rows":40}}"#)
            .unwrap();
        assert_eq!(event.name, "resize");
        let size: serde_json::Value = event.parse().unwrap();
        assert_eq!(size["cols"], 100);

        let bare = ClientEvent::from_text(r#"{"event":"exit"}"#).unwrap();
        assert_eq!(bare.data, Payload::Json(serde_json::Value::Null));

        assert!(ClientEvent::from_text("not json").is_err());
    }

    #[test]
    fn test_resize_geometry() {
        let resize: Resize = serde_json::from_value(json!({"cols": 80, "rows": 24})).unwrap();
        assert_eq!(resize.cells(), Some((80, 24)));
        assert_eq!(resize.pixels(80, 24), (720, 456));

        let sized: Resize =
            serde_json::from_value(json!({"cols": 80, "rows": 24, "width": 1000, "height": 0}))
                .unwrap();
        assert_eq!(sized.pixels(80, 24), (1000, 456));

        let bad: Resize = serde_json::from_value(json!({"cols": 0, "rows": 24})).unwrap();
        assert_eq!(bad.cells(), None);
        let negative: Resize = serde_json::from_value(json!({"cols": 80, "rows": -1})).unwrap();
        assert_eq!(negative.cells(), None);
        assert!(serde_json::from_value::<Resize>(json!({"cols": "80", "rows": 24})).is_err());
    }

    #[test]
    fn test_resize_huge_geometry_is_capped() {
        let huge: Resize = serde_json::from_value(json!({"cols": 1e9, "rows": 24})).unwrap();
        let (cols, rows) = huge.cells().unwrap();
        assert_eq!((cols, rows), (65535, 24));
        assert_eq!(huge.pixels(cols, rows), (65535 * 9, 456));
        assert_eq!(huge.pixels(u32::MAX, u32::MAX), (u32::MAX, u32::MAX));

        let tiny: Resize = serde_json::from_value(json!({"cols": 0.2, "rows": 1e300})).unwrap();
        assert_eq!(tiny.cells(), Some((1, 65535)));
    }

    #[test]
    fn test_message_bytes() {
        assert_eq!(
            ClientEvent::json("message", json!("ls\n")).bytes(),
            Some(Bytes::from_static(b"ls\n"))
        );
        assert_eq!(
            ClientEvent::binary("message", vec![0u8, 1, 2]).bytes(),
            Some(Bytes::from_static(&[0, 1, 2]))
        );
        assert_eq!(ClientEvent::json("message", json!({"x": 1})).bytes(), None);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (mut conn, mut peer) = Connection::pair("127.0.0.1:4000");
        conn.emit(ServerEvent::Ready).await;
        conn.disconnect().await;
        conn.disconnect().await;
        conn.emit(ServerEvent::Ready).await;

        assert_eq!(peer.recv().await, Some(Outbound::Event(ServerEvent::Ready)));
        assert_eq!(peer.recv().await, Some(Outbound::Disconnect));
        assert_eq!(peer.try_recv(), None);
        assert!(conn.recv().await.is_none());
        assert!(!peer.send(ClientEvent::json("message", json!("x"))).await);
    }

    #[tokio::test]
    async fn test_peer_drop_is_disconnect() {
        let (mut conn, peer) = Connection::pair("127.0.0.1:4000");
        assert!(peer.send(ClientEvent::json("message", json!("a"))).await);
        drop(peer);

        assert_eq!(conn.recv().await.map(|e| e.name), Some("message".to_string()));
        assert!(conn.recv().await.is_none());
        assert!(conn.is_disconnected());
        assert!(conn.recv().await.is_none());
    }

    #[test]
    fn test_text_decoder_carries_split_sequences() {
        let snowman = "☃".as_bytes();
        let mut decoder = TextDecoder::default();
        assert_eq!(decoder.decode(&[b'a', snowman[0]]), "a");
        assert_eq!(decoder.decode(&snowman[1..2]), "");
        assert_eq!(decoder.decode(&[snowman[2], b'b']), "☃b");
        assert_eq!(decoder.finish(), None);

        assert_eq!(decoder.decode(&[0xe2]), "");
        assert_eq!(decoder.finish(), Some("\u{fffd}".to_string()));
    }

    #[test]
    fn test_connection_display() {
        let (conn, _peer) = Connection::pair("10.1.2.3:5555");
        assert_eq!(conn.to_string(), format!("10.1.2.3:5555 - \"{}\"", conn.id()));
    }
}
