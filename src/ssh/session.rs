//! Per-session state of a remote shell: terminal geometry and the write gate.
//!
//! Client input goes to the channel through a bounded queue drained by a
//! writer task. When the queue fills up the gate closes and further input is
//! dropped until the writer reports it has caught up. Nothing is buffered
//! beyond the queue.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, warn};

use crate::transport::Resize;

/// Queue depth between the bridge and the channel writer.
pub const WRITE_QUEUE: usize = 64;

/// Terminal size in character cells and pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub cols: u32,
    pub rows: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            cols: 80,
            rows: 24,
            width: 80 * 9,
            height: 24 * 19,
        }
    }
}

impl Geometry {
    pub fn from_resize(resize: &Resize) -> Option<Self> {
        let (cols, rows) = resize.cells()?;
        let (width, height) = resize.pixels(cols, rows);
        Some(Self {
            cols,
            rows,
            width,
            height,
        })
    }
}

/// Destination of client input.
pub trait ChannelSink {
    /// Hand `data` over. Resolves to whether there is room for more without
    /// waiting for a drain.
    fn write(&mut self, data: Bytes) -> impl Future<Output = bool> + Send;
}

/// State owned by one remote session.
pub struct RemoteSession<S> {
    sink: S,
    write_gate_open: bool,
    ignore_backpressure: bool,
    geometry: Geometry,
}

impl<S: ChannelSink> RemoteSession<S> {
    pub fn new(sink: S, ignore_backpressure: bool, geometry: Geometry) -> Self {
        Self {
            sink,
            write_gate_open: true,
            ignore_backpressure,
            geometry,
        }
    }

    pub fn is_write_gate_open(&self) -> bool {
        self.write_gate_open
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Forward client input unless the gate is closed. Returns whether it was
    /// forwarded.
    pub async fn on_client_message(&mut self, data: Bytes) -> bool {
        if !self.write_gate_open && !self.ignore_backpressure {
            return false;
        }
        self.write_gate_open = self.sink.write(data).await;
        true
    }

    /// The channel writer caught up.
    pub fn on_continue(&mut self) {
        if !self.write_gate_open {
            debug!("remote write buffer drained");
        }
        self.write_gate_open = true;
    }

    /// Geometry to apply for a client resize, or `None` if the request is invalid.
    pub fn plan_resize(&self, resize: &Resize) -> Option<Geometry> {
        let geometry = Geometry::from_resize(resize);
        if geometry.is_none() {
            warn!(
                "invalid resize {}x{}, positive numbers expected",
                resize.cols, resize.rows
            );
        }
        geometry
    }

    /// Record the outcome of applying `geometry`; the result also reopens or
    /// closes the gate.
    pub fn after_resize(&mut self, geometry: Geometry, applied: bool) {
        if applied {
            self.geometry = geometry;
        }
        self.write_gate_open = applied;
    }
}

/// [`ChannelSink`] feeding a writer task.
pub struct ChannelWriter {
    tx: mpsc::Sender<Bytes>,
    drain_wanted: Arc<AtomicBool>,
}

impl ChannelWriter {
    /// Spawn the writer task. `drained` is notified once the queue empties
    /// after having been full.
    pub fn spawn<W>(mut writer: W, drained: Arc<Notify>, capacity: usize) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Bytes>(capacity.max(1));
        let drain_wanted = Arc::new(AtomicBool::new(false));
        let wanted = drain_wanted.clone();
        tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                if let Err(e) = writer.write_all(&data).await {
                    debug!("remote channel write failed: {}", e);
                    break;
                }
                if rx.is_empty() && wanted.swap(false, Ordering::SeqCst) {
                    drained.notify_one();
                }
            }
            debug!("remote channel writer exited");
        });
        Self { tx, drain_wanted }
    }
}

impl ChannelSink for ChannelWriter {
    async fn write(&mut self, data: Bytes) -> bool {
        // Armed before the send so the writer cannot drain unnoticed.
        if self.tx.capacity() <= 1 {
            self.drain_wanted.store(true, Ordering::SeqCst);
        }
        if self.tx.send(data).await.is_err() {
            return false;
        }
        self.tx.capacity() > 0
    }
}
