//! Bridges a connection to a local shell on a PTY.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{EXIT_EVENT, MESSAGE_EVENT, RESIZE_EVENT};
use crate::auth::Authenticator;
use crate::config::LocalOptions;
use crate::pty::{PtyExit, PtySession, PtyStreams};
use crate::transport::{Connection, Resize, ServerEvent, TextDecoder};

/// How long to wait for output still in flight once the shell has exited.
const DRAIN_GRACE: Duration = Duration::from_millis(100);

pub struct LocalBackend {
    options: LocalOptions,
    pub(super) auth: Arc<Authenticator>,
}

impl LocalBackend {
    pub fn new(options: LocalOptions, auth: Arc<Authenticator>) -> Self {
        Self { options, auth }
    }

    pub async fn attach(&self, conn: &mut Connection) {
        info!("{} attaching PTY", conn);
        let mut pty = PtySession::new(&self.options);
        let PtyStreams {
            mut output,
            mut exit,
        } = match pty.start() {
            Ok(streams) => streams,
            Err(e) => {
                error!("{} failed to start PTY: {}", conn, e);
                conn.emit(ServerEvent::Failed(Some(e.to_string()))).await;
                conn.disconnect().await;
                pty.destroy();
                return;
            }
        };

        conn.emit(ServerEvent::Size {
            cols: pty.cols(),
            rows: pty.rows(),
        })
        .await;
        conn.emit(ServerEvent::Ready).await;

        let mut decoder = TextDecoder::default();
        let mut output_open = true;
        loop {
            tokio::select! {
                event = conn.recv() => {
                    let Some(event) = event else {
                        if pty.is_destroyed() {
                            info!("{} PTY already dead", conn);
                        } else {
                            info!("{} destroying PTY", conn);
                            pty.destroy();
                        }
                        break;
                    };
                    match event.name.as_str() {
                        MESSAGE_EVENT => match event.bytes() {
                            Some(data) => pty.write(data),
                            None => warn!("{} failed to write to PTY: unsupported payload", conn),
                        },
                        RESIZE_EVENT => match event.parse::<Resize>().and_then(|r| r.cells()) {
                            Some((cols, rows)) => pty.resize(cell_count(cols), cell_count(rows)),
                            None => warn!("{} failed to resize PTY: invalid geometry", conn),
                        },
                        EXIT_EVENT => {
                            info!("{} client force exit", conn);
                            pty.destroy();
                            conn.disconnect().await;
                            break;
                        }
                        other => debug!("{} ignoring `{}`", conn, other),
                    }
                }
                chunk = output.recv(), if output_open => match chunk {
                    Some(chunk) => {
                        let text = decoder.decode(&chunk);
                        if !text.is_empty() {
                            conn.emit(ServerEvent::Message(text)).await;
                        }
                    }
                    None => output_open = false,
                },
                status = &mut exit => {
                    let status = status.unwrap_or(PtyExit { code: None, signal: None });
                    drain(conn, &mut output, &mut decoder).await;
                    info!("{} PTY exited ({:?}, {:?})", conn, status.code, status.signal);
                    conn.emit(ServerEvent::Exit {
                        code: status.code,
                        signal: status.signal,
                    })
                    .await;
                    conn.disconnect().await;
                    pty.destroy();
                    break;
                }
            }
        }
    }
}

fn cell_count(n: u32) -> u16 {
    n.min(u16::MAX as u32) as u16
}

/// Forward output that was read before the exit was observed.
async fn drain(conn: &Connection, output: &mut mpsc::Receiver<Bytes>, decoder: &mut TextDecoder) {
    while let Ok(Some(chunk)) = tokio::time::timeout(DRAIN_GRACE, output.recv()).await {
        let text = decoder.decode(&chunk);
        if !text.is_empty() {
            conn.emit(ServerEvent::Message(text)).await;
        }
    }
    if let Some(rest) = decoder.finish() {
        conn.emit(ServerEvent::Message(rest)).await;
    }
}
