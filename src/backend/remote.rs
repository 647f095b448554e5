//! Bridges a connection to a shell on a remote host over SSH.

use std::sync::Arc;

use russh::{ChannelMsg, Sig};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use super::{EXIT_EVENT, MESSAGE_EVENT, RESIZE_EVENT};
use crate::auth::Authenticator;
use crate::config::RemoteTarget;
use crate::ssh::{
    self, ChannelWriter, Geometry, Notice, RemoteSession, SshError, session::WRITE_QUEUE,
};
use crate::transport::{Connection, Resize, ServerEvent, TextDecoder};

pub struct RemoteBackend {
    target: RemoteTarget,
    pub(super) auth: Arc<Authenticator>,
}

impl RemoteBackend {
    pub fn new(target: RemoteTarget, auth: Arc<Authenticator>) -> Self {
        Self { target, auth }
    }

    pub async fn attach(&self, conn: &mut Connection) {
        let target = &self.target;
        info!(
            "{} attaching remote target {}@{}:{}",
            conn, target.username, target.host, target.port
        );

        let (notice_tx, mut notices) = mpsc::unbounded_channel();
        let handle = match ssh::connect(target, notice_tx).await {
            Ok(handle) => handle,
            Err(e) => {
                fail(conn, &e).await;
                return;
            }
        };
        while let Ok(notice) = notices.try_recv() {
            if let Notice::Banner(banner) = notice {
                conn.emit(ServerEvent::Message(normalize_newlines(&banner))).await;
            }
        }

        let geometry = Geometry::default();
        let mut channel = match ssh::open_shell(&handle, &target.term, &geometry).await {
            Ok(channel) => channel,
            Err(e) => {
                fail(conn, &e).await;
                ssh::end(&handle).await;
                return;
            }
        };
        conn.emit(ServerEvent::RemoteReady).await;

        let drained = Arc::new(Notify::new());
        let writer = ChannelWriter::spawn(Box::pin(channel.make_writer()), drained.clone(), WRITE_QUEUE);
        let mut session = RemoteSession::new(writer, target.ignore_backpressure, geometry);
        let mut decoder = TextDecoder::default();

        loop {
            tokio::select! {
                event = conn.recv() => {
                    let Some(event) = event else {
                        info!("{} client disconnected, ending remote session", conn);
                        break;
                    };
                    match event.name.as_str() {
                        MESSAGE_EVENT => match event.bytes() {
                            Some(data) => {
                                if !session.on_client_message(data).await {
                                    debug!("{} remote write buffer full, input dropped", conn);
                                }
                            }
                            None => warn!("{} unsupported message payload", conn),
                        },
                        RESIZE_EVENT => {
                            let Some(resize) = event.parse::<Resize>() else {
                                warn!("{} malformed resize", conn);
                                continue;
                            };
                            let Some(geometry) = session.plan_resize(&resize) else {
                                continue;
                            };
                            let applied = channel
                                .window_change(geometry.cols, geometry.rows, geometry.width, geometry.height)
                                .await;
                            if let Err(e) = &applied {
                                warn!("{} failed to resize remote PTY: {}", conn, e);
                            }
                            session.after_resize(geometry, applied.is_ok());
                        }
                        EXIT_EVENT => {
                            info!("{} client force exit", conn);
                            conn.disconnect().await;
                            break;
                        }
                        other => debug!("{} ignoring `{}`", conn, other),
                    }
                }
                _ = drained.notified() => session.on_continue(),
                Some(notice) = notices.recv() => match notice {
                    Notice::Banner(banner) => {
                        conn.emit(ServerEvent::Message(normalize_newlines(&banner))).await;
                    }
                    Notice::Failed(reason) => {
                        flush(conn, &mut decoder).await;
                        lost(conn, reason).await;
                        break;
                    }
                },
                msg = channel.wait() => match msg {
                    Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                        let text = decoder.decode(&data);
                        if !text.is_empty() {
                            conn.emit(ServerEvent::Message(text)).await;
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        info!("{} remote exited with status {}", conn, exit_status);
                        flush(conn, &mut decoder).await;
                        conn.emit(ServerEvent::RemoteExit {
                            code: Some(exit_status),
                            signal: None,
                            core_dumped: false,
                            description: None,
                        })
                        .await;
                        conn.disconnect().await;
                        break;
                    }
                    Some(ChannelMsg::ExitSignal { signal_name, core_dumped, error_message, .. }) => {
                        let signal = signal_label(&signal_name);
                        info!("{} remote killed by {}", conn, signal);
                        flush(conn, &mut decoder).await;
                        conn.emit(ServerEvent::RemoteExit {
                            code: None,
                            signal: Some(signal),
                            core_dumped,
                            description: Some(error_message).filter(|m| !m.is_empty()),
                        })
                        .await;
                        conn.disconnect().await;
                        break;
                    }
                    Some(ChannelMsg::Eof) => debug!("{} remote EOF", conn),
                    Some(ChannelMsg::Close) => {
                        info!("{} remote channel closed", conn);
                        flush(conn, &mut decoder).await;
                        conn.disconnect().await;
                        break;
                    }
                    None => {
                        flush(conn, &mut decoder).await;
                        lost(conn, lost_reason(&mut notices)).await;
                        break;
                    }
                    Some(_) => {}
                }
            }
        }

        ssh::end(&handle).await;
        debug!("{} remote session ended", conn);
    }
}

async fn fail(conn: &mut Connection, err: &SshError) {
    warn!("{} remote connection failed: {}", conn, err);
    conn.emit(ServerEvent::Failed(Some(err.client_reason()))).await;
    conn.disconnect().await;
}

/// The connection died under an open channel.
async fn lost(conn: &mut Connection, reason: String) {
    warn!("{} remote connection lost: {}", conn, reason);
    conn.emit(ServerEvent::Failed(Some(reason))).await;
    conn.disconnect().await;
}

/// Reason reported by the connection task, if it got one out before the
/// channel went away.
fn lost_reason(notices: &mut mpsc::UnboundedReceiver<Notice>) -> String {
    while let Ok(notice) = notices.try_recv() {
        if let Notice::Failed(reason) = notice {
            return reason;
        }
    }
    SshError::ConnectionLost.client_reason()
}

async fn flush(conn: &Connection, decoder: &mut TextDecoder) {
    if let Some(rest) = decoder.finish() {
        conn.emit(ServerEvent::Message(rest)).await;
    }
}

/// `SIGTERM` style name for an SSH exit signal.
fn signal_label(signal: &Sig) -> String {
    match signal {
        Sig::Custom(name) => name.clone(),
        other => format!("SIG{:?}", other),
    }
}

/// Banners use bare `\n`; terminals want `\r\n`.
fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\n', "\r\n")
}
