//! Local pseudo-terminal sessions on top of portable-pty.
//!
//! The master side is pumped by blocking tasks: one reads output into a
//! bounded channel, one writes queued input, one waits for the child. The
//! session itself only keeps the handles needed to resize and kill.

use std::io::{Read, Write};
use std::path::PathBuf;

use bytes::Bytes;
use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::LocalOptions;

const OUTPUT_CAPACITY: usize = 64;
/// Input chunks waiting for a shell that is not reading.
const INPUT_CAPACITY: usize = 256;
const READ_BUF: usize = 8192;

/// Error type for PTY operations
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("failed to create PTY: {0}")]
    CreateFailed(String),

    #[error("failed to spawn `{shell}`: {reason}")]
    SpawnFailed { shell: String, reason: String },

    #[error("spawned `{0}` has no process id")]
    NoPid(String),

    #[error("PTY system error: {0}")]
    PtySystemError(String),

    #[error("PTY session already started")]
    AlreadyStarted,
}

/// How the shell ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyExit {
    pub code: Option<u32>,
    pub signal: Option<String>,
}

impl From<portable_pty::ExitStatus> for PtyExit {
    fn from(status: portable_pty::ExitStatus) -> Self {
        match status.signal() {
            Some(signal) => Self {
                code: None,
                signal: Some(signal.to_string()),
            },
            None => Self {
                code: Some(status.exit_code()),
                signal: None,
            },
        }
    }
}

/// Receivers handed out by [`PtySession::start`].
pub struct PtyStreams {
    pub output: mpsc::Receiver<Bytes>,
    pub exit: oneshot::Receiver<PtyExit>,
}

struct Running {
    pid: u32,
    master: Box<dyn MasterPty + Send>,
    input: mpsc::Sender<Bytes>,
    killer: Box<dyn ChildKiller + Send + Sync>,
}

pub struct PtySession {
    shell: String,
    cols: u16,
    rows: u16,
    conpty: bool,
    home: Option<PathBuf>,
    running: Option<Running>,
    destroyed: bool,
}

pub fn default_shell() -> String {
    if cfg!(windows) {
        "cmd.exe".to_string()
    } else {
        "bash".to_string()
    }
}

impl PtySession {
    pub fn new(options: &LocalOptions) -> Self {
        let shell = options
            .shell
            .as_ref()
            .map(|s| s.display().to_string())
            .unwrap_or_else(default_shell);
        Self {
            shell,
            cols: options.cols,
            rows: options.rows,
            conpty: options.conpty,
            home: dirs::home_dir(),
            running: None,
            destroyed: false,
        }
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    pub fn cols(&self) -> u16 {
        self.cols
    }

    pub fn rows(&self) -> u16 {
        self.rows
    }

    pub fn pid(&self) -> Option<u32> {
        self.running.as_ref().map(|r| r.pid)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Spawn the shell in the user's home directory.
    pub fn start(&mut self) -> Result<PtyStreams, PtyError> {
        if self.running.is_some() || self.destroyed {
            return Err(PtyError::AlreadyStarted);
        }

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: self.rows,
                cols: self.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::CreateFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&self.shell);
        if let Some(home) = &self.home {
            cmd.cwd(home);
        }
        cmd.env("TERM", "xterm-color");

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed {
                shell: self.shell.clone(),
                reason: e.to_string(),
            })?;
        drop(pair.slave);

        let Some(pid) = child.process_id() else {
            abandon(child.as_mut(), &self.shell);
            return Err(PtyError::NoPid(self.shell.clone()));
        };
        let (reader, writer) = match open_streams(pair.master.as_ref()) {
            Ok(streams) => streams,
            Err(e) => {
                abandon(child.as_mut(), &self.shell);
                return Err(e);
            }
        };
        let killer = child.clone_killer();

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CAPACITY);
        tokio::task::spawn_blocking(move || read_pump(reader, output_tx, pid));

        let (input_tx, input_rx) = mpsc::channel(INPUT_CAPACITY);
        tokio::task::spawn_blocking(move || write_pump(writer, input_rx, pid));

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::task::spawn_blocking(move || {
            let exit = match child.wait() {
                Ok(status) => PtyExit::from(status),
                Err(e) => {
                    warn!("pty {} wait failed: {}", pid, e);
                    PtyExit {
                        code: None,
                        signal: None,
                    }
                }
            };
            debug!("pty {} exited: {:?}", pid, exit);
            let _ = exit_tx.send(exit);
        });

        info!(
            "spawned `{}` pid {} ({}x{}{})",
            self.shell,
            pid,
            self.cols,
            self.rows,
            if self.conpty { ", conpty" } else { "" }
        );

        self.running = Some(Running {
            pid,
            master: pair.master,
            input: input_tx,
            killer,
        });

        Ok(PtyStreams {
            output: output_rx,
            exit: exit_rx,
        })
    }

    /// Queue input for the shell. Ignored before start and after destroy.
    pub fn write(&self, data: Bytes) {
        if let Some(running) = &self.running {
            queue_input(&running.input, data, running.pid);
        }
    }

    /// Resize the terminal. Failures are logged, never fatal.
    pub fn resize(&mut self, cols: u16, rows: u16) {
        let Some(running) = &self.running else {
            return;
        };
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        match running.master.resize(size) {
            Ok(()) => {
                self.cols = cols;
                self.rows = rows;
            }
            Err(e) => warn!("pty {} resize to {}x{} failed: {}", running.pid, cols, rows, e),
        }
    }

    /// Kill the shell and release the PTY. Safe to call repeatedly.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        let Some(mut running) = self.running.take() else {
            return;
        };
        kill(&mut running);
        debug!("pty {} destroyed", running.pid);
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn open_streams(
    master: &dyn MasterPty,
) -> Result<(Box<dyn Read + Send>, Box<dyn Write + Send>), PtyError> {
    let reader = master
        .try_clone_reader()
        .map_err(|e| PtyError::PtySystemError(format!("failed to clone reader: {}", e)))?;
    let writer = master
        .take_writer()
        .map_err(|e| PtyError::PtySystemError(format!("failed to take writer: {}", e)))?;
    Ok((reader, writer))
}

/// Kill and reap a child whose session could not be set up.
fn abandon(child: &mut (dyn Child + Send + Sync), shell: &str) {
    if let Err(e) = child.kill() {
        debug!("kill of half-started `{}` failed: {}", shell, e);
    }
    if let Err(e) = child.wait() {
        debug!("reaping half-started `{}` failed: {}", shell, e);
    }
}

/// Hand input to the write pump without waiting. Input is dropped while the
/// queue is full.
fn queue_input(input: &mpsc::Sender<Bytes>, data: Bytes, pid: u32) -> bool {
    match input.try_send(data) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(data)) => {
            warn!("pty {} input queue full, {} bytes dropped", pid, data.len());
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            warn!("pty {} input closed, write dropped", pid);
            false
        }
    }
}

#[cfg(unix)]
fn kill(running: &mut Running) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(running.pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => {
            debug!("SIGKILL to {} failed: {}, falling back", running.pid, e);
            let _ = running.killer.kill();
        }
    }
}

#[cfg(not(unix))]
fn kill(running: &mut Running) {
    if let Err(e) = running.killer.kill() {
        debug!("kill {} failed (may have already exited): {}", running.pid, e);
    }
}

fn read_pump(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Bytes>, pid: u32) {
    let mut buf = [0u8; READ_BUF];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // EIO once the slave side is gone.
            Err(e) => {
                debug!("pty {} read ended: {}", pid, e);
                break;
            }
        }
    }
    debug!("pty {} read pump exited", pid);
}

fn write_pump(
    mut writer: Box<dyn Write + Send>,
    mut rx: mpsc::Receiver<Bytes>,
    pid: u32,
) {
    while let Some(data) = rx.blocking_recv() {
        if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
            warn!("pty {} write failed: {}", pid, e);
            break;
        }
    }
    debug!("pty {} write pump exited", pid);
}
