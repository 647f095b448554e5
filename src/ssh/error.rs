//! SSH client error types

use thiserror::Error;

/// Where a failure came from, for the `failed` reason shown to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOrigin {
    Socket,
    Protocol,
    Unknown,
}

#[derive(Error, Debug)]
pub enum SshError {
    #[error("failed to read private key `{path}`: {source}")]
    KeyFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid private key: {0}")]
    Key(#[from] russh::keys::Error),

    #[error("{0}")]
    Transport(#[from] russh::Error),

    #[error("authentication rejected by server")]
    AuthenticationRejected,

    #[error("host key mismatch: expected {expected}, got {actual}")]
    HostKeyMismatch { expected: String, actual: String },

    #[error("timed out after {0} ms")]
    Timeout(u64),

    #[error("failed to open shell channel: {0}")]
    Channel(#[source] russh::Error),

    #[error("connection closed unexpectedly")]
    ConnectionLost,
}

impl SshError {
    pub fn origin(&self) -> FailureOrigin {
        match self {
            SshError::Transport(russh::Error::IO(_))
            | SshError::Transport(russh::Error::ConnectionTimeout)
            | SshError::Timeout(_)
            | SshError::ConnectionLost => FailureOrigin::Socket,
            SshError::Transport(_)
            | SshError::Channel(_)
            | SshError::AuthenticationRejected
            | SshError::HostKeyMismatch { .. } => FailureOrigin::Protocol,
            SshError::KeyFile { .. } | SshError::Key(_) => FailureOrigin::Unknown,
        }
    }

    /// Human-readable reason carried by the `failed` event.
    pub fn client_reason(&self) -> String {
        match self {
            SshError::Channel(_) => format!("remote shell unavailable: {}", self),
            SshError::AuthenticationRejected => "remote login failed".to_string(),
            _ => match self.origin() {
                FailureOrigin::Socket => format!("network error: {}", self),
                FailureOrigin::Protocol => format!("SSH protocol error: {}", self),
                FailureOrigin::Unknown => format!("connection failed: {}", self),
            },
        }
    }
}
