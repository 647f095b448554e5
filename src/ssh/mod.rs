//! SSH client side of remote targets, built on russh.

pub mod error;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use russh::client;
use russh::keys::PublicKey;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::{Channel, Disconnect};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{RemoteCredentials, RemoteTarget};
pub use error::SshError;
pub use session::{ChannelSink, ChannelWriter, Geometry, RemoteSession};

/// Out-of-band news from the connection task.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Banner(String),
    /// The connection broke after login; carries the `failed` reason.
    Failed(String),
}

/// russh callbacks for one outgoing connection.
pub struct ClientHandler {
    host: String,
    /// Pinned `SHA256:<base64>` fingerprint; unset accepts any server key.
    expected_fingerprint: Option<String>,
    notices: mpsc::UnboundedSender<Notice>,
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let actual = fingerprint(server_public_key);
        match &self.expected_fingerprint {
            Some(expected) if !fingerprints_match(expected, &actual) => {
                warn!(
                    "Host key for {} does not match: expected {}, got {}",
                    self.host, expected, actual
                );
                Err(SshError::HostKeyMismatch {
                    expected: expected.clone(),
                    actual,
                })
            }
            Some(_) => {
                debug!("Host key verified for {}", self.host);
                Ok(true)
            }
            None => {
                debug!("Accepting host key {} for {}", actual, self.host);
                Ok(true)
            }
        }
    }

    async fn auth_banner(
        &mut self,
        banner: &str,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let _ = self.notices.send(Notice::Banner(banner.to_string()));
        Ok(())
    }

    async fn disconnected(
        &mut self,
        reason: client::DisconnectReason<Self::Error>,
    ) -> Result<(), Self::Error> {
        match reason {
            client::DisconnectReason::ReceivedDisconnect(info) => {
                debug!("{} disconnected: {:?}", self.host, info);
                Ok(())
            }
            client::DisconnectReason::Error(e) => {
                warn!("SSH connection to {} lost: {}", self.host, e);
                let _ = self.notices.send(Notice::Failed(e.client_reason()));
                Err(e)
            }
        }
    }
}

/// SHA256 fingerprint of a server key in the `ssh-keygen -l` format.
pub fn fingerprint(key: &PublicKey) -> String {
    use russh::keys::PublicKeyBase64;
    fingerprint_from_bytes(&key.public_key_bytes())
}

fn fingerprint_from_bytes(key_bytes: &[u8]) -> String {
    let hash = Sha256::digest(key_bytes);
    let b64 = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{}", b64)
}

/// Compare fingerprints, tolerating a missing `SHA256:` prefix and padding.
fn fingerprints_match(expected: &str, actual: &str) -> bool {
    let strip = |s: &str| -> String {
        let s = s.trim();
        let s = s.strip_prefix("SHA256:").unwrap_or(s);
        s.trim_end_matches('=').to_string()
    };
    strip(expected) == strip(actual)
}

/// Private key from inline PEM or from a file read at call time.
pub async fn load_private_key(
    key: &str,
    passphrase: Option<&str>,
) -> Result<russh::keys::PrivateKey, SshError> {
    let content = if key.trim_start().starts_with("-----BEGIN") {
        key.to_string()
    } else {
        tokio::fs::read_to_string(key)
            .await
            .map_err(|source| SshError::KeyFile {
                path: key.to_string(),
                source,
            })?
    };
    Ok(russh::keys::decode_secret_key(&content, passphrase)?)
}

/// Connect and log in. Banners and later connection failures are pushed to
/// `notices`.
pub async fn connect(
    target: &RemoteTarget,
    notices: mpsc::UnboundedSender<Notice>,
) -> Result<client::Handle<ClientHandler>, SshError> {
    let config = Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    });
    let handler = ClientHandler {
        host: target.host.clone(),
        expected_fingerprint: target.host_key_fingerprint.clone(),
        notices,
    };

    let login = async {
        // Keys are read per connection so a rotated file is picked up.
        let key = match &target.credentials {
            RemoteCredentials::PrivateKey { key, passphrase } => {
                Some(load_private_key(key, passphrase.as_deref()).await?)
            }
            RemoteCredentials::Password(_) => None,
        };

        let mut handle =
            client::connect(config, (target.host.as_str(), target.port), handler).await?;
        debug!("SSH handshake with {}:{} completed", target.host, target.port);

        let result = match (&target.credentials, key) {
            (RemoteCredentials::Password(password), _) => {
                handle
                    .authenticate_password(&target.username, password)
                    .await?
            }
            (_, Some(key)) => {
                let key = PrivateKeyWithHashAlg::new(Arc::new(key), None);
                handle.authenticate_publickey(&target.username, key).await?
            }
            (_, None) => return Err(SshError::AuthenticationRejected),
        };
        if !result.success() {
            return Err(SshError::AuthenticationRejected);
        }
        info!(
            "SSH login as {}@{}:{} succeeded",
            target.username, target.host, target.port
        );
        Ok(handle)
    };

    let timeout = Duration::from_millis(target.connect_timeout_ms);
    tokio::time::timeout(timeout, login)
        .await
        .map_err(|_| SshError::Timeout(target.connect_timeout_ms))?
}

/// Open a session channel with a PTY and start the user's shell.
pub async fn open_shell(
    handle: &client::Handle<ClientHandler>,
    term: &str,
    geometry: &Geometry,
) -> Result<Channel<client::Msg>, SshError> {
    let channel = handle
        .channel_open_session()
        .await
        .map_err(SshError::Channel)?;
    channel
        .request_pty(
            false,
            term,
            geometry.cols,
            geometry.rows,
            geometry.width,
            geometry.height,
            &[],
        )
        .await
        .map_err(SshError::Channel)?;
    channel
        .request_shell(false)
        .await
        .map_err(SshError::Channel)?;
    Ok(channel)
}

/// Close the connection. Errors mean it is already gone.
pub async fn end(handle: &client::Handle<ClientHandler>) {
    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, "", "en")
        .await
    {
        debug!("SSH disconnect: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_format() {
        let fp = fingerprint_from_bytes(b"key bytes");
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
        // 32-byte digest, unpadded base64
        assert_eq!(fp.len(), "SHA256:".len() + 43);
    }

    #[test]
    fn test_fingerprints_match() {
        let fp = fingerprint_from_bytes(b"key bytes");
        assert!(fingerprints_match(&fp, &fp));
        assert!(fingerprints_match(fp.trim_start_matches("SHA256:"), &fp));
        assert!(fingerprints_match(&format!(" {}= ", fp), &fp));
        assert!(!fingerprints_match(&fingerprint_from_bytes(b"other"), &fp));
    }

    #[tokio::test]
    async fn test_missing_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_ed25519");
        let err = load_private_key(path.to_str().unwrap(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SshError::KeyFile { .. }));
    }

    #[tokio::test]
    async fn test_garbage_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_ed25519");
        std::fs::write(&path, "not a key").unwrap();
        let err = load_private_key(path.to_str().unwrap(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SshError::Key(_)));
    }
}
