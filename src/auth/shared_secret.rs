//! Plain username/password check over a single `auth` event.

use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::crypto::constant_time_eq;
use super::{AuthOutcome, OptionsError, expire, reject, string_option, time_out, timeout_option};
use crate::transport::{Connection, ServerEvent};

const AUTH_EVENT: &str = "auth";

#[derive(Deserialize)]
struct Credentials {
    username: String,
    password: String,
}

/// Compares the submitted pair against a configured pair.
#[derive(Debug, Clone)]
pub struct SharedSecretAuth {
    username: String,
    password: String,
    timeout: Option<Duration>,
}

impl SharedSecretAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn from_options(options: &toml::Table) -> Result<Self, OptionsError> {
        let timeout = timeout_option(options)?;
        let username = string_option(options, &["username"])?;
        let password = string_option(options, &["password"])?;
        Ok(Self::new(username, password).with_timeout(timeout))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn matches(&self, credentials: &Credentials) -> bool {
        let user = constant_time_eq(&credentials.username, &self.username);
        let pass = constant_time_eq(&credentials.password, &self.password);
        user & pass
    }

    pub(crate) async fn handshake(
        &self,
        conn: &mut Connection,
        deadline: Option<Instant>,
    ) -> Option<AuthOutcome> {
        loop {
            tokio::select! {
                event = conn.recv() => {
                    let event = event?;
                    if event.name != AUTH_EVENT {
                        debug!("{} ignoring `{}` before authentication", conn, event.name);
                        continue;
                    }
                    let Some(credentials) = event.parse::<Credentials>() else {
                        warn!("{} authenticate failed (malformed credentials)", conn);
                        return Some(reject(conn).await);
                    };
                    if !self.matches(&credentials) {
                        warn!("{} authenticate failed", conn);
                        return Some(reject(conn).await);
                    }
                    info!("{} authenticated", conn);
                    conn.emit(ServerEvent::Authenticated).await;
                    return Some(AuthOutcome::Authenticated);
                }
                _ = expire(deadline) => return Some(time_out(conn).await),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Authenticator;
    use crate::transport::{ClientEvent, Outbound};
    use serde_json::json;

    fn authenticator(timeout_ms: u64) -> Authenticator {
        let timeout = (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms));
        Authenticator::shared_secret(SharedSecretAuth::new("admin", "s3cret").with_timeout(timeout))
    }

    fn credentials(username: &str, password: &str) -> ClientEvent {
        ClientEvent::json(AUTH_EVENT, json!({"username": username, "password": password}))
    }

    #[tokio::test]
    async fn test_exact_credentials_authenticate() {
        let auth = authenticator(5000);
        let (mut conn, mut peer) = Connection::pair("127.0.0.1:1");
        let signal = auth.subscribe(conn.id());
        let handshake = auth.on_new_connection(&conn);

        peer.send(credentials("admin", "s3cret")).await;
        assert_eq!(handshake.run(&mut conn).await, Some(AuthOutcome::Authenticated));

        assert_eq!(signal.await.unwrap(), AuthOutcome::Authenticated);
        assert_eq!(peer.recv().await, Some(Outbound::Event(ServerEvent::Authenticated)));
        assert!(!conn.is_disconnected());
        assert_eq!(auth.pending(), 0);
    }

    #[tokio::test]
    async fn test_near_miss_rejected() {
        for (user, pass) in [("admin", "s3cre"), ("Admin", "s3cret"), ("admin", "s3cret ")] {
            let auth = authenticator(0);
            let (mut conn, mut peer) = Connection::pair("127.0.0.1:1");
            let signal = auth.subscribe(conn.id());
            let handshake = auth.on_new_connection(&conn);

            peer.send(credentials(user, pass)).await;
            assert_eq!(handshake.run(&mut conn).await, Some(AuthOutcome::Rejected));
            assert_eq!(signal.await.unwrap(), AuthOutcome::Rejected);
            assert_eq!(
                peer.recv().await,
                Some(Outbound::Event(ServerEvent::UsernameOrPasswordIncorrect))
            );
            assert_eq!(peer.recv().await, Some(Outbound::Disconnect));
        }
    }

    #[tokio::test]
    async fn test_malformed_credentials_rejected() {
        let auth = authenticator(0);
        let (mut conn, mut peer) = Connection::pair("127.0.0.1:1");
        let handshake = auth.on_new_connection(&conn);

        peer.send(ClientEvent::json("message", json!("ls"))).await;
        peer.send(ClientEvent::json(AUTH_EVENT, json!({"username": "admin"}))).await;
        assert_eq!(handshake.run(&mut conn).await, Some(AuthOutcome::Rejected));
        assert_eq!(
            peer.recv().await,
            Some(Outbound::Event(ServerEvent::UsernameOrPasswordIncorrect))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_once() {
        let auth = authenticator(5000);
        let (mut conn, mut peer) = Connection::pair("127.0.0.1:1");
        let signal = auth.subscribe(conn.id());
        let started = Instant::now();
        let handshake = auth.on_new_connection(&conn);

        assert_eq!(handshake.run(&mut conn).await, Some(AuthOutcome::Rejected));
        assert!(started.elapsed() >= Duration::from_millis(5000));
        assert_eq!(signal.await.unwrap(), AuthOutcome::Rejected);
        assert_eq!(peer.recv().await, Some(Outbound::Event(ServerEvent::Timeout)));
        assert_eq!(peer.recv().await, Some(Outbound::Disconnect));
        drop(conn);
        assert_eq!(peer.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_never_fires() {
        let auth = authenticator(0);
        let (mut conn, mut peer) = Connection::pair("127.0.0.1:1");
        let handshake = auth.on_new_connection(&conn);

        let waited =
            tokio::time::timeout(Duration::from_secs(3600), handshake.run(&mut conn)).await;
        assert!(waited.is_err());
        assert_eq!(peer.try_recv(), None);
        assert_eq!(auth.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_timer_and_releases_slot() {
        let auth = authenticator(5000);
        let (mut conn, peer) = Connection::pair("127.0.0.1:1");
        let signal = auth.subscribe(conn.id());
        let started = Instant::now();
        let handshake = auth.on_new_connection(&conn);
        assert_eq!(auth.pending(), 1);

        drop(peer);
        assert_eq!(handshake.run(&mut conn).await, None);
        assert!(started.elapsed() < Duration::from_millis(5000));
        assert!(signal.await.is_err());
        assert_eq!(auth.pending(), 0);
    }

    #[test]
    fn test_options() {
        let options: toml::Table = toml::from_str("username = \"a\"\npassword = \"b\"").unwrap();
        let auth = SharedSecretAuth::from_options(&options).unwrap();
        assert_eq!(auth.timeout(), None);

        let options: toml::Table = toml::from_str("username = \"\"\npassword = \"b\"").unwrap();
        assert_eq!(
            SharedSecretAuth::from_options(&options).unwrap_err(),
            OptionsError::Blank("username")
        );

        let options: toml::Table = toml::from_str("username = \"  \"\npassword = \"b\"").unwrap();
        assert_eq!(
            SharedSecretAuth::from_options(&options).unwrap_err(),
            OptionsError::Blank("username")
        );

        let options: toml::Table = toml::from_str("username = \"a\"").unwrap();
        assert_eq!(
            SharedSecretAuth::from_options(&options).unwrap_err(),
            OptionsError::Blank("password")
        );
    }
}
