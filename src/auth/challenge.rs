//! Salted challenge-response login.
//!
//! The gateway stores `sha512(static_salt + password)`. The client sends its
//! username and receives `[static_salt, dynamic_salt]`; it then answers with
//! `sha512(dynamic_salt + sha512(static_salt + password))`. Every connection
//! gets a fresh dynamic salt, so a captured answer is worthless elsewhere.
//! Unknown usernames receive a decoy static salt that stays fixed for the
//! authenticator's lifetime.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::crypto::{SALT_LEN, constant_time_eq, is_sha512_hex, random_salt, salted_hash};
use super::{AuthOutcome, OptionsError, expire, reject, string_option, time_out, timeout_option};
use crate::transport::{Connection, ServerEvent};

pub const USERNAME_EVENT: &str = "username";
pub const PASSWORD_EVENT: &str = "password";

/// Shortest static salt accepted in the configuration.
pub const MIN_SALT_LEN: usize = 8;

#[derive(Debug, Clone)]
pub struct ChallengeResponseAuth {
    username: String,
    /// Lowercase `sha512(salt + password)`.
    password_hash: String,
    salt: String,
    decoy_salt: String,
    timeout: Option<Duration>,
}

impl ChallengeResponseAuth {
    /// `password_hash` must already be `sha512(salt + password)` in hex.
    pub fn new(
        username: impl Into<String>,
        password_hash: &str,
        salt: impl Into<String>,
    ) -> Result<Self, OptionsError> {
        let username = username.into();
        let salt = salt.into();
        if username.trim().is_empty() {
            return Err(OptionsError::Blank("username"));
        }
        if !is_sha512_hex(password_hash) {
            return Err(OptionsError::PasswordHash);
        }
        if salt.trim().is_empty() || salt.chars().count() < MIN_SALT_LEN {
            return Err(OptionsError::Salt(MIN_SALT_LEN));
        }
        let decoy_salt = random_salt(salt.chars().count());
        Ok(Self {
            username,
            password_hash: password_hash.to_ascii_lowercase(),
            salt,
            decoy_salt,
            timeout: None,
        })
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn from_options(options: &toml::Table) -> Result<Self, OptionsError> {
        let timeout = timeout_option(options)?;
        let username = string_option(options, &["username"])?;
        let password_hash = string_option(options, &["password", "password_hash"])
            .map_err(|_| OptionsError::PasswordHash)?;
        let salt = string_option(options, &["salt"]).map_err(|_| OptionsError::Salt(MIN_SALT_LEN))?;
        Ok(Self::new(username, &password_hash, salt)?.with_timeout(timeout))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Static salt shown for `username`: the real one, or the decoy.
    fn static_salt_for(&self, username: &str) -> &str {
        if constant_time_eq(username, &self.username) {
            &self.salt
        } else {
            &self.decoy_salt
        }
    }

    fn verify(&self, username: &str, dynamic_salt: &str, answer: &str) -> bool {
        let expected = salted_hash(dynamic_salt, &self.password_hash);
        let hash_ok = constant_time_eq(&answer.to_ascii_lowercase(), &expected);
        let user_ok = constant_time_eq(username, &self.username);
        hash_ok & user_ok
    }

    pub(crate) async fn handshake(
        &self,
        conn: &mut Connection,
        deadline: Option<Instant>,
    ) -> Option<AuthOutcome> {
        // (username, dynamic salt) once the first `username` event arrived.
        let mut challenge: Option<(String, String)> = None;

        loop {
            tokio::select! {
                event = conn.recv() => {
                    let event = event?;
                    match event.name.as_str() {
                        USERNAME_EVENT => {
                            if challenge.is_some() {
                                debug!("{} duplicate username ignored", conn);
                                continue;
                            }
                            let Some(username) = event.parse::<String>() else {
                                warn!("{} authenticate failed (invalid username)", conn);
                                return Some(reject(conn).await);
                            };
                            let dynamic_salt = random_salt(SALT_LEN);
                            let salts = [self.static_salt_for(&username).to_string(), dynamic_salt.clone()];
                            conn.emit(ServerEvent::Salts(salts)).await;
                            challenge = Some((username, dynamic_salt));
                        }
                        PASSWORD_EVENT => {
                            let answer = event.parse::<String>().filter(|h| is_sha512_hex(h));
                            let (Some(answer), Some((username, dynamic_salt))) = (answer, challenge.as_ref()) else {
                                warn!("{} authenticate failed (invalid password)", conn);
                                return Some(reject(conn).await);
                            };
                            if !self.verify(username, dynamic_salt, &answer) {
                                warn!("{} authenticate failed", conn);
                                return Some(reject(conn).await);
                            }
                            info!("{} authenticated", conn);
                            conn.emit(ServerEvent::Authenticated).await;
                            return Some(AuthOutcome::Authenticated);
                        }
                        other => debug!("{} ignoring `{}` before authentication", conn, other),
                    }
                }
                _ = expire(deadline) => return Some(time_out(conn).await),
            }
        }
    }
}
