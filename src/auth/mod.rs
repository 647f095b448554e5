//! Connection authentication.
//!
//! Each target owns an [`Authenticator`]. When a connection arrives the target
//! first lets its backend subscribe for the outcome, then runs the handshake.
//! The outcome is delivered to that subscription at most once, and the
//! subscription slot is released when the handshake finishes or the
//! connection goes away, whichever comes first.

pub mod challenge;
pub mod crypto;
pub mod shared_secret;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::warn;

use crate::config::AuthEntry;
use crate::transport::{Connection, ConnectionId, ServerEvent};

pub use challenge::ChallengeResponseAuth;
pub use shared_secret::SharedSecretAuth;

/// Authenticator type names accepted in `[auth.<name>] type = ...`.
pub const INSTALLED: &[&str] = &["none", "shared-secret", "challenge-response"];

/// Result of one handshake, delivered to the subscribed backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Authenticated,
    Rejected,
}

/// Invalid authenticator options. Display text names the offending option.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OptionsError {
    #[error("invalid timeout, unset or non-negative number (milliseconds) expected")]
    Timeout,

    #[error("invalid {0}, non-empty string expected")]
    Blank(&'static str),

    #[error("invalid password, SHA-512 hex digest (128 hex digits) expected")]
    PasswordHash,

    #[error("invalid salt, string of at least {0} characters expected")]
    Salt(usize),

    #[error("unknown authenticator type `{0}`, installed: {installed}", installed = INSTALLED.join(", "))]
    UnknownKind(String),
}

/// Pending once-listeners keyed by connection.
#[derive(Default)]
pub struct SignalMap {
    slots: Mutex<HashMap<ConnectionId, oneshot::Sender<AuthOutcome>>>,
}

impl SignalMap {
    /// Register a listener for `id`, replacing any earlier one.
    pub fn subscribe(&self, id: &ConnectionId) -> oneshot::Receiver<AuthOutcome> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut slots) = self.slots.lock() {
            slots.insert(id.clone(), tx);
        }
        rx
    }

    /// Deliver `outcome` and drop the slot. Returns whether a listener was waiting.
    pub fn emit(&self, id: &ConnectionId, outcome: AuthOutcome) -> bool {
        let slot = self.slots.lock().ok().and_then(|mut slots| slots.remove(id));
        match slot {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Drop the slot without delivering anything.
    pub fn release(&self, id: &ConnectionId) {
        if let Ok(mut slots) = self.slots.lock() {
            slots.remove(id);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum Scheme {
    Null,
    SharedSecret(SharedSecretAuth),
    ChallengeResponse(ChallengeResponseAuth),
}

/// A configured authenticator plus its pending-outcome registry.
pub struct Authenticator {
    scheme: Scheme,
    signals: SignalMap,
}

impl Authenticator {
    pub fn null() -> Self {
        Self::with_scheme(Scheme::Null)
    }

    pub fn shared_secret(auth: SharedSecretAuth) -> Self {
        Self::with_scheme(Scheme::SharedSecret(auth))
    }

    pub fn challenge_response(auth: ChallengeResponseAuth) -> Self {
        Self::with_scheme(Scheme::ChallengeResponse(auth))
    }

    fn with_scheme(scheme: Scheme) -> Self {
        Self {
            scheme,
            signals: SignalMap::default(),
        }
    }

    /// Build from a config entry, checking its options.
    pub fn from_entry(entry: &AuthEntry) -> Result<Self, OptionsError> {
        match entry.kind.as_str() {
            "none" => Ok(Self::null()),
            "shared-secret" | "simple-auth" => {
                SharedSecretAuth::from_options(&entry.options).map(Self::shared_secret)
            }
            "challenge-response" | "salty-auth" => {
                ChallengeResponseAuth::from_options(&entry.options).map(Self::challenge_response)
            }
            other => Err(OptionsError::UnknownKind(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self.scheme {
            Scheme::Null => "none",
            Scheme::SharedSecret(_) => "shared-secret",
            Scheme::ChallengeResponse(_) => "challenge-response",
        }
    }

    fn timeout(&self) -> Option<Duration> {
        match &self.scheme {
            Scheme::Null => None,
            Scheme::SharedSecret(auth) => auth.timeout(),
            Scheme::ChallengeResponse(auth) => auth.timeout(),
        }
    }

    /// Subscribe for the outcome of `id`'s handshake.
    pub fn subscribe(&self, id: &ConnectionId) -> oneshot::Receiver<AuthOutcome> {
        self.signals.subscribe(id)
    }

    /// Number of connections still waiting for an outcome.
    pub fn pending(&self) -> usize {
        self.signals.len()
    }

    /// Start the handshake for a new connection. The timeout, if any, runs
    /// from this point.
    pub fn on_new_connection(&self, conn: &Connection) -> Handshake<'_> {
        let deadline = self.timeout().map(|t| Instant::now() + t);
        Handshake {
            auth: self,
            id: conn.id().clone(),
            deadline,
        }
    }
}

/// An in-flight handshake. Dropping it releases the connection's slot.
pub struct Handshake<'a> {
    auth: &'a Authenticator,
    id: ConnectionId,
    deadline: Option<Instant>,
}

impl Handshake<'_> {
    /// Drive the handshake to completion. Returns `None` when the client left
    /// first, in which case no outcome is delivered.
    pub async fn run(self, conn: &mut Connection) -> Option<AuthOutcome> {
        let outcome = match &self.auth.scheme {
            Scheme::Null => {
                warn!("{} authentication skipped (type = \"none\")", conn);
                Some(AuthOutcome::Authenticated)
            }
            Scheme::SharedSecret(auth) => auth.handshake(conn, self.deadline).await,
            Scheme::ChallengeResponse(auth) => auth.handshake(conn, self.deadline).await,
        };
        if let Some(outcome) = outcome {
            self.auth.signals.emit(&self.id, outcome);
        }
        outcome
    }
}

impl Drop for Handshake<'_> {
    fn drop(&mut self) {
        self.auth.signals.release(&self.id);
    }
}

/// Resolves at `deadline`, or never.
pub(crate) async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

pub(crate) async fn reject(conn: &mut Connection) -> AuthOutcome {
    conn.emit(ServerEvent::UsernameOrPasswordIncorrect).await;
    conn.disconnect().await;
    AuthOutcome::Rejected
}

pub(crate) async fn time_out(conn: &mut Connection) -> AuthOutcome {
    warn!("{} authentication timeout", conn);
    conn.emit(ServerEvent::Timeout).await;
    conn.disconnect().await;
    AuthOutcome::Rejected
}

/// `timeout` option: unset, or a non-negative number of milliseconds. Zero
/// disables the timer.
pub(crate) fn timeout_option(options: &toml::Table) -> Result<Option<Duration>, OptionsError> {
    let millis = match options.get("timeout") {
        None => return Ok(None),
        Some(toml::Value::Integer(ms)) if *ms >= 0 => *ms as f64,
        Some(toml::Value::Float(ms)) if ms.is_finite() && *ms >= 0.0 => *ms,
        Some(_) => return Err(OptionsError::Timeout),
    };
    if millis == 0.0 {
        return Ok(None);
    }
    Ok(Some(Duration::from_micros((millis * 1000.0).round() as u64)))
}

/// First of `keys` that is set, as a string with something besides whitespace.
pub(crate) fn string_option(
    options: &toml::Table,
    keys: &[&'static str],
) -> Result<String, OptionsError> {
    let name = keys.first().copied().unwrap_or("option");
    let value = keys.iter().find_map(|key| options.get(*key));
    match value {
        Some(toml::Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        _ => Err(OptionsError::Blank(name)),
    }
}
