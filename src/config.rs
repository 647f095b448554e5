//! Gateway configuration loaded from TOML, plus the static checks that run
//! before the listener is bound.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::auth::Authenticator;

/// Namespace reserved for the transport itself.
pub const ROOT_NAMESPACE: &str = "/";

/// Main gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address the WebSocket listener binds to (default: "0.0.0.0")
    pub bind: String,

    /// Listening port (default: 8022)
    pub port: u16,

    /// Allowed `Origin` values for WebSocket upgrades. Empty allows any origin.
    pub cors: Vec<String>,

    /// Named authentication configurations, referenced by targets.
    pub auth: BTreeMap<String, AuthEntry>,

    /// Terminal targets, one per namespace.
    pub targets: Vec<TargetEntry>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8022,
            cors: Vec::new(),
            auth: BTreeMap::new(),
            targets: Vec::new(),
        }
    }
}

/// One `[auth.<name>]` entry. Options are kept untyped until the matching
/// authenticator checks them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthEntry {
    #[serde(rename = "type", default)]
    pub kind: String,

    #[serde(flatten)]
    pub options: toml::Table,
}

/// One `[[targets]]` entry as written in the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetEntry {
    #[serde(default)]
    pub nsp: String,

    #[serde(rename = "type", default)]
    pub kind: String,

    #[serde(default)]
    pub auth: String,

    #[serde(flatten)]
    pub options: toml::Table,
}

/// Options of a `local` target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalOptions {
    /// Shell binary, e.g. `/usr/bin/bash`. Defaults to the platform shell.
    pub shell: Option<PathBuf>,

    /// Request the Windows pseudo-console (ConPTY). Required on Windows, where
    /// it is the only PTY portable-pty provides. Elsewhere it only shows up in
    /// the spawn log line.
    pub conpty: bool,

    /// Initial terminal width in columns.
    pub cols: u16,

    /// Initial terminal height in rows.
    pub rows: u16,
}

impl Default for LocalOptions {
    fn default() -> Self {
        Self {
            shell: None,
            conpty: false,
            cols: 80,
            rows: 30,
        }
    }
}

/// Options of a `remote` target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteOptions {
    pub host: String,

    /// Kept wide so out-of-range values can be reported instead of failing to parse.
    #[serde(default = "default_ssh_port")]
    pub port: i64,

    pub username: String,

    pub password: Option<String>,

    /// Path to a private key file, or the PEM content itself.
    #[serde(alias = "privateKey")]
    pub private_key: Option<String>,

    pub passphrase: Option<String>,

    /// Forward client input even while the channel reports a full write buffer.
    #[serde(alias = "ignoreBackpressure")]
    pub ignore_backpressure: bool,

    /// Expected server key fingerprint (`SHA256:<base64>`). Unset accepts any key.
    #[serde(alias = "hostKeyFingerprint")]
    pub host_key_fingerprint: Option<String>,

    /// SSH connect + login timeout in milliseconds.
    #[serde(alias = "connectTimeout")]
    pub connect_timeout: Option<u64>,

    /// TERM value sent with the PTY request.
    pub term: Option<String>,
}

fn default_ssh_port() -> i64 {
    22
}

/// How the SSH login is performed.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCredentials {
    Password(String),
    PrivateKey {
        key: String,
        passphrase: Option<String>,
    },
}

/// Remote options after shape validation.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credentials: RemoteCredentials,
    pub ignore_backpressure: bool,
    pub host_key_fingerprint: Option<String>,
    pub connect_timeout_ms: u64,
    pub term: String,
}

impl RemoteOptions {
    /// Check the option shape and produce the typed target. Errors carry the
    /// offending option key.
    pub fn check(self) -> std::result::Result<RemoteTarget, (&'static str, String)> {
        if self.host.trim().is_empty() {
            return Err(("host", format!("invalid host `{}`", self.host)));
        }
        if self.port <= 0 || self.port > 65535 {
            return Err(("port", format!("invalid port {}", self.port)));
        }
        if self.username.trim().is_empty() {
            return Err(("username", format!("invalid username `{}`", self.username)));
        }

        let password = self.password.filter(|p| !p.is_empty());
        let private_key = self.private_key.filter(|k| !k.trim().is_empty());
        let credentials = match (password, private_key) {
            (Some(password), None) => {
                if self.passphrase.is_some() {
                    return Err((
                        "passphrase",
                        "`passphrase` is only valid alongside `private_key`".to_string(),
                    ));
                }
                RemoteCredentials::Password(password)
            }
            (None, Some(key)) => RemoteCredentials::PrivateKey {
                key,
                passphrase: self.passphrase,
            },
            _ => {
                return Err((
                    "password",
                    "exactly one of `password` and `private_key` should be defined".to_string(),
                ));
            }
        };

        Ok(RemoteTarget {
            host: self.host,
            port: self.port as u16,
            username: self.username,
            credentials,
            ignore_backpressure: self.ignore_backpressure,
            host_key_fingerprint: self.host_key_fingerprint,
            connect_timeout_ms: self.connect_timeout.unwrap_or(20_000),
            term: self.term.unwrap_or_else(|| "xterm-color".to_string()),
        })
    }
}

/// A target after validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub namespace: String,
    pub auth: String,
    pub kind: TargetKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TargetKind {
    Local(LocalOptions),
    Remote(RemoteTarget),
}

impl TargetKind {
    pub fn name(&self) -> &'static str {
        match self {
            TargetKind::Local(_) => "local",
            TargetKind::Remote(_) => "remote",
        }
    }
}

/// Error raised by [`GatewayConfig::validate`]; `path` points at the offending key.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("`{path}` invalid: {message}")]
pub struct ConfigError {
    pub path: String,
    pub message: String,
}

impl ConfigError {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a file, or return defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// A small working configuration, printed by `--generate-config`.
    pub fn sample() -> Self {
        let mut auth_options = toml::Table::new();
        auth_options.insert("timeout".into(), toml::Value::Integer(5000));
        auth_options.insert("username".into(), toml::Value::String("admin".into()));
        auth_options.insert("password".into(), toml::Value::String("change-me".into()));

        let mut auth = BTreeMap::new();
        auth.insert(
            "default".to_string(),
            AuthEntry {
                kind: "shared-secret".to_string(),
                options: auth_options,
            },
        );

        Self {
            auth,
            targets: vec![TargetEntry {
                nsp: "/local".to_string(),
                kind: "local".to_string(),
                auth: "default".to_string(),
                options: toml::Table::new(),
            }],
            ..Self::default()
        }
    }

    /// Socket address the listener binds to.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let addr = format!("{}:{}", self.bind, self.port);
        addr.parse()
            .with_context(|| format!("Invalid listen address: {}", addr))
    }

    /// Check the target/authenticator graph.
    ///
    /// Every auth entry is constructed once so option errors surface here,
    /// before any connection is accepted.
    pub fn validate(&self) -> std::result::Result<Vec<Target>, ConfigError> {
        if self.auth.is_empty() {
            return Err(ConfigError::new("auth", "no authentication configuration"));
        }
        for (name, entry) in &self.auth {
            Authenticator::from_entry(entry)
                .map_err(|e| ConfigError::new(format!("auth.{}", name), e.to_string()))?;
        }

        let mut namespaces = HashSet::new();
        let mut targets = Vec::with_capacity(self.targets.len());
        for (i, entry) in self.targets.iter().enumerate() {
            let path = |key: &str| format!("targets[{}].{}", i, key);

            if entry.kind != "local" && entry.kind != "remote" {
                return Err(ConfigError::new(path("type"), "invalid target type"));
            }
            if entry.nsp.trim().is_empty() {
                return Err(ConfigError::new(
                    path("nsp"),
                    "invalid namespace, non-empty string expected",
                ));
            }
            let namespace = normalize_namespace(&entry.nsp);
            if namespace == ROOT_NAMESPACE {
                return Err(ConfigError::new(
                    path("nsp"),
                    "default namespace `/` not allowed",
                ));
            }
            if !namespaces.insert(namespace.clone()) {
                return Err(ConfigError::new(path("nsp"), "namespace taken"));
            }
            if entry.auth.is_empty() {
                return Err(ConfigError::new(path("auth"), "invalid type, string expected"));
            }
            if !self.auth.contains_key(&entry.auth) {
                return Err(ConfigError::new(
                    path("auth"),
                    "undefined authentication configuration",
                ));
            }

            let kind = if entry.kind == "local" {
                let local: LocalOptions = parse_options(&entry.options, i)?;
                check_local(&local).map_err(|(key, m)| ConfigError::new(path(key), m))?;
                TargetKind::Local(local)
            } else {
                let remote: RemoteOptions = parse_options(&entry.options, i)?;
                TargetKind::Remote(
                    remote
                        .check()
                        .map_err(|(key, m)| ConfigError::new(path(key), m))?,
                )
            };

            targets.push(Target {
                namespace,
                auth: entry.auth.clone(),
                kind,
            });
        }

        Ok(targets)
    }
}

/// Deserialize the options of target `index`. A bad value is reported at its
/// own key; every option has a default, so each key can be tried alone.
fn parse_options<T: DeserializeOwned>(
    options: &toml::Table,
    index: usize,
) -> std::result::Result<T, ConfigError> {
    toml::Value::Table(options.clone())
        .try_into()
        .map_err(|e: toml::de::Error| {
            let bad_key = options.iter().find_map(|(key, value)| {
                let mut single = toml::Table::new();
                single.insert(key.clone(), value.clone());
                toml::Value::Table(single).try_into::<T>().err().map(|e| (key, e))
            });
            match bad_key {
                Some((key, e)) => {
                    ConfigError::new(format!("targets[{}].{}", index, key), e.message())
                }
                None => ConfigError::new(format!("targets[{}]", index), e.message()),
            }
        })
}

fn check_local(options: &LocalOptions) -> std::result::Result<(), (&'static str, String)> {
    if options.cols == 0 {
        return Err(("cols", "`cols` must be positive".to_string()));
    }
    if options.rows == 0 {
        return Err(("rows", "`rows` must be positive".to_string()));
    }
    // portable-pty only offers ConPTY on Windows, so it has to be opted into.
    if cfg!(windows) && !options.conpty {
        return Err((
            "conpty",
            "local targets on Windows require `conpty = true`".to_string(),
        ));
    }
    Ok(())
}

/// Trim and prefix a namespace with `/`.
pub fn normalize_namespace(nsp: &str) -> String {
    let trimmed = nsp.trim();
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}
