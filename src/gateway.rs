//! Namespace router: one authenticator + backend chain per configured target.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::auth::{AuthOutcome, Authenticator};
use crate::backend::Backend;
use crate::config::{ConfigError, GatewayConfig, normalize_namespace};
use crate::transport::Connection;

/// The middleware installed on one namespace, run in order for every
/// connection: the authenticator, then the backend.
pub struct Chain {
    namespace: String,
    auth: Arc<Authenticator>,
    backend: Backend,
}

impl Chain {
    pub fn new(namespace: impl Into<String>, auth: Arc<Authenticator>, backend: Backend) -> Self {
        Self {
            namespace: namespace.into(),
            auth,
            backend,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Run one connection through the chain until it ends.
    pub async fn serve(&self, mut conn: Connection) {
        info!(
            "{} connected to {} ({} auth, {} backend)",
            conn,
            self.namespace,
            self.auth.name(),
            self.backend.name()
        );

        let handshake = self.auth.on_new_connection(&conn);
        let signal = self.backend.on_new_connection(&conn);
        handshake.run(&mut conn).await;

        match signal.await {
            Ok(AuthOutcome::Authenticated) => self.backend.attach(&mut conn).await,
            Ok(AuthOutcome::Rejected) => debug!("{} not authenticated", conn),
            Err(_) => debug!("{} left during authentication", conn),
        }

        let lifetime = Utc::now() - conn.connected_at();
        info!(
            "{} session ended after {}.{:03}s",
            conn,
            lifetime.num_seconds(),
            lifetime.num_milliseconds() % 1000
        );
    }
}

/// All chains, keyed by namespace.
pub struct Gateway {
    chains: HashMap<String, Arc<Chain>>,
}

impl Gateway {
    /// Validate `config` and build a chain per target. Each target gets its
    /// own authenticator instance.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, ConfigError> {
        let targets = config.validate()?;
        let mut chains = HashMap::with_capacity(targets.len());
        for (i, target) in targets.iter().enumerate() {
            let entry = config.auth.get(&target.auth).ok_or_else(|| ConfigError {
                path: format!("targets[{}].auth", i),
                message: "undefined authentication configuration".to_string(),
            })?;
            let auth = Arc::new(Authenticator::from_entry(entry).map_err(|e| ConfigError {
                path: format!("auth.{}", target.auth),
                message: e.to_string(),
            })?);
            let backend = Backend::for_target(target, auth.clone());
            info!(
                "Installed {} target on {} with `{}` ({})",
                target.kind.name(),
                target.namespace,
                target.auth,
                auth.name()
            );
            chains.insert(
                target.namespace.clone(),
                Arc::new(Chain::new(target.namespace.clone(), auth, backend)),
            );
        }
        Ok(Self { chains })
    }

    /// Chain for a namespace, with or without the leading `/`.
    pub fn route(&self, namespace: &str) -> Option<Arc<Chain>> {
        self.chains.get(&normalize_namespace(namespace)).cloned()
    }

    pub fn namespaces(&self) -> Vec<&str> {
        let mut namespaces: Vec<&str> = self.chains.keys().map(String::as_str).collect();
        namespaces.sort_unstable();
        namespaces
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ClientEvent, Outbound, Peer, ServerEvent};
    use serde_json::json;
    use std::time::Duration;

    const CONFIG: &str = r#"
        [auth.simple]
        type = "shared-secret"
        timeout = 5000
        username = "admin"
        password = "s3cret"

        [auth.salty]
        type = "challenge-response"
        timeout = 5000
        username = "ops"
        password = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
        salt = "staticsalt"

        [[targets]]
        nsp = "/local"
        type = "local"
        auth = "simple"
        shell = "/bin/sh"
        conpty = true

        [[targets]]
        nsp = "remote"
        type = "remote"
        auth = "salty"
        host = "127.0.0.1"
        port = 22
        username = "deploy"
        password = "pw"
    "#;

    fn gateway() -> Gateway {
        let config: GatewayConfig = toml::from_str(CONFIG).unwrap();
        Gateway::from_config(&config).unwrap()
    }

    async fn next(peer: &mut Peer) -> Option<Outbound> {
        tokio::time::timeout(Duration::from_secs(10), peer.recv())
            .await
            .ok()
            .flatten()
    }

    #[test]
    fn test_routes_by_namespace() {
        let gateway = gateway();
        assert_eq!(gateway.namespaces(), vec!["/local", "/remote"]);
        assert_eq!(gateway.route("/remote").unwrap().namespace(), "/remote");
        assert_eq!(gateway.route("local").unwrap().namespace(), "/local");
        assert!(gateway.route("/").is_none());
        assert!(gateway.route("/other").is_none());
    }

    #[test]
    fn test_config_error_stops_construction() {
        let mut config: GatewayConfig = toml::from_str(CONFIG).unwrap();
        config.targets[1].auth = "missing".to_string();
        let err = Gateway::from_config(&config).err().unwrap();
        assert_eq!(err.path, "targets[1].auth");
    }

    #[test]
    fn test_targets_get_separate_authenticators() {
        let mut config: GatewayConfig = toml::from_str(CONFIG).unwrap();
        config.targets[1].auth = "simple".to_string();
        let gateway = Gateway::from_config(&config).unwrap();
        let local = gateway.route("/local").unwrap();
        let remote = gateway.route("/remote").unwrap();
        assert!(!Arc::ptr_eq(&local.auth, &remote.auth));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_session_end_to_end() {
        let chain = gateway().route("/local").unwrap();
        let (conn, mut peer) = Connection::pair("127.0.0.1:1");

        let client = async {
            peer.send(ClientEvent::json(
                "auth",
                json!({"username": "admin", "password": "s3cret"}),
            ))
            .await;
            assert_eq!(next(&mut peer).await, Some(Outbound::Event(ServerEvent::Authenticated)));
            assert_eq!(
                next(&mut peer).await,
                Some(Outbound::Event(ServerEvent::Size { cols: 80, rows: 30 }))
            );
            assert_eq!(next(&mut peer).await, Some(Outbound::Event(ServerEvent::Ready)));

            peer.send(ClientEvent::json("message", json!("ls\n"))).await;
            match next(&mut peer).await {
                Some(Outbound::Event(ServerEvent::Message(_))) => {}
                other => panic!("expected output, got {:?}", other),
            }

            peer.send(ClientEvent::json("exit", serde_json::Value::Null)).await;
            loop {
                match next(&mut peer).await {
                    Some(Outbound::Event(ServerEvent::Message(_))) => {}
                    Some(Outbound::Disconnect) => break,
                    other => panic!("unexpected {:?}", other),
                }
            }
            assert_eq!(next(&mut peer).await, None);
        };

        tokio::join!(chain.serve(conn), client);
        assert_eq!(chain.auth.pending(), 0);
    }

    #[tokio::test]
    async fn test_failed_challenges_each_get_fresh_salt() {
        let chain = gateway().route("/remote").unwrap();
        let mut dynamic_salts = Vec::new();

        for _ in 0..2 {
            let (conn, mut peer) = Connection::pair("127.0.0.1:1");
            let client = async {
                peer.send(ClientEvent::json("username", json!("ops"))).await;
                let salts = match next(&mut peer).await {
                    Some(Outbound::Event(ServerEvent::Salts(salts))) => salts,
                    other => panic!("expected salts, got {:?}", other),
                };
                peer.send(ClientEvent::json("password", json!("0".repeat(128)))).await;
                assert_eq!(
                    next(&mut peer).await,
                    Some(Outbound::Event(ServerEvent::UsernameOrPasswordIncorrect))
                );
                assert_eq!(next(&mut peer).await, Some(Outbound::Disconnect));
                salts
            };
            let ((), salts) = tokio::join!(chain.serve(conn), client);
            assert_eq!(salts[0], "staticsalt");
            dynamic_salts.push(salts[1].clone());
        }

        assert_ne!(dynamic_salts[0], dynamic_salts[1]);
        assert_eq!(chain.auth.pending(), 0);
    }
}
