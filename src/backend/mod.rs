//! Backend adapters: what an authenticated connection gets bridged to.

pub mod local;
pub mod remote;

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::auth::{AuthOutcome, Authenticator};
use crate::config::{Target, TargetKind};
use crate::transport::Connection;

pub use local::LocalBackend;
pub use remote::RemoteBackend;

/// Client input.
pub const MESSAGE_EVENT: &str = "message";
/// Client terminal resize.
pub const RESIZE_EVENT: &str = "resize";
/// Client force exit.
pub const EXIT_EVENT: &str = "exit";

pub enum Backend {
    Local(LocalBackend),
    Remote(RemoteBackend),
}

impl Backend {
    pub fn for_target(target: &Target, auth: Arc<Authenticator>) -> Self {
        match &target.kind {
            TargetKind::Local(options) => Backend::Local(LocalBackend::new(options.clone(), auth)),
            TargetKind::Remote(remote) => Backend::Remote(RemoteBackend::new(remote.clone(), auth)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Local(_) => "local",
            Backend::Remote(_) => "remote",
        }
    }

    fn auth(&self) -> &Authenticator {
        match self {
            Backend::Local(backend) => &backend.auth,
            Backend::Remote(backend) => &backend.auth,
        }
    }

    /// Subscribe for the connection's authentication outcome.
    pub fn on_new_connection(&self, conn: &Connection) -> oneshot::Receiver<AuthOutcome> {
        self.auth().subscribe(conn.id())
    }

    /// Bridge an authenticated connection until either side ends.
    pub async fn attach(&self, conn: &mut Connection) {
        match self {
            Backend::Local(backend) => backend.attach(conn).await,
            Backend::Remote(backend) => backend.attach(conn).await,
        }
    }
}
