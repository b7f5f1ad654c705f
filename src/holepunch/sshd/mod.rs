//! SSH server side: authentication, connection lifecycle and the glue between
//! russh callbacks and the port-forwarding handlers.

pub mod auth;
mod handler;
#[cfg(test)]
pub(crate) mod tests;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::holepunch::{
    config::SshConfig,
    portforward::ForwardRegistry,
    supervisor::ConnScope,
    telemetry::{self, ActiveConnGuard, SharedConnections},
};

use auth::{AuthPolicy, SessionTimeouts};
use handler::ConnHandler;

/// How long a closed connection's forwards and relays get to wind down.
const SCOPE_DRAIN: Duration = Duration::from_secs(5);

/// Everything a connection needs, shared by all of them.
pub struct SshServer {
    config: Arc<russh::server::Config>,
    auth: AuthPolicy,
    registry: Arc<ForwardRegistry>,
    conns: SharedConnections,
    direct_dial_timeout: Duration,
}

impl SshServer {
    pub fn new(
        config: russh::server::Config,
        auth: AuthPolicy,
        registry: Arc<ForwardRegistry>,
        conns: SharedConnections,
        direct_dial_timeout: Duration,
    ) -> Self {
        Self {
            config: Arc::new(config),
            auth,
            registry,
            conns,
            direct_dial_timeout,
        }
    }

    /// Loads and parses key material. Any unusable key aborts startup.
    pub fn from_config(
        cfg: &SshConfig,
        registry: Arc<ForwardRegistry>,
        conns: SharedConnections,
    ) -> anyhow::Result<Self> {
        let keys = cfg.load_keys()?;
        let host_key = auth::parse_host_key(&keys.host_key)?;
        let policy = AuthPolicy::new(cfg.username.clone(), &keys.client_pubkey)?;
        let timeouts = SessionTimeouts {
            inactivity: cfg.inactivity_timeout,
            keepalive_interval: cfg.keepalive_interval,
            auth_rejection: cfg.auth_rejection_time,
        };

        tracing::info!(user = %policy.username(), "sshd: keys loaded");

        Ok(Self::new(
            auth::server_config(host_key, &timeouts),
            policy,
            registry,
            conns,
            cfg.direct_dial_timeout,
        ))
    }

    /// Runs one SSH connection over `stream` until it ends. Never fails: every
    /// error is confined to this connection and logged.
    pub async fn serve_conn<S>(self: Arc<Self>, stream: S, peer: Option<SocketAddr>, transport: &'static str)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let _active = ActiveConnGuard::new(transport);
        let id = telemetry::new_conn_id();
        let scope = ConnScope::new(id.clone());
        let remote = peer.map_or_else(|| "-".to_string(), |p| p.to_string());

        tracing::debug!(conn = %id, remote = %remote, transport, "sshd: connection opened");

        let handler = ConnHandler::new(self.clone(), scope.clone(), remote.clone(), transport);
        let result = match russh::server::run_stream(self.config.clone(), stream, handler).await {
            Ok(session) => session.await,
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => tracing::info!(conn = %id, remote = %remote, "sshd: connection closed"),
            Err(err) => tracing::warn!(conn = %id, remote = %remote, err = %err, "sshd: connection ended with error"),
        }

        scope.shutdown(SCOPE_DRAIN).await;
        self.conns.remove(&id);
    }
}
