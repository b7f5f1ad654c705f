//! `direct-tcpip`: the server dials a target for the client.

use std::{sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};

use crate::holepunch::{
    bridge,
    messages::{ChannelOpen, DirectTcpip, RejectReason},
    supervisor::ConnScope,
};

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of a channel-open request.
#[derive(Debug)]
pub enum ChannelDecision {
    /// Dialed; bridge the channel to `target` with [`DirectForwarder::bridge`].
    Accept { req: DirectTcpip, target: TcpStream },
    Reject { reason: RejectReason, message: String },
    /// Not a `direct-tcpip` request; the session decides what to do with it.
    NotMine(ChannelOpen),
}

pub struct DirectForwarder {
    scope: Arc<ConnScope>,
    dial_timeout: Duration,
}

impl DirectForwarder {
    pub fn new(scope: Arc<ConnScope>, dial_timeout: Duration) -> Self {
        Self { scope, dial_timeout }
    }

    pub async fn open(&self, req: ChannelOpen) -> ChannelDecision {
        let req = match req {
            ChannelOpen::DirectTcpip(req) => req,
            other => return ChannelDecision::NotMine(other),
        };

        let Ok(port) = u16::try_from(req.target_port) else {
            return ChannelDecision::Reject {
                reason: RejectReason::ConnectFailed,
                message: format!("invalid target port {}", req.target_port),
            };
        };

        let dial = TcpStream::connect((req.target_address.as_str(), port));
        let result = match tokio::time::timeout(self.dial_timeout, dial).await {
            Ok(r) => r,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("dial timed out after {:?}", self.dial_timeout),
            )),
        };

        match result {
            Ok(target) => {
                metrics::counter!("holepunch_direct_forwards_total").increment(1);
                ChannelDecision::Accept { req, target }
            }
            Err(err) => {
                tracing::warn!(
                    conn = %self.scope.id(),
                    target = %req.target(),
                    origin = %req.origin(),
                    err = %err,
                    "portforward: direct dial failed"
                );
                ChannelDecision::Reject {
                    reason: RejectReason::ConnectFailed,
                    message: err.to_string(),
                }
            }
        }
    }

    /// Copies between the accepted channel and the dialed connection under the
    /// connection's scope. Both are closed when the copy ends.
    pub fn bridge<C>(&self, channel: C, req: DirectTcpip, target: TcpStream) -> bool
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let conn = self.scope.id().to_string();
        self.scope.spawn("direct-forward", async move {
            tracing::debug!(conn = %conn, target = %req.target(), origin = %req.origin(), "portforward: direct forward open");
            bridge::pipe(channel, "SSH channel", target, "Dialed connection").await?;
            tracing::debug!(conn = %conn, target = %req.target(), "portforward: direct forward closed");
            Ok(())
        })
    }
}
