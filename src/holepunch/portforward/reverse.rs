//! `tcpip-forward` / `cancel-tcpip-forward` handling: grants reverse forwards,
//! runs their listeners and relays accepted connections back to the client.

use std::{future::Future, io, net::SocketAddr, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use crate::holepunch::{
    bridge::{self, BoxedStream},
    messages::{ForwardSpec, ForwardedTcpip, GlobalRequest, Reply},
    portforward::{
        is_local_bind_address,
        registry::{CancelSignal, ForwardKey, ForwardRegistry},
    },
    supervisor::{ConnScope, wait_closed},
};

/// Opens the `forwarded-tcpip` channel for one relayed connection.
#[async_trait]
pub trait RelayOpener: Send + Sync + 'static {
    async fn open_relay(&self, msg: &ForwardedTcpip) -> anyhow::Result<BoxedStream>;
}

#[async_trait]
impl RelayOpener for russh::server::Handle {
    async fn open_relay(&self, msg: &ForwardedTcpip) -> anyhow::Result<BoxedStream> {
        let channel = self
            .channel_open_forwarded_tcpip(
                msg.address.clone(),
                msg.port,
                msg.origin_address.clone(),
                msg.origin_port,
            )
            .await?;
        Ok(Box::new(channel.into_stream()))
    }
}

/// Where a reverse forward's inbound connections come from.
pub trait Accept: Send + Sync + 'static {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl Accept for TcpListener {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }
}

/// Per-connection dispatcher for reverse-forward requests.
pub struct ReverseForwarder<O> {
    registry: Arc<ForwardRegistry>,
    scope: Arc<ConnScope>,
    opener: Arc<O>,
}

impl<O: RelayOpener> ReverseForwarder<O> {
    pub fn new(registry: Arc<ForwardRegistry>, scope: Arc<ConnScope>, opener: O) -> Self {
        Self {
            registry,
            scope,
            opener: Arc::new(opener),
        }
    }

    pub async fn handle(&self, req: GlobalRequest) -> Reply {
        let kind = req.kind();
        let reply = match req {
            GlobalRequest::TcpipForward(spec) => self.grant(spec).await,
            GlobalRequest::CancelTcpipForward(spec) => self.cancel(&spec),
        };
        if let Reply::Failure(reason) = &reply {
            tracing::warn!(conn = %self.scope.id(), request = kind, reason = %reason, "portforward: request refused");
        }
        reply
    }

    async fn grant(&self, spec: ForwardSpec) -> Reply {
        let Ok(port) = u16::try_from(spec.port) else {
            return Reply::failure(format!("invalid port {}", spec.port));
        };

        if !is_local_bind_address(&spec.address) {
            tracing::debug!(
                conn = %self.scope.id(),
                bind = %spec.key(),
                "portforward: pre-emptive forward acknowledged without listener"
            );
            return Reply::ok();
        }

        let (key, listener, cancel) = if port == 0 {
            // The key has to name the real port, so bind before reserving.
            let listener = match TcpListener::bind((spec.address.as_str(), 0)).await {
                Ok(l) => l,
                Err(err) => return Reply::failure(format!("bind {}: {err}", spec.key())),
            };
            let bound = match listener.local_addr() {
                Ok(a) => a.port(),
                Err(err) => return Reply::failure(format!("bind {}: {err}", spec.key())),
            };
            let key = ForwardKey::new(&spec.address, u32::from(bound));
            match self.registry.add(key.clone()) {
                Ok(cancel) => (key, listener, cancel),
                Err(err) => return Reply::failure(err.to_string()),
            }
        } else {
            let key = spec.key();
            let cancel = match self.registry.add(key.clone()) {
                Ok(c) => c,
                Err(err) => return Reply::failure(err.to_string()),
            };
            match TcpListener::bind((spec.address.as_str(), port)).await {
                Ok(listener) => (key, listener, cancel),
                Err(err) => {
                    self.registry.cancel(&key);
                    return Reply::failure(format!("bind {key}: {err}"));
                }
            }
        };

        let bound_port = listener.local_addr().map(|a| u32::from(a.port())).unwrap_or(spec.port);
        let forward = ActiveForward {
            key: key.clone(),
            address: spec.address,
            port: bound_port,
            listener,
            cancel,
        };

        let started = self.scope.spawn(
            "reverse-forward",
            run_forward(forward, self.registry.clone(), self.scope.clone(), self.opener.clone()),
        );
        if !started {
            self.registry.cancel(&key);
            return Reply::failure("connection closing");
        }

        tracing::info!(conn = %self.scope.id(), bind = %key, "portforward: reverse listener added");
        Reply::Success {
            bound_port: (port == 0).then_some(bound_port),
        }
    }

    fn cancel(&self, spec: &ForwardSpec) -> Reply {
        let key = spec.key();
        if self.registry.cancel(&key) {
            tracing::info!(conn = %self.scope.id(), bind = %key, "portforward: reverse forward cancelled");
            Reply::ok()
        } else {
            Reply::failure(format!("no reservation for {key}"))
        }
    }
}

struct ActiveForward<L> {
    key: ForwardKey,
    address: String,
    port: u32,
    listener: L,
    cancel: CancelSignal,
}

/// Accepts until the reservation is cancelled, the owning connection goes
/// away, or `accept` fails. The listener is dropped on the way out and the
/// reservation released if it still exists.
async fn run_forward<O: RelayOpener, L: Accept>(
    forward: ActiveForward<L>,
    registry: Arc<ForwardRegistry>,
    scope: Arc<ConnScope>,
    opener: Arc<O>,
) -> anyhow::Result<()> {
    let ActiveForward {
        key,
        address,
        port,
        listener,
        mut cancel,
    } = forward;
    let mut closed = scope.closed();

    loop {
        tokio::select! {
            _ = &mut cancel => {
                tracing::debug!(bind = %key, "portforward: cancel signal received");
                break;
            }
            _ = wait_closed(&mut closed) => {
                if registry.cancel(&key) {
                    tracing::debug!(bind = %key, "portforward: connection gone, reservation released");
                }
                break;
            }
            res = listener.accept() => match res {
                Ok((conn, peer)) => {
                    tracing::debug!(bind = %key, peer = %peer, "portforward: accepted connection");
                    let msg = relay_message(&address, port, peer);
                    scope.spawn("relay", relay(opener.clone(), msg, conn));
                }
                Err(err) => {
                    tracing::warn!(bind = %key, err = %err, "portforward: accept failed");
                    registry.cancel(&key);
                    break;
                }
            },
        }
    }

    drop(listener);
    tracing::info!(bind = %key, "portforward: reverse listener removed");
    Ok(())
}

fn relay_message(address: &str, port: u32, peer: SocketAddr) -> ForwardedTcpip {
    ForwardedTcpip {
        address: address.to_string(),
        port,
        origin_address: peer.ip().to_canonical().to_string(),
        origin_port: u32::from(peer.port()),
    }
}

async fn relay<O: RelayOpener>(opener: Arc<O>, msg: ForwardedTcpip, conn: TcpStream) -> anyhow::Result<()> {
    metrics::counter!("holepunch_relayed_connections_total").increment(1);
    let channel = opener.open_relay(&msg).await.with_context(|| {
        format!(
            "open forwarded-tcpip for {}:{} from {}:{}",
            msg.address, msg.port, msg.origin_address, msg.origin_port
        )
    })?;
    bridge::pipe(channel, "SSH tunnel", conn, "Local connection").await?;
    Ok(())
}
