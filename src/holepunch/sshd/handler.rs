use std::sync::Arc;

use russh::{
    Channel,
    keys::PublicKey,
    server::{Auth, Handle, Handler, Msg, Session},
};

use crate::holepunch::{
    messages::{ChannelOpen, DirectTcpip, ForwardSpec, GlobalRequest, RejectReason, Reply},
    portforward::{ChannelDecision, DirectForwarder, ReverseForwarder},
    sshd::SshServer,
    supervisor::ConnScope,
    telemetry::{self, ConnInfo},
};

/// russh callback target for one connection. Decodes each forwarding request
/// into [`GlobalRequest`] / [`ChannelOpen`] and hands it to the forwarders.
pub(super) struct ConnHandler {
    server: Arc<SshServer>,
    scope: Arc<ConnScope>,
    remote: String,
    transport: &'static str,
    reverse: Option<ReverseForwarder<Handle>>,
    direct: DirectForwarder,
}

impl ConnHandler {
    pub(super) fn new(server: Arc<SshServer>, scope: Arc<ConnScope>, remote: String, transport: &'static str) -> Self {
        let direct = DirectForwarder::new(scope.clone(), server.direct_dial_timeout);
        Self {
            server,
            scope,
            remote,
            transport,
            reverse: None,
            direct,
        }
    }

    async fn global_request(&mut self, req: GlobalRequest, session: &mut Session) -> Reply {
        let reverse = self.reverse.get_or_insert_with(|| {
            ReverseForwarder::new(self.server.registry.clone(), self.scope.clone(), session.handle())
        });
        reverse.handle(req).await
    }

    fn reject_channel(&self, open: &ChannelOpen) -> bool {
        tracing::info!(
            conn = %self.scope.id(),
            channel_type = open.kind(),
            reason = %RejectReason::AdministrativelyProhibited,
            "sshd: channel type rejected"
        );
        false
    }
}

impl Handler for ConnHandler {
    type Error = russh::Error;

    async fn auth_publickey_offered(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
        // Turning away a foreign key here spares the client a signature.
        match self.server.auth.check(user, public_key) {
            Ok(()) => Ok(Auth::Accept),
            Err(_) => Ok(Auth::reject()),
        }
    }

    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
        match self.server.auth.check(user, public_key) {
            Ok(()) => {
                tracing::info!(conn = %self.scope.id(), user = %user, remote = %self.remote, "sshd: authorized user");
                self.server.conns.add(ConnInfo {
                    id: self.scope.id().to_string(),
                    transport: self.transport,
                    remote: self.remote.clone(),
                    user: user.to_string(),
                    started_at_unix_ms: telemetry::now_unix_ms(),
                });
                Ok(Auth::Accept)
            }
            Err(err) => {
                metrics::counter!("holepunch_ssh_auth_failures_total").increment(1);
                tracing::warn!(conn = %self.scope.id(), user = %user, remote = %self.remote, err = %err, "sshd: authentication rejected");
                Ok(Auth::reject())
            }
        }
    }

    async fn tcpip_forward(&mut self, address: &str, port: &mut u32, session: &mut Session) -> Result<bool, Self::Error> {
        let req = GlobalRequest::TcpipForward(ForwardSpec::new(address, *port));
        match self.global_request(req, session).await {
            Reply::Success { bound_port } => {
                if let Some(p) = bound_port {
                    *port = p;
                }
                Ok(true)
            }
            Reply::Failure(_) => Ok(false),
        }
    }

    async fn cancel_tcpip_forward(&mut self, address: &str, port: u32, session: &mut Session) -> Result<bool, Self::Error> {
        let req = GlobalRequest::CancelTcpipForward(ForwardSpec::new(address, port));
        Ok(self.global_request(req, session).await.is_success())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let open = ChannelOpen::DirectTcpip(DirectTcpip {
            target_address: host_to_connect.to_string(),
            target_port: port_to_connect,
            origin_address: originator_address.to_string(),
            origin_port: originator_port,
        });

        match self.direct.open(open).await {
            ChannelDecision::Accept { req, target } => Ok(self.direct.bridge(channel.into_stream(), req, target)),
            ChannelDecision::Reject { reason, message } => {
                // russh answers every refused open with its own reason code;
                // ours is only logged.
                tracing::debug!(conn = %self.scope.id(), reason = %reason, msg = %message, "sshd: direct-tcpip refused");
                Ok(false)
            }
            ChannelDecision::NotMine(other) => Ok(self.reject_channel(&other)),
        }
    }

    async fn channel_open_session(&mut self, _channel: Channel<Msg>, _session: &mut Session) -> Result<bool, Self::Error> {
        Ok(self.reject_channel(&ChannelOpen::Other("session")))
    }

    async fn channel_open_x11(
        &mut self,
        _channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.reject_channel(&ChannelOpen::Other("x11")))
    }

    async fn channel_open_forwarded_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.reject_channel(&ChannelOpen::Other("forwarded-tcpip")))
    }

    async fn channel_open_direct_streamlocal(
        &mut self,
        _channel: Channel<Msg>,
        _socket_path: &str,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.reject_channel(&ChannelOpen::Other("direct-streamlocal@openssh.com")))
    }
}
