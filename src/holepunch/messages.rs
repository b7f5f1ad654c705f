//! Decoded shapes of the SSH port-forwarding messages (RFC 4254 §7).
//!
//! russh hands requests to the server as separate callbacks with raw fields.
//! They are turned into these closed enums once, at that boundary, and
//! everything downstream matches on the variant instead of re-inspecting
//! request-type strings.

use std::fmt;

use crate::holepunch::portforward::registry::ForwardKey;

/// Payload of `tcpip-forward` and `cancel-tcpip-forward`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    pub address: String,
    pub port: u32,
}

impl ForwardSpec {
    pub fn new(address: impl Into<String>, port: u32) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    pub fn key(&self) -> ForwardKey {
        ForwardKey::new(&self.address, self.port)
    }
}

/// Payload of a `forwarded-tcpip` channel opened by the server toward the
/// client for one accepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedTcpip {
    pub address: String,
    pub port: u32,
    pub origin_address: String,
    pub origin_port: u32,
}

/// Payload of a `direct-tcpip` channel opened by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectTcpip {
    pub target_address: String,
    pub target_port: u32,
    pub origin_address: String,
    pub origin_port: u32,
}

impl DirectTcpip {
    pub fn target(&self) -> String {
        format!("{}:{}", self.target_address, self.target_port)
    }

    pub fn origin(&self) -> String {
        format!("{}:{}", self.origin_address, self.origin_port)
    }
}

/// Global requests the port-forward dispatcher understands. Anything else is
/// answered by russh itself with `SSH_MSG_REQUEST_FAILURE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalRequest {
    TcpipForward(ForwardSpec),
    CancelTcpipForward(ForwardSpec),
}

impl GlobalRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TcpipForward(_) => "tcpip-forward",
            Self::CancelTcpipForward(_) => "cancel-tcpip-forward",
        }
    }
}

/// Reply to a [`GlobalRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `bound_port` is set when the client asked for port 0.
    Success { bound_port: Option<u32> },
    Failure(String),
}

impl Reply {
    pub fn ok() -> Self {
        Self::Success { bound_port: None }
    }

    pub fn failure(msg: impl Into<String>) -> Self {
        Self::Failure(msg.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Channel-open requests coming from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOpen {
    DirectTcpip(DirectTcpip),
    /// Every other channel type, by name (`session`, `x11`, ...).
    Other(&'static str),
}

impl ChannelOpen {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DirectTcpip(_) => "direct-tcpip",
            Self::Other(kind) => kind,
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE reason codes (RFC 4254 §5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    AdministrativelyProhibited,
    ConnectFailed,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AdministrativelyProhibited => "prohibited",
            Self::ConnectFailed => "connection failed",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_spec_key_matches_registry_format() {
        let spec = ForwardSpec::new("127.0.0.1", 8081);
        assert_eq!(spec.key().as_str(), "127.0.0.1:8081");
    }

    #[test]
    fn request_and_channel_kinds_use_wire_names() {
        let spec = ForwardSpec::new("localhost", 1);
        assert_eq!(GlobalRequest::TcpipForward(spec.clone()).kind(), "tcpip-forward");
        assert_eq!(GlobalRequest::CancelTcpipForward(spec).kind(), "cancel-tcpip-forward");
        assert_eq!(ChannelOpen::Other("session").kind(), "session");
        assert_eq!(RejectReason::ConnectFailed.to_string(), "connection failed");
    }
}
