pub mod direct;
pub mod registry;
pub mod reverse;

use std::net::IpAddr;

pub use direct::{ChannelDecision, DirectForwarder};
pub use registry::ForwardRegistry;
pub use reverse::ReverseForwarder;

/// Whether a `tcpip-forward` bind address is one this server actually listens
/// on: a loopback or unspecified IP literal, or `localhost`.
///
/// Anything else is treated as a client announcing a forward it may use later,
/// which the protocol allows; it is acknowledged without opening a listener.
pub fn is_local_bind_address(address: &str) -> bool {
    if address.eq_ignore_ascii_case("localhost") {
        return true;
    }
    address
        .parse::<IpAddr>()
        .is_ok_and(|ip| ip.is_loopback() || ip.is_unspecified())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_bind_addresses() {
        for addr in ["127.0.0.1", "0.0.0.0", "localhost", "LOCALHOST", "::1", "::", "127.0.0.2"] {
            assert!(is_local_bind_address(addr), "{addr}");
        }
        for addr in ["203.0.113.5", "", "example.com", "10.0.0.1", "localhost.example"] {
            assert!(!is_local_bind_address(addr), "{addr}");
        }
    }
}
