use std::{borrow::Cow, io, time::Duration};

use axum::serve::{ListenerExt, TapIo};
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};

pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(15);

/// Normalize a bind/listen address.
///
/// Config and flags commonly use the shorthand `":PORT"` to mean "bind on all
/// interfaces". Tokio bind APIs do not accept `":PORT"`, so we normalize it to
/// `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Turns on TCP keep-alive probes, using `period` both as the idle time before
/// the first probe and as the interval between probes.
pub fn enable_keepalive(stream: &TcpStream, period: Duration) -> io::Result<()> {
    let ka = TcpKeepalive::new().with_time(period);
    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
    let ka = ka.with_interval(period);
    SockRef::from(stream).set_tcp_keepalive(&ka)
}

/// Wraps a listener for `axum::serve` so every accepted socket gets TCP
/// keep-alive. A zero `period` leaves sockets untouched.
pub fn keepalive_listener(
    ln: TcpListener,
    period: Duration,
) -> TapIo<TcpListener, impl FnMut(&mut TcpStream) + Send + 'static> {
    ln.tap_io(move |stream| {
        if period.is_zero() {
            return;
        }
        if let Err(err) = enable_keepalive(stream, period) {
            tracing::warn!(err = %err, "http: tcp keepalive");
        }
    })
}
