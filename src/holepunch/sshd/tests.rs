//! End-to-end tests: a real russh client against the server over loopback TCP.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use russh::{
    Channel,
    client::{self, AuthResult},
    keys::{PrivateKeyWithHashAlg, PublicKey},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};

use super::{
    SshServer,
    auth::{self, AuthPolicy, SessionTimeouts, testkeys},
};
use crate::holepunch::{
    portforward::{ForwardRegistry, registry::ForwardKey},
    telemetry::{ConnectionRegistry, SharedConnections},
};

struct TestServer {
    addr: SocketAddr,
    registry: Arc<ForwardRegistry>,
    conns: SharedConnections,
}

pub(crate) fn test_server(registry: Arc<ForwardRegistry>, conns: SharedConnections) -> Arc<SshServer> {
    let timeouts = SessionTimeouts {
        inactivity: Duration::ZERO,
        keepalive_interval: Duration::ZERO,
        auth_rejection: Duration::from_millis(10),
    };
    Arc::new(SshServer::new(
        auth::server_config(auth::parse_host_key(testkeys::HOST).unwrap(), &timeouts),
        AuthPolicy::new("hp", testkeys::CLIENT_PUB).unwrap(),
        registry,
        conns,
        Duration::from_secs(2),
    ))
}

async fn start_server() -> TestServer {
    let registry = Arc::new(ForwardRegistry::new());
    let conns: SharedConnections = Arc::new(ConnectionRegistry::new());
    let server = test_server(registry.clone(), conns.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, peer)) = listener.accept().await {
            tokio::spawn(server.clone().serve_conn(stream, Some(peer), "tcp"));
        }
    });

    TestServer { addr, registry, conns }
}

pub(crate) struct Forwarded {
    pub channel: Channel<client::Msg>,
    pub address: String,
    pub port: u32,
    pub origin_address: String,
    pub origin_port: u32,
}

pub(crate) struct TestClient {
    forwarded: mpsc::UnboundedSender<Forwarded>,
}

impl client::Handler for TestClient {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let _ = self.forwarded.send(Forwarded {
            channel,
            address: connected_address.to_string(),
            port: connected_port,
            origin_address: originator_address.to_string(),
            origin_port: originator_port,
        });
        Ok(())
    }
}

pub(crate) type ClientHandle = client::Handle<TestClient>;

/// Handshakes over `stream` and tries public-key auth as `user` with `key_pem`.
pub(crate) async fn handshake<S>(
    stream: S,
    user: &str,
    key_pem: &str,
) -> (ClientHandle, bool, mpsc::UnboundedReceiver<Forwarded>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let config = Arc::new(client::Config::default());
    let mut handle = client::connect_stream(config, stream, TestClient { forwarded: tx })
        .await
        .unwrap();

    let key = auth::parse_host_key(key_pem).unwrap();
    let res: AuthResult = handle
        .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), None))
        .await
        .unwrap();
    (handle, res.success(), rx)
}

async fn connect(server: &TestServer) -> (ClientHandle, mpsc::UnboundedReceiver<Forwarded>) {
    let stream = TcpStream::connect(server.addr).await.unwrap();
    let (handle, ok, rx) = handshake(stream, "hp", testkeys::CLIENT).await;
    assert!(ok, "authorized client was rejected");
    (handle, rx)
}

async fn free_port() -> u32 {
    let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
    u32::from(l.local_addr().unwrap().port())
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn reverse_forward_relays_external_connection() {
    let server = start_server().await;
    let (mut client, mut forwarded) = connect(&server).await;
    let port = free_port().await;

    client.tcpip_forward("127.0.0.1", port).await.unwrap();
    assert!(server.registry.contains(&ForwardKey::new("127.0.0.1", port)));

    let mut external = TcpStream::connect(("127.0.0.1", port as u16)).await.unwrap();
    let origin = external.local_addr().unwrap();

    let fwd = tokio::time::timeout(Duration::from_secs(3), forwarded.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fwd.address, "127.0.0.1");
    assert_eq!(fwd.port, port);
    assert_eq!(fwd.origin_address, origin.ip().to_string());
    assert_eq!(fwd.origin_port, u32::from(origin.port()));

    let mut channel = fwd.channel.into_stream();
    external.write_all(b"ping from the internet").await.unwrap();
    let mut got = [0u8; 22];
    channel.read_exact(&mut got).await.unwrap();
    assert_eq!(&got, b"ping from the internet");

    channel.write_all(b"pong from the client").await.unwrap();
    let mut back = [0u8; 20];
    external.read_exact(&mut back).await.unwrap();
    assert_eq!(&back, b"pong from the client");
}

#[tokio::test]
async fn non_local_grant_succeeds_without_listener() {
    let server = start_server().await;
    let (mut client, _forwarded) = connect(&server).await;

    assert!(client.tcpip_forward("203.0.113.5", 9000).await.is_ok());
    assert!(server.registry.snapshot().is_empty());
}

#[tokio::test]
async fn duplicate_grant_from_another_connection_fails() {
    let server = start_server().await;
    let (mut first, _f1) = connect(&server).await;
    let (mut second, _f2) = connect(&server).await;
    let port = free_port().await;

    first.tcpip_forward("127.0.0.1", port).await.unwrap();
    assert!(second.tcpip_forward("127.0.0.1", port).await.is_err());
    assert_eq!(server.registry.snapshot(), vec![ForwardKey::new("127.0.0.1", port)]);
}

#[tokio::test]
async fn cancel_releases_reservation_once() {
    let server = start_server().await;
    let (mut client, _forwarded) = connect(&server).await;
    let port = free_port().await;
    let key = ForwardKey::new("127.0.0.1", port);

    client.tcpip_forward("127.0.0.1", port).await.unwrap();
    assert!(client.cancel_tcpip_forward("127.0.0.1", port).await.is_ok());
    assert!(!server.registry.contains(&key));
    assert!(client.cancel_tcpip_forward("127.0.0.1", port).await.is_err());

    // The port is free again, for this or any other client.
    client.tcpip_forward("127.0.0.1", port).await.unwrap();
    assert!(server.registry.contains(&key));
}

#[tokio::test]
async fn port_zero_reports_assigned_port() {
    let server = start_server().await;
    let (mut client, _forwarded) = connect(&server).await;

    let assigned = client.tcpip_forward("127.0.0.1", 0).await.unwrap();
    assert_ne!(assigned, 0);
    assert!(server.registry.contains(&ForwardKey::new("127.0.0.1", assigned)));
}

#[tokio::test]
async fn disconnect_releases_forwards_and_connection_entry() {
    let server = start_server().await;
    let (mut client, _forwarded) = connect(&server).await;
    let port = free_port().await;

    client.tcpip_forward("127.0.0.1", port).await.unwrap();
    wait_until("connection entry", || server.conns.len() == 1).await;

    client
        .disconnect(russh::Disconnect::ByApplication, "bye", "en")
        .await
        .unwrap();

    let registry = server.registry.clone();
    wait_until("reservation release", || registry.snapshot().is_empty()).await;
    let conns = server.conns.clone();
    wait_until("connection entry removal", || conns.len() == 0).await;
}

#[tokio::test]
async fn cancel_racing_disconnect_tears_down_once() {
    let server = start_server().await;
    for _ in 0..8 {
        let (mut client, _forwarded) = connect(&server).await;
        let port = free_port().await;
        client.tcpip_forward("127.0.0.1", port).await.unwrap();

        let key = ForwardKey::new("127.0.0.1", port);
        let registry = server.registry.clone();
        let racer = tokio::spawn(async move { registry.cancel(&key) });
        let _ = client.disconnect(russh::Disconnect::ByApplication, "", "en").await;
        let _ = racer.await.unwrap();

        let registry = server.registry.clone();
        wait_until("reservation release", || registry.snapshot().is_empty()).await;
    }
}

#[tokio::test]
async fn direct_forward_to_unreachable_target_is_rejected() {
    let server = start_server().await;
    let (client, _forwarded) = connect(&server).await;
    let closed_port = free_port().await;

    let res = client
        .channel_open_direct_tcpip("127.0.0.1", closed_port, "127.0.0.1", 40000)
        .await;
    assert!(res.is_err());
}

#[tokio::test]
async fn direct_forward_bridges_to_target() {
    let server = start_server().await;
    let (client, _forwarded) = connect(&server).await;

    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = u32::from(target.local_addr().unwrap().port());
    tokio::spawn(async move {
        let (mut s, _) = target.accept().await.unwrap();
        let mut buf = [0u8; 4];
        s.read_exact(&mut buf).await.unwrap();
        buf.reverse();
        s.write_all(&buf).await.unwrap();
    });

    let channel = client
        .channel_open_direct_tcpip("127.0.0.1", port, "127.0.0.1", 40000)
        .await
        .unwrap();
    let mut stream = channel.into_stream();
    stream.write_all(b"abcd").await.unwrap();
    let mut got = [0u8; 4];
    stream.read_exact(&mut got).await.unwrap();
    assert_eq!(&got, b"dcba");
}

#[tokio::test]
async fn session_channels_are_refused() {
    let server = start_server().await;
    let (client, _forwarded) = connect(&server).await;
    assert!(client.channel_open_session().await.is_err());
}

#[tokio::test]
async fn wrong_key_or_user_is_rejected() {
    let server = start_server().await;

    let stream = TcpStream::connect(server.addr).await.unwrap();
    let (_h, ok, _rx) = handshake(stream, "hp", testkeys::INTRUDER).await;
    assert!(!ok);

    let stream = TcpStream::connect(server.addr).await.unwrap();
    let (_h, ok, _rx) = handshake(stream, "root", testkeys::CLIENT).await;
    assert!(!ok);

    assert_eq!(server.conns.len(), 0);
}
