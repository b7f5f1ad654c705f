//! Listeners that feed streams into the SSH server: raw TCP, and WebSocket on
//! the HTTP listener (which also hosts the reverse proxy).

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    Router,
    extract::{
        ConnectInfo, State,
        ws::{WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use tokio::{net::TcpListener, sync::watch};
use tower_http::trace::TraceLayer;

use crate::holepunch::{net, reverseproxy::{self, ReverseProxy}, sshd::SshServer, wsconn::WsConnAdapter};

pub async fn serve_tcp_with_shutdown(
    listen_addr: &str,
    ssh: Arc<SshServer>,
    keepalive: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let bind_addr = net::normalize_bind_addr(listen_addr);
    let ln = TcpListener::bind(bind_addr.as_ref())
        .await
        .with_context(|| format!("bind tcp {listen_addr}"))?;

    tracing::info!(listen_addr = %listen_addr, "sshd: listening on tcp");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                let (conn, peer) = res.context("sshd: accept tcp")?;
                if keepalive > Duration::ZERO {
                    if let Err(err) = net::enable_keepalive(&conn, keepalive) {
                        tracing::warn!(client = %peer, err = %err, "sshd: tcp keepalive");
                    }
                }
                if tracing::enabled!(tracing::Level::DEBUG) {
                    tracing::debug!(client = %peer, "sshd: accepted");
                }
                tokio::spawn(ssh.clone().serve_conn(conn, Some(peer), "tcp"));
            }
        }
    }

    Ok(())
}

/// HTTP routes: SSH over WebSocket at `ssh_path` when `ssh` is set, and the
/// reverse proxy for every other path when `proxy` is set.
pub fn router(ssh_path: &str, ssh: Option<Arc<SshServer>>, proxy: Option<Arc<ReverseProxy>>) -> Router {
    let mut app = Router::new();

    if let Some(ssh) = ssh {
        app = app.merge(Router::new().route(ssh_path, get(ssh_over_websocket)).with_state(ssh));
    }
    if let Some(proxy) = proxy {
        app = app.merge(Router::new().fallback(reverseproxy::proxy_handler).with_state(proxy));
    }

    app.layer(TraceLayer::new_for_http())
}

pub async fn serve_http_with_shutdown(
    listen_addr: &str,
    app: Router,
    keepalive: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let bind_addr = net::normalize_bind_addr(listen_addr);
    let ln = TcpListener::bind(bind_addr.as_ref())
        .await
        .with_context(|| format!("bind http {listen_addr}"))?;

    tracing::info!(listen_addr = %listen_addr, "http: listening");

    axum::serve(
        net::keepalive_listener(ln, keepalive),
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.wait_for(|s| *s).await;
    })
    .await
    .context("http: serve")?;

    Ok(())
}

async fn ssh_over_websocket(
    State(ssh): State<Arc<SshServer>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            tracing::info!(client = %peer, reason = %rejection, "http: ssh path requested without websocket upgrade");
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    ws.on_upgrade(move |socket| async move {
        ssh.serve_conn(WsConnAdapter::new(socket), Some(peer), "websocket").await;
    })
}
