use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::holepunch::{
    admin, config, logging, net,
    portforward::ForwardRegistry,
    reverseproxy::ReverseProxy,
    server,
    sshd::SshServer,
    telemetry,
};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub config_path: Option<PathBuf>,
    pub overrides: config::Overrides,
}

pub async fn run(opts: RunOptions) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(opts.config_path)?;

    let loaded = config::load_resolved(&resolved)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;
    let from_file = loaded.is_some();
    let mut cfg = loaded.unwrap_or_default();
    opts.overrides.apply(&mut cfg);

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if !from_file {
        tracing::info!(path = %resolved.path.display(), source = %resolved.source, "config: no config file, using defaults");
    }

    let ssh_tcp_enabled = !cfg.ssh.tcp_listen.is_empty();
    let ssh_ws_enabled = cfg.ssh.websocket;
    let proxy_enabled = cfg.http.reverse_proxy;
    let http_enabled = ssh_ws_enabled || proxy_enabled;
    let admin_enabled = !cfg.admin_addr.trim().is_empty();

    if !ssh_tcp_enabled && !http_enabled {
        anyhow::bail!(
            "config: nothing to run (set ssh.tcp_listen and/or ssh.websocket and/or http.reverse_proxy)"
        );
    }

    tracing::info!(
        config = %resolved.path.display(),
        ssh_tcp = %cfg.ssh.tcp_listen,
        ssh_websocket = ssh_ws_enabled,
        reverse_proxy = proxy_enabled,
        http_addr = %cfg.http.listen_addr,
        admin_addr = %cfg.admin_addr,
        "holepunch: starting"
    );

    let registry = Arc::new(ForwardRegistry::new());
    let conns = Arc::new(telemetry::ConnectionRegistry::new());

    // Keys are only needed (and only required) when some SSH transport is on.
    let ssh = if ssh_tcp_enabled || ssh_ws_enabled {
        Some(Arc::new(SshServer::from_config(&cfg.ssh, registry.clone(), conns.clone())?))
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    // Admin server.
    if admin_enabled {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;

        let admin_state = admin::AdminState {
            prom: Arc::new(telemetry::init_prometheus()?),
            conns: conns.clone(),
            forwards: registry.clone(),
        };

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, admin_state, shutdown).await });
    }

    // SSH over raw TCP.
    if let Some(ssh) = ssh.clone().filter(|_| ssh_tcp_enabled) {
        let listen_addr = cfg.ssh.tcp_listen.clone();
        // One keep-alive setting covers every accepted TCP socket.
        let keepalive = cfg.http.tcp_keepalive;
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { server::serve_tcp_with_shutdown(&listen_addr, ssh, keepalive, shutdown).await });
    }

    // HTTP: SSH over WebSocket and/or the reverse proxy.
    if http_enabled {
        let proxy = if proxy_enabled {
            Some(Arc::new(ReverseProxy::new(cfg.http.disallowed_ports.clone())?))
        } else {
            None
        };
        let app = server::router(&cfg.http.ssh_path, ssh.clone().filter(|_| ssh_ws_enabled), proxy);
        let listen_addr = cfg.http.listen_addr.clone();
        let keepalive = cfg.http.tcp_keepalive;
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { server::serve_http_with_shutdown(&listen_addr, app, keepalive, shutdown).await });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            let _ = shutdown_tx.send(true);
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => tracing::warn!("shutdown: a listener exited"),
                    Ok(Err(err)) => return Err(err),
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    // Drain tasks: exit as soon as they complete; only enforce a timeout if something hangs.
    let drain = async {
        while let Some(res) = tasks.join_next().await {
            if let Ok(Err(err)) = res {
                tracing::debug!(err = %format!("{err:#}"), "shutdown: task error during drain");
            }
        }
    };

    let drain_timeout = Duration::from_secs(5);
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    tracing::info!(forwards = registry.snapshot().len(), conns = conns.len(), "shutdown: done");
    Ok(())
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
