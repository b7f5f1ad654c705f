use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use dashmap::DashMap;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

/// One live SSH connection, as shown by the admin `/conns` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ConnInfo {
    pub id: String,
    pub transport: &'static str,
    pub remote: String,
    pub user: String,
    pub started_at_unix_ms: u64,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    conns: DashMap<String, ConnInfo>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, c: ConnInfo) {
        self.conns.insert(c.id.clone(), c);
    }

    pub fn remove(&self, id: &str) {
        self.conns.remove(id);
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn snapshot(&self) -> Vec<ConnInfo> {
        let mut out: Vec<ConnInfo> = self.conns.iter().map(|c| c.value().clone()).collect();
        out.sort_by(|a, b| {
            a.started_at_unix_ms
                .cmp(&b.started_at_unix_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn new_conn_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("c{n}")
}

/// Counts one SSH connection for as long as it is held.
pub struct ActiveConnGuard;

impl ActiveConnGuard {
    pub fn new(transport: &'static str) -> Self {
        metrics::counter!("holepunch_ssh_connections_total", "transport" => transport).increment(1);
        metrics::gauge!("holepunch_ssh_connections_active").increment(1.0);
        Self
    }
}

impl Drop for ActiveConnGuard {
    fn drop(&mut self) {
        metrics::gauge!("holepunch_ssh_connections_active").decrement(1.0);
    }
}

pub type SharedConnections = Arc<ConnectionRegistry>;

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;
