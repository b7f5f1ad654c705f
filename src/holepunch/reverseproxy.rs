//! Virtual-host HTTP reverse proxy: `8081.punch.example.com` is served by
//! whatever listens on `localhost:8081`, which is typically a reverse forward
//! some SSH client has bound on the server's loopback.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use regex::Regex;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("no destination port in host {0:?}")]
    NoPort(String),
    #[error("destination port {0} is not allowed")]
    DisallowedPort(u16),
}

pub struct ReverseProxy {
    client: reqwest::Client,
    host_port: Regex,
    disallowed_ports: Vec<u16>,
}

impl ReverseProxy {
    pub fn new(disallowed_ports: Vec<u16>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .context("proxy: build http client")?;
        Ok(Self {
            client,
            host_port: Regex::new(r"^([0-9]+)\.").context("proxy: compile host pattern")?,
            disallowed_ports,
        })
    }

    /// Port named by the leading numeric label of `host`.
    pub fn destination_port(&self, host: &str) -> Result<u16, ProxyError> {
        let port = self
            .host_port
            .captures(host)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u16>().ok())
            .ok_or_else(|| ProxyError::NoPort(host.to_string()))?;

        if self.disallowed_ports.contains(&port) {
            return Err(ProxyError::DisallowedPort(port));
        }
        Ok(port)
    }

    async fn forward(&self, req: Request, peer: SocketAddr) -> anyhow::Result<Response> {
        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| req.uri().host())
            .unwrap_or_default()
            .to_string();
        let port = self.destination_port(&host)?;

        let path = req.uri().path_and_query().map_or("/", |pq| pq.as_str());
        let url = format!("http://localhost:{port}{path}");

        let (parts, body) = req.into_parts();
        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        append_forwarded_for(&mut headers, peer);

        let upstream = self
            .client
            .request(parts.method, &url)
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await
            .with_context(|| format!("proxy: upstream {url}"))?;

        let status = upstream.status();
        let mut resp_headers = upstream.headers().clone();
        strip_hop_by_hop(&mut resp_headers);

        let mut resp = Response::new(Body::from_stream(upstream.bytes_stream()));
        *resp.status_mut() = status;
        *resp.headers_mut() = resp_headers;
        Ok(resp)
    }
}

/// Entry point mounted as the HTTP router's fallback.
pub async fn proxy_handler(
    State(proxy): State<Arc<ReverseProxy>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    metrics::counter!("holepunch_proxy_requests_total").increment(1);
    let method = req.method().clone();
    let uri = req.uri().clone();

    match proxy.forward(req, peer).await {
        Ok(resp) => resp,
        Err(err) => {
            metrics::counter!("holepunch_proxy_errors_total").increment(1);
            tracing::warn!(client = %peer, method = %method, uri = %uri, err = %format!("{err:#}"), "http: proxy failed");
            (StatusCode::BAD_GATEWAY, "bad gateway\n").into_response()
        }
    }
}

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in &named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, peer: SocketAddr) {
    const XFF: &str = "x-forwarded-for";
    let ip = peer.ip().to_canonical().to_string();
    let value = match headers.get(XFF).and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{prior}, {ip}"),
        None => ip,
    };
    if let Ok(v) = HeaderValue::from_str(&value) {
        headers.insert(XFF, v);
    }
}
