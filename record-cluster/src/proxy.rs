//! Round-robin reverse proxy in front of the worker pool.
//!
//! Each inbound request goes to the next port in a fixed rotation. Request
//! and response bodies are streamed in both directions; nothing is buffered
//! whole. Failures to reach a worker become gateway errors for that one
//! request, and the rotation moves on regardless.

use std::{
    io,
    net::{IpAddr, Ipv4Addr},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, ensure};
use axum::{
    Router,
    body::{Body, Bytes, HttpBody},
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt, channel::mpsc};
use thiserror::Error;
use tokio::{select, sync::oneshot, time::timeout};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Cyclic selection over a fixed, non-empty list of worker ports.
#[derive(Debug)]
pub struct RoundRobin {
    ports: Vec<u16>,
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new(ports: Vec<u16>) -> Result<Self> {
        ensure!(!ports.is_empty(), "no workers available to route requests to");
        Ok(Self {
            ports,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Returns the current port and advances the cursor.
    pub fn next_port(&self) -> u16 {
        let len = self.ports.len();
        let index = self
            .cursor
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |index| {
                Some((index + 1) % len)
            })
            .unwrap_or_else(|index| index);
        self.ports[index]
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address the workers listen on.
    pub upstream_host: IpAddr,
    pub connect_timeout: Duration,
    /// Maximum wait for a worker's response headers, counted from the moment
    /// the request body has been handed over in full.
    pub upstream_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            connect_timeout: Duration::from_secs(2),
            upstream_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("worker on port {port} is unreachable: {source}")]
    Unreachable {
        port: u16,
        #[source]
        source: reqwest::Error,
    },

    #[error("worker on port {port} sent no response within {timeout:?}")]
    Timeout { port: u16, timeout: Duration },
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        warn!(error = %self, "proxying request failed");
        match self {
            ProxyError::Unreachable { .. } => {
                (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
            }
            ProxyError::Timeout { .. } => {
                (StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout").into_response()
            }
        }
    }
}

pub struct ReverseProxy {
    targets: RoundRobin,
    client: reqwest::Client,
    config: ProxyConfig,
}

impl ReverseProxy {
    pub fn new(targets: RoundRobin, config: ProxyConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            // A fresh connection per request, so a dead worker fails fast
            // instead of surfacing through a stale pooled socket.
            .pool_max_idle_per_host(0)
            .build()
            .context("failed to build upstream HTTP client")?;

        Ok(Self {
            targets,
            client,
            config,
        })
    }

    pub fn router(self) -> Router {
        Router::new()
            .fallback(forward)
            .with_state(Arc::new(self))
            .layer(TraceLayer::new_for_http())
    }

    async fn dispatch(&self, port: u16, request: Request) -> Result<Response, ProxyError> {
        let (parts, body) = request.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|path| path.as_str())
            .unwrap_or("/");
        let url = format!("http://{}:{}{}", self.config.upstream_host, port, path);
        debug!(port, method = %parts.method, %url, "forwarding request");

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);

        let mut outbound = self.client.request(parts.method, url).headers(headers);
        let mut uploaded = None;
        if body.size_hint().exact() != Some(0) {
            let (stream, done) = stream_body(body);
            outbound = outbound.body(stream);
            uploaded = Some(done);
        }

        let request = outbound.send();
        tokio::pin!(request);

        // A slow client upload does not count against the upstream deadline.
        let early = match uploaded {
            Some(uploaded) => select! {
                result = &mut request => Some(result),
                _ = uploaded => None,
            },
            None => None,
        };
        let result = match early {
            Some(result) => result,
            None => timeout(self.config.upstream_timeout, &mut request)
                .await
                .map_err(|_| ProxyError::Timeout {
                    port,
                    timeout: self.config.upstream_timeout,
                })?,
        };
        let upstream = result.map_err(|source| ProxyError::Unreachable { port, source })?;

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

async fn forward(State(proxy): State<Arc<ReverseProxy>>, request: Request) -> Response {
    let port = proxy.targets.next_port();
    match proxy.dispatch(port, request).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    }
}

/// Feeds the inbound body to the outbound request through a one-slot
/// channel, so the client is only read as fast as the worker consumes. The
/// returned receiver fires once the last chunk has been handed over or the
/// upload has stopped.
fn stream_body(body: Body) -> (reqwest::Body, oneshot::Receiver<()>) {
    let (mut sender, receiver) = mpsc::channel::<Result<Bytes, io::Error>>(1);
    let (done, uploaded) = oneshot::channel();

    tokio::spawn(async move {
        let mut chunks = body.into_data_stream();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(io::Error::other);
            let failed = chunk.is_err();
            if sender.send(chunk).await.is_err() || failed {
                break;
            }
        }
        drop(sender);
        let _ = done.send(());
    });

    (reqwest::Body::wrap_stream(receiver), uploaded)
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}
