//! Proxy behaviour against hand-built upstreams on ephemeral ports.

use std::{io, net::Ipv4Addr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    Router,
    body::{Body, Bytes},
    extract::State,
    routing::{get, post},
};
use futures::{SinkExt, StreamExt, channel::mpsc as body_channel, stream};
use record_cluster::proxy::{ProxyConfig, ReverseProxy, RoundRobin};
use reqwest::StatusCode;
use tokio::{
    net::TcpListener,
    sync::{Notify, mpsc},
    time::{sleep, timeout},
};

const WAIT: Duration = Duration::from_secs(2);

async fn serve(router: Router) -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(async move { axum::serve(listener, router).await });
    Ok(port)
}

async fn start_proxy(ports: Vec<u16>, config: ProxyConfig) -> Result<String> {
    let proxy = ReverseProxy::new(RoundRobin::new(ports)?, config)?;
    let port = serve(proxy.router()).await?;
    Ok(format!("http://127.0.0.1:{port}"))
}

/// Upstream that reports every request chunk as it arrives and answers with
/// the whole body once it ends.
fn recording_upstream(seen: mpsc::UnboundedSender<Bytes>) -> Router {
    async fn record(State(seen): State<mpsc::UnboundedSender<Bytes>>, body: Body) -> Vec<u8> {
        let mut received = Vec::new();
        let mut chunks = body.into_data_stream();
        while let Some(Ok(chunk)) = chunks.next().await {
            received.extend_from_slice(&chunk);
            let _ = seen.send(chunk);
        }
        received
    }

    Router::new().route("/upload", post(record)).with_state(seen)
}

/// Client body fed by hand, one chunk at a time.
fn manual_body() -> (body_channel::Sender<Result<Bytes, io::Error>>, reqwest::Body) {
    let (sender, receiver) = body_channel::channel(4);
    (sender, reqwest::Body::wrap_stream(receiver))
}

#[tokio::test]
async fn request_body_reaches_the_worker_while_the_client_is_still_sending() -> Result<()> {
    let (seen, mut chunks) = mpsc::unbounded_channel();
    let upstream = serve(recording_upstream(seen)).await?;
    let proxy = start_proxy(vec![upstream], ProxyConfig::default()).await?;

    let (mut sender, body) = manual_body();
    let request = tokio::spawn(
        reqwest::Client::new()
            .post(format!("{proxy}/upload"))
            .body(body)
            .send(),
    );

    sender.send(Ok(Bytes::from_static(b"chunk1"))).await?;
    let first = timeout(WAIT, chunks.recv())
        .await
        .context("first chunk never reached the worker")?
        .context("worker hung up")?;
    assert_eq!(first, Bytes::from_static(b"chunk1"));
    assert!(!request.is_finished());

    sender.send(Ok(Bytes::from_static(b"chunk2"))).await?;
    drop(sender);

    let response = timeout(WAIT, request).await???;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await?, "chunk1chunk2");
    Ok(())
}

#[tokio::test]
async fn response_body_reaches_the_client_while_the_worker_is_still_writing() -> Result<()> {
    async fn trickle(State(gate): State<Arc<Notify>>) -> Body {
        let first = stream::once(async { Ok::<_, io::Error>(Bytes::from_static(b"first")) });
        let rest = stream::once(async move {
            gate.notified().await;
            Ok(Bytes::from_static(b"second"))
        });
        Body::from_stream(first.chain(rest))
    }

    let gate = Arc::new(Notify::new());
    let upstream = serve(
        Router::new()
            .route("/download", get(trickle))
            .with_state(Arc::clone(&gate)),
    )
    .await?;
    let proxy = start_proxy(vec![upstream], ProxyConfig::default()).await?;

    let mut response = timeout(WAIT, reqwest::get(format!("{proxy}/download"))).await??;
    assert_eq!(response.status(), StatusCode::OK);

    // The worker is held at the gate, so this chunk cannot come from a
    // buffered body.
    let first = timeout(WAIT, response.chunk()).await??;
    assert_eq!(first.as_deref(), Some(&b"first"[..]));

    gate.notify_one();
    let second = timeout(WAIT, response.chunk()).await??;
    assert_eq!(second.as_deref(), Some(&b"second"[..]));
    assert_eq!(timeout(WAIT, response.chunk()).await??, None);
    Ok(())
}

#[tokio::test]
async fn slow_worker_times_out_and_rotation_moves_on() -> Result<()> {
    let slow = serve(Router::new().route(
        "/",
        get(|| async {
            sleep(Duration::from_secs(2)).await;
            "slow"
        }),
    ))
    .await?;
    let fast = serve(Router::new().route("/", get(|| async { "fast" }))).await?;

    let config = ProxyConfig {
        upstream_timeout: Duration::from_millis(200),
        ..ProxyConfig::default()
    };
    let proxy = start_proxy(vec![slow, fast], config).await?;
    let client = reqwest::Client::new();

    let timed_out = client.get(format!("{proxy}/")).send().await?;
    assert_eq!(timed_out.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(timed_out.text().await?, "Gateway Timeout");

    let served = client.get(format!("{proxy}/")).send().await?;
    assert_eq!(served.status(), StatusCode::OK);
    assert_eq!(served.text().await?, "fast");

    let timed_out = client.get(format!("{proxy}/")).send().await?;
    assert_eq!(timed_out.status(), StatusCode::GATEWAY_TIMEOUT);
    Ok(())
}

#[tokio::test]
async fn worker_dropping_the_connection_is_a_bad_gateway() -> Result<()> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            drop(socket);
        }
    });

    let proxy = start_proxy(vec![port], ProxyConfig::default()).await?;
    let response = reqwest::get(format!("{proxy}/api/items")).await?;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(response.text().await?, "Bad Gateway");
    Ok(())
}

#[tokio::test]
async fn slow_upload_does_not_count_against_the_worker_deadline() -> Result<()> {
    let (seen, _chunks) = mpsc::unbounded_channel();
    let upstream = serve(recording_upstream(seen)).await?;
    let config = ProxyConfig {
        upstream_timeout: Duration::from_millis(200),
        ..ProxyConfig::default()
    };
    let proxy = start_proxy(vec![upstream], config).await?;

    let (mut sender, body) = manual_body();
    let request = tokio::spawn(
        reqwest::Client::new()
            .post(format!("{proxy}/upload"))
            .body(body)
            .send(),
    );

    sender.send(Ok(Bytes::from_static(b"slow"))).await?;
    sleep(Duration::from_millis(500)).await;
    sender.send(Ok(Bytes::from_static(b"-upload"))).await?;
    drop(sender);

    let response = timeout(WAIT, request).await???;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await?, "slow-upload");
    Ok(())
}
