use std::{
    future::Future,
    io,
    net::{Ipv4Addr, SocketAddr},
};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufRead, AsyncWrite},
    net::TcpListener,
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    cli::CoordinatorArgs,
    pool::{PoolConfig, WorkerPool},
    protocol::{CoordinatorMessage, WorkerMessage, read_message, write_message},
    proxy::{ReverseProxy, RoundRobin},
    store::{Store, StoreHandle, StoreRequest, StoreService, WorkerId},
};

/// Wires one worker's channel to the store service.
///
/// Sends `initial { port }` first, then forwards every request read from
/// `reader` to the store and writes the responses back to `writer` in the
/// order the store produced them. The returned task finishes when the worker
/// closes its end.
pub fn serve_worker_channel<R, W>(
    store: StoreHandle,
    worker: WorkerId,
    reader: R,
    writer: W,
    port: u16,
) -> JoinHandle<()>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound, responses) = mpsc::unbounded_channel();
    // Cannot fail: the receiver is moved into the writer task below.
    let _ = outbound.send(CoordinatorMessage::Initial { port });
    tokio::spawn(write_responses(writer, responses, worker));

    tokio::spawn(async move {
        if let Err(error) = forward_requests(reader, &store, worker, outbound).await {
            warn!(worker, ?error, "worker channel closed with error");
        } else {
            info!(worker, "worker channel closed");
        }
    })
}

async fn forward_requests<R>(
    mut reader: R,
    store: &StoreHandle,
    worker: WorkerId,
    outbound: mpsc::UnboundedSender<CoordinatorMessage>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let message = match read_message::<_, WorkerMessage>(&mut reader).await {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(()),
            Err(error) if error.kind() == io::ErrorKind::InvalidData => {
                warn!(worker, %error, "dropping malformed request");
                continue;
            }
            Err(error) => return Err(error.into()),
        };

        store
            .submit(StoreRequest {
                worker,
                message,
                reply: outbound.clone(),
            })
            .await
            .context("store service stopped")?;
    }
}

async fn write_responses<W>(
    mut writer: W,
    mut responses: mpsc::UnboundedReceiver<CoordinatorMessage>,
    worker: WorkerId,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = responses.recv().await {
        if let Err(error) = write_message(&mut writer, &response).await {
            debug!(worker, ?error, "failed to deliver response to worker");
            break;
        }
    }
}

/// The coordinator process: store owner, worker pool, and public proxy.
pub struct Coordinator {
    listener: TcpListener,
    proxy: ReverseProxy,
    pool: WorkerPool,
}

impl Coordinator {
    /// Binds the public port, starts the store service, and spawns the
    /// worker pool. Any failure here is a configuration error.
    pub async fn start(args: &CoordinatorArgs) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, args.port))
            .await
            .with_context(|| format!("failed to bind public port {}", args.port))?;

        let program = std::env::current_exe().context("failed to locate own executable")?;
        let pool_config = PoolConfig {
            program,
            worker_args: args.worker_args(),
            base_port: args.port,
            workers: args.worker_count(),
        };

        let (store, _store_task) = StoreService::spawn(Store::new());
        let pool = WorkerPool::spawn(&pool_config, &store)?;
        let targets = RoundRobin::new(pool.ports()).context("worker pool is empty")?;
        let proxy = ReverseProxy::new(targets, args.proxy_config())?;

        Ok(Self {
            listener,
            proxy,
            pool,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn worker_ports(&self) -> Vec<u16> {
        self.pool.ports()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Coordinator {
            listener,
            proxy,
            mut pool,
        } = self;

        let result = axum::serve(listener, proxy.router())
            .with_graceful_shutdown(shutdown)
            .await
            .context("proxy server failed");

        info!(live_workers = pool.live_count(), "coordinator shutting down");
        pool.shutdown();
        result
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

pub async fn run(args: CoordinatorArgs) -> Result<()> {
    let coordinator = Coordinator::start(&args).await?;
    let addr = coordinator.local_addr()?;
    info!(workers = ?coordinator.worker_ports(), "worker pool ready");
    info!("coordinator listening on {}", addr);

    if let Err(err) = coordinator.run_until_ctrl_c().await {
        warn!("coordinator exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}
