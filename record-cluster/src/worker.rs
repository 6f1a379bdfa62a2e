//! A pooled worker: the application handler served over HTTP, with every
//! store access forwarded to the coordinator through stdin/stdout.

use std::{net::Ipv4Addr, sync::Arc};

use anyhow::{Context, Result, bail};
use tokio::{
    io::{AsyncBufRead, BufReader},
    net::TcpListener,
    sync::oneshot,
};
use tracing::{debug, info, warn};

use crate::{
    app,
    cli::WorkerArgs,
    protocol::{CoordinatorMessage, read_message},
    remote::RemoteStore,
};

/// Reads coordinator messages until the `initial` one arrives and returns the
/// port it assigns.
pub async fn await_initial<R>(reader: &mut R) -> Result<u16>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        match read_message::<_, CoordinatorMessage>(reader).await {
            Ok(Some(CoordinatorMessage::Initial { port })) => return Ok(port),
            Ok(Some(other)) => debug!(?other, "ignoring message before initial"),
            Ok(None) => bail!("coordinator closed the channel before sending initial"),
            Err(error) => return Err(error).context("failed to read initial message"),
        }
    }
}

/// Serves the application on `listener` until the coordinator channel
/// behind `responses` closes.
pub async fn serve<R>(listener: TcpListener, store: RemoteStore, responses: R) -> Result<()>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let addr = listener.local_addr()?;
    let (closed, on_closed) = oneshot::channel::<()>();

    let pump = store.clone();
    tokio::spawn(async move {
        match pump.pump(responses).await {
            Ok(()) => info!("coordinator channel closed"),
            Err(error) => warn!(?error, "coordinator channel failed"),
        }
        let _ = closed.send(());
    });

    info!("worker listening on {}", addr);
    axum::serve(listener, app::router(Arc::new(store), Some(addr.port())))
        .with_graceful_shutdown(async {
            let _ = on_closed.await;
        })
        .await
        .context("worker server failed")
}

pub async fn run(args: WorkerArgs) -> Result<()> {
    let mut responses = BufReader::new(tokio::io::stdin());
    let port = await_initial(&mut responses).await?;

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
        .await
        .with_context(|| format!("failed to bind worker port {port}"))?;
    let store = RemoteStore::connect(tokio::io::stdout(), args.ipc_timeout());

    serve(listener, store, responses).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::protocol::write_message;

    #[tokio::test]
    async fn initial_is_found_after_stray_messages() {
        let (mut coordinator, worker) = tokio::io::duplex(1024);
        write_message(&mut coordinator, &CoordinatorMessage::Set { correlation_id: 9 })
            .await
            .expect("write stray");
        write_message(&mut coordinator, &CoordinatorMessage::Initial { port: 4007 })
            .await
            .expect("write initial");

        let mut reader = BufReader::new(worker);
        assert_eq!(await_initial(&mut reader).await.expect("initial"), 4007);
    }

    #[tokio::test]
    async fn channel_closed_before_initial_is_an_error() {
        let (coordinator, worker) = tokio::io::duplex(1024);
        drop(coordinator);

        let mut reader = BufReader::new(worker);
        assert!(await_initial(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn worker_stops_when_the_coordinator_goes_away() {
        let (worker_side, coordinator_side) = tokio::io::duplex(1024);
        let (worker_read, worker_write) = tokio::io::split(worker_side);
        let store = RemoteStore::connect(worker_write, Duration::from_secs(1));
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bind");

        let server = tokio::spawn(serve(listener, store, BufReader::new(worker_read)));
        drop(coordinator_side);

        let result = tokio::time::timeout(Duration::from_secs(3), server)
            .await
            .expect("worker shut down")
            .expect("worker task");
        assert!(result.is_ok());
    }
}
