use std::{net::Ipv4Addr, sync::Arc};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::{app, cli::ServeArgs, store::LocalStore};

/// Runs the application handler in this process over an in-memory store.
pub async fn run(args: ServeArgs) -> Result<()> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, args.port))
        .await
        .with_context(|| format!("failed to bind port {}", args.port))?;
    info!("server listening on {}", listener.local_addr()?);

    axum::serve(listener, app::router(Arc::new(LocalStore::new()), None))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
        .context("server failed")
}
