use anyhow::Result;
use clap::Parser;

use record_cluster::{
    cli::{Cli, Command},
    coordinator, standalone, worker,
};

fn init_tracing(to_stderr: bool) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(false);
    // A worker's stdout carries the IPC channel.
    let _ = if to_stderr {
        builder.with_writer(std::io::stderr).try_init()
    } else {
        builder.try_init()
    };
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(matches!(cli.command, Command::Worker(_)));

    match cli.command {
        Command::Coordinator(args) => coordinator::run(args).await?,
        Command::Worker(args) => worker::run(args).await?,
        Command::Serve(args) => standalone::run(args).await?,
    }

    Ok(())
}
