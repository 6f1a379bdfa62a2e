use std::{ffi::OsString, num::NonZeroUsize, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{pool::default_worker_count, proxy::ProxyConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the coordinator: spawn the worker pool and proxy the public port.
    Coordinator(CoordinatorArgs),
    /// Run one pooled worker. Started by the coordinator, not by hand.
    #[command(hide = true)]
    Worker(WorkerArgs),
    /// Run the application in a single process with an in-memory store.
    Serve(ServeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CoordinatorArgs {
    /// Public port on 127.0.0.1. Workers take the ports directly above it.
    #[arg(long, env = "PORT", default_value_t = 4000)]
    pub port: u16,

    /// Number of workers. Defaults to one less than the available cores.
    #[arg(long, env = "WORKERS")]
    pub workers: Option<NonZeroUsize>,

    /// How long a worker waits for the store to answer one request.
    #[arg(long, env = "IPC_TIMEOUT_MS", default_value_t = 5000)]
    pub ipc_timeout_ms: u64,

    /// How long the proxy waits for a worker's response headers.
    #[arg(long, default_value_t = 30_000)]
    pub upstream_timeout_ms: u64,

    #[arg(long, default_value_t = 2000)]
    pub connect_timeout_ms: u64,
}

impl CoordinatorArgs {
    pub fn worker_count(&self) -> usize {
        self.workers
            .map(NonZeroUsize::get)
            .unwrap_or_else(default_worker_count)
    }

    /// Arguments passed to every spawned `worker` process.
    pub fn worker_args(&self) -> Vec<OsString> {
        vec![
            "--ipc-timeout-ms".into(),
            self.ipc_timeout_ms.to_string().into(),
        ]
    }

    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            upstream_timeout: Duration::from_millis(self.upstream_timeout_ms),
            ..ProxyConfig::default()
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    #[arg(long, env = "IPC_TIMEOUT_MS", default_value_t = 5000)]
    pub ipc_timeout_ms: u64,
}

impl WorkerArgs {
    pub fn ipc_timeout(&self) -> Duration {
        Duration::from_millis(self.ipc_timeout_ms)
    }
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Port on 127.0.0.1. Use 0 for an ephemeral port.
    #[arg(long, env = "PORT", default_value_t = 4000)]
    pub port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("record-cluster").chain(args.iter().copied()))
            .expect("valid command line")
    }

    #[test]
    fn coordinator_flags_override_defaults() {
        let cli = parse(&[
            "coordinator",
            "--port",
            "5000",
            "--workers",
            "3",
            "--ipc-timeout-ms",
            "250",
        ]);
        let Command::Coordinator(args) = cli.command else {
            panic!("expected coordinator subcommand");
        };

        assert_eq!(args.port, 5000);
        assert_eq!(args.worker_count(), 3);
        assert_eq!(
            args.worker_args(),
            [OsString::from("--ipc-timeout-ms"), OsString::from("250")]
        );
        assert_eq!(args.proxy_config().upstream_timeout, Duration::from_secs(30));
        assert_eq!(args.proxy_config().connect_timeout, Duration::from_secs(2));
    }

    #[test]
    fn zero_workers_is_rejected() {
        let result = Cli::try_parse_from(["record-cluster", "coordinator", "--workers", "0"]);
        assert!(result.is_err());
    }

    #[test]
    fn worker_mode_is_accepted_though_hidden() {
        let cli = parse(&["worker", "--ipc-timeout-ms", "100"]);
        let Command::Worker(args) = cli.command else {
            panic!("expected worker subcommand");
        };
        assert_eq!(args.ipc_timeout(), Duration::from_millis(100));
    }

    #[test]
    fn serve_accepts_an_ephemeral_port() {
        let cli = parse(&["serve", "--port", "0"]);
        assert!(matches!(cli.command, Command::Serve(ServeArgs { port: 0 })));
    }
}
