//! Spawning and tracking worker processes.
//!
//! Every worker is the current executable re-run in `worker` mode with piped
//! stdin/stdout. The pipes become that worker's IPC channel and the first
//! thing sent down them is its `initial` configuration. Spawning never waits
//! for the worker to come up, and a worker that fails to spawn is left out
//! of the pool rather than failing the coordinator.

use std::{
    ffi::OsString,
    path::PathBuf,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Result, ensure};
use tokio::{
    io::BufReader,
    process::{Child, Command},
    select,
    sync::oneshot,
};
use tracing::{info, warn};

use crate::{
    coordinator::serve_worker_channel,
    store::{StoreHandle, WorkerId},
};

/// Worker count used when none is configured: one less than the available
/// parallelism, never below one.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|parallelism| parallelism.get())
        .unwrap_or(1)
        .saturating_sub(1)
        .max(1)
}

/// Ports `base + 1 ..= base + count`.
pub fn worker_ports(base_port: u16, count: usize) -> Result<Vec<u16>> {
    ensure!(count > 0, "worker count must be at least one");
    (1..=count)
        .map(|offset| {
            u16::try_from(offset)
                .ok()
                .and_then(|offset| base_port.checked_add(offset))
                .ok_or_else(|| {
                    anyhow::anyhow!("{count} workers above base port {base_port} exceed the port range")
                })
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Executable started for each worker.
    pub program: PathBuf,
    /// Arguments placed after the `worker` subcommand.
    pub worker_args: Vec<OsString>,
    pub base_port: u16,
    pub workers: usize,
}

pub struct WorkerDescriptor {
    pub id: WorkerId,
    pub port: u16,
    pub pid: Option<u32>,
    alive: Arc<AtomicBool>,
    stop: Option<oneshot::Sender<()>>,
}

impl WorkerDescriptor {
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Kills the worker process. Its port stays in the rotation.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// The set of workers spawned at startup. Dropping the pool kills them.
pub struct WorkerPool {
    workers: Vec<WorkerDescriptor>,
}

impl WorkerPool {
    pub fn spawn(config: &PoolConfig, store: &StoreHandle) -> Result<Self> {
        let ports = worker_ports(config.base_port, config.workers)?;
        info!(workers = ports.len(), base_port = config.base_port, "spawning worker pool");

        let workers = ports
            .into_iter()
            .enumerate()
            .filter_map(|(id, port)| match spawn_worker(config, store, id, port) {
                Ok(worker) => Some(worker),
                Err(error) => {
                    warn!(worker = id, port, ?error, "failed to spawn worker; leaving it out");
                    None
                }
            })
            .collect();

        Ok(Self { workers })
    }

    /// Ports of the spawned workers, in spawn order.
    pub fn ports(&self) -> Vec<u16> {
        self.workers.iter().map(|worker| worker.port).collect()
    }

    pub fn workers(&self) -> &[WorkerDescriptor] {
        &self.workers
    }

    pub fn live_count(&self) -> usize {
        self.workers.iter().filter(|worker| worker.is_alive()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn shutdown(&mut self) {
        for worker in &mut self.workers {
            if worker.is_alive() {
                info!(worker = worker.id, port = worker.port, pid = ?worker.pid, "stopping worker");
            }
            worker.stop();
        }
    }
}

fn spawn_worker(
    config: &PoolConfig,
    store: &StoreHandle,
    id: WorkerId,
    port: u16,
) -> Result<WorkerDescriptor> {
    let mut child = Command::new(&config.program)
        .arg("worker")
        .args(&config.worker_args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;

    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        anyhow::bail!("worker {id} was spawned without piped stdio");
    };
    let pid = child.id();

    serve_worker_channel(store.clone(), id, BufReader::new(stdout), stdin, port);

    let alive = Arc::new(AtomicBool::new(true));
    let (stop, stop_rx) = oneshot::channel();
    tokio::spawn(monitor_worker(child, id, port, Arc::clone(&alive), stop_rx));

    info!(worker = id, port, ?pid, "worker spawned");
    Ok(WorkerDescriptor {
        id,
        port,
        pid,
        alive,
        stop: Some(stop),
    })
}

async fn monitor_worker(
    mut child: Child,
    id: WorkerId,
    port: u16,
    alive: Arc<AtomicBool>,
    stop: oneshot::Receiver<()>,
) {
    select! {
        status = child.wait() => match status {
            Ok(status) => warn!(worker = id, port, %status, "worker exited"),
            Err(error) => warn!(worker = id, port, ?error, "failed to wait on worker"),
        },
        _ = stop => {
            if let Err(error) = child.kill().await {
                warn!(worker = id, port, ?error, "failed to kill worker");
            } else {
                info!(worker = id, port, "worker stopped");
            }
        }
    }
    alive.store(false, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn ports_sit_directly_above_the_base() {
        assert_eq!(worker_ports(4000, 3).expect("ports"), [4001, 4002, 4003]);
    }

    #[test]
    fn zero_workers_is_a_configuration_error() {
        assert!(worker_ports(4000, 0).is_err());
    }

    #[test]
    fn ports_must_fit_in_range() {
        assert!(worker_ports(u16::MAX - 1, 1).is_ok());
        assert!(worker_ports(u16::MAX - 1, 2).is_err());
    }

    #[test]
    fn default_count_leaves_room_for_the_coordinator() {
        let count = default_worker_count();
        let parallelism = std::thread::available_parallelism()
            .map(|parallelism| parallelism.get())
            .unwrap_or(1);
        assert!(count >= 1);
        assert_eq!(count, parallelism.saturating_sub(1).max(1));
    }

    async fn wait_for_live_count(pool: &WorkerPool, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while pool.live_count() != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("live count never settled");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exited_workers_are_marked_dead() {
        let (store, _task) = crate::store::StoreService::spawn(crate::store::Store::new());
        // `sh worker` looks for a script named `worker` and exits at once.
        let config = PoolConfig {
            program: PathBuf::from("/bin/sh"),
            worker_args: Vec::new(),
            base_port: 4000,
            workers: 2,
        };

        let pool = WorkerPool::spawn(&config, &store).expect("pool");
        assert_eq!(pool.ports(), [4001, 4002]);
        let ids: Vec<WorkerId> = pool.workers().iter().map(|worker| worker.id).collect();
        assert_eq!(ids, [0, 1]);
        assert!(pool.workers().iter().all(|worker| worker.pid.is_some()));

        wait_for_live_count(&pool, 0).await;
        assert!(pool.workers().iter().all(|worker| !worker.is_alive()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stopped_workers_are_killed() {
        let (store, _task) = crate::store::StoreService::spawn(crate::store::Store::new());
        // `xargs worker` waits for stdin to close, and the pool holds it open.
        let config = PoolConfig {
            program: PathBuf::from("xargs"),
            worker_args: Vec::new(),
            base_port: 4000,
            workers: 1,
        };

        let mut pool = WorkerPool::spawn(&config, &store).expect("pool");
        assert_eq!(pool.live_count(), 1);

        pool.shutdown();
        wait_for_live_count(&pool, 0).await;
    }

    #[tokio::test]
    async fn unspawnable_workers_are_left_out() {
        let (store, _task) = crate::store::StoreService::spawn(crate::store::Store::new());
        let config = PoolConfig {
            program: PathBuf::from("/nonexistent/record-cluster-worker"),
            worker_args: Vec::new(),
            base_port: 4000,
            workers: 2,
        };

        let pool = WorkerPool::spawn(&config, &store).expect("pool");
        assert!(pool.is_empty());
        assert!(pool.ports().is_empty());
    }
}
