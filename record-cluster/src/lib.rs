//! A coordinator/worker HTTP cluster on one machine.
//!
//! The coordinator owns the only copy of the record store, spawns a pool of
//! worker processes, and proxies its public port to them in round-robin
//! order. Workers run the application handler and reach the store over a
//! newline-delimited JSON channel on their stdin/stdout.
//!
//! - [`cli`] parses the `coordinator`, `worker`, and `serve` modes.
//! - [`coordinator`] wires worker channels to the store and serves the proxy.
//! - [`pool`] spawns and tracks worker processes.
//! - [`proxy`] is the round-robin reverse proxy.
//! - [`protocol`] defines the IPC messages and their line framing.
//! - [`store`] holds the record map, the store service, and [`store::RecordStore`].
//! - [`remote`] is the worker-side store proxy with correlation ids.
//! - [`worker`] and [`standalone`] run the application handler from [`app`].
//! - [`error`] collects the store and API error types.

pub mod app;
pub mod cli;
pub mod coordinator;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod proxy;
pub mod remote;
pub mod standalone;
pub mod store;
pub mod worker;
