//! The authoritative record store and the ways of reaching it.
//!
//! The coordinator owns a single [`Store`] inside a [`StoreService`] task.
//! Every worker request funnels through that task's inbox, so the map is only
//! ever touched from one place and needs no lock. Application code talks to
//! any store through the [`RecordStore`] trait: [`LocalStore`] in standalone
//! mode, [`crate::remote::RemoteStore`] inside a pooled worker.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info};

use crate::{
    error::StoreError,
    protocol::{CoordinatorMessage, Record, StoreReply, WorkerMessage},
};

/// Store operations as seen by request-handling code.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_all(&self) -> Result<Vec<Record>, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Record>, StoreError>;

    async fn has(&self, key: &str) -> Result<bool, StoreError>;

    async fn set(&self, key: &str, record: Record) -> Result<(), StoreError>;

    /// Removes `key` if present. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// In-memory key to record map.
#[derive(Debug, Default)]
pub struct Store {
    records: HashMap<String, Record>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record, in no particular order.
    pub fn get_all(&self) -> Vec<Record> {
        self.records.values().cloned().collect()
    }

    pub fn get(&self, key: &str) -> Option<Record> {
        self.records.get(key).cloned()
    }

    pub fn has(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    pub fn set(&mut self, key: String, record: Record) {
        self.records.insert(key, record);
    }

    pub fn delete(&mut self, key: &str) {
        self.records.remove(key);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Executes one worker request and builds the response carrying the
    /// same correlation id.
    pub fn apply(&mut self, request: WorkerMessage) -> CoordinatorMessage {
        let correlation_id = request.correlation_id();
        let reply = match request {
            WorkerMessage::GetAll { .. } => StoreReply::GetAll(self.get_all()),
            WorkerMessage::Get { data, .. } => StoreReply::Get(self.get(&data.key)),
            WorkerMessage::Has { data, .. } => StoreReply::Has(self.has(&data.key)),
            WorkerMessage::Set { data, .. } => {
                self.set(data.key, data.record);
                StoreReply::Set
            }
            WorkerMessage::Delete { data, .. } => {
                self.delete(&data.key);
                StoreReply::Delete
            }
        };
        CoordinatorMessage::response(correlation_id, reply)
    }
}

/// A [`Store`] shared behind a mutex, for running the application in a single
/// process.
#[derive(Clone, Default)]
pub struct LocalStore {
    inner: Arc<Mutex<Store>>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for LocalStore {
    async fn get_all(&self) -> Result<Vec<Record>, StoreError> {
        Ok(self.inner.lock().await.get_all())
    }

    async fn get(&self, key: &str) -> Result<Option<Record>, StoreError> {
        Ok(self.inner.lock().await.get(key))
    }

    async fn has(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.inner.lock().await.has(key))
    }

    async fn set(&self, key: &str, record: Record) -> Result<(), StoreError> {
        self.inner.lock().await.set(key.to_string(), record);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.lock().await.delete(key);
        Ok(())
    }
}

pub type WorkerId = usize;

/// One worker request waiting in the store inbox, together with the channel
/// its response goes back on.
pub struct StoreRequest {
    pub worker: WorkerId,
    pub message: WorkerMessage,
    pub reply: mpsc::UnboundedSender<CoordinatorMessage>,
}

/// Handle used by per-worker channel tasks to submit requests.
#[derive(Clone)]
pub struct StoreHandle {
    inbox: mpsc::Sender<StoreRequest>,
}

impl StoreHandle {
    /// Queues a request. Fails only if the store task has stopped.
    pub async fn submit(&self, request: StoreRequest) -> Result<(), StoreError> {
        self.inbox
            .send(request)
            .await
            .map_err(|_| StoreError::Disconnected)
    }
}

/// Owner of the coordinator's [`Store`].
pub struct StoreService;

impl StoreService {
    /// Moves `store` into a dedicated task and returns the handle feeding it.
    /// The task ends, yielding the store back, once every handle is dropped.
    pub fn spawn(store: Store) -> (StoreHandle, JoinHandle<Store>) {
        let (inbox, requests) = mpsc::channel(256);
        let task = tokio::spawn(run_store(store, requests));
        (StoreHandle { inbox }, task)
    }
}

async fn run_store(mut store: Store, mut requests: mpsc::Receiver<StoreRequest>) -> Store {
    while let Some(StoreRequest {
        worker,
        message,
        reply,
    }) = requests.recv().await
    {
        let operation = message.operation();
        let correlation_id = message.correlation_id();
        let response = store.apply(message);
        debug!(worker, %operation, correlation_id, "store request handled");

        if reply.send(response).is_err() {
            debug!(worker, correlation_id, "worker channel closed before reply");
        }
    }

    info!(records = store.len(), "store service stopped");
    store
}
