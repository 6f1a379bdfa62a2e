//! Worker-side proxy for the coordinator's store.
//!
//! Each call allocates a correlation id, registers a oneshot in the pending
//! table, writes one request, and waits (bounded by the IPC timeout) for the
//! response carrying the same id. Responses are routed by id only, so
//! overlapping calls of the same operation can never steal each other's
//! results.

use std::{
    collections::HashMap,
    io,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufRead, AsyncWrite},
    sync::{mpsc, oneshot},
    time::timeout,
};
use tracing::{debug, warn};

use crate::{
    error::StoreError,
    protocol::{
        CoordinatorMessage, CorrelationId, Entry, KeyRef, Operation, Record, StoreReply,
        WorkerMessage, read_message, write_message,
    },
    store::RecordStore,
};

#[derive(Clone)]
pub struct RemoteStore {
    shared: Arc<Shared>,
}

struct Shared {
    outbound: mpsc::UnboundedSender<WorkerMessage>,
    pending: Mutex<Pending>,
    next_id: AtomicU64,
    timeout: Duration,
}

#[derive(Default)]
struct Pending {
    calls: HashMap<CorrelationId, oneshot::Sender<StoreReply>>,
    closed: bool,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, Pending> {
        // The table holds no invariants a panicking holder could break.
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Drops the pending entry when a call finishes or is cancelled.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending().calls.remove(&self.id);
    }
}

impl RemoteStore {
    /// Creates a proxy whose requests are written to `writer` by a background
    /// task. Responses must be fed back through [`RemoteStore::pump`] or
    /// [`RemoteStore::deliver`].
    pub fn connect<W>(writer: W, call_timeout: Duration) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, requests) = mpsc::unbounded_channel();
        tokio::spawn(write_requests(writer, requests));

        Self {
            shared: Arc::new(Shared {
                outbound,
                pending: Mutex::new(Pending::default()),
                next_id: AtomicU64::new(1),
                timeout: call_timeout,
            }),
        }
    }

    /// Reads coordinator responses until the channel closes, resolving the
    /// matching pending calls. Closes the proxy on exit either way.
    pub async fn pump<R>(self, mut reader: R) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let result = loop {
            match read_message::<_, CoordinatorMessage>(&mut reader).await {
                Ok(Some(message)) => self.deliver(message),
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            }
        };
        self.close();
        result
    }

    /// Routes one coordinator message to the call waiting on its id.
    pub fn deliver(&self, message: CoordinatorMessage) {
        let Some((id, reply)) = message.into_reply() else {
            warn!("ignoring repeated initial message");
            return;
        };

        let waiter = self.shared.pending().calls.remove(&id);
        match waiter {
            Some(waiter) => {
                if waiter.send(reply).is_err() {
                    debug!(correlation_id = id, "caller went away before its response");
                }
            }
            None => debug!(correlation_id = id, "discarding response with no pending call"),
        }
    }

    /// Fails every pending call and rejects new ones.
    pub fn close(&self) {
        let mut pending = self.shared.pending();
        pending.closed = true;
        let dropped = pending.calls.len();
        pending.calls.clear();
        if dropped > 0 {
            warn!(dropped, "coordinator channel closed with calls in flight");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.pending().closed
    }

    /// Number of calls currently waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.shared.pending().calls.len()
    }

    async fn call<F>(&self, build: F) -> Result<StoreReply, StoreError>
    where
        F: FnOnce(CorrelationId) -> WorkerMessage,
    {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (waiter, response) = oneshot::channel();
        {
            let mut pending = self.shared.pending();
            if pending.closed {
                return Err(StoreError::Disconnected);
            }
            pending.calls.insert(id, waiter);
        }
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        self.shared
            .outbound
            .send(build(id))
            .map_err(|_| StoreError::Disconnected)?;

        match timeout(self.shared.timeout, response).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(StoreError::Disconnected),
            Err(_) => Err(StoreError::Timeout(self.shared.timeout)),
        }
    }
}

fn unexpected(expected: Operation, reply: &StoreReply) -> StoreError {
    StoreError::UnexpectedReply {
        expected,
        actual: reply.operation(),
    }
}

#[async_trait]
impl RecordStore for RemoteStore {
    async fn get_all(&self) -> Result<Vec<Record>, StoreError> {
        match self
            .call(|correlation_id| WorkerMessage::GetAll { correlation_id })
            .await?
        {
            StoreReply::GetAll(records) => Ok(records),
            other => Err(unexpected(Operation::GetAll, &other)),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Record>, StoreError> {
        let data = KeyRef {
            key: key.to_string(),
        };
        match self
            .call(|correlation_id| WorkerMessage::Get {
                correlation_id,
                data,
            })
            .await?
        {
            StoreReply::Get(record) => Ok(record),
            other => Err(unexpected(Operation::Get, &other)),
        }
    }

    async fn has(&self, key: &str) -> Result<bool, StoreError> {
        let data = KeyRef {
            key: key.to_string(),
        };
        match self
            .call(|correlation_id| WorkerMessage::Has {
                correlation_id,
                data,
            })
            .await?
        {
            StoreReply::Has(exists) => Ok(exists),
            other => Err(unexpected(Operation::Has, &other)),
        }
    }

    async fn set(&self, key: &str, record: Record) -> Result<(), StoreError> {
        let data = Entry {
            key: key.to_string(),
            record,
        };
        match self
            .call(|correlation_id| WorkerMessage::Set {
                correlation_id,
                data,
            })
            .await?
        {
            StoreReply::Set => Ok(()),
            other => Err(unexpected(Operation::Set, &other)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let data = KeyRef {
            key: key.to_string(),
        };
        match self
            .call(|correlation_id| WorkerMessage::Delete {
                correlation_id,
                data,
            })
            .await?
        {
            StoreReply::Delete => Ok(()),
            other => Err(unexpected(Operation::Delete, &other)),
        }
    }
}

async fn write_requests<W>(mut writer: W, mut requests: mpsc::UnboundedReceiver<WorkerMessage>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(request) = requests.recv().await {
        if let Err(error) = write_message(&mut writer, &request).await {
            warn!(?error, "failed to write store request to coordinator");
            break;
        }
    }
}
