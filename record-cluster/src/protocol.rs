use std::{fmt, io};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Identifier attached by the worker to every request and echoed on the
/// matching response.
pub type CorrelationId = u64;

/// Opaque record payload. The store never looks inside it.
pub type Record = Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeyRef {
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entry {
    pub key: String,
    pub record: Record,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    GetAll,
    Get,
    Has,
    Set,
    Delete,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::GetAll => "get-all",
            Operation::Get => "get",
            Operation::Has => "has",
            Operation::Set => "set",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requests sent from a worker to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum WorkerMessage {
    GetAll { correlation_id: CorrelationId },
    Get { correlation_id: CorrelationId, data: KeyRef },
    Has { correlation_id: CorrelationId, data: KeyRef },
    Set { correlation_id: CorrelationId, data: Entry },
    Delete { correlation_id: CorrelationId, data: KeyRef },
}

impl WorkerMessage {
    pub fn correlation_id(&self) -> CorrelationId {
        match self {
            WorkerMessage::GetAll { correlation_id }
            | WorkerMessage::Get { correlation_id, .. }
            | WorkerMessage::Has { correlation_id, .. }
            | WorkerMessage::Set { correlation_id, .. }
            | WorkerMessage::Delete { correlation_id, .. } => *correlation_id,
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            WorkerMessage::GetAll { .. } => Operation::GetAll,
            WorkerMessage::Get { .. } => Operation::Get,
            WorkerMessage::Has { .. } => Operation::Has,
            WorkerMessage::Set { .. } => Operation::Set,
            WorkerMessage::Delete { .. } => Operation::Delete,
        }
    }
}

/// Messages sent from the coordinator to a worker: the one-off startup
/// configuration followed by responses to store requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum CoordinatorMessage {
    Initial {
        port: u16,
    },
    GetAll {
        correlation_id: CorrelationId,
        data: Vec<Record>,
    },
    Get {
        correlation_id: CorrelationId,
        #[serde(default)]
        data: Option<Record>,
    },
    Has {
        correlation_id: CorrelationId,
        data: bool,
    },
    Set {
        correlation_id: CorrelationId,
    },
    Delete {
        correlation_id: CorrelationId,
    },
}

impl CoordinatorMessage {
    pub fn response(correlation_id: CorrelationId, reply: StoreReply) -> Self {
        match reply {
            StoreReply::GetAll(data) => CoordinatorMessage::GetAll {
                correlation_id,
                data,
            },
            StoreReply::Get(data) => CoordinatorMessage::Get {
                correlation_id,
                data,
            },
            StoreReply::Has(data) => CoordinatorMessage::Has {
                correlation_id,
                data,
            },
            StoreReply::Set => CoordinatorMessage::Set { correlation_id },
            StoreReply::Delete => CoordinatorMessage::Delete { correlation_id },
        }
    }

    /// Splits a response into its correlation id and payload. Returns `None`
    /// for the startup message.
    pub fn into_reply(self) -> Option<(CorrelationId, StoreReply)> {
        match self {
            CoordinatorMessage::Initial { .. } => None,
            CoordinatorMessage::GetAll {
                correlation_id,
                data,
            } => Some((correlation_id, StoreReply::GetAll(data))),
            CoordinatorMessage::Get {
                correlation_id,
                data,
            } => Some((correlation_id, StoreReply::Get(data))),
            CoordinatorMessage::Has {
                correlation_id,
                data,
            } => Some((correlation_id, StoreReply::Has(data))),
            CoordinatorMessage::Set { correlation_id } => {
                Some((correlation_id, StoreReply::Set))
            }
            CoordinatorMessage::Delete { correlation_id } => {
                Some((correlation_id, StoreReply::Delete))
            }
        }
    }
}

/// Result payload of one store operation.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreReply {
    GetAll(Vec<Record>),
    Get(Option<Record>),
    Has(bool),
    Set,
    Delete,
}

impl StoreReply {
    pub fn operation(&self) -> Operation {
        match self {
            StoreReply::GetAll(_) => Operation::GetAll,
            StoreReply::Get(_) => Operation::Get,
            StoreReply::Has(_) => Operation::Has,
            StoreReply::Set => Operation::Set,
            StoreReply::Delete => Operation::Delete,
        }
    }
}

/// Reads the next message from a worker or coordinator pipe.
///
/// Each message is one JSON document on its own line; blank lines are
/// skipped. Returns `Ok(None)` once the peer closes its end. A line that does
/// not decode fails with [`io::ErrorKind::InvalidData`] and leaves the reader
/// positioned at the following line, so callers can log it and keep going.
/// Nothing here inspects correlation ids; matching is up to the caller.
pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    while reader.read_line(&mut line).await? > 0 {
        let frame = line.trim_end_matches(LINE_ENDINGS);
        if !frame.is_empty() {
            return serde_json::from_str(frame).map(Some).map_err(to_io_error);
        }
        line.clear();
    }
    Ok(None)
}

/// Writes `message` as a single line and flushes, so a request or response
/// is visible to the other process as soon as this returns.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut frame = serde_json::to_vec(message).map_err(to_io_error)?;
    frame.push(b'\n');
    writer.write_all(&frame).await?;
    writer.flush().await
}

fn to_io_error(error: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, error)
}
