use std::{io, time::Duration};

use thiserror::Error;

use crate::status::{Code, Status};

/// Failure of a single client call. A call yields exactly one of these or a response.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("invalid call input: {0}")]
    CallerInput(String),
    #[error("failed to open call to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: TransportError,
    },
    #[error("failed to submit call batch: {0}")]
    Submission(#[from] SubmitError),
    #[error("call to {method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },
    #[error("transport failure: {0}")]
    TransportFailure(Status),
    #[error("remote fault: {0}")]
    RemoteFault(Status),
}

impl CallError {
    /// Status code surfaced to the caller, where one exists.
    pub fn code(&self) -> Option<Code> {
        match self {
            Self::Timeout { .. } => Some(Code::DeadlineExceeded),
            Self::TransportFailure(status) | Self::RemoteFault(status) => Some(status.code()),
            Self::Connect { .. } => Some(Code::Unavailable),
            Self::CallerInput(_) | Self::Submission(_) => None,
        }
    }
}

/// A batch (or accept request) the transport or queue refused to take.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("call is already closed")]
    CallClosed,
    #[error("a batch is already outstanding on this call")]
    BatchInProgress,
    #[error("invalid batch: {0}")]
    InvalidBatch(String),
    #[error("completion queue is shut down")]
    QueueShutdown,
    #[error("listener is not started")]
    NotStarted,
    #[error("listener is shutting down")]
    ListenerShutdown,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid address {0:?}")]
    InvalidAddress(String),
    #[error("address {0} is already in use")]
    AddressInUse(String),
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("listener must be bound before it is started")]
    NotBound,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Anything a handler raised. Converted into an `Internal` status at the dispatch boundary.
#[derive(Debug, Error)]
pub enum HandlerFault {
    #[error("{0}")]
    Failed(String),
    #[error("handler panicked: {0}")]
    Panicked(String),
    #[error("handler process failed: {0}")]
    Process(String),
}

impl HandlerFault {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for HandlerFault {
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self::Failed(err.to_string())
    }
}

impl From<io::Error> for HandlerFault {
    fn from(err: io::Error) -> Self {
        Self::Process(err.to_string())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HookError {
    #[error(
        "unknown hook {0:?}, expected one of server_create, queue_create, bind, server_start, run, shutdown, stopped"
    )]
    UnknownHook(String),
}

/// Conditions that end `serve` with an error. A single call failing is never one of them.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to create listener: {0}")]
    CreateListener(#[source] TransportError),
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: TransportError,
    },
    #[error("failed to start listener: {0}")]
    Start(#[source] TransportError),
    #[error("cannot accept new calls: {0}")]
    AcceptFailed(String),
}
