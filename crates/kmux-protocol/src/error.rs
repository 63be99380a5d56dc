//! Error types for kmux client operations.

use std::time::Duration;

use thiserror::Error;

use crate::ids::{KernelId, MsgId};

/// Errors surfaced by the deferred I/O layer, the bus, and the multiplexer.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("timed out after {waited:?} waiting for {subject}")]
    ProtocolTimeout {
        subject: String,
        waited: Duration,
        request_id: Option<MsgId>,
    },
    #[error("kernelspec {name} is not compatible with the kernelspecs of {endpoint}")]
    KernelspecMismatch { endpoint: String, name: String },
    #[error("connection unavailable: {0}")]
    ConnectionUnavailable(String),
    #[error("cannot subscribe to a plain subscriber")]
    SubscriptionMisuse,
    #[error("no execution context installed")]
    MissingContext,
    #[error("single-shot action was already evaluated")]
    AlreadyEvaluated,
    #[error("kernel has not been started")]
    KernelNotStarted,
    #[error("kernel {0} does not exist on the endpoint")]
    KernelNotFound(KernelId),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("lifecycle api error: {0}")]
    Lifecycle(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ClientError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ProtocolTimeout { .. })
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Convenience result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;
