//! Error types for the session layer.
//!
//! Request failures carry the name of the step that failed (`context`) and
//! render as `"<context>: <cause>"`, which is also the diagnostic text sent
//! to the peer in a failure reply.

use std::fmt;

use rsshd_protocol::WireError;
use thiserror::Error;

use crate::identity::IdentityError;

/// Failure handling a single channel request.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The payload could not be decoded.
    #[error("{context}: {source}")]
    MalformedPayload {
        /// Step that failed.
        context: &'static str,
        /// Codec failure.
        #[source]
        source: WireError,
    },

    /// Unknown request type or unsupported subsystem.
    #[error("{context}: {cause}")]
    Unsupported {
        /// Step that failed.
        context: &'static str,
        /// What was asked for.
        cause: String,
    },

    /// The request arrived in a state where it cannot be honoured.
    #[error("{context}: {cause}")]
    PreconditionUnmet {
        /// Step that failed.
        context: &'static str,
        /// The unmet condition.
        cause: String,
    },

    /// A pseudo-terminal, process, or subsystem could not be created.
    #[error("{context}: {cause}")]
    ResourceAllocation {
        /// Step that failed.
        context: &'static str,
        /// OS or library error text.
        cause: String,
    },
}

impl RequestError {
    pub fn malformed(context: &'static str, source: WireError) -> Self {
        Self::MalformedPayload { context, source }
    }

    pub fn unsupported(context: &'static str, cause: impl Into<String>) -> Self {
        Self::Unsupported {
            context,
            cause: cause.into(),
        }
    }

    pub fn precondition(context: &'static str, cause: impl Into<String>) -> Self {
        Self::PreconditionUnmet {
            context,
            cause: cause.into(),
        }
    }

    pub fn allocation(context: &'static str, cause: impl fmt::Display) -> Self {
        Self::ResourceAllocation {
            context,
            cause: cause.to_string(),
        }
    }
}

/// Failure talking to the transport side of a channel or connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The transport side has gone away.
    #[error("transport closed")]
    Closed,

    /// Key exchange or authentication did not complete.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The transport refused an operation.
    #[error("transport error: {0}")]
    Other(String),
}

/// Failure establishing a [`ServerConn`](crate::session::ServerConn).
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The transport handshake failed.
    #[error(transparent)]
    Handshake(#[from] TransportError),

    /// The authenticated name has no local account.
    #[error(transparent)]
    UnknownUser(#[from] IdentityError),
}

/// One resource that failed to release during connection teardown.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{resource}: {source}")]
pub struct ReleaseFailure {
    /// What was being released, e.g. `channel 3`.
    pub resource: String,
    /// Why it failed.
    #[source]
    pub source: TransportError,
}

/// Every release failure collected by a connection close.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShutdownError {
    failures: Vec<ReleaseFailure>,
}

impl ShutdownError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, resource: impl Into<String>, source: TransportError) {
        self.failures.push(ReleaseFailure {
            resource: resource.into(),
            source,
        });
    }

    pub fn failures(&self) -> &[ReleaseFailure] {
        &self.failures
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// `Ok(())` when nothing failed.
    pub fn into_result(self) -> Result<(), ShutdownError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{}", failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for ShutdownError {}
