//! Error types for the change-data-capture pipeline
//!
//! Every fallible operation in the crate returns [`ReplicationError`]. The
//! supervisor uses [`ReplicationError::is_transient`] to decide between a
//! reconnect with backoff and a terminal [`PipelineFailure`](crate::PipelineFailure).

use crate::types::Lsn;
use thiserror::Error;

/// Longest payload excerpt kept on a [`DecodeError`]
const EXCERPT_LIMIT: usize = 160;

/// Comprehensive error types for replication operations
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Network or server failures that a reconnect may cure
    #[error("Connection error: {0}")]
    Connection(String),

    /// The named slot exists but was created for a different output plugin
    #[error(
        "Replication slot \"{slot_name}\" uses output plugin \"{existing_plugin}\", expected \"{expected_plugin}\""
    )]
    SlotConflict {
        slot_name: String,
        existing_plugin: String,
        expected_plugin: String,
    },

    /// The slot vanished or is held by another walsender
    #[error("Replication slot unavailable: {0}")]
    SlotUnavailable(String),

    /// WAL needed to resume from the requested position has been recycled
    #[error("Replication slot \"{slot_name}\" cannot resume from {requested}: {reason}")]
    LsnTooOld {
        slot_name: String,
        requested: Lsn,
        reason: String,
    },

    /// A wal2json payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The change stream broke an ordering or grouping rule
    #[error("Protocol invariant violated: {0}")]
    ProtocolInvariantViolation(String),

    /// Checkpoint persistence failed or would regress
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// The downstream consumer rejected a transaction
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation cancelled errors
    #[error("Operation was cancelled: {0}")]
    Cancelled(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// String conversion errors (from CString operations)
    #[error("String conversion error: {0}")]
    StringConversion(#[from] std::ffi::NulError),
}

impl ReplicationError {
    /// Create a new connection error (transient)
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        ReplicationError::Connection(msg.into())
    }

    /// Create a new slot-unavailable error (transient)
    pub fn slot_unavailable<S: Into<String>>(msg: S) -> Self {
        ReplicationError::SlotUnavailable(msg.into())
    }

    /// Create a new protocol invariant violation
    pub fn protocol_violation<S: Into<String>>(msg: S) -> Self {
        ReplicationError::ProtocolInvariantViolation(msg.into())
    }

    /// Create a new checkpoint error
    pub fn checkpoint<S: Into<String>>(msg: S) -> Self {
        ReplicationError::Checkpoint(msg.into())
    }

    /// Create a new consumer error
    pub fn consumer<S: Into<String>>(msg: S) -> Self {
        ReplicationError::Consumer(msg.into())
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        ReplicationError::Config(msg.into())
    }

    /// Create a new cancellation error
    pub fn cancelled<S: Into<String>>(msg: S) -> Self {
        ReplicationError::Cancelled(msg.into())
    }

    /// Check if the error is transient (reconnect with backoff)
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReplicationError::Connection(_)
                | ReplicationError::SlotUnavailable(_)
                | ReplicationError::Io(_)
        )
    }

    /// Check if the error must stop the pipeline
    pub fn is_fatal(&self) -> bool {
        !self.is_transient() && !self.is_cancelled()
    }

    /// Check if the error is due to cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ReplicationError::Cancelled(_))
    }
}

/// A payload the codec could not turn into a [`WalMessage`](crate::WalMessage)
///
/// Carries the reason and a bounded excerpt of the raw payload for diagnostics.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason} (payload: {excerpt})")]
pub struct DecodeError {
    reason: String,
    excerpt: String,
}

impl DecodeError {
    pub fn new<S: Into<String>>(reason: S, raw: &[u8]) -> Self {
        let text = String::from_utf8_lossy(raw);
        let excerpt = if text.chars().count() > EXCERPT_LIMIT {
            let mut cut: String = text.chars().take(EXCERPT_LIMIT).collect();
            cut.push_str("...");
            cut
        } else {
            text.into_owned()
        };
        Self {
            reason: reason.into(),
            excerpt,
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn excerpt(&self) -> &str {
        &self.excerpt
    }
}

/// Result type for replication operations
pub type Result<T> = std::result::Result<T, ReplicationError>;
