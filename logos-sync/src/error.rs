//! Crate-level error types.

use thiserror::Error;

use crate::connection::ConnectionError;
use crate::protocol::ProtocolError;
use crate::session::SessionId;
use crate::storage::StorageError;

/// Invariant violations that must never happen in correct operation.
///
/// These abort the operation that detected them and are logged at `error`
/// level; nothing retries past them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsistencyError {
    /// The session id generator produced an id already in use
    #[error("generated session id {0} twice")]
    DuplicateSessionId(SessionId),
    /// A completion arrived for a number below the watermark
    #[error("confirmation {confirmed} completed again below watermark {watermark}")]
    ConfirmationRegression { confirmed: u64, watermark: u64 },
    /// The same out-of-order completion was reported twice
    #[error("confirmation {0} completed twice")]
    DuplicateCompletion(u64),
    /// A write was confirmed that was never tracked as in flight
    #[error("write {0} confirmed with nothing in flight")]
    UntrackedWrite(u64),
    /// The session was ended by an earlier violation
    #[error("session {0} was aborted")]
    SessionAborted(SessionId),
}

/// Errors surfaced by the sync core.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("consistency violation: {0}")]
    Consistency(#[from] ConsistencyError),
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
    #[error("session {0} still has attached connections")]
    SessionInUse(SessionId),
    #[error("session {0} still has writes in flight")]
    SessionBusy(SessionId),
    #[error("persistence queue is closed")]
    QueueClosed,
}

impl SyncError {
    /// Whether this error reflects a defect rather than bad input or I/O.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Consistency(_))
    }
}
