//! Outbound side of a client connection.
//!
//! The transport owns the socket and the read loop; the core only needs to
//! push encoded frames at a connection. Every connection carries an explicit
//! lifecycle that `write` checks before sending:
//!
//! ```text
//!   Open ──close()──► Closing ──mark_closed()──► Closed
//!     └──────────── receiver dropped ─────────────┘
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

/// Process-unique connection identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate a fresh id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Open = 0,
    /// No new frames accepted; queued frames may still drain
    Closing = 1,
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Connection errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("connection {0} is closed")]
    Closed(ConnectionId),
    /// Outbound buffer full; the frame was dropped
    #[error("outbound buffer of connection {0} is full")]
    Full(ConnectionId),
}

/// Capability to send frames to one client.
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    fn state(&self) -> ConnectionState;

    /// Queue one encoded frame. Never blocks.
    fn write(&self, frame: Vec<u8>) -> Result<(), ConnectionError>;

    /// Stop accepting frames.
    fn close(&self);
}

/// Connection backed by a bounded channel drained by a transport writer task.
pub struct ChannelConnection {
    id: ConnectionId,
    state: AtomicU8,
    sender: mpsc::Sender<Vec<u8>>,
}

impl ChannelConnection {
    /// Create a connection and the receiver its writer task drains.
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let conn = Arc::new(Self {
            id: ConnectionId::next(),
            state: AtomicU8::new(ConnectionState::Open as u8),
            sender,
        });
        (conn, receiver)
    }

    /// The writer task finished; nothing more will be delivered.
    pub fn mark_closed(&self) {
        self.state.store(ConnectionState::Closed as u8, Ordering::Release);
    }
}

impl Connection for ChannelConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn write(&self, frame: Vec<u8>) -> Result<(), ConnectionError> {
        if self.state() != ConnectionState::Open {
            return Err(ConnectionError::Closed(self.id));
        }
        match self.sender.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Outbound buffer of {} full, dropping frame", self.id);
                Err(ConnectionError::Full(self.id))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.mark_closed();
                Err(ConnectionError::Closed(self.id))
            }
        }
    }

    fn close(&self) {
        let _ = self.state.compare_exchange(
            ConnectionState::Open as u8,
            ConnectionState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_and_receive() {
        let (conn, mut rx) = ChannelConnection::new(4);
        conn.write(vec![1, 2]).unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec![1, 2]);
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[test]
    fn test_ids_are_unique() {
        let (a, _ra) = ChannelConnection::new(1);
        let (b, _rb) = ChannelConnection::new(1);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_full_buffer_drops() {
        let (conn, _rx) = ChannelConnection::new(1);
        conn.write(vec![1]).unwrap();
        assert_eq!(conn.write(vec![2]), Err(ConnectionError::Full(conn.id())));
        // Still open: a full buffer is lossy, not fatal.
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[test]
    fn test_lifecycle_rejects_after_close() {
        let (conn, _rx) = ChannelConnection::new(4);
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert_eq!(conn.write(vec![1]), Err(ConnectionError::Closed(conn.id())));

        conn.mark_closed();
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_dropped_receiver_closes() {
        let (conn, rx) = ChannelConnection::new(4);
        drop(rx);
        assert_eq!(conn.write(vec![1]), Err(ConnectionError::Closed(conn.id())));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }
}
