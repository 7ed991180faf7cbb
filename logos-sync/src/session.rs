//! Logical client identity spanning reconnects.
//!
//! A session owns one active connection plus every connection attached under
//! the same identity, and the confirmation trackers for both directions. All
//! outbound sends go through the session lock, so the client observes a single
//! total order of updates and confirmations.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::confirmation::{ClientConfirmation, ServerConfirmation};
use crate::connection::{Connection, ConnectionError, ConnectionId};
use crate::error::ConsistencyError;
use crate::protocol::{encode_update, Message, RoomName, SubscriptionEntry};

/// Unpredictable session identity (random v4 UUID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Draw a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Snapshot of a session's confirmation counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationSnapshot {
    /// Next server confirmation to hand out
    pub server_next: u64,
    /// Next server confirmation the client is expected to confirm
    pub server_next_client: u64,
    /// Watermark of completed client work
    pub client_next: u64,
    /// Client completions buffered above the watermark
    pub client_buffered: usize,
}

struct SessionInner {
    active: Option<Arc<dyn Connection>>,
    connections: Vec<Arc<dyn Connection>>,
    server_confirmation: ServerConfirmation,
    client_confirmation: ClientConfirmation,
}

/// One logical client.
pub struct Session {
    id: SessionId,
    inner: Mutex<SessionInner>,
    /// Mirrors `inner.active.is_none()` for lock-free pruning checks
    detached: AtomicBool,
    /// Accepted writes not yet durably confirmed
    in_flight: AtomicU64,
    /// A consistency violation ended this session
    aborted: AtomicBool,
}

impl Session {
    /// Create a session with no connections.
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            inner: Mutex::new(SessionInner {
                active: None,
                connections: Vec::new(),
                server_confirmation: ServerConfirmation::new(),
                client_confirmation: ClientConfirmation::new(),
            }),
            detached: AtomicBool::new(true),
            in_flight: AtomicU64::new(0),
            aborted: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Whether the session currently has no active connection.
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// Writes accepted from this session and not yet committed.
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Whether a consistency violation ended this session.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// End the session after a consistency violation: close every attached
    /// connection and refuse further frames. Its confirmation state is no
    /// longer trustworthy, so it is never resumed.
    pub async fn abort(&self, reason: &ConsistencyError) {
        if self.aborted.swap(true, Ordering::AcqRel) {
            return;
        }
        log::error!("Session {} aborted: {reason}", self.id);
        let inner = self.inner.lock().await;
        for conn in &inner.connections {
            conn.close();
        }
    }

    /// Connectionless with no pending obligations: eligible for removal.
    pub fn is_idle(&self) -> bool {
        self.is_detached() && self.in_flight() == 0
    }

    /// Attach a connection. The first attached connection becomes active.
    pub async fn attach(&self, conn: Arc<dyn Connection>) {
        let mut inner = self.inner.lock().await;
        if inner.active.is_none() {
            inner.active = Some(conn.clone());
            self.detached.store(false, Ordering::Release);
        }
        log::debug!("Session {} attached {}", self.id, conn.id());
        inner.connections.push(conn);
    }

    /// Detach a connection, promoting another attached one if the active
    /// connection went away.
    ///
    /// Returns `true` when the session is left without any connection.
    pub async fn detach(&self, conn_id: ConnectionId) -> bool {
        let mut inner = self.inner.lock().await;
        inner.connections.retain(|c| c.id() != conn_id);
        if inner.active.as_ref().is_some_and(|c| c.id() == conn_id) {
            inner.active = inner.connections.first().cloned();
            if let Some(promoted) = &inner.active {
                log::debug!("Session {} promoted {} to active", self.id, promoted.id());
            }
        }
        let connectionless = inner.active.is_none();
        self.detached.store(connectionless, Ordering::Release);
        connectionless
    }

    /// Number of attached connections.
    pub async fn connection_count(&self) -> usize {
        self.inner.lock().await.connections.len()
    }

    pub async fn active_connection(&self) -> Option<ConnectionId> {
        self.inner.lock().await.active.as_ref().map(|c| c.id())
    }

    fn write_frame(&self, inner: &SessionInner, frame: Vec<u8>) {
        let Some(conn) = &inner.active else {
            log::trace!("Session {} has no active connection, dropping frame", self.id);
            return;
        };
        match conn.write(frame) {
            Ok(()) => {}
            Err(ConnectionError::Closed(id)) => {
                log::debug!("Session {}: {id} closed before send", self.id);
            }
            // Already logged by the connection.
            Err(ConnectionError::Full(_)) => {}
        }
    }

    /// Send an arbitrary message on the active connection.
    pub async fn send(&self, message: &Message) {
        let inner = self.inner.lock().await;
        self.write_frame(&inner, message.encode());
    }

    /// Send room data tagged with a fresh server confirmation number.
    ///
    /// Empty payloads are not sent.
    pub async fn send_update(&self, room: &RoomName, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().await;
        let conf = inner.server_confirmation.create_room_confirmation(room);
        let frame = encode_update(conf, room, payload);
        self.write_frame(&inner, frame);
    }

    /// Optimistic acknowledgement of an accepted, not yet durable, update.
    pub async fn send_host_unconfirmed(&self, confirmation: u64, offset: u64) {
        self.send(&Message::HostUnconfirmedByClient { confirmation, offset })
            .await;
    }

    /// Tell the client how much of `room` is durable.
    pub async fn send_confirmed_by_host(&self, room: &RoomName, offset: u64) {
        self.send(&Message::ConfirmedByHost {
            room: room.clone(),
            offset,
        })
        .await;
    }

    pub async fn send_subscribe_confirm(&self, entries: Vec<SubscriptionEntry>) {
        self.send(&Message::SubscribeConfirm { entries }).await;
    }

    /// Register an accepted write that still owes a durable confirmation.
    pub fn track_write(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// Complete client work `n`. Emits one cumulative `Confirmation` when the
    /// watermark advances.
    pub async fn confirm(&self, n: u64) -> Result<bool, ConsistencyError> {
        let mut inner = self.inner.lock().await;
        let advanced = inner.client_confirmation.server_confirmed(n)?;
        if advanced {
            let number = inner.client_confirmation.next() - 1;
            self.write_frame(&inner, Message::Confirmation { number }.encode());
        }
        Ok(advanced)
    }

    /// Durably committed write `n`: release the in-flight slot and confirm it.
    pub async fn confirm_write(&self, n: u64) -> Result<bool, ConsistencyError> {
        if self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
            .is_err()
        {
            log::error!("Session {}: write {n} confirmed with nothing in flight", self.id);
            return Err(ConsistencyError::UntrackedWrite(n));
        }
        self.confirm(n).await
    }

    /// The client acknowledged server updates through `n`.
    pub async fn client_confirmed(&self, n: u64) {
        let mut inner = self.inner.lock().await;
        if !inner.server_confirmation.is_issued(n) {
            log::warn!(
                "Session {} confirmed {n}, but only {} confirmations were issued",
                self.id,
                inner.server_confirmation.next()
            );
            return;
        }
        inner.server_confirmation.client_confirmed(n);
    }

    pub async fn confirmation_snapshot(&self) -> ConfirmationSnapshot {
        let inner = self.inner.lock().await;
        ConfirmationSnapshot {
            server_next: inner.server_confirmation.next(),
            server_next_client: inner.server_confirmation.next_client(),
            client_next: inner.client_confirmation.next(),
            client_buffered: inner.client_confirmation.buffered(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("detached", &self.is_detached())
            .field("in_flight", &self.in_flight())
            .field("aborted", &self.is_aborted())
            .finish()
    }
}
