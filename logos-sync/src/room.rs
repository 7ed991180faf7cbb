//! Per-room replication state machine.
//!
//! ```text
//!          append / catch-up subscribe
//!   Idle ───────────────────────────────► Registered
//!    ▲        (enqueued exactly once)         │
//!    └────────── worker drains marker ────────┘
//! ```
//!
//! A room is a named append-only byte log. Appends are broadcast to live
//! subscribers immediately and buffered in `pending_writes` until the
//! persistence worker commits them. `offset` is the logical length
//! (durable + pending) and only grows.

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

use crate::protocol::{Epoch, RoomName, SubscriptionEntry};
use crate::session::{Session, SessionId};

/// An accepted append waiting for the persistence worker.
pub struct PendingWrite {
    pub payload: Vec<u8>,
    /// Originating session
    pub session: Arc<Session>,
    /// Client-assigned confirmation number
    pub confirmation: u64,
}

/// A subscriber waiting for catch-up replay.
pub struct PendingSubscription {
    pub session: Arc<Session>,
    /// Offset the client already holds
    pub offset: u64,
    pub epoch: Epoch,
}

/// Mutable room state, guarded by the room lock.
pub(crate) struct RoomState {
    /// Already queued with the persistence worker
    pub(crate) registered: bool,
    pub(crate) pending_writes: Vec<PendingWrite>,
    /// Logical length: durable + pending bytes
    pub(crate) offset: u64,
    /// Length of the room's log file
    pub(crate) durable_offset: u64,
    pub(crate) subscribers: Vec<Arc<Session>>,
    pub(crate) pending_subs: Vec<PendingSubscription>,
    /// Last commit exhausted its retries; writes are still pending
    pub(crate) degraded: bool,
}

impl RoomState {
    /// Claim the persistence registration. Returns `true` if the caller must
    /// enqueue the room.
    pub(crate) fn claim_registration(&mut self) -> bool {
        if self.registered {
            return false;
        }
        self.registered = true;
        true
    }

    pub(crate) fn has_subscriber(&self, id: SessionId) -> bool {
        self.subscribers.iter().any(|s| s.id() == id)
    }

    /// Drop subscribers whose session lost its last connection.
    pub(crate) fn prune_detached(&mut self, room: &RoomName) {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| !s.is_detached());
        self.pending_subs.retain(|p| !p.session.is_detached());
        let pruned = before - self.subscribers.len();
        if pruned > 0 {
            log::debug!("Room {room}: pruned {pruned} detached subscribers");
        }
    }
}

/// Result of [`Room::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Logical offset after the append
    pub offset: u64,
    /// The caller must enqueue the room with the persistence queue
    pub needs_register: bool,
}

/// How a subscription was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeStatus {
    /// Session was already live; nothing changed
    AlreadySubscribed,
    /// Client is up to date and now receives live broadcasts
    Live,
    /// Client is behind; the persistence worker will replay the backlog
    CatchUp,
}

/// Result of [`Room::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOutcome {
    /// Offset and epoch after resync correction, as sent in SubscribeConfirm
    pub entry: SubscriptionEntry,
    pub status: SubscribeStatus,
    pub needs_register: bool,
}

/// A named append-only log with live subscribers.
pub struct Room {
    name: RoomName,
    epoch: Epoch,
    state: Mutex<RoomState>,
}

impl Room {
    /// Create a room whose log already holds `durable_len` bytes.
    pub fn new(name: RoomName, durable_len: u64) -> Self {
        Self {
            name,
            epoch: Epoch::generate(),
            state: Mutex::new(RoomState {
                registered: false,
                pending_writes: Vec::new(),
                offset: durable_len,
                durable_offset: durable_len,
                subscribers: Vec::new(),
                pending_subs: Vec::new(),
                degraded: false,
            }),
        }
    }

    pub fn name(&self) -> &RoomName {
        &self.name
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().await
    }

    /// Logical length (durable + pending).
    pub async fn offset(&self) -> u64 {
        self.state.lock().await.offset
    }

    pub async fn durable_offset(&self) -> u64 {
        self.state.lock().await.durable_offset
    }

    pub async fn subscriber_count(&self) -> usize {
        self.state.lock().await.subscribers.len()
    }

    pub async fn is_subscribed(&self, id: SessionId) -> bool {
        self.state.lock().await.has_subscriber(id)
    }

    /// Writes accepted but not yet committed.
    pub async fn pending_write_count(&self) -> usize {
        self.state.lock().await.pending_writes.len()
    }

    pub async fn is_registered(&self) -> bool {
        self.state.lock().await.registered
    }

    /// Whether the last commit failed after exhausting its retries.
    pub async fn is_degraded(&self) -> bool {
        self.state.lock().await.degraded
    }

    /// Append `payload` from `sender`.
    ///
    /// Advances the logical offset immediately, broadcasts the payload to every
    /// live subscriber except the sender and acknowledges the sender with
    /// `HostUnconfirmedByClient`.
    pub async fn append(
        &self,
        sender: &Arc<Session>,
        confirmation: u64,
        payload: Vec<u8>,
    ) -> AppendOutcome {
        let mut state = self.state.lock().await;
        state.prune_detached(&self.name);

        // Lock order is room, then session. Nothing may take a room lock
        // while holding a session lock.
        state.offset += payload.len() as u64;
        let offset = state.offset;

        for subscriber in &state.subscribers {
            if subscriber.id() != sender.id() {
                subscriber.send_update(&self.name, &payload).await;
            }
        }
        sender.track_write();
        sender.send_host_unconfirmed(confirmation, offset).await;

        log::trace!(
            "Room {}: {} appended {} bytes (conf {confirmation}), offset {offset}",
            self.name,
            sender.id(),
            payload.len()
        );
        state.pending_writes.push(PendingWrite {
            payload,
            session: sender.clone(),
            confirmation,
        });

        AppendOutcome {
            offset,
            needs_register: state.claim_registration(),
        }
    }

    /// The position a client reporting `(offset, epoch)` must adopt.
    ///
    /// A stale epoch or an offset beyond the room's logical length resets to 0
    /// under the room's own epoch (full resync). Changes nothing, and stays
    /// valid afterwards because the logical length only grows.
    pub async fn resolve(&self, offset: u64, epoch: Epoch) -> SubscriptionEntry {
        let state = self.state.lock().await;
        self.corrected_entry(&state, offset, epoch)
    }

    fn corrected_entry(&self, state: &RoomState, offset: u64, epoch: Epoch) -> SubscriptionEntry {
        let offset = if epoch != self.epoch || offset > state.offset {
            log::debug!(
                "Room {}: client reported ({offset}, {epoch}), forcing resync at epoch {}",
                self.name,
                self.epoch
            );
            0
        } else {
            offset
        };
        SubscriptionEntry {
            room: self.name.clone(),
            offset,
            epoch: self.epoch,
        }
    }

    /// Subscribe `session` from `offset` in `epoch`.
    ///
    /// The position is corrected as in [`Room::resolve`]. An up-to-date client
    /// goes live directly; anyone behind is queued for catch-up replay, which
    /// may start as soon as this returns.
    pub async fn subscribe(
        &self,
        session: &Arc<Session>,
        offset: u64,
        epoch: Epoch,
    ) -> SubscribeOutcome {
        let mut state = self.state.lock().await;
        state.prune_detached(&self.name);

        let entry = self.corrected_entry(&state, offset, epoch);
        let offset = entry.offset;

        if state.has_subscriber(session.id()) {
            return SubscribeOutcome {
                entry,
                status: SubscribeStatus::AlreadySubscribed,
                needs_register: false,
            };
        }

        if offset == state.offset {
            state.subscribers.push(session.clone());
            return SubscribeOutcome {
                entry,
                status: SubscribeStatus::Live,
                needs_register: false,
            };
        }

        state.pending_subs.push(PendingSubscription {
            session: session.clone(),
            offset,
            epoch: self.epoch,
        });
        SubscribeOutcome {
            entry,
            status: SubscribeStatus::CatchUp,
            needs_register: state.claim_registration(),
        }
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("name", &self.name)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ChannelConnection, Connection};
    use crate::protocol::Message;
    use tokio::sync::mpsc;

    async fn attached_session() -> (Arc<Session>, mpsc::Receiver<Vec<u8>>) {
        let session = Arc::new(Session::new(SessionId::generate()));
        let (conn, rx) = ChannelConnection::new(32);
        session.attach(conn).await;
        (session, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Vec<u8>>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.extend(Message::decode_frame(&frame).unwrap());
        }
        out
    }

    fn room(name: &str, len: u64) -> Room {
        Room::new(RoomName::new(name).unwrap(), len)
    }

    #[tokio::test]
    async fn test_append_broadcasts_to_others_only() {
        let room = room("doc1", 0);
        let (a, mut rx_a) = attached_session().await;
        let (b, mut rx_b) = attached_session().await;
        room.subscribe(&a, 0, room.epoch()).await;
        room.subscribe(&b, 0, room.epoch()).await;

        let outcome = room.append(&a, 7, vec![1, 2, 3]).await;
        assert_eq!(outcome, AppendOutcome { offset: 3, needs_register: true });

        let to_b = drain(&mut rx_b);
        assert_eq!(to_b.len(), 1);
        assert!(matches!(&to_b[0], Message::Update { payload, .. } if payload == &vec![1, 2, 3]));

        let to_a = drain(&mut rx_a);
        assert_eq!(to_a, vec![Message::HostUnconfirmedByClient { confirmation: 7, offset: 3 }]);
        assert_eq!(a.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_registers_once_per_dirty_period() {
        let room = room("r", 0);
        let (a, _rx) = attached_session().await;
        assert!(room.append(&a, 0, vec![1]).await.needs_register);
        assert!(!room.append(&a, 1, vec![2]).await.needs_register);
        assert_eq!(room.offset().await, 2);
        assert_eq!(room.pending_write_count().await, 2);

        room.lock().await.registered = false;
        assert!(room.append(&a, 2, vec![3]).await.needs_register);
    }

    #[tokio::test]
    async fn test_subscribe_up_to_date_goes_live() {
        let room = room("r", 10);
        let (a, _rx) = attached_session().await;
        let outcome = room.subscribe(&a, 10, room.epoch()).await;
        assert_eq!(outcome.status, SubscribeStatus::Live);
        assert!(!outcome.needs_register);
        assert!(room.is_subscribed(a.id()).await);
    }

    #[tokio::test]
    async fn test_subscribe_behind_queues_catch_up() {
        let room = room("r", 10);
        let (a, _rx) = attached_session().await;
        let outcome = room.subscribe(&a, 4, room.epoch()).await;
        assert_eq!(outcome.status, SubscribeStatus::CatchUp);
        assert_eq!(outcome.entry.offset, 4);
        assert!(outcome.needs_register);
        assert!(!room.is_subscribed(a.id()).await);
    }

    #[tokio::test]
    async fn test_stale_epoch_forces_resync() {
        let room = room("r", 10);
        let (a, _rx) = attached_session().await;
        let stale = Epoch(room.epoch().0.wrapping_add(1));
        let outcome = room.subscribe(&a, 10, stale).await;
        assert_eq!(outcome.entry.offset, 0);
        assert_eq!(outcome.entry.epoch, room.epoch());
        assert_eq!(outcome.status, SubscribeStatus::CatchUp);
    }

    #[tokio::test]
    async fn test_offset_beyond_length_forces_resync() {
        let room = room("r", 5);
        let (a, _rx) = attached_session().await;
        let outcome = room.subscribe(&a, 6, room.epoch()).await;
        assert_eq!(outcome.entry.offset, 0);
    }

    #[tokio::test]
    async fn test_resolve_leaves_room_untouched() {
        let room = room("r", 10);
        let (a, _rx) = attached_session().await;
        let stale = Epoch(room.epoch().0.wrapping_add(1));

        let entry = room.resolve(10, stale).await;
        assert_eq!(entry.offset, 0);
        assert_eq!(entry.epoch, room.epoch());
        assert_eq!(room.resolve(10, room.epoch()).await.offset, 10);
        assert!(!room.is_registered().await);
        assert_eq!(room.subscriber_count().await, 0);

        // Subscribing at the resolved position keeps it.
        let outcome = room.subscribe(&a, entry.offset, entry.epoch).await;
        assert_eq!(outcome.entry, entry);
    }

    #[tokio::test]
    async fn test_resubscribe_is_noop() {
        let room = room("r", 0);
        let (a, _rx_a) = attached_session().await;
        let (b, mut rx_b) = attached_session().await;
        room.subscribe(&b, 0, room.epoch()).await;
        let again = room.subscribe(&b, 0, room.epoch()).await;
        assert_eq!(again.status, SubscribeStatus::AlreadySubscribed);
        assert_eq!(room.subscriber_count().await, 1);

        room.append(&a, 0, vec![9]).await;
        assert_eq!(drain(&mut rx_b).len(), 1);
    }

    #[tokio::test]
    async fn test_detached_subscriber_pruned_on_mutation() {
        let room = room("r", 0);
        let (a, _rx_a) = attached_session().await;
        let session = Arc::new(Session::new(SessionId::generate()));
        let (conn, _rx) = ChannelConnection::new(4);
        session.attach(conn.clone()).await;
        room.subscribe(&session, 0, room.epoch()).await;
        assert_eq!(room.subscriber_count().await, 1);

        session.detach(conn.id()).await;
        room.append(&a, 0, vec![1]).await;
        assert_eq!(room.subscriber_count().await, 0);
    }
}
