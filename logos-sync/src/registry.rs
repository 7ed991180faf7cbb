//! Process-wide context: rooms, sessions, storage and the persistence queue.
//!
//! ```text
//!              ┌─────────────── Registry ───────────────┐
//!  frame ───►  │ rooms: RwLock<name → Arc<Room>>        │
//!              │ sessions: Mutex<id → Arc<Session>>     │ ──► PersistenceQueue ──► RoomStore
//!              └────────────────────────────────────────┘
//! ```
//!
//! Rooms live for the life of the process. Sessions are removed once they have
//! no connection and no write awaiting durable confirmation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::RwLock;

use crate::connection::{Connection, ConnectionId};
use crate::error::{ConsistencyError, SyncError};
use crate::persistence::{PersistenceConfig, PersistenceQueue, PersistenceStats};
use crate::protocol::{Decoder, Epoch, Message, RoomName, SubscriptionEntry};
use crate::room::Room;
use crate::session::{Session, SessionId};
use crate::storage::RoomStore;

/// Session id → session map behind a plain mutex. Never held across `.await`.
#[derive(Default)]
pub struct SessionTable {
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
}

impl SessionTable {
    fn map(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a fresh session. An id collision is a consistency violation.
    pub fn insert_new(&self, id: SessionId) -> Result<Arc<Session>, ConsistencyError> {
        let mut map = self.map();
        if map.contains_key(&id) {
            log::error!("Session id {id} generated twice, refusing to reuse it");
            return Err(ConsistencyError::DuplicateSessionId(id));
        }
        let session = Arc::new(Session::new(id));
        map.insert(id, session.clone());
        Ok(session)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.map().get(&id).cloned()
    }

    /// Remove `id` only if it is still idle. Returns whether it was removed.
    pub fn remove_if_idle(&self, id: SessionId) -> bool {
        let mut map = self.map();
        match map.get(&id) {
            Some(session) if session.is_idle() => {
                map.remove(&id);
                log::debug!("Session {id} removed");
                true
            }
            _ => false,
        }
    }

    /// Put `session` back if an idle removal raced with its resume.
    /// Returns whether it had to be re-inserted.
    pub fn reinstate(&self, session: &Arc<Session>) -> bool {
        let mut map = self.map();
        if map.contains_key(&session.id()) {
            return false;
        }
        log::debug!("Session {} resumed after removal, re-inserting", session.id());
        map.insert(session.id(), session.clone());
        true
    }

    fn remove(&self, id: SessionId) -> Result<(), SyncError> {
        let mut map = self.map();
        let session = map.get(&id).ok_or(SyncError::SessionNotFound(id))?;
        if !session.is_detached() {
            return Err(SyncError::SessionInUse(id));
        }
        if session.in_flight() > 0 {
            return Err(SyncError::SessionBusy(id));
        }
        map.remove(&id);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }

    fn clear(&self) {
        self.map().clear();
    }
}

/// The sync core's shared state.
pub struct Registry {
    rooms: RwLock<HashMap<RoomName, Arc<Room>>>,
    sessions: Arc<SessionTable>,
    store: Arc<RoomStore>,
    persistence: PersistenceQueue,
}

impl Registry {
    /// Open storage and start the persistence workers.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: PersistenceConfig) -> Result<Self, SyncError> {
        let store = Arc::new(RoomStore::open(&config.dir)?);
        let sessions = Arc::new(SessionTable::default());
        let persistence = PersistenceQueue::start(&config, store.clone(), sessions.clone());
        Ok(Self {
            rooms: RwLock::new(HashMap::new()),
            sessions,
            store,
            persistence,
        })
    }

    pub fn store(&self) -> &RoomStore {
        &self.store
    }

    /// Look up a room, creating it on first access.
    ///
    /// The offset of a new room is the length of its existing log.
    pub async fn get_or_create_room(&self, name: &RoomName) -> Result<Arc<Room>, SyncError> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(name) {
                return Ok(room.clone());
            }
        }

        // Slow path: write lock, re-check
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(name) {
            return Ok(room.clone());
        }
        let durable_len = self.store.durable_len(name).await?;
        let room = Arc::new(Room::new(name.clone(), durable_len));
        log::info!(
            "Room {name} opened at offset {durable_len}, epoch {}",
            room.epoch()
        );
        rooms.insert(name.clone(), room.clone());
        Ok(room)
    }

    pub async fn room(&self, name: &RoomName) -> Option<Arc<Room>> {
        self.rooms.read().await.get(name).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Create a session under a fresh random id.
    pub fn create_session(&self) -> Result<Arc<Session>, SyncError> {
        self.create_session_with_id(SessionId::generate())
    }

    pub(crate) fn create_session_with_id(&self, id: SessionId) -> Result<Arc<Session>, SyncError> {
        let session = self.sessions.insert_new(id)?;
        log::debug!("Session {id} created");
        Ok(session)
    }

    pub fn get_session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id)
    }

    /// Remove a session. Refused while it holds a connection or owes
    /// confirmations.
    pub fn remove_session(&self, id: SessionId) -> Result<(), SyncError> {
        self.sessions.remove(id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Attach `conn` to `session`.
    ///
    /// The session is no longer idle once attached, so a removal can only have
    /// happened before that point and is undone here.
    pub async fn attach_connection(&self, session: &Arc<Session>, conn: Arc<dyn Connection>) {
        session.attach(conn).await;
        self.sessions.reinstate(session);
    }

    /// Detach a connection. Returns `true` if the session was removed.
    pub async fn detach_connection(&self, session: &Arc<Session>, conn: ConnectionId) -> bool {
        let connectionless = session.detach(conn).await;
        if connectionless && session.is_idle() {
            return self.sessions.remove_if_idle(session.id());
        }
        if connectionless {
            log::debug!(
                "Session {} detached with {} writes in flight",
                session.id(),
                session.in_flight()
            );
        }
        false
    }

    /// Subscribe `session` to `room` from `offset`. Returns the entry to
    /// report in SubscribeConfirm.
    pub async fn subscribe(
        &self,
        room: &RoomName,
        session: &Arc<Session>,
        offset: u64,
        epoch: Epoch,
    ) -> Result<SubscriptionEntry, SyncError> {
        let room = self.get_or_create_room(room).await?;
        self.subscribe_room(&room, session, offset, epoch).await
    }

    async fn subscribe_room(
        &self,
        room: &Arc<Room>,
        session: &Arc<Session>,
        offset: u64,
        epoch: Epoch,
    ) -> Result<SubscriptionEntry, SyncError> {
        let outcome = room.subscribe(session, offset, epoch).await;
        if outcome.needs_register {
            self.register(room).await?;
        }
        Ok(outcome.entry)
    }

    /// Append `payload` to `room` on behalf of `session`. Returns the room's
    /// logical offset after the append.
    pub async fn publish(
        &self,
        room: &RoomName,
        session: &Arc<Session>,
        confirmation: u64,
        payload: Vec<u8>,
    ) -> Result<u64, SyncError> {
        let room = self.get_or_create_room(room).await?;
        let outcome = room.append(session, confirmation, payload).await;
        if outcome.needs_register {
            self.register(&room).await?;
        }
        Ok(outcome.offset)
    }

    async fn register(&self, room: &Arc<Room>) -> Result<(), SyncError> {
        if let Err(e) = self.persistence.register(room).await {
            room.lock().await.registered = false;
            log::error!("Cannot enqueue room {}: {e}", room.name());
            return Err(e);
        }
        Ok(())
    }

    /// Decode a binary frame and apply each message in order.
    ///
    /// Messages decoded before a malformed one are still applied.
    pub async fn handle_frame(&self, session: &Arc<Session>, frame: &[u8]) -> Result<(), SyncError> {
        if session.is_aborted() {
            return Err(ConsistencyError::SessionAborted(session.id()).into());
        }
        let mut decoder = Decoder::new(frame);
        while let Some(message) = decoder.next_message().map_err(|e| {
            log::warn!("Session {}: dropping malformed frame: {e}", session.id());
            e
        })? {
            self.handle_message(session, message).await?;
        }
        Ok(())
    }

    pub async fn handle_message(&self, session: &Arc<Session>, message: Message) -> Result<(), SyncError> {
        match message {
            Message::Update {
                confirmation,
                room,
                payload,
            } => {
                self.publish(&room, session, confirmation, payload).await?;
            }
            Message::Subscribe {
                confirmation,
                entries,
            } => {
                // Resolve every position first: nothing for these rooms may
                // reach the client before SubscribeConfirm.
                let mut resolved = Vec::with_capacity(entries.len());
                for entry in entries {
                    let room = self.get_or_create_room(&entry.room).await?;
                    let entry = room.resolve(entry.offset, entry.epoch).await;
                    resolved.push((room, entry));
                }
                session
                    .send_subscribe_confirm(resolved.iter().map(|(_, e)| e.clone()).collect())
                    .await;
                for (room, entry) in &resolved {
                    self.subscribe_room(room, session, entry.offset, entry.epoch)
                        .await?;
                }
                session.confirm(confirmation).await?;
            }
            Message::Confirmation { number } => {
                session.client_confirmed(number).await;
            }
            other => {
                log::debug!(
                    "Session {} sent server-only message {:?}, ignoring",
                    session.id(),
                    other.message_type()
                );
            }
        }
        Ok(())
    }

    /// Drop every room and session and delete all room logs. Test-only reset.
    pub async fn clear_all(&self) -> Result<usize, SyncError> {
        let mut rooms = self.rooms.write().await;
        rooms.clear();
        self.sessions.clear();
        let removed = self.store.clear().await?;
        log::warn!("Cleared all rooms and sessions, removed {removed} logs");
        Ok(removed)
    }

    pub fn persistence_stats(&self) -> PersistenceStats {
        self.persistence.stats()
    }
}
