//! # logos-sync: Durable room log synchronization for Logos
//!
//! Clients append opaque byte payloads (CRDT update fragments) to named
//! append-only rooms, receive every other client's appends in order, and
//! resume from any byte offset after a disconnect. Producers never wait on
//! disk: appends are acknowledged optimistically and confirmed once durable.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  binary frames   ┌──────────┐      ┌────────────┐
//! │  Client A  │ ◄──────────────► │ Session  │ ───► │    Room    │──► live Update to B
//! └────────────┘    (WebSocket)   └──────────┘      └─────┬──────┘
//!                                      ▲                  │ register once per dirty period
//!                                      │                  ▼
//!                                      │         ┌──────────────────┐
//!                                      └──────── │ PersistenceQueue │──► RoomStore (fsync)
//!                         Confirmation /         └──────────────────┘
//!                         ConfirmedByHost
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Varint wire codec and message types
//! - [`confirmation`]: Server→client and client→server acknowledgment tracking
//! - [`connection`]: Outbound connection capability and lifecycle
//! - [`session`]: Client identity spanning reconnects
//! - [`room`]: Per-room replication state machine
//! - [`persistence`]: Sharded durable commit and catch-up replay
//! - [`storage`]: One append-only log file per room
//! - [`registry`]: Process-wide rooms and sessions
//! - [`server`]: WebSocket transport

pub mod confirmation;
pub mod connection;
pub mod error;
pub mod persistence;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use confirmation::{ClientConfirmation, ServerConfirmation};
pub use connection::{ChannelConnection, Connection, ConnectionError, ConnectionId, ConnectionState};
pub use error::{ConsistencyError, SyncError};
pub use persistence::{PersistenceConfig, PersistenceQueue, PersistenceStats};
pub use protocol::{Decoder, Epoch, Message, MessageType, ProtocolError, RoomName, SubscriptionEntry};
pub use registry::{Registry, SessionTable};
pub use room::{AppendOutcome, Room, SubscribeOutcome, SubscribeStatus};
pub use server::{ServerConfig, ServerStats, SyncServer, SESSION_HEADER};
pub use session::{ConfirmationSnapshot, Session, SessionId};
pub use storage::{RoomStore, StorageError};
