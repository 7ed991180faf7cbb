//! Durable storage for room logs.
//!
//! Layout:
//! ```text
//! <root>/            (0700)
//! ├── doc1           (0600)  append-only bytes of room "doc1"
//! ├── doc2           (0600)
//! └── ...
//! ```
//!
//! The file length is the authoritative durable offset of a room. Only the
//! persistence worker owning a room's shard appends to its file.

pub mod room_log;

pub use room_log::{RoomStore, StorageError};
