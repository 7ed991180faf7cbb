//! Per-session confirmation bookkeeping, one tracker per direction.
//!
//! ```text
//!            Update(n) ──────────────►
//!   server   ◄────────────── Confirmation(n)     ServerConfirmation
//!
//!            ◄────────────── Update(c) / Subscribe(c)
//!   server   Confirmation(watermark) ──────────►  ClientConfirmation
//! ```
//!
//! Client-submitted work completes out of order because persistence is
//! asynchronous and sharded. `ClientConfirmation` buffers early completions so
//! the client only ever sees a strictly increasing, gap-free sequence.

use std::collections::{BTreeSet, HashMap};

use crate::error::ConsistencyError;
use crate::protocol::RoomName;

/// Numbers attached to updates the server sends to a client.
#[derive(Debug, Default)]
pub struct ServerConfirmation {
    /// Next number to hand out
    next: u64,
    /// Next number we expect the client to confirm
    next_client: u64,
    /// Last confirmation number sent per room, not yet confirmed by the client
    rooms_changed: HashMap<RoomName, u64>,
}

impl ServerConfirmation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next confirmation number.
    pub fn create_confirmation(&mut self) -> u64 {
        let conf = self.next;
        self.next += 1;
        conf
    }

    /// Allocate a number for an update to `room` and remember the room as
    /// changed until the client confirms it.
    pub fn create_room_confirmation(&mut self, room: &RoomName) -> u64 {
        let conf = self.create_confirmation();
        self.rooms_changed.insert(room.clone(), conf);
        conf
    }

    /// The client confirmed it consumed and persisted everything up to `confirmed`.
    ///
    /// Returns whether the watermark moved. Stale confirmations are ignored.
    pub fn client_confirmed(&mut self, confirmed: u64) -> bool {
        if confirmed < self.next_client {
            return false;
        }
        self.next_client = confirmed + 1;
        self.rooms_changed.retain(|_, conf| *conf > confirmed);
        self.rooms_changed.shrink_to_fit();
        true
    }

    /// Whether `n` was ever handed out.
    pub fn is_issued(&self, n: u64) -> bool {
        n < self.next
    }

    pub fn next(&self) -> u64 {
        self.next
    }

    pub fn next_client(&self) -> u64 {
        self.next_client
    }

    /// Updates sent that the client has not confirmed yet.
    pub fn unconfirmed(&self) -> u64 {
        self.next - self.next_client
    }

    /// Rooms with updates not yet confirmed by the client.
    pub fn rooms_changed(&self) -> impl Iterator<Item = (&RoomName, u64)> {
        self.rooms_changed.iter().map(|(room, conf)| (room, *conf))
    }
}

/// Completion tracking for numbers assigned by the client.
#[derive(Debug, Default)]
pub struct ClientConfirmation {
    /// Watermark: next expected in-order completion
    next: u64,
    /// Completions above the watermark (never contains `next`)
    out_of_order: BTreeSet<u64>,
}

impl ClientConfirmation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the server finished the work numbered `n`.
    ///
    /// Returns `Ok(true)` when the watermark advanced; the caller must then send
    /// one cumulative `Confirmation(next - 1)`. Returns `Ok(false)` for an
    /// isolated out-of-order completion, which is buffered silently.
    pub fn server_confirmed(&mut self, n: u64) -> Result<bool, ConsistencyError> {
        if n < self.next {
            return Err(ConsistencyError::ConfirmationRegression {
                confirmed: n,
                watermark: self.next,
            });
        }
        if n > self.next {
            if !self.out_of_order.insert(n) {
                return Err(ConsistencyError::DuplicateCompletion(n));
            }
            return Ok(false);
        }

        self.next = n + 1;
        while self.out_of_order.remove(&self.next) {
            self.next += 1;
        }
        Ok(true)
    }

    /// Next expected completion.
    pub fn next(&self) -> u64 {
        self.next
    }

    /// Highest number covered by the watermark, if any.
    pub fn confirmed_through(&self) -> Option<u64> {
        self.next.checked_sub(1)
    }

    /// Number of completions waiting for an earlier gap to close.
    pub fn buffered(&self) -> usize {
        self.out_of_order.len()
    }
}
