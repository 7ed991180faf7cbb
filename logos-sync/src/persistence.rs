//! Sharded persistence queue: the only path from memory to disk.
//!
//! ```text
//!   Room::append ──┐                       ┌──► catch-up replay to pending subscribers
//!                  ├─► shard[hash(room)] ──┤
//!   Room::subscribe┘   (one marker per     └──► append + fsync ──► Confirmation / ConfirmedByHost
//!                       dirty room)
//! ```
//!
//! Each shard is a bounded channel drained by one worker task, so all commits
//! of a room are serialized. The worker takes the room lock only to detach
//! pending work and to publish results; the file append runs unlocked, which
//! keeps appends and live broadcasts flowing while a commit is in progress.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::SyncError;
use crate::protocol::RoomName;
use crate::registry::SessionTable;
use crate::room::{PendingSubscription, PendingWrite, Room, RoomState};
use crate::storage::{RoomStore, StorageError};

/// Persistence configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Root directory for room logs
    pub dir: PathBuf,
    /// Bounded capacity of each shard's queue
    pub queue_depth: usize,
    /// Number of independent workers
    pub shards: usize,
    /// Wait before draining a marker so bursts share one commit
    pub coalesce_delay: Duration,
    /// Extra attempts after a failed commit or catch-up read
    pub commit_retries: u32,
    /// Base delay between attempts, multiplied by the attempt number
    pub retry_backoff: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logos_sync_data"),
            queue_depth: 1000,
            shards: 1,
            coalesce_delay: Duration::ZERO,
            commit_retries: 3,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

impl PersistenceConfig {
    /// Small queue and fast retries for tests.
    pub fn for_testing(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            queue_depth: 64,
            shards: 2,
            coalesce_delay: Duration::ZERO,
            commit_retries: 1,
            retry_backoff: Duration::from_millis(5),
        }
    }
}

/// Persistence statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistenceStats {
    /// Successful commits
    pub commits: u64,
    pub bytes_committed: u64,
    /// Subscribers served by catch-up replay
    pub catch_ups: u64,
    /// Commits that exhausted their retries
    pub failed_commits: u64,
}

/// Lock-free counters shared by all workers.
#[derive(Default)]
struct AtomicPersistenceStats {
    commits: AtomicU64,
    bytes_committed: AtomicU64,
    catch_ups: AtomicU64,
    failed_commits: AtomicU64,
}

impl AtomicPersistenceStats {
    fn snapshot(&self) -> PersistenceStats {
        PersistenceStats {
            commits: self.commits.load(Ordering::Relaxed),
            bytes_committed: self.bytes_committed.load(Ordering::Relaxed),
            catch_ups: self.catch_ups.load(Ordering::Relaxed),
            failed_commits: self.failed_commits.load(Ordering::Relaxed),
        }
    }
}

/// Handle to the persistence workers.
///
/// Workers exit once the queue is dropped and their channels drain.
pub struct PersistenceQueue {
    shards: Vec<mpsc::Sender<Arc<Room>>>,
    stats: Arc<AtomicPersistenceStats>,
}

impl PersistenceQueue {
    /// Spawn one worker per shard. Must be called inside a tokio runtime.
    pub fn start(
        config: &PersistenceConfig,
        store: Arc<RoomStore>,
        sessions: Arc<SessionTable>,
    ) -> Self {
        let stats = Arc::new(AtomicPersistenceStats::default());
        let shard_count = config.shards.max(1);
        let mut shards = Vec::with_capacity(shard_count);

        for shard in 0..shard_count {
            let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
            let worker = ShardWorker {
                shard,
                store: store.clone(),
                sessions: sessions.clone(),
                stats: stats.clone(),
                coalesce_delay: config.coalesce_delay,
                retries: config.commit_retries,
                backoff: config.retry_backoff,
            };
            tokio::spawn(worker.run(rx));
            shards.push(tx);
        }

        log::info!(
            "Persistence started: {shard_count} shards, queue depth {}",
            config.queue_depth
        );
        Self { shards, stats }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard owning `room`. Stable for the life of the process.
    pub fn shard_for(&self, room: &RoomName) -> usize {
        let mut hasher = DefaultHasher::new();
        room.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Enqueue a dirty room. Waits while the shard's queue is full.
    pub async fn register(&self, room: &Arc<Room>) -> Result<(), SyncError> {
        let shard = self.shard_for(room.name());
        self.shards[shard]
            .send(room.clone())
            .await
            .map_err(|_| SyncError::QueueClosed)
    }

    pub fn stats(&self) -> PersistenceStats {
        self.stats.snapshot()
    }
}

struct ShardWorker {
    shard: usize,
    store: Arc<RoomStore>,
    sessions: Arc<SessionTable>,
    stats: Arc<AtomicPersistenceStats>,
    coalesce_delay: Duration,
    retries: u32,
    backoff: Duration,
}

impl ShardWorker {
    async fn run(self, mut rx: mpsc::Receiver<Arc<Room>>) {
        log::debug!("Persistence shard {} running", self.shard);
        while let Some(room) = rx.recv().await {
            if !self.coalesce_delay.is_zero() {
                tokio::time::sleep(self.coalesce_delay).await;
            }
            self.process(&room).await;
        }
        log::debug!("Persistence shard {} stopped", self.shard);
    }

    async fn process(&self, room: &Arc<Room>) {
        let writes = {
            let mut state = room.lock().await;
            let writes = std::mem::take(&mut state.pending_writes);
            let subs = std::mem::take(&mut state.pending_subs);
            state.registered = false;
            state.prune_detached(room.name());

            for sub in subs {
                if sub.session.is_detached() || state.has_subscriber(sub.session.id()) {
                    continue;
                }
                match self.catch_up(room, &state, &writes, &sub).await {
                    Ok(()) => state.subscribers.push(sub.session),
                    Err(e) => {
                        log::error!(
                            "Catch-up of {} in room {} failed: {e}",
                            sub.session.id(),
                            room.name()
                        );
                        state.pending_subs.push(sub);
                        state.degraded = true;
                    }
                }
            }
            writes
        };

        if !writes.is_empty() {
            self.commit(room, writes).await;
        }
    }

    /// Replay everything `sub` is missing: durable bytes from disk, then
    /// pending bytes other sessions wrote.
    async fn catch_up(
        &self,
        room: &Room,
        state: &RoomState,
        writes: &[PendingWrite],
        sub: &PendingSubscription,
    ) -> Result<(), StorageError> {
        let name = room.name();
        let durable = state.durable_offset;

        let mut data = if sub.offset < durable {
            let mut bytes = self
                .with_retries(name, move || self.store.read_from(name, sub.offset))
                .await?;
            bytes.truncate((durable - sub.offset) as usize);
            bytes
        } else {
            Vec::new()
        };

        let mut position = durable;
        for write in writes {
            let end = position + write.payload.len() as u64;
            if end > sub.offset && write.session.id() != sub.session.id() {
                let skip = sub.offset.saturating_sub(position) as usize;
                data.extend_from_slice(&write.payload[skip..]);
            }
            position = end;
        }

        log::debug!(
            "Room {name}: replaying {} bytes to {} from offset {}",
            data.len(),
            sub.session.id(),
            sub.offset
        );
        sub.session.send_update(name, &data).await;
        sub.session.send_confirmed_by_host(name, durable).await;
        self.stats.catch_ups.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn commit(&self, room: &Arc<Room>, writes: Vec<PendingWrite>) {
        let name = room.name();
        let expected = room.durable_offset().await;
        let data: Vec<u8> = writes.iter().flat_map(|w| w.payload.iter().copied()).collect();
        let bytes = &data;

        let result = self
            .with_retries(name, move || async move {
                // Roll back a tail left by an earlier failed attempt.
                self.store.truncate(name, expected).await?;
                self.store.append(name, bytes).await
            })
            .await;

        match result {
            Ok(len) => {
                let durable = expected + data.len() as u64;
                if len != durable {
                    log::warn!("Room {name}: log holds {len} bytes, expected {durable}");
                }
                let subscribers = {
                    let mut state = room.lock().await;
                    state.durable_offset = durable;
                    state.degraded = false;
                    state.subscribers.clone()
                };
                self.stats.commits.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .bytes_committed
                    .fetch_add(data.len() as u64, Ordering::Relaxed);

                for write in &writes {
                    if let Err(e) = write.session.confirm_write(write.confirmation).await {
                        log::error!(
                            "Consistency violation confirming write {} of {}: {e}",
                            write.confirmation,
                            write.session.id()
                        );
                        write.session.abort(&e).await;
                    }
                }
                for write in &writes {
                    if write.session.is_idle() {
                        self.sessions.remove_if_idle(write.session.id());
                    }
                }
                for subscriber in &subscribers {
                    subscriber.send_confirmed_by_host(name, durable).await;
                }
                log::trace!(
                    "Room {name}: committed {} writes, durable offset {durable}",
                    writes.len()
                );
            }
            Err(e) => {
                log::error!(
                    "Room {name}: commit of {} bytes failed, keeping writes pending: {e}",
                    data.len()
                );
                self.stats.failed_commits.fetch_add(1, Ordering::Relaxed);
                let mut state = room.lock().await;
                let newer = std::mem::replace(&mut state.pending_writes, writes);
                state.pending_writes.extend(newer);
                state.degraded = true;
            }
        }
    }

    async fn with_retries<T, F, Fut>(&self, room: &RoomName, mut op: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, StorageError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    log::warn!("Room {room}: I/O failed (attempt {attempt}): {e}");
                    tokio::time::sleep(self.backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
