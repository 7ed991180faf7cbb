//! One append-only file per room.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::protocol::RoomName;

/// Owner read/write for room files.
const FILE_MODE: u32 = 0o600;
/// Owner read/write/execute for the root directory.
const DIR_MODE: u32 = 0o700;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to create storage root {path:?}: {source}")]
    CreateRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("I/O error on log of room {room}: {source}")]
    Io {
        room: RoomName,
        #[source]
        source: io::Error,
    },
    #[error("failed to clear storage root {path:?}: {source}")]
    Clear {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Room log files under one root directory.
#[derive(Debug, Clone)]
pub struct RoomStore {
    root: PathBuf,
}

impl RoomStore {
    /// Open the store, creating the root directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        create_root(&root).map_err(|source| StorageError::CreateRoot {
            path: root.clone(),
            source,
        })?;
        log::debug!("Room store opened at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Log file of `room`.
    pub fn path(&self, room: &RoomName) -> PathBuf {
        self.root.join(room.as_str())
    }

    /// Durable length of `room`; zero if the room was never written.
    pub async fn durable_len(&self, room: &RoomName) -> Result<u64, StorageError> {
        match fs::metadata(self.path(room)).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(source) => Err(StorageError::Io {
                room: room.clone(),
                source,
            }),
        }
    }

    /// Read the durable bytes of `room` from `offset` to the end of the file.
    pub async fn read_from(&self, room: &RoomName, offset: u64) -> Result<Vec<u8>, StorageError> {
        let io_err = |source| StorageError::Io {
            room: room.clone(),
            source,
        };
        let mut file = match fs::File::open(self.path(room)).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(e)),
        };
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await.map_err(io_err)?;
        }
        let mut data = Vec::new();
        file.read_to_end(&mut data).await.map_err(io_err)?;
        Ok(data)
    }

    /// Append `data` to the log of `room` and sync it to disk.
    ///
    /// Returns the new durable length.
    pub async fn append(&self, room: &RoomName, data: &[u8]) -> Result<u64, StorageError> {
        let io_err = |source| StorageError::Io {
            room: room.clone(),
            source,
        };
        let mut options = OpenOptions::new();
        options.append(true).create(true);
        #[cfg(unix)]
        options.mode(FILE_MODE);

        let mut file = options.open(self.path(room)).await.map_err(io_err)?;
        file.write_all(data).await.map_err(io_err)?;
        file.sync_data().await.map_err(io_err)?;
        let len = file.metadata().await.map_err(io_err)?.len();
        log::trace!("Appended {} bytes to room {room}, durable length {len}", data.len());
        Ok(len)
    }

    /// Cut the log of `room` back to `len` bytes, discarding a torn tail.
    pub async fn truncate(&self, room: &RoomName, len: u64) -> Result<(), StorageError> {
        let io_err = |source| StorageError::Io {
            room: room.clone(),
            source,
        };
        let file = match OpenOptions::new().write(true).open(self.path(room)).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound && len == 0 => return Ok(()),
            Err(e) => return Err(io_err(e)),
        };
        if file.metadata().await.map_err(io_err)?.len() > len {
            log::warn!("Truncating log of room {room} back to {len} bytes");
            file.set_len(len).await.map_err(io_err)?;
            file.sync_data().await.map_err(io_err)?;
        }
        Ok(())
    }

    /// Delete every room log. Returns the number of files removed.
    pub async fn clear(&self) -> Result<usize, StorageError> {
        let clear_err = |source| StorageError::Clear {
            path: self.root.clone(),
            source,
        };
        let mut entries = fs::read_dir(&self.root).await.map_err(clear_err)?;
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await.map_err(clear_err)? {
            if entry.file_type().await.map_err(clear_err)?.is_file() {
                fs::remove_file(entry.path()).await.map_err(clear_err)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(unix)]
fn create_root(root: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(root)
}

#[cfg(not(unix))]
fn create_root(root: &Path) -> io::Result<()> {
    let _ = DIR_MODE;
    std::fs::create_dir_all(root)
}
