//! # cairn-storage: Append-only data/index log storage
//!
//! This crate implements the on-disk core of the cairn engine:
//! - [`data`]: the append-only payload log (`zdb-data-NNNNN` files)
//! - [`index`]: the append-only metadata log (`zdb-index-NNNNN` files)
//! - [`memory`]: the in-memory bucket index for user-key lookups
//! - [`seq`]: the id-to-file mapping used by sequential mode
//! - [`loader`]: crash-safe replay of index files into memory state
//! - [`scan`]: forward/backward cursors over the index log
//! - [`crc`]: payload checksums and the bucket hash
//! - [`fs`]: directory plumbing and the per-directory instance lock
//!
//! Each namespace owns one [`data::DataLog`] and one [`index::IndexLog`];
//! the [`memory::MemoryIndex`] is shared by every namespace of an engine,
//! with records tagged by their owning namespace.
//!
//! All on-disk integers are little-endian and all structures are packed.
//! The format is not supported on big-endian hardware.

use std::fs::File;
use std::io;
use std::ops::Deref;
use std::path::PathBuf;

use cairn_types::{FileId, IndexMode, epoch_seconds};
use thiserror::Error;

pub mod crc;
pub mod data;
pub mod fs;
pub mod index;
pub mod loader;
pub mod memory;
pub mod scan;
pub mod seq;

pub use data::{DataLog, DataRequest};
pub use index::{CursorKey, IndexItem, IndexLog, IndexRequest, IndexStats, LocatedItem};
pub use memory::{KeyRecord, MemoryIndex};
pub use scan::ScanOutcome;


/// Errors produced by the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("{path}: invalid header, wrong magic")]
    InvalidMagic { path: PathBuf },

    #[error("{path}: unsupported version {found} (supported: {expected})")]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    #[error("{path}: header corrupted or incomplete")]
    HeaderTruncated { path: PathBuf },

    #[error("{path}: created in another mode ({recorded}) than running mode ({configured})")]
    ModeMismatch {
        path: PathBuf,
        recorded: u8,
        configured: IndexMode,
    },

    #[error("{path}: no index found and read-only filesystem")]
    ReadOnlyNoIndex { path: PathBuf },

    #[error("an instance is already using {path}")]
    Locked { path: PathBuf },

    #[error("file id space exhausted")]
    FileIdExhausted,

    #[error("active file exceeds the addressable offset range")]
    OffsetOverflow,

    #[error("invalid cursor key requested (fields mismatch)")]
    InvalidCursor,
}

/// I/O counters kept per log, aggregated by the engine into instance-wide
/// statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct IoStats {
    pub disk_read: u64,
    pub disk_write: u64,
    pub read_failed: u64,
    pub write_failed: u64,
}

impl IoStats {
    /// Folds another counter set into this one.
    pub fn merge(&mut self, other: IoStats) {
        self.disk_read += other.disk_read;
        self.disk_write += other.disk_write;
        self.read_failed += other.read_failed;
        self.write_failed += other.write_failed;
    }
}

/// The two fsync switches shared by the data and index logs.
///
/// `force` syncs after every write; `seconds` syncs on the first write
/// happening more than that many seconds after the previous sync (0
/// disables). The check runs after payload writes, not after every header
/// write.
#[derive(Debug)]
pub struct SyncPolicy {
    force: bool,
    seconds: u64,
    pub(crate) last: u64,
}

impl SyncPolicy {
    pub fn new(force: bool, seconds: u64) -> Self {
        Self {
            force,
            seconds,
            last: 0,
        }
    }

    /// Applies the sync switches to `file` after a write.
    pub fn check(&mut self, file: &File) -> io::Result<()> {
        if self.force {
            return self.sync(file);
        }

        if self.seconds == 0 {
            return Ok(());
        }

        if epoch_seconds().saturating_sub(self.last) > self.seconds {
            tracing::debug!("last sync expired, forcing sync");
            return self.sync(file);
        }

        Ok(())
    }

    /// Unconditional fsync, used by the emergency path.
    pub fn sync(&mut self, file: &File) -> io::Result<()> {
        file.sync_all()?;
        self.last = epoch_seconds();
        Ok(())
    }
}

/// A borrowed or ephemeral file handle for one rotated file.
///
/// Lookups targeting the currently active file reuse its long-lived
/// descriptor; older files are opened read-only for the duration of one
/// call and closed on drop.
pub enum LogFile<'a> {
    Active(&'a File),
    Ephemeral(File),
}

impl Deref for LogFile<'_> {
    type Target = File;

    fn deref(&self) -> &File {
        match self {
            LogFile::Active(file) => file,
            LogFile::Ephemeral(file) => file,
        }
    }
}

/// Zero-padded rotated file name, shared shape of both logs.
pub(crate) fn rotated_filename(prefix: &str, id: FileId) -> String {
    format!("{prefix}-{:05}", id.as_u16())
}
