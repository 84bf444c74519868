//! Engine settings.
//!
//! A plain struct with defaults; the daemon/CLI layer that would populate it
//! from flags is outside this crate. `datapath` and `indexpath` may live on
//! different devices (fast disk for the index, large disk for the data) but
//! must never resolve to the same directory.

use std::path::PathBuf;

use cairn_types::RunMode;
use thiserror::Error;

/// Default data files root.
pub const DEFAULT_DATA_PATH: &str = "./zdb-data";

/// Default index files root.
pub const DEFAULT_INDEX_PATH: &str = "./zdb-index";

/// Default per-data-file rotation threshold (256 MB).
pub const DEFAULT_DATA_MAXSIZE: u64 = 256 * 1024 * 1024;

/// Hard cap on the rotation threshold: entry offsets are 32-bit.
pub const MAX_DATAFILE_SIZE: u64 = u32::MAX as u64;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("datasize must be within 1..={MAX_DATAFILE_SIZE} bytes, got {0}")]
    InvalidDataSize(u64),

    #[error("bucket bits must be within 1..=30, got {0}")]
    InvalidBucketBits(u8),

    #[error("data path and index path resolve to the same directory")]
    SamePaths,
}

/// Everything the engine recognizes at open time.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory for data files (one subdirectory per namespace).
    pub datapath: PathBuf,
    /// Root directory for index files; must differ from `datapath`.
    pub indexpath: PathBuf,
    /// Engine mode. `Mixed` lets each namespace choose at creation.
    pub mode: RunMode,
    /// Force fsync after every write.
    pub sync: bool,
    /// Seconds between forced fsyncs, 0 disables.
    pub synctime: u64,
    /// Per-data-file rotation threshold in bytes.
    pub datasize: u64,
    /// Default per-namespace quota in bytes, 0 means unlimited.
    pub maxsize: u64,
    /// External executable invoked on lifecycle events.
    pub hook: Option<PathBuf>,
    /// Number of bits of the shared bucket array (2^bits slots).
    pub bucket_bits: u8,
    /// Textual instance identifier handed to hooks, typically the listen
    /// address of the serving daemon.
    pub instance: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            datapath: PathBuf::from(DEFAULT_DATA_PATH),
            indexpath: PathBuf::from(DEFAULT_INDEX_PATH),
            mode: RunMode::Mixed,
            sync: false,
            synctime: 0,
            datasize: DEFAULT_DATA_MAXSIZE,
            maxsize: 0,
            hook: None,
            bucket_bits: cairn_storage::memory::DEFAULT_BUCKET_BITS,
            instance: None,
        }
    }
}

impl Settings {
    /// Range checks. Path validation happens at open time, after both
    /// directories exist and can be canonicalized.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.datasize == 0 || self.datasize > MAX_DATAFILE_SIZE {
            return Err(SettingsError::InvalidDataSize(self.datasize));
        }

        if self.bucket_bits == 0 || self.bucket_bits > 30 {
            return Err(SettingsError::InvalidBucketBits(self.bucket_bits));
        }

        Ok(())
    }
}
