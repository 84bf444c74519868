//! # cairn-types: Core types for cairn
//!
//! This crate contains the small shared types used across the cairn storage
//! engine:
//! - File identifiers ([`FileId`]) for the rotated data/index file pairs
//! - Sequential identifiers ([`SeqId`]) used as keys in sequential mode
//! - Namespace tags ([`NamespaceId`]) for records in the shared bucket index
//! - Running modes ([`IndexMode`], [`RunMode`]) and lock states ([`LockState`])
//! - On-disk entry flags ([`EntryFlags`])
//!
//! Everything here is `Copy` and cheap; serialization of these values into
//! the packed on-disk formats lives in `cairn-storage`.

use std::fmt::{self, Display};
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum key length in bytes. Key lengths are stored in a single byte on
/// disk, which bounds keys to 255 bytes.
pub const MAX_KEY_LENGTH: usize = 255;

/// Maximum accepted payload length (8 MB).
pub const MAX_PAYLOAD_LENGTH: usize = 8 * 1024 * 1024;

// ============================================================================
// File identifiers
// ============================================================================

/// Identifier of one data/index file pair within a namespace.
///
/// File ids are monotonic from zero: file `N` exists only if file `N - 1`
/// exists. The id is stored as a `u16` in the packed file headers, which caps
/// a namespace at 65536 file pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FileId(u16);

impl FileId {
    /// The first file of a namespace.
    pub const FIRST: FileId = FileId(0);

    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    pub fn as_u16(self) -> u16 {
        self.0
    }

    /// Returns the next file id, or `None` when the id space is exhausted.
    pub fn next(self) -> Option<FileId> {
        self.0.checked_add(1).map(FileId)
    }

    /// Returns the previous file id, or `None` when called on file zero.
    pub fn previous(self) -> Option<FileId> {
        self.0.checked_sub(1).map(FileId)
    }
}

impl Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for FileId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<FileId> for u16 {
    fn from(id: FileId) -> Self {
        id.0
    }
}

// ============================================================================
// Sequential identifiers
// ============================================================================

/// Server-assigned key in sequential mode.
///
/// The id is the key: its four little-endian bytes are what gets stored
/// inline in the data and index entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SeqId(u32);

impl SeqId {
    /// Byte width of a sequential key on disk.
    pub const KEY_LENGTH: usize = 4;

    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Parses a sequential id from user-supplied key bytes.
    ///
    /// Returns `None` unless the key is exactly four bytes.
    pub fn from_key(key: &[u8]) -> Option<SeqId> {
        let bytes: [u8; Self::KEY_LENGTH] = key.try_into().ok()?;
        Some(SeqId(u32::from_le_bytes(bytes)))
    }

    /// The inline key representation of this id.
    pub fn to_key(self) -> [u8; Self::KEY_LENGTH] {
        self.0.to_le_bytes()
    }
}

impl Display for SeqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SeqId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<SeqId> for u32 {
    fn from(id: SeqId) -> Self {
        id.0
    }
}

// ============================================================================
// Namespace tags
// ============================================================================

/// Identity tag of a namespace.
///
/// The in-memory bucket index is shared by all namespaces of an engine, so
/// every record carries the tag of its owner and lookups compare it before
/// comparing key bytes. The tag is never reused while the engine is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NamespaceId(u32);

impl NamespaceId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl Display for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Modes
// ============================================================================

/// Operating mode of a namespace's index, recorded in every index file
/// header at creation time.
///
/// Mixing modes on existing files is refused at load time to avoid data
/// loss, so this value is effectively immutable once a namespace has been
/// written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexMode {
    /// Keys are user-supplied byte strings (1..=255 bytes).
    #[default]
    UserKey,
    /// Keys are server-assigned monotonic `u32` ids.
    Sequential,
}

impl IndexMode {
    pub fn as_byte(self) -> u8 {
        match self {
            IndexMode::UserKey => 0,
            IndexMode::Sequential => 1,
        }
    }

    pub fn from_byte(byte: u8) -> Option<IndexMode> {
        match byte {
            0 => Some(IndexMode::UserKey),
            1 => Some(IndexMode::Sequential),
            _ => None,
        }
    }
}

impl Display for IndexMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexMode::UserKey => write!(f, "userkey"),
            IndexMode::Sequential => write!(f, "sequential"),
        }
    }
}

/// Engine-level mode setting.
///
/// `Mixed` lets each namespace pick its own [`IndexMode`] at creation time;
/// the other two force every namespace into a single mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    #[default]
    UserKey,
    Sequential,
    Mixed,
}

impl RunMode {
    /// The index mode a new namespace gets by default under this setting.
    pub fn default_index_mode(self) -> IndexMode {
        match self {
            RunMode::Sequential => IndexMode::Sequential,
            RunMode::UserKey | RunMode::Mixed => IndexMode::UserKey,
        }
    }

    /// Whether namespaces may choose a mode different from the default.
    pub fn allows(self, mode: IndexMode) -> bool {
        match self {
            RunMode::Mixed => true,
            RunMode::UserKey => mode == IndexMode::UserKey,
            RunMode::Sequential => mode == IndexMode::Sequential,
        }
    }
}

// ============================================================================
// Lock states
// ============================================================================

/// Administrative lock state of a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockState {
    /// Normal operation.
    #[default]
    Unlocked,
    /// Reads allowed, writes denied (maintenance).
    ReadOnly,
    /// All access denied.
    Frozen,
}

// ============================================================================
// Entry flags
// ============================================================================

/// Per-entry flag byte shared by the data and index formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryFlags(u8);

impl EntryFlags {
    /// Entry is a tombstone: the key was deleted.
    pub const DELETED: u8 = 1;
    /// Payload was truncated by offline compaction. The engine never sets
    /// this flag itself, it only preserves it.
    pub const TRUNCATED: u8 = 1 << 1;

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn deleted() -> Self {
        Self(Self::DELETED)
    }

    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    pub fn as_byte(self) -> u8 {
        self.0
    }

    pub fn is_deleted(self) -> bool {
        self.0 & Self::DELETED != 0
    }

    pub fn is_truncated(self) -> bool {
        self.0 & Self::TRUNCATED != 0
    }

    pub fn set_deleted(&mut self) {
        self.0 |= Self::DELETED;
    }
}

// ============================================================================
// Time
// ============================================================================

/// Wall-clock seconds since the unix epoch.
///
/// Entry timestamps are stored as `u32` on disk; file headers use `u64`.
pub fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// [`epoch_seconds`] narrowed to the on-disk entry timestamp width.
pub fn entry_timestamp() -> u32 {
    epoch_seconds() as u32
}
