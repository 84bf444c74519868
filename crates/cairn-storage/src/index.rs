//! Append-only metadata log.
//!
//! Sibling of the data log: each namespace owns a directory of
//! `zdb-index-NNNNN` files mirroring the data entries, key inline, no
//! payload. The index is what gets replayed at load time to rebuild memory
//! state.
//!
//! # File Format
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ file header (27 bytes)                                   │
//! │   magic "IDX0" (4) version u32 (4)                       │
//! │   created u64 (8)  opened u64 (8)                        │
//! │   fileid u16 (2)   mode u8 (1)                           │
//! ├──────────────────────────────────────────────────────────┤
//! │ entry: keylen u8 (1)   offset u32 (4)  length u32 (4)    │
//! │        previous u32(4) flags u8 (1)   dataid u16 (2)     │
//! │        timestamp u32(4) crc u32 (4)                      │
//! │        parentid u16 (2) parentoff u32 (4)                │
//! │        key[keylen]                                       │
//! │ entry: ...                                               │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Writes are append with a single exception: flagging an existing entry
//! DELETED rewrites that entry's own bytes in place. The rewrite never goes
//! through the active append descriptor (`pwrite` on an `O_APPEND` file
//! ignores the offset); it always uses a fresh read-write descriptor.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use cairn_types::{EntryFlags, FileId, IndexMode, NamespaceId, SeqId};

use crate::memory::{KeyRecord, MemoryIndex};
use crate::seq::SeqMap;
use crate::{IoStats, LogFile, StorageError, SyncPolicy, rotated_filename};

/// Magic bytes identifying an index file.
pub const INDEX_MAGIC: [u8; 4] = *b"IDX0";

/// Current index file format version.
pub const INDEX_VERSION: u32 = 1;

/// Index file header size: magic(4) + version(4) + created(8) + opened(8) +
/// fileid(2) + mode(1).
pub const INDEX_HEADER_SIZE: usize = 27;

/// Fixed part of an index entry, before the inline key.
pub const INDEX_ITEM_SIZE: usize = 30;

/// Stride of one sequential-mode slot: fixed header plus the 4-byte id key.
pub const SEQ_SLOT_SIZE: usize = INDEX_ITEM_SIZE + SeqId::KEY_LENGTH;

/// Serialized cursor key size: keylen(1) + fileid(2) + length(4) +
/// idxoffset(4) + crc(4).
pub const CURSOR_KEY_SIZE: usize = 15;

fn index_filename(id: FileId) -> String {
    rotated_filename("zdb-index", id)
}

fn uninitialized() -> StorageError {
    StorageError::Io(io::Error::other("index log used before initialization"))
}

/// Byte offset of a sequential slot relative to the file start.
pub fn seq_slot_offset(relative: u32) -> u64 {
    INDEX_HEADER_SIZE as u64 + u64::from(relative) * SEQ_SLOT_SIZE as u64
}

// ============================================================================
// File header
// ============================================================================

/// The fixed header written at offset zero of every index file.
///
/// The namespace mode is recorded at creation time; loading a file whose
/// recorded mode differs from the configured one is refused to avoid data
/// loss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexFileHeader {
    pub version: u32,
    pub created: u64,
    pub opened: u64,
    pub file_id: FileId,
    pub mode: IndexMode,
}

impl IndexFileHeader {
    pub fn new(file_id: FileId, mode: IndexMode) -> Self {
        let now = cairn_types::epoch_seconds();
        Self {
            version: INDEX_VERSION,
            created: now,
            opened: now,
            file_id,
            mode,
        }
    }

    pub fn encode(&self) -> [u8; INDEX_HEADER_SIZE] {
        let mut buf = [0u8; INDEX_HEADER_SIZE];
        buf[0..4].copy_from_slice(&INDEX_MAGIC);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.created.to_le_bytes());
        buf[16..24].copy_from_slice(&self.opened.to_le_bytes());
        buf[24..26].copy_from_slice(&self.file_id.as_u16().to_le_bytes());
        buf[26] = self.mode.as_byte();
        buf
    }

    /// Validates magic and version but not the mode: mode checking needs
    /// the namespace's configuration, which the loader owns.
    pub fn decode(buf: &[u8], path: &Path) -> Result<(Self, u8), StorageError> {
        if buf.len() < INDEX_HEADER_SIZE {
            return Err(StorageError::HeaderTruncated {
                path: path.to_path_buf(),
            });
        }

        if buf[0..4] != INDEX_MAGIC {
            return Err(StorageError::InvalidMagic {
                path: path.to_path_buf(),
            });
        }

        let version = u32::from_le_bytes(buf[4..8].try_into().expect("slice is 4 bytes"));
        if version != INDEX_VERSION {
            return Err(StorageError::UnsupportedVersion {
                path: path.to_path_buf(),
                found: version,
                expected: INDEX_VERSION,
            });
        }

        let mode_byte = buf[26];
        let header = Self {
            version,
            created: u64::from_le_bytes(buf[8..16].try_into().expect("slice is 8 bytes")),
            opened: u64::from_le_bytes(buf[16..24].try_into().expect("slice is 8 bytes")),
            file_id: FileId::new(u16::from_le_bytes(
                buf[24..26].try_into().expect("slice is 2 bytes"),
            )),
            // fall back to the default; the caller decides on mode_byte
            mode: IndexMode::from_byte(mode_byte).unwrap_or_default(),
        };

        Ok((header, mode_byte))
    }
}

// ============================================================================
// Index entries
// ============================================================================

/// One on-disk index entry, key inline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexItem {
    pub key: Vec<u8>,
    /// Offset of the payload entry in its data file.
    pub offset: u32,
    /// Payload length on the data file.
    pub length: u32,
    /// Offset of the previously appended entry in this index file.
    pub previous: u32,
    pub flags: EntryFlags,
    pub data_id: FileId,
    pub timestamp: u32,
    /// CRC32 of the payload, mirrored from the data entry.
    pub crc: u32,
    /// Index file id of this key's previous version (history chain).
    pub parent_id: FileId,
    /// Index file offset of this key's previous version, zero when none.
    pub parent_off: u32,
}

impl IndexItem {
    pub fn disk_size(&self) -> usize {
        INDEX_ITEM_SIZE + self.key.len()
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.is_deleted()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.disk_size());
        buf.push(self.key.len() as u8);
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&self.length.to_le_bytes());
        buf.extend_from_slice(&self.previous.to_le_bytes());
        buf.push(self.flags.as_byte());
        buf.extend_from_slice(&self.data_id.as_u16().to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.crc.to_le_bytes());
        buf.extend_from_slice(&self.parent_id.as_u16().to_le_bytes());
        buf.extend_from_slice(&self.parent_off.to_le_bytes());
        buf.extend_from_slice(&self.key);
        buf
    }

    /// Decodes one entry from the head of `buf`, returning it and the bytes
    /// consumed. `None` means the buffer ends mid-entry.
    pub fn decode(buf: &[u8]) -> Option<(IndexItem, usize)> {
        if buf.len() < INDEX_ITEM_SIZE {
            return None;
        }

        let key_length = buf[0] as usize;
        let total = INDEX_ITEM_SIZE + key_length;
        if buf.len() < total {
            return None;
        }

        let item = IndexItem {
            key: buf[INDEX_ITEM_SIZE..total].to_vec(),
            offset: u32::from_le_bytes(buf[1..5].try_into().expect("slice is 4 bytes")),
            length: u32::from_le_bytes(buf[5..9].try_into().expect("slice is 4 bytes")),
            previous: u32::from_le_bytes(buf[9..13].try_into().expect("slice is 4 bytes")),
            flags: EntryFlags::from_byte(buf[13]),
            data_id: FileId::new(u16::from_le_bytes(
                buf[14..16].try_into().expect("slice is 2 bytes"),
            )),
            timestamp: u32::from_le_bytes(buf[16..20].try_into().expect("slice is 4 bytes")),
            crc: u32::from_le_bytes(buf[20..24].try_into().expect("slice is 4 bytes")),
            parent_id: FileId::new(u16::from_le_bytes(
                buf[24..26].try_into().expect("slice is 2 bytes"),
            )),
            parent_off: u32::from_le_bytes(buf[26..30].try_into().expect("slice is 4 bytes")),
        };

        Some((item, total))
    }
}

/// An index entry together with its position on the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedItem {
    pub item: IndexItem,
    pub file_id: FileId,
    pub offset: u32,
}

/// Opaque fixed-size cursor handed to clients for scan continuation.
///
/// The redundant fields (key length, payload length, CRC) are what makes the
/// cursor safe: deserialization re-reads the slot it points at and rejects
/// the cursor unless all of them match, so a crafted offset cannot reach
/// unrelated bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorKey {
    pub key_length: u8,
    pub file_id: FileId,
    pub length: u32,
    pub idx_offset: u32,
    pub crc: u32,
}

impl CursorKey {
    pub fn from_record(rec: &KeyRecord) -> Self {
        Self {
            key_length: rec.key.len() as u8,
            file_id: rec.index_id,
            length: rec.length,
            idx_offset: rec.idx_offset,
            crc: rec.crc,
        }
    }

    pub fn from_item(item: &IndexItem, file_id: FileId, idx_offset: u32) -> Self {
        Self {
            key_length: item.key.len() as u8,
            file_id,
            length: item.length,
            idx_offset,
            crc: item.crc,
        }
    }

    pub fn encode(&self) -> [u8; CURSOR_KEY_SIZE] {
        let mut buf = [0u8; CURSOR_KEY_SIZE];
        buf[0] = self.key_length;
        buf[1..3].copy_from_slice(&self.file_id.as_u16().to_le_bytes());
        buf[3..7].copy_from_slice(&self.length.to_le_bytes());
        buf[7..11].copy_from_slice(&self.idx_offset.to_le_bytes());
        buf[11..15].copy_from_slice(&self.crc.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, StorageError> {
        if buf.len() != CURSOR_KEY_SIZE {
            return Err(StorageError::InvalidCursor);
        }

        Ok(Self {
            key_length: buf[0],
            file_id: FileId::new(u16::from_le_bytes(
                buf[1..3].try_into().expect("slice is 2 bytes"),
            )),
            length: u32::from_le_bytes(buf[3..7].try_into().expect("slice is 4 bytes")),
            idx_offset: u32::from_le_bytes(buf[7..11].try_into().expect("slice is 4 bytes")),
            crc: u32::from_le_bytes(buf[11..15].try_into().expect("slice is 4 bytes")),
        })
    }
}

/// One write request against the index, mirroring a data insert that just
/// happened.
#[derive(Debug)]
pub struct IndexRequest<'a> {
    pub key: &'a [u8],
    pub data_offset: u32,
    pub length: u32,
    pub crc: u32,
    pub timestamp: u32,
    pub data_id: FileId,
}

/// Per-namespace index statistics, maintained by the write and replay paths
/// identically so a reload reproduces them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    /// Number of live (non-deleted) keys.
    pub entries: u64,
    /// Sum of payload lengths over live keys.
    pub datasize: u64,
    /// Approximate bytes of in-memory records.
    pub indexsize: u64,
}

// ============================================================================
// Index log
// ============================================================================

/// The metadata log of one namespace.
#[derive(Debug)]
pub struct IndexLog {
    pub(crate) dir: PathBuf,
    pub(crate) ns: NamespaceId,
    pub(crate) mode: IndexMode,
    pub(crate) file_id: FileId,
    pub(crate) file: Option<File>,
    /// Global monotonic entry counter; the next sequential id.
    pub(crate) next_entry: u64,
    /// File-local entry counter, reset on rotation and per-file replay.
    pub(crate) next_id: u32,
    /// Offset of the last appended entry. Kept across rotation so the first
    /// entry of a new file links back into the previous one.
    pub(crate) previous: u32,
    pub(crate) sync: SyncPolicy,
    pub(crate) read_only: bool,
    pub(crate) degraded: bool,
    pub(crate) loaded: bool,
    pub(crate) seqmap: Option<SeqMap>,
    pub(crate) stats: IndexStats,
    pub(crate) io: IoStats,
}

impl IndexLog {
    /// Builds the in-memory state without touching the filesystem; call
    /// [`IndexLog::load`](crate::loader) to populate it.
    pub fn init_lazy(dir: PathBuf, ns: NamespaceId, mode: IndexMode, sync: SyncPolicy) -> Self {
        Self {
            dir,
            ns,
            mode,
            file_id: FileId::FIRST,
            file: None,
            next_entry: 0,
            next_id: 0,
            previous: 0,
            sync,
            read_only: false,
            degraded: false,
            loaded: false,
            seqmap: (mode == IndexMode::Sequential).then(SeqMap::new),
            stats: IndexStats::default(),
            io: IoStats::default(),
        }
    }

    pub fn namespace(&self) -> NamespaceId {
        self.ns
    }

    pub fn mode(&self) -> IndexMode {
        self.mode
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn next_entry(&self) -> u64 {
        self.next_entry
    }

    pub fn next_id(&self) -> u32 {
        self.next_id
    }

    pub fn previous(&self) -> u32 {
        self.previous
    }

    pub fn stats(&self) -> IndexStats {
        self.stats
    }

    pub fn io_stats(&self) -> IoStats {
        self.io
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn path_for(&self, id: FileId) -> PathBuf {
        self.dir.join(index_filename(id))
    }

    pub fn active_path(&self) -> PathBuf {
        self.path_for(self.file_id)
    }

    pub(crate) fn active(&self) -> Result<&File, StorageError> {
        self.file.as_ref().ok_or_else(uninitialized)
    }

    /// Borrows the active descriptor or opens the requested older file
    /// read-only.
    pub(crate) fn grab(&self, id: FileId) -> Result<LogFile<'_>, StorageError> {
        if id == self.file_id {
            return Ok(LogFile::Active(self.active()?));
        }

        tracing::debug!(current = %self.file_id, requested = %id, "index: switching file");
        Ok(LogFile::Ephemeral(File::open(self.path_for(id))?))
    }

    /// Opens the active file for appending, read-only on a read-only
    /// filesystem.
    pub(crate) fn open_active(&mut self) -> Result<(), StorageError> {
        let path = self.active_path();

        let file = if self.read_only {
            File::open(&path)?
        } else {
            match OpenOptions::new()
                .read(true)
                .append(true)
                .create(true)
                .open(&path)
            {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::ReadOnlyFilesystem => {
                    self.read_only = true;
                    File::open(&path)?
                }
                Err(e) => return Err(e.into()),
            }
        };

        tracing::debug!(file = %path.display(), "index: active file opened");
        self.file = Some(file);
        Ok(())
    }

    /// Writes a fresh file header when the active file is still empty.
    /// The descriptor is in append mode, so the header lands at offset zero
    /// exactly because the file is empty.
    pub(crate) fn initialize_active_header(&mut self) -> Result<(), StorageError> {
        let encoded = IndexFileHeader::new(self.file_id, self.mode).encode();

        let empty = self.active()?.metadata()?.len() == 0;
        if empty {
            let mut file = self.active()?;
            file.write_all(&encoded)?;
            self.io.disk_write += INDEX_HEADER_SIZE as u64;
        }

        Ok(())
    }

    /// Offset at which the next entry will land in the active file.
    pub fn next_offset(&self) -> Result<u64, StorageError> {
        Ok(self.active()?.metadata()?.len())
    }

    /// Closes the active file and opens the next id, creating it with a
    /// fresh header. Called when the data file rotates, so the id pair stays
    /// in sync. `previous` is deliberately not reset: the first entry of the
    /// new file keeps the backward link into the old one.
    pub fn jump_next(&mut self) -> Result<FileId, StorageError> {
        let new_id = self.file_id.next().ok_or(StorageError::FileIdExhausted)?;
        tracing::debug!(from = %self.file_id, to = %new_id, "index: jumping to the next file");

        self.file = None;
        self.file_id = new_id;
        self.next_id = 0;

        self.open_active()?;
        self.initialize_active_header()?;

        if let Some(map) = &mut self.seqmap {
            map.push(self.next_entry as u32, new_id);
        }

        Ok(new_id)
    }

    // ========================================================================
    // Raw entry i/o
    // ========================================================================

    /// Reads one entry (fixed header plus inline key) from any index file.
    pub fn item_get_disk(
        &mut self,
        index_id: FileId,
        offset: u32,
    ) -> Result<IndexItem, StorageError> {
        match self.read_item(index_id, offset) {
            Ok(item) => {
                self.io.disk_read += item.disk_size() as u64;
                Ok(item)
            }
            Err(e) => {
                self.io.read_failed += 1;
                Err(e)
            }
        }
    }

    fn read_item(&self, index_id: FileId, offset: u32) -> Result<IndexItem, StorageError> {
        let file = self.grab(index_id)?;
        read_item_at(&file, offset)
    }

    /// Appends `item` to the active file, stamping its `previous` link, and
    /// returns the offset it was written at.
    pub(crate) fn append(&mut self, item: &mut IndexItem) -> Result<u32, StorageError> {
        let offset = self.next_offset()?;
        let offset = u32::try_from(offset).map_err(|_| StorageError::OffsetOverflow)?;

        item.previous = self.previous;
        let buf = item.encode();

        tracing::debug!(bytes = buf.len(), offset, "index: writing entry on disk");

        let mut file = match self.file.as_ref() {
            Some(file) => file,
            None => return Err(uninitialized()),
        };

        if let Err(e) = file.write_all(&buf) {
            self.io.write_failed += 1;
            tracing::warn!(error = %e, "index write failed");
            return Err(e.into());
        }

        self.io.disk_write += buf.len() as u64;
        self.sync.check(file)?;

        self.previous = offset;
        Ok(offset)
    }

    /// The only non-append write on the index: rewrites one known entry in
    /// place with the DELETED flag set. Bounded to that entry's own bytes.
    pub fn entry_delete_disk(
        &mut self,
        index_id: FileId,
        idx_offset: u32,
        key_length: u8,
    ) -> Result<(), StorageError> {
        let path = self.path_for(index_id);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        let total = INDEX_ITEM_SIZE + key_length as usize;
        let mut buf = vec![0u8; total];
        file.read_exact_at(&mut buf, u64::from(idx_offset))?;

        tracing::debug!(offset = idx_offset, bytes = total, "index: delete: overwriting key");

        let mut flags = EntryFlags::from_byte(buf[13]);
        flags.set_deleted();
        buf[13] = flags.as_byte();

        file.write_all_at(&buf, u64::from(idx_offset))?;
        self.io.disk_write += total as u64;
        self.sync.check(&file)?;

        Ok(())
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    /// Raw lookup of a key's current record. Tombstones are returned too;
    /// the deleted-flag check happens at the API layer.
    ///
    /// User-key mode resolves against the shared memory index; sequential
    /// mode computes the fixed slot and reads it from disk, no per-key
    /// memory involved.
    pub fn get(
        &mut self,
        mem: &MemoryIndex,
        key: &[u8],
    ) -> Result<Option<KeyRecord>, StorageError> {
        match self.mode {
            IndexMode::UserKey => Ok(mem.lookup(self.ns, key).cloned()),
            IndexMode::Sequential => self.get_sequential(key),
        }
    }

    fn get_sequential(&mut self, key: &[u8]) -> Result<Option<KeyRecord>, StorageError> {
        let Some(id) = SeqId::from_key(key) else {
            tracing::debug!(length = key.len(), "index: sequential get: invalid key length");
            return Ok(None);
        };

        let Some(mapping) = self.seqmap.as_ref().and_then(|m| m.resolve(id.as_u32())) else {
            return Ok(None);
        };

        let Some(relative) = id.as_u32().checked_sub(mapping.first) else {
            return Ok(None);
        };

        let Ok(offset) = u32::try_from(seq_slot_offset(relative)) else {
            return Ok(None);
        };

        let item = match self.item_get_disk(mapping.file, offset) {
            Ok(item) => item,
            // a slot past the end of the file is an unassigned id
            Err(StorageError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if item.key != key {
            tracing::debug!(id = %id, "index: sequential get: slot key mismatch");
            return Ok(None);
        }

        Ok(Some(KeyRecord {
            ns: self.ns,
            key: item.key,
            offset: item.offset,
            idx_offset: offset,
            length: item.length,
            flags: item.flags,
            data_id: item.data_id,
            index_id: mapping.file,
            crc: item.crc,
            timestamp: item.timestamp,
            parent_id: item.parent_id,
            parent_off: item.parent_off,
        }))
    }

    // ========================================================================
    // Set: insert or update
    // ========================================================================

    /// Applies one write to the index: insert when the key is unknown,
    /// update (with history chaining) when it exists. `existing` is the
    /// caller's pre-write lookup, required for sequential updates where the
    /// old slot position cannot be recovered from memory.
    pub fn set(
        &mut self,
        mem: &mut MemoryIndex,
        req: &IndexRequest<'_>,
        existing: Option<&KeyRecord>,
    ) -> Result<(), StorageError> {
        match self.mode {
            IndexMode::UserKey => self.set_userkey(mem, req),
            IndexMode::Sequential => self.set_sequential(req, existing),
        }
    }

    fn set_userkey(
        &mut self,
        mem: &mut MemoryIndex,
        req: &IndexRequest<'_>,
    ) -> Result<(), StorageError> {
        // any resident record counts, including a tombstone being revived:
        // both go through the update path so the history chain survives
        // deletion
        let old = mem.lookup(self.ns, req.key).map(|rec| {
            (
                rec.index_id,
                rec.idx_offset,
                rec.length,
                rec.flags,
                rec.key.len() as u8,
            )
        });

        match old {
            Some((old_index_id, old_idx_offset, old_length, old_flags, old_key_length)) => {
                tracing::debug!("index: set: updating existing entry");

                // flag the previous version on disk first, so replay sees it
                // as superseded even if the new append fails
                self.entry_delete_disk(old_index_id, old_idx_offset, old_key_length)?;

                let mut item = IndexItem {
                    key: req.key.to_vec(),
                    offset: req.data_offset,
                    length: req.length,
                    previous: 0,
                    flags: EntryFlags::empty(),
                    data_id: req.data_id,
                    timestamp: req.timestamp,
                    crc: req.crc,
                    parent_id: old_index_id,
                    parent_off: old_idx_offset,
                };
                let idx_offset = self.append(&mut item)?;

                if old_flags.is_deleted() {
                    self.stats.entries += 1;
                } else {
                    self.stats.datasize -= u64::from(old_length);
                }
                self.stats.datasize += u64::from(req.length);

                let rec = mem
                    .lookup_mut(self.ns, req.key)
                    .expect("record found just above");
                rec.parent_id = old_index_id;
                rec.parent_off = old_idx_offset;
                rec.offset = req.data_offset;
                rec.idx_offset = idx_offset;
                rec.length = req.length;
                rec.flags = EntryFlags::empty();
                rec.data_id = req.data_id;
                rec.index_id = self.file_id;
                rec.crc = req.crc;
                rec.timestamp = req.timestamp;
            }
            None => {
                tracing::debug!("index: set: inserting new entry");

                let mut item = IndexItem {
                    key: req.key.to_vec(),
                    offset: req.data_offset,
                    length: req.length,
                    previous: 0,
                    flags: EntryFlags::empty(),
                    data_id: req.data_id,
                    timestamp: req.timestamp,
                    crc: req.crc,
                    parent_id: FileId::FIRST,
                    parent_off: 0,
                };
                let idx_offset = self.append(&mut item)?;

                let rec = KeyRecord {
                    ns: self.ns,
                    key: req.key.to_vec(),
                    offset: req.data_offset,
                    idx_offset,
                    length: req.length,
                    flags: EntryFlags::empty(),
                    data_id: req.data_id,
                    index_id: self.file_id,
                    crc: req.crc,
                    timestamp: req.timestamp,
                    parent_id: FileId::FIRST,
                    parent_off: 0,
                };

                self.stats.entries += 1;
                self.stats.datasize += u64::from(req.length);
                self.stats.indexsize += rec.footprint();
                mem.insert(rec);

                self.next_entry += 1;
                self.next_id += 1;
            }
        }

        Ok(())
    }

    fn set_sequential(
        &mut self,
        req: &IndexRequest<'_>,
        existing: Option<&KeyRecord>,
    ) -> Result<(), StorageError> {
        match existing {
            None => {
                let mut item = IndexItem {
                    key: req.key.to_vec(),
                    offset: req.data_offset,
                    length: req.length,
                    previous: 0,
                    flags: EntryFlags::empty(),
                    data_id: req.data_id,
                    timestamp: req.timestamp,
                    crc: req.crc,
                    parent_id: FileId::FIRST,
                    parent_off: 0,
                };
                self.append(&mut item)?;

                self.stats.entries += 1;
                self.stats.datasize += u64::from(req.length);

                self.next_entry += 1;
                self.next_id += 1;
            }
            Some(old) => {
                tracing::debug!("index: update on sequential keys, duplicating key flagged");

                // append a copy of the old entry, already flagged DELETED,
                // so the forward replay still observes the superseded
                // version; it occupies the next slot position
                let mut shadow_flags = old.flags;
                shadow_flags.set_deleted();

                let mut duplicate = IndexItem {
                    key: old.key.clone(),
                    offset: old.offset,
                    length: old.length,
                    previous: 0,
                    flags: shadow_flags,
                    data_id: old.data_id,
                    timestamp: old.timestamp,
                    crc: old.crc,
                    parent_id: old.parent_id,
                    parent_off: old.parent_off,
                };
                let duplicate_offset = self.append(&mut duplicate)?;

                // rewrite the original slot with the new metadata, chained
                // to the duplicate just appended
                let item = IndexItem {
                    key: req.key.to_vec(),
                    offset: req.data_offset,
                    length: req.length,
                    previous: 0,
                    flags: EntryFlags::empty(),
                    data_id: req.data_id,
                    timestamp: req.timestamp,
                    crc: req.crc,
                    parent_id: self.file_id,
                    parent_off: duplicate_offset,
                };
                self.seq_overwrite(old.index_id, old.idx_offset, &item)?;

                self.stats.datasize -= u64::from(old.length);
                self.stats.datasize += u64::from(req.length);

                // skip the shadow slot for future inserts
                self.next_entry += 1;
                self.next_id += 1;
            }
        }

        Ok(())
    }

    /// Rewrites a sequential slot in place with new metadata.
    ///
    /// The slot's on-disk `previous` field is restored from the original
    /// bytes before writing: it still points at the entry physically before
    /// the slot, and overwriting it would corrupt the backward chain.
    fn seq_overwrite(
        &mut self,
        index_id: FileId,
        slot_offset: u32,
        item: &IndexItem,
    ) -> Result<(), StorageError> {
        let path = self.path_for(index_id);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        tracing::debug!(file = %index_id, offset = slot_offset, "index: sequential: overwriting");

        let original = read_item_at(&file, slot_offset)?;

        let mut patched = item.clone();
        patched.previous = original.previous;

        let buf = patched.encode();
        file.write_all_at(&buf, u64::from(slot_offset))?;
        self.io.disk_write += buf.len() as u64;
        self.sync.check(&file)?;

        Ok(())
    }

    // ========================================================================
    // Replay support
    // ========================================================================

    /// Applies one replayed entry to memory state exactly as the live write
    /// path would have, minus the disk writes. Statistics, counters and
    /// parent chains come out identical to the live outcome.
    pub(crate) fn set_memory(&mut self, mem: &mut MemoryIndex, item: &IndexItem, idx_offset: u32) {
        match self.mode {
            IndexMode::Sequential => {
                // every on-disk entry occupies one slot position, shadow
                // entries included
                self.next_entry += 1;
                self.next_id += 1;

                if !item.is_deleted() {
                    self.stats.entries += 1;
                    self.stats.datasize += u64::from(item.length);
                }
            }
            IndexMode::UserKey => {
                if let Some(rec) = mem.lookup_mut(self.ns, &item.key) {
                    if rec.is_deleted() {
                        self.stats.entries += 1;
                    } else {
                        self.stats.datasize -= u64::from(rec.length);
                    }
                    self.stats.datasize += u64::from(item.length);

                    rec.offset = item.offset;
                    rec.idx_offset = idx_offset;
                    rec.length = item.length;
                    rec.flags = item.flags;
                    rec.data_id = item.data_id;
                    rec.index_id = self.file_id;
                    rec.crc = item.crc;
                    rec.timestamp = item.timestamp;
                    rec.parent_id = item.parent_id;
                    rec.parent_off = item.parent_off;
                } else {
                    let rec = KeyRecord {
                        ns: self.ns,
                        key: item.key.clone(),
                        offset: item.offset,
                        idx_offset,
                        length: item.length,
                        flags: item.flags,
                        data_id: item.data_id,
                        index_id: self.file_id,
                        crc: item.crc,
                        timestamp: item.timestamp,
                        parent_id: item.parent_id,
                        parent_off: item.parent_off,
                    };

                    self.stats.entries += 1;
                    self.stats.datasize += u64::from(item.length);
                    self.stats.indexsize += rec.footprint();
                    mem.insert(rec);

                    // updates replace a record in place and advance nothing,
                    // matching the live write path
                    self.next_entry += 1;
                    self.next_id += 1;
                }
            }
        }
    }

    // ========================================================================
    // Delete
    // ========================================================================

    /// Deletes a key: flags its index entry on disk, then marks the memory
    /// side. The record itself stays resident as a tombstone so lookups can
    /// tell "deleted" from "never existed"; replaying the flagged entry
    /// produces the same state.
    pub fn entry_delete(
        &mut self,
        mem: &mut MemoryIndex,
        rec: &KeyRecord,
    ) -> Result<(), StorageError> {
        self.entry_delete_disk(rec.index_id, rec.idx_offset, rec.key.len() as u8)?;

        match self.mode {
            IndexMode::UserKey => self.delete_memory(mem, &rec.key),
            // no per-key memory in this mode, only statistics
            IndexMode::Sequential => {
                self.stats.entries = self.stats.entries.saturating_sub(1);
                self.stats.datasize = self.stats.datasize.saturating_sub(u64::from(rec.length));
            }
        }

        Ok(())
    }

    /// Memory half of a user-key deletion: decrements the live statistics
    /// and turns the record into a zero-length tombstone.
    ///
    /// Unconditional: live deletes are guarded by the caller's lookup, and
    /// the replay path inserts entries carrying their on-disk flags before
    /// deleting them, so the decrement must always pair with the insert.
    pub(crate) fn delete_memory(&mut self, mem: &mut MemoryIndex, key: &[u8]) {
        tracing::debug!("index: delete memory: flagging record");

        if let Some(rec) = mem.lookup_mut(self.ns, key) {
            self.stats.entries -= 1;
            self.stats.datasize -= u64::from(rec.length);
            rec.flags.set_deleted();
            rec.length = 0;
        }
    }

    // ========================================================================
    // Cursors
    // ========================================================================

    /// Resolves a client-provided cursor, re-reading the slot it points at
    /// and rejecting it unless key length, payload length and CRC all match.
    pub fn resolve_cursor(&mut self, cursor: &CursorKey) -> Result<LocatedItem, StorageError> {
        tracing::debug!(file = %cursor.file_id, offset = cursor.idx_offset,
                        "index: fetching cursor from disk");

        let item = match self.item_get_disk(cursor.file_id, cursor.idx_offset) {
            Ok(item) => item,
            Err(StorageError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(StorageError::InvalidCursor);
            }
            Err(e) => return Err(e),
        };

        if item.key.len() != cursor.key_length as usize
            || item.length != cursor.length
            || item.crc != cursor.crc
        {
            tracing::debug!("index: cursor rejected (fields mismatch)");
            return Err(StorageError::InvalidCursor);
        }

        Ok(LocatedItem {
            item,
            file_id: cursor.file_id,
            offset: cursor.idx_offset,
        })
    }

    /// Fsync of the active file, for the emergency path.
    pub fn emergency(&mut self) -> bool {
        if !self.loaded {
            return false;
        }

        if let Some(file) = &self.file {
            if let Err(e) = self.sync.sync(file) {
                tracing::warn!(error = %e, "index: emergency sync failed");
            }
        }
        true
    }
}

/// Reads one entry from an already-open index file: fixed header first,
/// then the inline key it announces.
pub(crate) fn read_item_at(file: &File, offset: u32) -> Result<IndexItem, StorageError> {
    let mut head = [0u8; INDEX_ITEM_SIZE];
    file.read_exact_at(&mut head, u64::from(offset))?;

    let key_length = head[0] as usize;
    let mut key = vec![0u8; key_length];
    file.read_exact_at(&mut key, u64::from(offset) + INDEX_ITEM_SIZE as u64)?;

    let mut buf = Vec::with_capacity(INDEX_ITEM_SIZE + key_length);
    buf.extend_from_slice(&head);
    buf.extend_from_slice(&key);

    let (item, _) = IndexItem::decode(&buf).expect("buffer sized for one entry");
    Ok(item)
}
