//! Append-only payload log.
//!
//! Each namespace owns a directory of `zdb-data-NNNNN` files. Writes are
//! strictly append; deletion appends a zero-payload entry flagged DELETED so
//! that the index can always be rebuilt from data files alone.
//!
//! # File Format
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ file header (26 bytes)                                   │
//! │   magic "DAT0" (4) version u32 (4)                       │
//! │   created u64 (8)  opened u64 (8)  fileid u16 (2)        │
//! ├──────────────────────────────────────────────────────────┤
//! │ entry: keylen u8 (1) datalen u32 (4) previous u32 (4)    │
//! │        crc u32 (4)   flags u8 (1)   timestamp u32 (4)    │
//! │        key[keylen]   payload[datalen]                    │
//! │ entry: ...                                               │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers little-endian, no padding.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use cairn_types::{EntryFlags, FileId, epoch_seconds};

use crate::{IoStats, LogFile, StorageError, SyncPolicy, crc, rotated_filename};

/// Magic bytes identifying a data file.
pub const DATA_MAGIC: [u8; 4] = *b"DAT0";

/// Current data file format version.
pub const DATA_VERSION: u32 = 1;

/// Data file header size: magic(4) + version(4) + created(8) + opened(8) +
/// fileid(2).
pub const DATA_HEADER_SIZE: usize = 26;

/// Fixed part of an entry: keylen(1) + datalen(4) + previous(4) + crc(4) +
/// flags(1) + timestamp(4).
pub const DATA_ENTRY_HEADER_SIZE: usize = 18;

fn data_filename(id: FileId) -> String {
    rotated_filename("zdb-data", id)
}

fn uninitialized() -> StorageError {
    StorageError::Io(io::Error::other("data log used before initialization"))
}

// ============================================================================
// File header
// ============================================================================

/// The fixed header written at offset zero of every data file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFileHeader {
    pub version: u32,
    pub created: u64,
    pub opened: u64,
    pub file_id: FileId,
}

impl DataFileHeader {
    pub fn new(file_id: FileId) -> Self {
        let now = epoch_seconds();
        Self {
            version: DATA_VERSION,
            created: now,
            opened: now,
            file_id,
        }
    }

    pub fn encode(&self) -> [u8; DATA_HEADER_SIZE] {
        let mut buf = [0u8; DATA_HEADER_SIZE];
        buf[0..4].copy_from_slice(&DATA_MAGIC);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.created.to_le_bytes());
        buf[16..24].copy_from_slice(&self.opened.to_le_bytes());
        buf[24..26].copy_from_slice(&self.file_id.as_u16().to_le_bytes());
        buf
    }

    /// Validates magic and version; `path` is only used for error context.
    pub fn decode(buf: &[u8], path: &Path) -> Result<Self, StorageError> {
        if buf.len() < DATA_HEADER_SIZE {
            return Err(StorageError::HeaderTruncated {
                path: path.to_path_buf(),
            });
        }

        if buf[0..4] != DATA_MAGIC {
            return Err(StorageError::InvalidMagic {
                path: path.to_path_buf(),
            });
        }

        let version = u32::from_le_bytes(buf[4..8].try_into().expect("slice is 4 bytes"));
        if version != DATA_VERSION {
            return Err(StorageError::UnsupportedVersion {
                path: path.to_path_buf(),
                found: version,
                expected: DATA_VERSION,
            });
        }

        Ok(Self {
            version,
            created: u64::from_le_bytes(buf[8..16].try_into().expect("slice is 8 bytes")),
            opened: u64::from_le_bytes(buf[16..24].try_into().expect("slice is 8 bytes")),
            file_id: FileId::new(u16::from_le_bytes(
                buf[24..26].try_into().expect("slice is 2 bytes"),
            )),
        })
    }
}

// ============================================================================
// Entry header
// ============================================================================

/// The fixed header preceding every data entry's key and payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataEntryHeader {
    pub key_length: u8,
    pub data_length: u32,
    pub previous: u32,
    pub crc: u32,
    pub flags: EntryFlags,
    pub timestamp: u32,
}

impl DataEntryHeader {
    pub fn encode(&self) -> [u8; DATA_ENTRY_HEADER_SIZE] {
        let mut buf = [0u8; DATA_ENTRY_HEADER_SIZE];
        buf[0] = self.key_length;
        buf[1..5].copy_from_slice(&self.data_length.to_le_bytes());
        buf[5..9].copy_from_slice(&self.previous.to_le_bytes());
        buf[9..13].copy_from_slice(&self.crc.to_le_bytes());
        buf[13] = self.flags.as_byte();
        buf[14..18].copy_from_slice(&self.timestamp.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; DATA_ENTRY_HEADER_SIZE]) -> Self {
        Self {
            key_length: buf[0],
            data_length: u32::from_le_bytes(buf[1..5].try_into().expect("slice is 4 bytes")),
            previous: u32::from_le_bytes(buf[5..9].try_into().expect("slice is 4 bytes")),
            crc: u32::from_le_bytes(buf[9..13].try_into().expect("slice is 4 bytes")),
            flags: EntryFlags::from_byte(buf[13]),
            timestamp: u32::from_le_bytes(buf[14..18].try_into().expect("slice is 4 bytes")),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.is_deleted()
    }
}

/// One insert request against the data log.
///
/// The CRC is supplied by the caller (the API layer computes it once and
/// mirrors it into the index entry).
#[derive(Debug)]
pub struct DataRequest<'a> {
    pub payload: &'a [u8],
    pub key: &'a [u8],
    pub flags: EntryFlags,
    pub crc: u32,
    pub timestamp: u32,
}

// ============================================================================
// Data log
// ============================================================================

/// The payload log of one namespace.
///
/// Holds the long-lived descriptor of the currently active file; reads into
/// older files open an ephemeral read-only descriptor per call.
#[derive(Debug)]
pub struct DataLog {
    dir: PathBuf,
    file_id: FileId,
    file: Option<File>,
    /// File-local offset of the last inserted entry. Deliberately kept
    /// across rotation: the first entry of a new file stores the previous
    /// file's last offset, which lets the backward scan cross file
    /// boundaries.
    previous: u32,
    read_only: bool,
    sync: SyncPolicy,
    stats: IoStats,
}

impl DataLog {
    /// Builds the in-memory state without touching the filesystem.
    pub fn init_lazy(dir: PathBuf, file_id: FileId, sync: SyncPolicy) -> Self {
        Self {
            dir,
            file_id,
            file: None,
            previous: 0,
            read_only: false,
            sync,
            stats: IoStats::default(),
        }
    }

    /// Creates the active file if needed and opens it for appending.
    pub fn init(dir: PathBuf, file_id: FileId, sync: SyncPolicy) -> Result<Self, StorageError> {
        let mut log = Self::init_lazy(dir, file_id, sync);
        log.initialize_file()?;
        log.open_active()?;
        Ok(log)
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn previous(&self) -> u32 {
        self.previous
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn stats(&self) -> IoStats {
        self.stats
    }

    pub fn path_for(&self, id: FileId) -> PathBuf {
        self.dir.join(data_filename(id))
    }

    pub fn active_path(&self) -> PathBuf {
        self.path_for(self.file_id)
    }

    /// Writes the initial file header when the active file does not exist
    /// yet, and refreshes the last-opened timestamp when it does. A
    /// read-only filesystem is tolerated here; the open decides what access
    /// we actually get.
    fn initialize_file(&mut self) -> Result<(), StorageError> {
        let path = self.active_path();

        let mut file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::ReadOnlyFilesystem => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if file.metadata()?.len() > 0 {
            let mut buf = [0u8; DATA_HEADER_SIZE];
            if file.read_exact_at(&mut buf, 0).is_ok() {
                if let Ok(mut header) = DataFileHeader::decode(&buf, &path) {
                    header.opened = epoch_seconds();
                    file.write_all_at(&header.encode(), 0)?;
                }
            }
            return Ok(());
        }

        let header = DataFileHeader::new(self.file_id);
        file.write_all(&header.encode())?;
        self.stats.disk_write += DATA_HEADER_SIZE as u64;
        self.sync.sync(&file)?;

        Ok(())
    }

    /// Opens the active file for appending (read-only on a read-only
    /// filesystem) and recovers `previous` by walking the entry headers.
    fn open_active(&mut self) -> Result<(), StorageError> {
        let path = self.active_path();

        let file = match OpenOptions::new().read(true).append(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::ReadOnlyFilesystem => {
                tracing::debug!(file = %path.display(), "data file opened in read-only mode");
                self.read_only = true;
                File::open(&path)?
            }
            Err(e) => return Err(e.into()),
        };

        // find the offset of the last entry
        let mut offset = DATA_HEADER_SIZE as u64;
        let mut header = [0u8; DATA_ENTRY_HEADER_SIZE];
        let mut entries = 0u64;

        loop {
            match file.read_exact_at(&mut header, offset) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            let entry = DataEntryHeader::decode(&header);
            self.previous = offset as u32;
            offset += (DATA_ENTRY_HEADER_SIZE
                + entry.key_length as usize
                + entry.data_length as usize) as u64;
            entries += 1;
        }

        tracing::debug!(
            file = %path.display(),
            entries,
            last_offset = self.previous,
            "data: active file opened"
        );

        self.file = Some(file);
        Ok(())
    }

    /// Closes the active file and moves to `new_id`, creating the file.
    ///
    /// `previous` is not reset (see the field note).
    pub fn jump_next(&mut self, new_id: FileId) -> Result<FileId, StorageError> {
        tracing::debug!(from = %self.file_id, to = %new_id, "data: jumping to the next file");

        self.file = None;
        self.file_id = new_id;
        self.initialize_file()?;
        self.open_active()?;

        Ok(self.file_id)
    }

    /// Offset at which the next entry will land in the active file.
    pub fn next_offset(&self) -> Result<u64, StorageError> {
        let file = self.file.as_ref().ok_or_else(uninitialized)?;
        Ok(file.metadata()?.len())
    }

    /// Appends one entry and returns its offset within the active file.
    ///
    /// The header and key go out in one write, the payload in a second one;
    /// the sync switches are checked once after the payload.
    pub fn insert(&mut self, req: &DataRequest<'_>) -> Result<u32, StorageError> {
        let offset = self.next_offset()?;
        let offset = u32::try_from(offset).map_err(|_| StorageError::OffsetOverflow)?;

        let header = DataEntryHeader {
            key_length: req.key.len() as u8,
            data_length: req.payload.len() as u32,
            previous: self.previous,
            crc: req.crc,
            flags: req.flags,
            timestamp: req.timestamp,
        };

        let mut head = Vec::with_capacity(DATA_ENTRY_HEADER_SIZE + req.key.len());
        head.extend_from_slice(&header.encode());
        head.extend_from_slice(req.key);

        let mut file = match self.file.as_ref() {
            Some(file) => file,
            None => return Err(uninitialized()),
        };

        if let Err(e) = file.write_all(&head) {
            self.stats.write_failed += 1;
            tracing::warn!(error = %e, "data header: write failed");
            return Err(e.into());
        }

        if let Err(e) = file.write_all(req.payload) {
            self.stats.write_failed += 1;
            tracing::warn!(error = %e, "data payload: write failed");
            return Err(e.into());
        }

        self.stats.disk_write += (head.len() + req.payload.len()) as u64;
        self.sync.check(file)?;

        self.previous = offset;
        Ok(offset)
    }

    /// Appends a zero-payload entry flagged DELETED carrying the key, so
    /// that replaying data files alone reproduces the deletion.
    pub fn delete(&mut self, key: &[u8], timestamp: u32) -> Result<u32, StorageError> {
        tracing::debug!("data: delete: insert empty flagged data");
        self.insert(&DataRequest {
            payload: &[],
            key,
            flags: EntryFlags::deleted(),
            crc: 0,
            timestamp,
        })
    }

    /// Borrows the active descriptor or opens the requested older file
    /// read-only.
    fn grab(&self, id: FileId) -> Result<LogFile<'_>, StorageError> {
        if id == self.file_id {
            let file = self.file.as_ref().ok_or_else(uninitialized)?;
            return Ok(LogFile::Active(file));
        }

        tracing::debug!(current = %self.file_id, requested = %id, "data: switching file");
        Ok(LogFile::Ephemeral(File::open(self.path_for(id))?))
    }

    /// Reads one payload.
    ///
    /// When `length` is `None` the entry header is read first to learn it.
    pub fn get(
        &mut self,
        data_id: FileId,
        offset: u32,
        length: Option<u32>,
        key_length: u8,
    ) -> Result<Bytes, StorageError> {
        match self.read_payload(data_id, offset, length, key_length) {
            Ok(payload) => {
                self.stats.disk_read += payload.len() as u64;
                Ok(payload)
            }
            Err(e) => {
                self.stats.read_failed += 1;
                tracing::warn!(error = %e, "data: payload read failed");
                Err(e)
            }
        }
    }

    fn read_payload(
        &self,
        data_id: FileId,
        offset: u32,
        length: Option<u32>,
        key_length: u8,
    ) -> Result<Bytes, StorageError> {
        let file = self.grab(data_id)?;

        let length = match length {
            Some(length) => length,
            None => {
                let mut header = [0u8; DATA_ENTRY_HEADER_SIZE];
                file.read_exact_at(&mut header, u64::from(offset))?;
                DataEntryHeader::decode(&header).data_length
            }
        };

        if length == 0 {
            return Ok(Bytes::new());
        }

        let mut payload = vec![0u8; length as usize];
        let at = u64::from(offset) + (DATA_ENTRY_HEADER_SIZE + key_length as usize) as u64;
        file.read_exact_at(&mut payload, at)?;

        Ok(Bytes::from(payload))
    }

    /// Re-reads one entry's payload and compares its CRC32 against the
    /// header value.
    pub fn check(&mut self, data_id: FileId, offset: u32) -> Result<bool, StorageError> {
        match self.read_entry(data_id, offset) {
            Ok((header, _, payload)) => {
                self.stats.disk_read += u64::from(header.data_length);

                let integrity = crc::checksum(&payload);
                tracing::debug!(
                    computed = format_args!("{integrity:08x}"),
                    stored = format_args!("{:08x}", header.crc),
                    "data: checker"
                );
                Ok(integrity == header.crc)
            }
            Err(e) => {
                self.stats.read_failed += 1;
                tracing::warn!(error = %e, "data: checker: read failed");
                Err(e)
            }
        }
    }

    /// Reads one full entry (header, key, payload) by offset. Used by the
    /// history walk and by offline tooling.
    pub fn raw_get(
        &mut self,
        data_id: FileId,
        offset: u32,
    ) -> Result<(DataEntryHeader, Vec<u8>, Bytes), StorageError> {
        match self.read_entry(data_id, offset) {
            Ok(entry) => {
                self.stats.disk_read += u64::from(entry.0.data_length);
                Ok(entry)
            }
            Err(e) => {
                self.stats.read_failed += 1;
                Err(e)
            }
        }
    }

    fn read_entry(
        &self,
        data_id: FileId,
        offset: u32,
    ) -> Result<(DataEntryHeader, Vec<u8>, Bytes), StorageError> {
        let file = self.grab(data_id)?;

        let mut header = [0u8; DATA_ENTRY_HEADER_SIZE];
        file.read_exact_at(&mut header, u64::from(offset))?;
        let entry = DataEntryHeader::decode(&header);

        let mut key = vec![0u8; entry.key_length as usize];
        file.read_exact_at(&mut key, u64::from(offset) + DATA_ENTRY_HEADER_SIZE as u64)?;

        let mut payload = vec![0u8; entry.data_length as usize];
        let at = u64::from(offset) + (DATA_ENTRY_HEADER_SIZE + entry.key_length as usize) as u64;
        file.read_exact_at(&mut payload, at)?;

        Ok((entry, key, Bytes::from(payload)))
    }

    /// Loads and validates the active file's header.
    pub fn descriptor(&self) -> Result<DataFileHeader, StorageError> {
        let path = self.active_path();
        let file = self.file.as_ref().ok_or_else(uninitialized)?;

        let mut buf = [0u8; DATA_HEADER_SIZE];
        file.read_exact_at(&mut buf, 0)
            .map_err(|_| StorageError::HeaderTruncated { path: path.clone() })?;
        DataFileHeader::decode(&buf, &path)
    }

    /// Fsync of the active file, for the emergency path. Errors are logged,
    /// not propagated: this runs from signal handling.
    pub fn emergency(&mut self) {
        if let Some(file) = &self.file {
            if let Err(e) = self.sync.sync(file) {
                tracing::warn!(error = %e, "data: emergency sync failed");
            }
        }
    }
}
