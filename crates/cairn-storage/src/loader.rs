//! Index loader: rebuilds memory state by replaying index files.
//!
//! On namespace open the loader walks index files from id 0 upward and
//! feeds every entry through the same memory path a live write would have
//! taken, so bucket contents, statistics and parent chains come out
//! identical to the pre-crash state. Tombstones are not skipped: they are
//! inserted, then deleted, exactly as the live sequence did it.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use cairn_types::{FileId, IndexMode, epoch_seconds};

use crate::index::{INDEX_HEADER_SIZE, IndexFileHeader, IndexItem, IndexLog};
use crate::memory::MemoryIndex;
use crate::{StorageError, rotated_filename};

/// What happened to one index file during the load loop.
enum LoadOutcome {
    /// Entries were replayed (possibly zero of them).
    Loaded,
    /// A fresh file 0 was created; nothing to replay.
    Created,
    /// The file was empty or unreachable and was skipped; the load loop
    /// stops here.
    Discarded,
}

/// Reads the namespace mode recorded in index file 0, if that file exists.
///
/// Used before constructing the [`IndexLog`] so an existing namespace keeps
/// the mode it was created with. An unknown mode byte maps to `None` and is
/// reported properly later, by the load itself.
pub fn detect_mode(dir: &Path) -> Result<Option<IndexMode>, StorageError> {
    let path = dir.join(rotated_filename("zdb-index", FileId::FIRST));

    let file = match File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut buf = [0u8; INDEX_HEADER_SIZE];
    if file.read_exact_at(&mut buf, 0).is_err() {
        return Ok(None);
    }

    let (_, mode_byte) = IndexFileHeader::decode(&buf, &path)?;
    Ok(IndexMode::from_byte(mode_byte))
}

impl IndexLog {
    /// Loads every index file of this namespace into memory state.
    ///
    /// Creates an empty file 0 when the directory holds none and the
    /// filesystem is writable. Afterwards the highest-numbered file is open
    /// in append mode for live writes.
    pub fn load(&mut self, mem: &mut MemoryIndex) -> Result<(), StorageError> {
        let available = self.availability();

        if available > 0 {
            for id in 0..available {
                let last = id + 1 == available;
                let id = FileId::new(id as u16);

                match self.load_file(mem, id, last) {
                    Ok(LoadOutcome::Loaded | LoadOutcome::Created) => {}
                    Ok(LoadOutcome::Discarded) => {
                        // an empty file left behind by a crashed rotation
                        // becomes the active file; give it a header and, in
                        // sequential mode, its missing mapping point
                        tracing::warn!(file = %id, "index: discarding file, stopping load here");
                        self.next_id = 0;
                        if let Some(map) = &mut self.seqmap {
                            map.push(self.next_entry as u32, id);
                        }
                        break;
                    }
                    Err(e) if id != FileId::FIRST => {
                        // a corrupted later file degrades the namespace but
                        // what was already replayed stays served
                        tracing::warn!(file = %id, error = %e, "index: load failed, namespace degraded");
                        self.degraded = true;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        } else {
            self.load_file(mem, FileId::FIRST, true)?;
        }

        // a fresh sequential namespace starts its mapping at (0, 0)
        if let Some(map) = &mut self.seqmap {
            if map.is_empty() {
                tracing::debug!("index: fresh database, initializing default seqmap");
                map.push(0, FileId::FIRST);
            }
        }

        if self.read_only {
            tracing::warn!("index: running in read-only mode, filesystem is not writable");
        }

        if self.degraded {
            tracing::warn!("index: degraded (read errors)");
        }

        self.loaded = true;

        // open the real active file in append mode for subsequent writes
        self.open_active()?;
        self.initialize_active_header()?;

        tracing::debug!(
            entries = self.stats.entries,
            datasize = self.stats.datasize,
            "index: loaded"
        );

        Ok(())
    }

    /// Probes file names from id 0 until one does not exist; the returned
    /// count bounds the load loop.
    fn availability(&self) -> u32 {
        let max = u32::from(u16::MAX) + 1;

        for id in 0..max {
            if !self.path_for(FileId::new(id as u16)).is_file() {
                return id;
            }
        }

        max
    }

    /// Opens, validates and replays one index file.
    ///
    /// `last` marks the highest-numbered file: a torn entry at its tail is
    /// the footprint of a crash mid-append and gets truncated away so
    /// subsequent appends continue from the last complete entry. A short
    /// read anywhere else degrades the namespace instead.
    fn load_file(
        &mut self,
        mem: &mut MemoryIndex,
        id: FileId,
        last: bool,
    ) -> Result<LoadOutcome, StorageError> {
        self.file_id = id;
        let path = self.path_for(id);
        tracing::debug!(file = %path.display(), "index: loading file");

        let file = match self.try_open(&path)? {
            Some(file) => file,
            None => return Ok(LoadOutcome::Discarded),
        };

        let length = file.metadata()?.len();

        if length == 0 {
            // a file we just created, or an unexpected empty leftover
            if id != FileId::FIRST {
                return Ok(LoadOutcome::Discarded);
            }

            if self.read_only {
                return Err(StorageError::ReadOnlyNoIndex { path });
            }

            tracing::info!(file = %path.display(), "index: creating empty file");
            let header = IndexFileHeader::new(id, self.mode);
            file.write_all_at(&header.encode(), 0)?;
            file.sync_all()?;
            return Ok(LoadOutcome::Created);
        }

        if length < INDEX_HEADER_SIZE as u64 {
            return Err(StorageError::HeaderTruncated { path });
        }

        let mut head = [0u8; INDEX_HEADER_SIZE];
        file.read_exact_at(&mut head, 0)?;
        let (header, mode_byte) = IndexFileHeader::decode(&head, &path)?;

        if mode_byte != self.mode.as_byte() {
            tracing::error!(
                file = %path.display(),
                recorded = mode_byte,
                configured = %self.mode,
                "index created in another mode than running mode, refusing to load"
            );
            return Err(StorageError::ModeMismatch {
                path,
                recorded: mode_byte,
                configured: self.mode,
            });
        }

        // refresh the last-opened timestamp while we are here
        if !self.read_only {
            let mut refreshed = header;
            refreshed.opened = epoch_seconds();
            file.write_all_at(&refreshed.encode(), 0)?;
        }

        tracing::debug!(file = %path.display(), "index: populating");

        let mut buf = vec![0u8; length as usize];
        file.read_exact_at(&mut buf, 0)?;

        // next-id is relative to the file being populated
        self.next_id = 0;

        let mut seeker = INDEX_HEADER_SIZE;
        let mut first_entry = true;

        while seeker < buf.len() {
            let Some((item, consumed)) = IndexItem::decode(&buf[seeker..]) else {
                if last && !self.read_only {
                    tracing::warn!(
                        file = %path.display(),
                        offset = seeker,
                        "index: torn tail entry, truncating to the last complete one"
                    );
                    file.set_len(seeker as u64)?;
                } else {
                    tracing::warn!(
                        file = %path.display(),
                        offset = seeker,
                        "index: truncated entry, namespace degraded"
                    );
                    self.degraded = true;
                }
                break;
            };

            // the set path advances next-entry, so the mapping point must
            // be registered before the first insert
            if first_entry {
                if let Some(map) = &mut self.seqmap {
                    map.push(self.next_entry as u32, id);
                }
                first_entry = false;
            }

            let offset = seeker as u32;

            // insert as if a user had just executed this write, then replay
            // the deletion for tombstones so chain state and statistics
            // match the live outcome
            self.set_memory(mem, &item, offset);
            if item.is_deleted() && self.mode == IndexMode::UserKey {
                self.delete_memory(mem, &item.key);
            }

            self.previous = offset;
            seeker += consumed;
        }

        tracing::debug!(last_offset = self.previous, "index: file replayed");
        Ok(LoadOutcome::Loaded)
    }

    /// Opens one index file read-write with create, falling back to
    /// read-only on `EROFS`. `None` means the file does not exist on a
    /// read-only filesystem.
    fn try_open(&mut self, path: &Path) -> Result<Option<File>, StorageError> {
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
        {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == io::ErrorKind::ReadOnlyFilesystem => {
                tracing::debug!("index: read-only index filesystem");
                self.read_only = true;

                match File::open(path) {
                    Ok(file) => Ok(Some(file)),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}
