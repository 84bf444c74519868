//! Forward and backward cursors over the index log.
//!
//! The walkers are independent of the in-memory index: they read entry
//! headers straight from the files, skip deleted entries transparently and
//! cross file boundaries in both directions (forward on EOF, backward
//! through the `previous` links).
//!
//! Sequential-mode files written by early versions carry incorrect
//! `previous` offsets: the field was rewritten on overwrite when it should
//! not have changed. Entries in that mode have a constant stride, so the
//! walkers ignore the stored value and recompute the previous offset by
//! subtracting one stride; the value 1 is a sentinel meaning "continue from
//! the last entry of the previous file", whose offset cannot be known
//! without opening it.

use std::io;

use cairn_types::{FileId, IndexMode};

use crate::StorageError;
use crate::index::{
    INDEX_HEADER_SIZE, IndexItem, IndexLog, LocatedItem, SEQ_SLOT_SIZE, read_item_at,
};

/// Sequential-mode sentinel: resume from the last entry of the previous
/// file.
const PREVIOUS_FILE: u32 = 1;

/// Result of one scan step.
#[derive(Debug)]
pub enum ScanOutcome {
    Entry(LocatedItem),
    NoMoreData,
}

/// What a single read at a position found.
enum Probe {
    Item(IndexItem),
    Eof,
    MissingFile,
}

impl IndexLog {
    fn probe(&self, file_id: FileId, offset: u32) -> Result<Probe, StorageError> {
        let file = match self.grab(file_id) {
            Ok(file) => file,
            Err(StorageError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Probe::MissingFile);
            }
            Err(e) => return Err(e),
        };

        match read_item_at(&file, offset) {
            Ok(item) => Ok(Probe::Item(item)),
            Err(StorageError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(Probe::Eof),
            Err(e) => Err(e),
        }
    }

    /// Backward link of the entry at `current`. Sequential mode recomputes
    /// it from the constant stride (see the module note).
    fn backward_previous(&self, stored: u32, current: u32) -> u32 {
        if self.mode != IndexMode::Sequential {
            return stored;
        }

        match current.checked_sub(SEQ_SLOT_SIZE as u32) {
            Some(prev) if prev >= INDEX_HEADER_SIZE as u32 => prev,
            _ => PREVIOUS_FILE,
        }
    }

    /// Offset of the last fixed-size slot of a sequential file, `None` when
    /// the file holds no entries.
    fn last_slot_offset(&self, file_id: FileId) -> Result<Option<u32>, StorageError> {
        let file = match self.grab(file_id) {
            Ok(file) => file,
            Err(StorageError::Io(e)) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let length = file.metadata()?.len();
        if length < (INDEX_HEADER_SIZE + SEQ_SLOT_SIZE) as u64 {
            return Ok(None);
        }

        Ok(Some((length - SEQ_SLOT_SIZE as u64) as u32))
    }

    /// First live entry of the namespace.
    pub fn scan_first(&mut self) -> Result<ScanOutcome, StorageError> {
        self.walk_forward(FileId::FIRST, INDEX_HEADER_SIZE as u32)
    }

    /// Next live entry after the one at `(file_id, offset)`.
    pub fn scan_next(&mut self, file_id: FileId, offset: u32) -> Result<ScanOutcome, StorageError> {
        // the jump width depends on the current entry's key length
        let current = match self.probe(file_id, offset)? {
            Probe::Item(item) => item,
            Probe::Eof | Probe::MissingFile => return Err(StorageError::InvalidCursor),
        };

        let target = offset + current.disk_size() as u32;
        self.walk_forward(file_id, target)
    }

    fn walk_forward(
        &mut self,
        mut file_id: FileId,
        mut target: u32,
    ) -> Result<ScanOutcome, StorageError> {
        loop {
            match self.probe(file_id, target)? {
                Probe::Item(item) if item.is_deleted() => {
                    tracing::debug!(offset = target, "index scan: entry deleted, going further");
                    target += item.disk_size() as u32;
                }
                Probe::Item(item) => {
                    return Ok(ScanOutcome::Entry(LocatedItem {
                        item,
                        file_id,
                        offset: target,
                    }));
                }
                Probe::Eof => {
                    // expected entry is the first of the next file
                    let Some(next) = file_id.next() else {
                        return Ok(ScanOutcome::NoMoreData);
                    };
                    tracing::debug!(file = %next, "index scan: eof reached, next file");
                    file_id = next;
                    target = INDEX_HEADER_SIZE as u32;
                }
                Probe::MissingFile => return Ok(ScanOutcome::NoMoreData),
            }
        }
    }

    /// Last live entry of the namespace.
    pub fn scan_last(&mut self) -> Result<ScanOutcome, StorageError> {
        if self.previous == 0 {
            return Ok(ScanOutcome::NoMoreData);
        }

        let file_id = self.file_id;
        let target = self.previous;
        self.walk_backward(file_id, target, true)
    }

    /// Previous live entry before the one at `(file_id, offset)`.
    pub fn scan_previous(
        &mut self,
        file_id: FileId,
        offset: u32,
    ) -> Result<ScanOutcome, StorageError> {
        self.walk_backward(file_id, offset, false)
    }

    /// Walks the backward chain. With `include_start` the entry at the
    /// starting position itself is a candidate (LAST); without it the walk
    /// begins at its predecessor (PREVIOUS).
    fn walk_backward(
        &mut self,
        mut file_id: FileId,
        start: u32,
        include_start: bool,
    ) -> Result<ScanOutcome, StorageError> {
        // position whose entry is the next candidate; None means "derive it
        // from the entry at `current`"
        let mut current = start;
        let mut target = include_start.then_some(start);

        loop {
            let t = match target {
                Some(t) => t,
                None => {
                    let item = match self.probe(file_id, current)? {
                        Probe::Item(item) => item,
                        Probe::Eof | Probe::MissingFile => {
                            return Err(StorageError::InvalidCursor);
                        }
                    };

                    match self.descend(&mut file_id, item.previous, current)? {
                        Some(t) => t,
                        None => return Ok(ScanOutcome::NoMoreData),
                    }
                }
            };

            match self.probe(file_id, t)? {
                Probe::Item(item) if item.is_deleted() => {
                    tracing::debug!(offset = t, "index rscan: entry deleted, going one before");
                    current = t;
                    target = None;
                }
                Probe::Item(item) => {
                    return Ok(ScanOutcome::Entry(LocatedItem {
                        item,
                        file_id,
                        offset: t,
                    }));
                }
                Probe::Eof | Probe::MissingFile => return Ok(ScanOutcome::NoMoreData),
            }
        }
    }

    /// Resolves the backward link of the entry at `current` into a concrete
    /// `(file, offset)` position, descending files as needed. `None` means
    /// the walk ran out of data.
    fn descend(
        &self,
        file_id: &mut FileId,
        stored_previous: u32,
        current: u32,
    ) -> Result<Option<u32>, StorageError> {
        let mut previous = self.backward_previous(stored_previous, current);

        if previous == 0 {
            tracing::debug!("index rscan: zero reached, nothing to roll back");
            return Ok(None);
        }

        if previous != PREVIOUS_FILE && previous < current {
            return Ok(Some(previous));
        }

        // the previous entry lives in an earlier file: either the sentinel
        // says so, or the stored offset is not below the current one (the
        // first entry of a file keeps the previous file's last offset)
        loop {
            let Some(earlier) = file_id.previous() else {
                return Ok(None);
            };
            *file_id = earlier;

            if previous != PREVIOUS_FILE {
                // user-key mode: the stored offset is a position in the
                // previous file (its last entry at rotation time)
                return Ok(Some(previous));
            }

            // sequential mode: the last slot is computable from the size
            match self.last_slot_offset(*file_id)? {
                Some(offset) => return Ok(Some(offset)),
                // empty file, keep descending
                None => previous = PREVIOUS_FILE,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use cairn_types::{NamespaceId, SeqId};
    use tempfile::TempDir;

    use super::*;
    use crate::index::IndexRequest;
    use crate::memory::MemoryIndex;
    use crate::{SyncPolicy, crc};

    const NS: NamespaceId = NamespaceId::new(3);

    fn fresh(dir: &TempDir, mode: IndexMode) -> (IndexLog, MemoryIndex) {
        let mut index = IndexLog::init_lazy(
            dir.path().to_path_buf(),
            NS,
            mode,
            SyncPolicy::new(false, 0),
        );
        let mut mem = MemoryIndex::new(8);
        index.load(&mut mem).unwrap();
        (index, mem)
    }

    fn put(index: &mut IndexLog, mem: &mut MemoryIndex, key: &[u8], payload: &[u8]) {
        let existing = index.get(mem, key).unwrap().filter(|r| !r.is_deleted());
        index
            .set(
                mem,
                &IndexRequest {
                    key,
                    data_offset: 26,
                    length: payload.len() as u32,
                    crc: crc::checksum(payload),
                    timestamp: 1,
                    data_id: index.file_id(),
                },
                existing.as_ref(),
            )
            .unwrap();
    }

    fn collect_forward(index: &mut IndexLog) -> Vec<Vec<u8>> {
        let mut keys = Vec::new();
        let mut position = match index.scan_first().unwrap() {
            ScanOutcome::Entry(entry) => entry,
            ScanOutcome::NoMoreData => return keys,
        };

        loop {
            keys.push(position.item.key.clone());
            match index.scan_next(position.file_id, position.offset).unwrap() {
                ScanOutcome::Entry(entry) => position = entry,
                ScanOutcome::NoMoreData => return keys,
            }
        }
    }

    fn collect_backward(index: &mut IndexLog) -> Vec<Vec<u8>> {
        let mut keys = Vec::new();
        let mut position = match index.scan_last().unwrap() {
            ScanOutcome::Entry(entry) => entry,
            ScanOutcome::NoMoreData => return keys,
        };

        loop {
            keys.push(position.item.key.clone());
            match index
                .scan_previous(position.file_id, position.offset)
                .unwrap()
            {
                ScanOutcome::Entry(entry) => position = entry,
                ScanOutcome::NoMoreData => return keys,
            }
        }
    }

    #[test]
    fn empty_namespace_has_no_data_either_way() {
        let dir = tempfile::tempdir().unwrap();
        let (mut index, _) = fresh(&dir, IndexMode::UserKey);

        assert!(matches!(index.scan_first().unwrap(), ScanOutcome::NoMoreData));
        assert!(matches!(index.scan_last().unwrap(), ScanOutcome::NoMoreData));
    }

    #[test]
    fn forward_and_backward_agree_on_live_entries() {
        let dir = tempfile::tempdir().unwrap();
        let (mut index, mut mem) = fresh(&dir, IndexMode::UserKey);

        for key in [&b"one"[..], b"two", b"three", b"four"] {
            put(&mut index, &mut mem, key, b"payload");
        }

        let forward = collect_forward(&mut index);
        assert_eq!(forward, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec(), b"four".to_vec()]);

        let mut backward = collect_backward(&mut index);
        backward.reverse();
        assert_eq!(backward, forward);
    }

    #[test]
    fn deleted_entries_are_skipped_transparently() {
        let dir = tempfile::tempdir().unwrap();
        let (mut index, mut mem) = fresh(&dir, IndexMode::UserKey);

        for key in [&b"a"[..], b"b", b"c"] {
            put(&mut index, &mut mem, key, b"payload");
        }

        let rec = index.get(&mem, b"b").unwrap().unwrap();
        index.entry_delete(&mut mem, &rec).unwrap();

        assert_eq!(collect_forward(&mut index), vec![b"a".to_vec(), b"c".to_vec()]);
        assert_eq!(collect_backward(&mut index), vec![b"c".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn walks_cross_file_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let (mut index, mut mem) = fresh(&dir, IndexMode::UserKey);

        put(&mut index, &mut mem, b"first", b"payload");
        put(&mut index, &mut mem, b"second", b"payload");
        index.jump_next().unwrap();
        put(&mut index, &mut mem, b"third", b"payload");

        assert_eq!(
            collect_forward(&mut index),
            vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]
        );
        assert_eq!(
            collect_backward(&mut index),
            vec![b"third".to_vec(), b"second".to_vec(), b"first".to_vec()]
        );
    }

    #[test]
    fn sequential_update_shadows_stay_invisible() {
        let dir = tempfile::tempdir().unwrap();
        let (mut index, mut mem) = fresh(&dir, IndexMode::Sequential);

        put(&mut index, &mut mem, &SeqId::new(0).to_key(), b"v1");
        put(&mut index, &mut mem, &SeqId::new(1).to_key(), b"other");
        // update id 0: appends a deleted shadow after id 1's slot
        put(&mut index, &mut mem, &SeqId::new(0).to_key(), b"v2");

        let forward = collect_forward(&mut index);
        assert_eq!(
            forward,
            vec![SeqId::new(0).to_key().to_vec(), SeqId::new(1).to_key().to_vec()]
        );

        let backward = collect_backward(&mut index);
        assert_eq!(
            backward,
            vec![SeqId::new(1).to_key().to_vec(), SeqId::new(0).to_key().to_vec()]
        );
    }

    #[test]
    fn sequential_backward_walk_crosses_files_via_the_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let (mut index, mut mem) = fresh(&dir, IndexMode::Sequential);

        put(&mut index, &mut mem, &SeqId::new(0).to_key(), b"aa");
        put(&mut index, &mut mem, &SeqId::new(1).to_key(), b"bb");
        index.jump_next().unwrap();
        put(&mut index, &mut mem, &SeqId::new(2).to_key(), b"cc");

        let backward = collect_backward(&mut index);
        assert_eq!(
            backward,
            vec![
                SeqId::new(2).to_key().to_vec(),
                SeqId::new(1).to_key().to_vec(),
                SeqId::new(0).to_key().to_vec(),
            ]
        );
    }
}
