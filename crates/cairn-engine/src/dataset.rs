//! Dataset traversal: scan pages, history chains, cursor tokens.
//!
//! SCAN and RSCAN walk the index log forward or backward in bounded time
//! slices so the cooperative single-threaded server stays responsive: one
//! call collects entries for roughly two milliseconds, then hands back a
//! continuation cursor.
//!
//! HISTORY walks a key's parent chain: every update records where the
//! previous version's index entry lives, so passing the returned parent
//! token back retrieves the prior payload. The chain ends on the all-zeros
//! token. The requesting key is re-presented on every step and compared
//! against the entry read from disk, so a crafted token cannot reach
//! unrelated entries.

use std::time::{Duration, Instant};

use bytes::Bytes;
use cairn_storage::{CursorKey, LocatedItem, ScanOutcome, StorageError};
use cairn_types::{FileId, NamespaceId};
use thiserror::Error;

use crate::Engine;

/// Soft bound on the time one scan call may spend collecting entries.
const SCAN_TIMESLICE: Duration = Duration::from_micros(2000);

/// Serialized history token size: indexid(2) + offset(4).
const HISTORY_TOKEN_SIZE: usize = 6;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("no more data")]
    NoMoreData,

    #[error("invalid key format")]
    InvalidCursor,

    #[error("key not found")]
    NotFound,

    #[error("namespace not available")]
    NamespaceUnavailable,

    #[error("internal error: {0}")]
    Internal(#[from] StorageError),
}

/// One entry of a scan page. Payloads are not fetched here; the length and
/// timestamp are free, they sit in the index entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanItem {
    pub key: Vec<u8>,
    pub length: u32,
    pub timestamp: u32,
}

/// A batch of scan results plus the continuation cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPage {
    /// Serialized [`CursorKey`] of the last returned entry; feed it back to
    /// continue where this page stopped.
    pub cursor: Vec<u8>,
    pub items: Vec<ScanItem>,
}

/// One step of a history chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Token of the previous version, `None` when this is the oldest one.
    pub parent: Option<Vec<u8>>,
    pub timestamp: u32,
    pub payload: Bytes,
}

fn history_token(index_id: FileId, offset: u32) -> Option<Vec<u8>> {
    if index_id == FileId::FIRST && offset == 0 {
        return None;
    }

    let mut buf = Vec::with_capacity(HISTORY_TOKEN_SIZE);
    buf.extend_from_slice(&index_id.as_u16().to_le_bytes());
    buf.extend_from_slice(&offset.to_le_bytes());
    Some(buf)
}

fn history_token_decode(buf: &[u8]) -> Result<(FileId, u32), DatasetError> {
    if buf.len() != HISTORY_TOKEN_SIZE {
        return Err(DatasetError::InvalidCursor);
    }

    let index_id = FileId::new(u16::from_le_bytes(
        buf[0..2].try_into().expect("slice is 2 bytes"),
    ));
    let offset = u32::from_le_bytes(buf[2..6].try_into().expect("slice is 4 bytes"));
    Ok((index_id, offset))
}

fn item_to_scan_item(located: &LocatedItem) -> ScanItem {
    ScanItem {
        key: located.item.key.clone(),
        length: located.item.length,
        timestamp: located.item.timestamp,
    }
}

impl Engine {
    /// Serializes the cursor of a live key, the entry point for cursor-based
    /// scanning.
    pub fn key_cursor(&mut self, ns: NamespaceId, key: &[u8]) -> Result<Vec<u8>, DatasetError> {
        let (namespace, mem) = self
            .store
            .entry_mut(ns)
            .ok_or(DatasetError::NamespaceUnavailable)?;

        let record = namespace
            .index
            .get(mem, key)?
            .filter(|rec| !rec.is_deleted())
            .ok_or(DatasetError::NotFound)?;

        Ok(CursorKey::from_record(&record).encode().to_vec())
    }

    /// Forward scan: from the very beginning, or continuing after `cursor`.
    pub fn scan(&mut self, ns: NamespaceId, cursor: Option<&[u8]>) -> Result<ScanPage, DatasetError> {
        self.scan_page(ns, cursor, false)
    }

    /// Backward scan: from the latest entry, or continuing before `cursor`.
    pub fn rscan(
        &mut self,
        ns: NamespaceId,
        cursor: Option<&[u8]>,
    ) -> Result<ScanPage, DatasetError> {
        self.scan_page(ns, cursor, true)
    }

    fn scan_page(
        &mut self,
        ns: NamespaceId,
        cursor: Option<&[u8]>,
        reverse: bool,
    ) -> Result<ScanPage, DatasetError> {
        let (namespace, _) = self
            .store
            .entry_mut(ns)
            .ok_or(DatasetError::NamespaceUnavailable)?;
        let index = &mut namespace.index;

        let mut position = match cursor {
            None => {
                let outcome = if reverse {
                    index.scan_last()?
                } else {
                    index.scan_first()?
                };
                match outcome {
                    ScanOutcome::Entry(entry) => entry,
                    ScanOutcome::NoMoreData => return Err(DatasetError::NoMoreData),
                }
            }
            Some(buf) => {
                let cursor = CursorKey::decode(buf).map_err(|_| DatasetError::InvalidCursor)?;
                let located = index
                    .resolve_cursor(&cursor)
                    .map_err(|_| DatasetError::InvalidCursor)?;

                let outcome = if reverse {
                    index.scan_previous(located.file_id, located.offset)?
                } else {
                    index.scan_next(located.file_id, located.offset)?
                };
                match outcome {
                    ScanOutcome::Entry(entry) => entry,
                    ScanOutcome::NoMoreData => return Err(DatasetError::NoMoreData),
                }
            }
        };

        let started = Instant::now();
        let mut items = vec![item_to_scan_item(&position)];

        while started.elapsed() < SCAN_TIMESLICE {
            let outcome = if reverse {
                index.scan_previous(position.file_id, position.offset)?
            } else {
                index.scan_next(position.file_id, position.offset)?
            };

            match outcome {
                ScanOutcome::Entry(entry) => {
                    items.push(item_to_scan_item(&entry));
                    position = entry;
                }
                ScanOutcome::NoMoreData => break,
            }
        }

        let cursor = CursorKey::from_item(&position.item, position.file_id, position.offset)
            .encode()
            .to_vec();

        Ok(ScanPage { cursor, items })
    }

    /// Latest version of a key, with the token of its predecessor.
    pub fn history_get(
        &mut self,
        ns: NamespaceId,
        key: &[u8],
    ) -> Result<HistoryEntry, DatasetError> {
        let (namespace, mem) = self
            .store
            .entry_mut(ns)
            .ok_or(DatasetError::NamespaceUnavailable)?;

        let record = namespace
            .index
            .get(mem, key)?
            .filter(|rec| !rec.is_deleted())
            .ok_or(DatasetError::NotFound)?;

        let payload = namespace.data.get(
            record.data_id,
            record.offset,
            Some(record.length),
            record.key.len() as u8,
        )?;

        Ok(HistoryEntry {
            parent: history_token(record.parent_id, record.parent_off),
            timestamp: record.timestamp,
            payload,
        })
    }

    /// Follows a history token returned by a previous call. The same key
    /// must be re-presented; it is compared against the entry on disk.
    pub fn history_next(
        &mut self,
        ns: NamespaceId,
        key: &[u8],
        token: &[u8],
    ) -> Result<HistoryEntry, DatasetError> {
        let (index_id, offset) = history_token_decode(token)?;

        let (namespace, _) = self
            .store
            .entry_mut(ns)
            .ok_or(DatasetError::NamespaceUnavailable)?;

        let item = match namespace.index.item_get_disk(index_id, offset) {
            Ok(item) => item,
            Err(StorageError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(DatasetError::InvalidCursor);
            }
            Err(e) => return Err(e.into()),
        };

        if item.key != key {
            tracing::debug!("history: token does not belong to the requested key");
            return Err(DatasetError::InvalidCursor);
        }

        let payload = namespace.data.get(
            item.data_id,
            item.offset,
            Some(item.length),
            item.key.len() as u8,
        )?;

        Ok(HistoryEntry {
            parent: history_token(item.parent_id, item.parent_off),
            timestamp: item.timestamp,
            payload,
        })
    }
}
