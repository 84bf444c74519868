//! The engine API facade: SET, GET, EXISTS, CHECK, DEL.
//!
//! Every operation yields exactly one [`Reply`] variant; storage errors are
//! logged and folded into failure variants, they never cross this boundary.
//! The serving layer maps replies onto the wire protocol.

use bytes::Bytes;
use cairn_storage::{DataRequest, IndexRequest, KeyRecord, crc};
use cairn_types::{
    EntryFlags, LockState, MAX_KEY_LENGTH, MAX_PAYLOAD_LENGTH, IndexMode, NamespaceId, SeqId,
    entry_timestamp,
};

use crate::Engine;
use crate::namespace::Namespace;

/// Outcome of one engine operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Success,
    /// Operation refused; carries a human-readable reason.
    Failure(String),
    /// A key together with its payload.
    Entry { key: Vec<u8>, payload: Bytes },
    /// Write skipped: the stored payload already matches.
    UpToDate,
    /// Raw bytes (the echoed key on SET, the assigned id in sequential
    /// mode).
    Buffer(Vec<u8>),
    NotFound,
    Deleted,
    InternalError,
    True,
    False,
    InsertDenied,
}

impl Reply {
    fn failure(message: &str) -> Reply {
        Reply::Failure(message.to_string())
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Reply::Failure(_) | Reply::InternalError | Reply::InsertDenied
        )
    }
}

/// Write permission of a namespace for the requesting client.
fn write_allowed(ns: &Namespace) -> Option<Reply> {
    match ns.lock {
        LockState::Frozen => Some(Reply::failure("Namespace is temporarily frozen")),
        LockState::ReadOnly => Some(Reply::failure("Namespace is in read-only mode")),
        LockState::Unlocked => None,
    }
}

fn read_allowed(ns: &Namespace) -> Option<Reply> {
    match ns.lock {
        LockState::Frozen => Some(Reply::failure("Namespace is temporarily frozen")),
        LockState::ReadOnly | LockState::Unlocked => None,
    }
}

impl Engine {
    /// Stores one key/payload pair.
    ///
    /// In user-key mode the key is mandatory and echoed back on success. In
    /// sequential mode an empty key allocates the next id (returned as the
    /// success payload) and a supplied key must name an existing id, which
    /// gets updated in place.
    ///
    /// A rewrite with identical CRC and length is skipped entirely and
    /// answered with [`Reply::UpToDate`].
    pub fn set(&mut self, ns: NamespaceId, key: &[u8], payload: &[u8]) -> Reply {
        let datasize = self.settings.datasize;
        let Engine { store, hooks, .. } = self;

        let Some((namespace, mem)) = store.entry_mut(ns) else {
            return Reply::failure("Namespace not available");
        };

        if let Some(denied) = write_allowed(namespace) {
            return denied;
        }

        if key.len() > MAX_KEY_LENGTH {
            return Reply::failure("Key too large");
        }

        if payload.len() > MAX_PAYLOAD_LENGTH {
            return Reply::failure("Payload too big");
        }

        // pre-write lookup: quota math, dedup, worm and sequential updates
        // all need the current version
        let existing = match namespace.index.get(mem, key) {
            Ok(existing) => existing.filter(|rec| !rec.is_deleted()),
            Err(e) => {
                tracing::warn!(error = %e, "api: set: lookup failed");
                return Reply::InternalError;
            }
        };

        if namespace.worm && existing.is_some() {
            return Reply::failure("Namespace is protected (worm mode)");
        }

        // quota: an overwrite frees the old payload, count it as headroom
        if namespace.maxsize > 0 {
            let floating = existing.as_ref().map_or(0, |rec| u64::from(rec.length));
            let used = namespace.index.stats().datasize;

            if used + payload.len() as u64 > namespace.maxsize + floating {
                return Reply::failure("No space left on this namespace");
            }
        }

        // rotate *before* writing, so a fresh file never carries a stale
        // backward link for an entry it does not contain
        match namespace.data.next_offset() {
            Ok(next) => {
                if next + payload.len() as u64 > datasize {
                    let old = namespace.index.active_path().to_string_lossy().into_owned();

                    let jumped = namespace
                        .index
                        .jump_next()
                        .and_then(|id| namespace.data.jump_next(id));

                    match jumped {
                        Ok(_) => {
                            let new =
                                namespace.index.active_path().to_string_lossy().into_owned();
                            hooks.fire("jump", &[old.as_str(), new.as_str()]);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "api: set: rotation failed");
                            return Reply::InternalError;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "api: set: data offset unavailable");
                return Reply::InternalError;
            }
        }

        match namespace.mode() {
            IndexMode::UserKey => set_userkey(namespace, mem, key, payload, existing),
            IndexMode::Sequential => set_sequential(namespace, mem, key, payload, existing),
        }
    }

    /// Fetches the payload stored under a key.
    pub fn get(&mut self, ns: NamespaceId, key: &[u8]) -> Reply {
        let Some((namespace, mem)) = self.store.entry_mut(ns) else {
            return Reply::failure("Namespace not available");
        };

        if let Some(denied) = read_allowed(namespace) {
            return denied;
        }

        let record = match lookup(namespace, mem, key) {
            Ok(record) => record,
            Err(reply) => return reply,
        };

        tracing::debug!(
            length = record.length,
            file = %record.data_id,
            offset = record.offset,
            "api: get: entry found"
        );

        match namespace.data.get(
            record.data_id,
            record.offset,
            Some(record.length),
            record.key.len() as u8,
        ) {
            Ok(payload) => Reply::Entry {
                key: key.to_vec(),
                payload,
            },
            Err(e) => {
                tracing::warn!(error = %e, "api: get: cannot read payload");
                Reply::InternalError
            }
        }
    }

    /// Boolean form of GET, no payload read.
    pub fn exists(&mut self, ns: NamespaceId, key: &[u8]) -> Reply {
        let Some((namespace, mem)) = self.store.entry_mut(ns) else {
            return Reply::failure("Namespace not available");
        };

        if let Some(denied) = read_allowed(namespace) {
            return denied;
        }

        match lookup(namespace, mem, key) {
            Ok(_) => Reply::True,
            Err(Reply::NotFound | Reply::Deleted) => Reply::False,
            Err(reply) => reply,
        }
    }

    /// Re-reads a key's payload from disk and verifies its CRC32 against
    /// the stored one.
    pub fn check(&mut self, ns: NamespaceId, key: &[u8]) -> Reply {
        let Some((namespace, mem)) = self.store.entry_mut(ns) else {
            return Reply::failure("Namespace not available");
        };

        if let Some(denied) = read_allowed(namespace) {
            return denied;
        }

        let record = match lookup(namespace, mem, key) {
            Ok(record) => record,
            Err(reply) => return reply,
        };

        match namespace.data.check(record.data_id, record.offset) {
            Ok(true) => Reply::True,
            Ok(false) => Reply::False,
            Err(e) => {
                tracing::warn!(error = %e, "api: check: read failed");
                Reply::InternalError
            }
        }
    }

    /// Deletes a key: appends a data tombstone, flags the index entry in
    /// place and marks the memory side.
    pub fn del(&mut self, ns: NamespaceId, key: &[u8]) -> Reply {
        let Some((namespace, mem)) = self.store.entry_mut(ns) else {
            return Reply::failure("Namespace not available");
        };

        if let Some(denied) = write_allowed(namespace) {
            return denied;
        }

        if namespace.worm {
            return Reply::failure("Namespace is protected (worm mode)");
        }

        let record = match lookup(namespace, mem, key) {
            Ok(record) => record,
            Err(reply) => return reply,
        };

        // the data-side tombstone captures the deletion timestamp and lets
        // the index be rebuilt from data files alone
        if let Err(e) = namespace.data.delete(&record.key, entry_timestamp()) {
            tracing::warn!(error = %e, "api: del: data tombstone failed");
            return Reply::InternalError;
        }

        if let Err(e) = namespace.index.entry_delete(mem, &record) {
            tracing::warn!(error = %e, "api: del: index flag failed");
            return Reply::InternalError;
        }

        Reply::Success
    }
}

/// Shared lookup: resolves a key to its live record or the reply explaining
/// why there is none.
fn lookup(
    namespace: &mut Namespace,
    mem: &cairn_storage::MemoryIndex,
    key: &[u8],
) -> Result<KeyRecord, Reply> {
    match namespace.index.get(mem, key) {
        Ok(Some(record)) if record.is_deleted() => Err(Reply::Deleted),
        Ok(Some(record)) => Ok(record),
        Ok(None) => Err(Reply::NotFound),
        Err(e) => {
            tracing::warn!(error = %e, "api: lookup failed");
            Err(Reply::InternalError)
        }
    }
}

fn set_userkey(
    namespace: &mut Namespace,
    mem: &mut cairn_storage::MemoryIndex,
    key: &[u8],
    payload: &[u8],
    existing: Option<KeyRecord>,
) -> Reply {
    if key.is_empty() {
        return Reply::failure("Invalid argument, key needed");
    }

    let timestamp = entry_timestamp();
    let checksum = crc::checksum(payload);

    tracing::debug!(
        key_bytes = key.len(),
        payload_bytes = payload.len(),
        "api: set: userkey"
    );

    // identical content: don't touch the disk at all
    if let Some(existing) = &existing {
        if existing.crc == checksum && existing.length as usize == payload.len() {
            tracing::debug!(crc = format_args!("{checksum:08x}"), "api: set: crc match, ignoring");
            return Reply::UpToDate;
        }
    }

    let offset = match namespace.data.insert(&DataRequest {
        payload,
        key,
        flags: EntryFlags::empty(),
        crc: checksum,
        timestamp,
    }) {
        Ok(offset) => offset,
        Err(e) => {
            tracing::warn!(error = %e, "api: set: data write failed");
            return Reply::failure("Cannot write data right now");
        }
    };

    let request = IndexRequest {
        key,
        data_offset: offset,
        length: payload.len() as u32,
        crc: checksum,
        timestamp,
        data_id: namespace.data.file_id(),
    };

    if let Err(e) = namespace.index.set(mem, &request, existing.as_ref()) {
        tracing::warn!(error = %e, "api: set: index write failed");
        return Reply::failure("Cannot write index right now");
    }

    // the reply echoes the key, the shape sequential mode needs to return
    // generated ids
    Reply::Buffer(key.to_vec())
}

fn set_sequential(
    namespace: &mut Namespace,
    mem: &mut cairn_storage::MemoryIndex,
    key: &[u8],
    payload: &[u8],
    existing: Option<KeyRecord>,
) -> Reply {
    // a supplied key must name an existing id: sequential inserts are
    // keyless, ids are allocated by the engine
    if !key.is_empty() && existing.is_none() {
        return Reply::InsertDenied;
    }

    let id = match &existing {
        Some(record) => match SeqId::from_key(&record.key) {
            Some(id) => id,
            None => return Reply::InternalError,
        },
        None => SeqId::new(namespace.index.next_entry() as u32),
    };
    let id_key = id.to_key();

    let timestamp = entry_timestamp();
    let checksum = crc::checksum(payload);

    tracing::debug!(id = %id, payload_bytes = payload.len(), "api: set: sequential");

    if let Some(existing) = &existing {
        if existing.crc == checksum && existing.length as usize == payload.len() {
            tracing::debug!(crc = format_args!("{checksum:08x}"), "api: set: crc match, ignoring");
            return Reply::UpToDate;
        }
    }

    let offset = match namespace.data.insert(&DataRequest {
        payload,
        key: &id_key,
        flags: EntryFlags::empty(),
        crc: checksum,
        timestamp,
    }) {
        Ok(offset) => offset,
        Err(e) => {
            tracing::warn!(error = %e, "api: set: data write failed");
            return Reply::InternalError;
        }
    };

    let request = IndexRequest {
        key: &id_key,
        data_offset: offset,
        length: payload.len() as u32,
        crc: checksum,
        timestamp,
        data_id: namespace.data.file_id(),
    };

    if let Err(e) = namespace.index.set(mem, &request, existing.as_ref()) {
        tracing::warn!(error = %e, "api: set: index write failed");
        return Reply::InternalError;
    }

    Reply::Buffer(id_key.to_vec())
}
