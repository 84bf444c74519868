//! Namespaces: isolated stores with their own files, quota and access
//! control.
//!
//! Every namespace owns a data log and an index log under
//! `<datapath>/<name>` and `<indexpath>/<name>`, plus a binary descriptor
//! file `zdb-namespace` holding its password, flags and quota. The `default`
//! namespace always exists and cannot be removed.
//!
//! # Descriptor Format
//!
//! ```text
//! namelen u8 | passlen u8 | legacy-maxsize u32 | flags u8
//! name[namelen] | password[passlen]
//! version u32 | maxsize u64        <- extended block, flags bit EXTENDED
//! ```
//!
//! The legacy `u32` maxsize is honored on read when the EXTENDED bit is
//! absent (files written by early versions); writes always emit the
//! extended block.

use std::fs;
use std::path::{Path, PathBuf};

use cairn_storage::fs as storage_fs;
use cairn_storage::{DataLog, IndexLog, IndexStats, MemoryIndex, StorageError, SyncPolicy, loader};
use cairn_types::{FileId, IndexMode, LockState, NamespaceId};

use crate::settings::Settings;
use crate::{Engine, EngineError};

/// Name of the descriptor file inside a namespace's index directory.
pub(crate) const DESCRIPTOR_FILE: &str = "zdb-namespace";

/// Descriptor format version this build reads and writes.
pub(crate) const NAMESPACE_CURRENT_VERSION: u32 = 1;

/// The namespace every unauthenticated client lands in.
pub const NAMESPACE_DEFAULT: &str = "default";

/// Maximum namespace name length in bytes.
pub const MAX_NAMESPACE_NAME: usize = 128;

const NS_FLAG_PUBLIC: u8 = 1;
const NS_FLAG_WORM: u8 = 1 << 1;
const NS_FLAG_EXTENDED: u8 = 1 << 2;

/// Legacy descriptor head: namelen(1) + passlen(1) + maxsize(4) + flags(1).
const DESCRIPTOR_HEAD: usize = 7;

/// Extended block: version(4) + maxsize(8).
const DESCRIPTOR_EXTENDED: usize = 12;

/// Whether `name` may be used for a new namespace. The default namespace
/// is excluded: it exists from the start and is managed by the engine.
pub fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAMESPACE_NAME
        && name != "."
        && name != ".."
        && !name.contains('/')
        && name != NAMESPACE_DEFAULT
}

// ============================================================================
// Descriptor
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Descriptor {
    pub name: String,
    pub password: Option<String>,
    pub maxsize: u64,
    pub public: bool,
    pub worm: bool,
    pub version: u32,
}

impl Descriptor {
    fn encode(&self) -> Vec<u8> {
        let name = self.name.as_bytes();
        let password = self.password.as_deref().unwrap_or("").as_bytes();

        let mut flags = NS_FLAG_EXTENDED;
        if self.public {
            flags |= NS_FLAG_PUBLIC;
        }
        if self.worm {
            flags |= NS_FLAG_WORM;
        }

        let mut buf =
            Vec::with_capacity(DESCRIPTOR_HEAD + name.len() + password.len() + DESCRIPTOR_EXTENDED);
        buf.push(name.len() as u8);
        buf.push(password.len() as u8);
        // legacy field, kept for older readers; truncates past 4 GB
        buf.extend_from_slice(&(self.maxsize.min(u64::from(u32::MAX)) as u32).to_le_bytes());
        buf.push(flags);
        buf.extend_from_slice(name);
        buf.extend_from_slice(password);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.maxsize.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Option<Descriptor> {
        if buf.len() < DESCRIPTOR_HEAD {
            return None;
        }

        let name_length = buf[0] as usize;
        let pass_length = buf[1] as usize;
        let legacy_maxsize = u32::from_le_bytes(buf[2..6].try_into().expect("slice is 4 bytes"));
        let flags = buf[6];

        let name_end = DESCRIPTOR_HEAD + name_length;
        let pass_end = name_end + pass_length;
        if buf.len() < pass_end {
            return None;
        }

        let name = String::from_utf8_lossy(&buf[DESCRIPTOR_HEAD..name_end]).into_owned();
        let password = (pass_length > 0)
            .then(|| String::from_utf8_lossy(&buf[name_end..pass_end]).into_owned());

        let (version, maxsize) = if flags & NS_FLAG_EXTENDED != 0 {
            if buf.len() < pass_end + DESCRIPTOR_EXTENDED {
                return None;
            }
            let version =
                u32::from_le_bytes(buf[pass_end..pass_end + 4].try_into().expect("4 bytes"));
            let maxsize =
                u64::from_le_bytes(buf[pass_end + 4..pass_end + 12].try_into().expect("8 bytes"));
            (version, maxsize)
        } else {
            (NAMESPACE_CURRENT_VERSION, u64::from(legacy_maxsize))
        };

        Some(Descriptor {
            name,
            password,
            maxsize,
            public: flags & NS_FLAG_PUBLIC != 0,
            worm: flags & NS_FLAG_WORM != 0,
            version,
        })
    }
}

fn descriptor_path(indexpath: &Path) -> PathBuf {
    indexpath.join(DESCRIPTOR_FILE)
}

fn descriptor_save(indexpath: &Path, descriptor: &Descriptor) -> Result<(), EngineError> {
    tracing::debug!(namespace = %descriptor.name, "namespace: updating descriptor");
    fs::write(descriptor_path(indexpath), descriptor.encode()).map_err(StorageError::from)?;
    Ok(())
}

/// Reads the descriptor, writing `defaults` first when the file does not
/// exist yet.
fn descriptor_load_or_create(
    indexpath: &Path,
    defaults: Descriptor,
) -> Result<Descriptor, EngineError> {
    let path = descriptor_path(indexpath);

    let buf = match fs::read(&path) {
        Ok(buf) => buf,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            descriptor_save(indexpath, &defaults)?;
            return Ok(defaults);
        }
        Err(e) => return Err(StorageError::from(e).into()),
    };

    let descriptor = Descriptor::decode(&buf).ok_or_else(|| EngineError::CorruptDescriptor {
        path: path.clone(),
    })?;

    if descriptor.version != NAMESPACE_CURRENT_VERSION {
        return Err(EngineError::UnsupportedDescriptor {
            path,
            version: descriptor.version,
        });
    }

    Ok(descriptor)
}

// ============================================================================
// Namespace
// ============================================================================

/// One isolated store.
#[derive(Debug)]
pub struct Namespace {
    pub(crate) id: NamespaceId,
    pub(crate) name: String,
    pub(crate) password: Option<String>,
    pub(crate) public: bool,
    pub(crate) worm: bool,
    pub(crate) maxsize: u64,
    pub(crate) lock: LockState,
    pub(crate) version: u32,
    pub(crate) indexpath: PathBuf,
    pub(crate) datapath: PathBuf,
    pub(crate) index: IndexLog,
    pub(crate) data: DataLog,
}

impl Namespace {
    pub fn id(&self) -> NamespaceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_public(&self) -> bool {
        self.public
    }

    pub fn is_worm(&self) -> bool {
        self.worm
    }

    pub fn is_password_protected(&self) -> bool {
        self.password.is_some()
    }

    pub fn maxsize(&self) -> u64 {
        self.maxsize
    }

    pub fn lock(&self) -> LockState {
        self.lock
    }

    pub fn mode(&self) -> IndexMode {
        self.index.mode()
    }

    pub fn stats(&self) -> IndexStats {
        self.index.stats()
    }

    pub fn is_degraded(&self) -> bool {
        self.index.is_degraded()
    }

    /// A namespace is fresh when nothing was ever written to it, deleted
    /// keys included. Only fresh namespaces may switch mode.
    pub fn is_fresh(&self) -> bool {
        self.index.next_entry() == 0
            && self.index.next_id() == 0
            && self.index.file_id() == FileId::FIRST
    }

    /// Whether `given` grants access to this namespace.
    pub fn password_matches(&self, given: Option<&str>) -> bool {
        match &self.password {
            None => true,
            Some(expected) => given == Some(expected.as_str()),
        }
    }

    fn descriptor(&self) -> Descriptor {
        Descriptor {
            name: self.name.clone(),
            password: self.password.clone(),
            maxsize: self.maxsize,
            public: self.public,
            worm: self.worm,
            version: self.version,
        }
    }
}

// ============================================================================
// Namespace store
// ============================================================================

/// The ordered namespace slots plus the shared bucket index.
///
/// The default namespace sits at slot 0. Deleting a namespace frees its
/// slot; the identity tags handed out to callers are never reused, so a
/// stale handle resolves to nothing instead of a different namespace.
#[derive(Debug)]
pub(crate) struct NamespaceStore {
    pub(crate) mem: MemoryIndex,
    slots: Vec<Option<Namespace>>,
    next_tag: u32,
}

impl NamespaceStore {
    pub fn new(bucket_bits: u8) -> Self {
        Self {
            mem: MemoryIndex::new(bucket_bits),
            slots: Vec::new(),
            next_tag: 0,
        }
    }

    fn allocate_tag(&mut self) -> NamespaceId {
        let tag = NamespaceId::new(self.next_tag);
        self.next_tag += 1;
        tag
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Namespace> {
        self.slots.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Namespace> {
        self.slots.iter_mut().flatten()
    }

    pub fn get(&self, id: NamespaceId) -> Option<&Namespace> {
        self.slots.iter().flatten().find(|ns| ns.id == id)
    }

    pub fn get_mut(&mut self, id: NamespaceId) -> Option<&mut Namespace> {
        self.slots.iter_mut().flatten().find(|ns| ns.id == id)
    }

    /// Resolves a namespace together with the shared memory index, the pair
    /// every data-path operation needs.
    pub fn entry_mut(&mut self, id: NamespaceId) -> Option<(&mut Namespace, &mut MemoryIndex)> {
        let NamespaceStore { mem, slots, .. } = self;
        let ns = slots.iter_mut().flatten().find(|ns| ns.id == id)?;
        Some((ns, mem))
    }

    pub fn by_name(&self, name: &str) -> Option<NamespaceId> {
        self.iter().find(|ns| ns.name == name).map(|ns| ns.id)
    }

    fn push(&mut self, namespace: Namespace) -> NamespaceId {
        let id = namespace.id;

        if let Some(slot) = self.slots.iter_mut().find(|slot| slot.is_none()) {
            *slot = Some(namespace);
        } else {
            self.slots.push(Some(namespace));
        }

        id
    }

    pub fn take(&mut self, id: NamespaceId) -> Option<Namespace> {
        self.slots
            .iter_mut()
            .find(|slot| slot.as_ref().is_some_and(|ns| ns.id == id))
            .and_then(Option::take)
    }

    /// Loads (or creates) a namespace: directories, descriptor, index
    /// replay, data log. `mode` only matters for a brand-new namespace;
    /// existing files keep the mode recorded in their headers.
    pub fn load(
        &mut self,
        settings: &Settings,
        name: &str,
        mode: Option<IndexMode>,
    ) -> Result<NamespaceId, EngineError> {
        tracing::debug!(namespace = name, "namespaces: loading");

        let id = self.allocate_tag();
        let indexpath = settings.indexpath.join(name);
        let datapath = settings.datapath.join(name);

        storage_fs::dir_create(&indexpath).map_err(StorageError::from)?;
        storage_fs::dir_create(&datapath).map_err(StorageError::from)?;

        let descriptor = descriptor_load_or_create(
            &indexpath,
            Descriptor {
                name: name.to_string(),
                password: None,
                maxsize: settings.maxsize,
                public: true,
                worm: false,
                version: NAMESPACE_CURRENT_VERSION,
            },
        )?;

        tracing::info!(
            namespace = name,
            maxsize = descriptor.maxsize,
            public = descriptor.public,
            worm = descriptor.worm,
            protected = descriptor.password.is_some(),
            "namespace: opened, analyzing"
        );

        let mode = match loader::detect_mode(&indexpath)? {
            Some(recorded) => recorded,
            None => mode.unwrap_or(settings.mode.default_index_mode()),
        };

        let mut index = IndexLog::init_lazy(
            indexpath.clone(),
            id,
            mode,
            SyncPolicy::new(settings.sync, settings.synctime),
        );

        if let Err(e) = index.load(&mut self.mem) {
            self.mem.clean_namespace(id);
            return Err(e.into());
        }

        let data = match DataLog::init(
            datapath.clone(),
            index.file_id(),
            SyncPolicy::new(settings.sync, settings.synctime),
        ) {
            Ok(data) => data,
            Err(e) => {
                self.mem.clean_namespace(id);
                return Err(e.into());
            }
        };

        Ok(self.push(Namespace {
            id,
            name: name.to_string(),
            password: descriptor.password,
            public: descriptor.public,
            worm: descriptor.worm,
            maxsize: descriptor.maxsize,
            lock: LockState::Unlocked,
            version: descriptor.version,
            indexpath,
            datapath,
            index,
            data,
        }))
    }

    /// Drops and rebuilds a namespace's in-memory state from disk. The
    /// namespace identity is preserved so attached clients keep working.
    pub fn reload(&mut self, settings: &Settings, id: NamespaceId) -> Result<(), EngineError> {
        let NamespaceStore { mem, slots, .. } = self;
        let ns = slots
            .iter_mut()
            .flatten()
            .find(|ns| ns.id == id)
            .ok_or(EngineError::NotFound)?;

        tracing::debug!(namespace = %ns.name, "namespace: reloading");
        mem.clean_namespace(id);

        let mode = ns.index.mode();
        ns.index = IndexLog::init_lazy(
            ns.indexpath.clone(),
            id,
            mode,
            SyncPolicy::new(settings.sync, settings.synctime),
        );
        ns.index.load(mem)?;

        ns.data = DataLog::init(
            ns.datapath.clone(),
            ns.index.file_id(),
            SyncPolicy::new(settings.sync, settings.synctime),
        )?;

        Ok(())
    }

    /// Like [`reload`](Self::reload) but wipes the payload files first,
    /// keeping the descriptor. Permission checks belong to the caller.
    pub fn flush(&mut self, settings: &Settings, id: NamespaceId) -> Result<(), EngineError> {
        let ns = self.get(id).ok_or(EngineError::NotFound)?;
        tracing::debug!(namespace = %ns.name, "namespace: flushing");

        let indexpath = ns.indexpath.clone();
        let datapath = ns.datapath.clone();

        self.mem.clean_namespace(id);

        // close the active descriptors before removing the files
        {
            let ns = self.get_mut(id).expect("resolved above");
            ns.index = IndexLog::init_lazy(
                indexpath.clone(),
                id,
                ns.index.mode(),
                SyncPolicy::new(settings.sync, settings.synctime),
            );
            ns.data = DataLog::init_lazy(
                datapath.clone(),
                FileId::FIRST,
                SyncPolicy::new(settings.sync, settings.synctime),
            );
        }

        storage_fs::dir_clean_payload(&indexpath).map_err(StorageError::from)?;
        storage_fs::dir_clean_payload(&datapath).map_err(StorageError::from)?;

        self.reload(settings, id)
    }
}

// ============================================================================
// Engine lifecycle surface
// ============================================================================

impl Engine {
    /// Creates a new namespace and fires `namespace-created`.
    pub fn namespace_create(
        &mut self,
        name: &str,
        mode: Option<IndexMode>,
    ) -> Result<NamespaceId, EngineError> {
        if !valid_name(name) {
            return Err(EngineError::InvalidName);
        }

        if self.store.by_name(name).is_some() {
            return Err(EngineError::AlreadyExists);
        }

        if let Some(mode) = mode {
            if !self.settings.mode.allows(mode) {
                return Err(EngineError::ModeDenied);
            }
        }

        tracing::info!(namespace = name, "namespace: creating");
        let id = self.store.load(&self.settings, name, mode)?;

        let args = [name];
        self.hooks.fire("namespace-created", &args);

        Ok(id)
    }

    /// Resolves a namespace name to its handle.
    pub fn namespace_get(&self, name: &str) -> Option<NamespaceId> {
        self.store.by_name(name)
    }

    /// The always-present default namespace.
    pub fn namespace_default(&self) -> NamespaceId {
        self.store
            .by_name(NAMESPACE_DEFAULT)
            .expect("the default namespace always exists")
    }

    pub fn namespace(&self, id: NamespaceId) -> Option<&Namespace> {
        self.store.get(id)
    }

    /// Iterates over loaded namespaces, default first.
    pub fn namespaces(&self) -> impl Iterator<Item = &Namespace> {
        self.store.iter()
    }

    /// Removes a namespace: memory records, open files, directories. The
    /// default namespace cannot be removed. Attached clients are the serving
    /// layer's concern: their handles simply stop resolving.
    pub fn namespace_delete(&mut self, id: NamespaceId) -> Result<(), EngineError> {
        {
            let ns = self.store.get(id).ok_or(EngineError::NotFound)?;
            if ns.name == NAMESPACE_DEFAULT {
                return Err(EngineError::DefaultProtected);
            }
        }

        self.store.mem.clean_namespace(id);

        let ns = self.store.take(id).expect("resolved above");
        tracing::info!(namespace = %ns.name, "namespace: removing");

        // dropping the namespace closed its descriptors; now the files
        let Namespace {
            name,
            indexpath,
            datapath,
            ..
        } = ns;

        storage_fs::dir_remove(&indexpath).map_err(StorageError::from)?;
        storage_fs::dir_remove(&datapath).map_err(StorageError::from)?;

        let args = [name.as_str()];
        self.hooks.fire("namespace-deleted", &args);

        Ok(())
    }

    /// Rereads a namespace from disk, preserving its identity, and fires
    /// `namespace-reloaded`.
    pub fn namespace_reload(&mut self, id: NamespaceId) -> Result<(), EngineError> {
        self.store.reload(&self.settings, id)?;

        let name = self.store.get(id).expect("reloaded").name.clone();
        self.hooks.fire("namespace-reloaded", &[&name]);
        Ok(())
    }

    /// Wipes a namespace's data while keeping its descriptor. Only
    /// permitted on password-protected private namespaces: an open public
    /// namespace must never be wiped by a client.
    pub fn namespace_flush(&mut self, id: NamespaceId) -> Result<(), EngineError> {
        {
            let ns = self.store.get(id).ok_or(EngineError::NotFound)?;
            if ns.password.is_none() || ns.public {
                return Err(EngineError::FlushDenied);
            }
        }

        self.store.flush(&self.settings, id)
    }

    /// Rewrites the descriptor and fires `namespace-updated`.
    fn namespace_commit(&mut self, id: NamespaceId) -> Result<(), EngineError> {
        let Engine { store, hooks, .. } = self;
        let ns = store.get(id).ok_or(EngineError::NotFound)?;

        descriptor_save(&ns.indexpath, &ns.descriptor())?;
        let args = [ns.name.as_str()];
        hooks.fire("namespace-updated", &args);
        Ok(())
    }

    pub fn namespace_set_password(
        &mut self,
        id: NamespaceId,
        password: Option<&str>,
    ) -> Result<(), EngineError> {
        let ns = self.store.get_mut(id).ok_or(EngineError::NotFound)?;
        ns.password = password.map(str::to_string);
        self.namespace_commit(id)
    }

    pub fn namespace_set_public(&mut self, id: NamespaceId, public: bool) -> Result<(), EngineError> {
        let ns = self.store.get_mut(id).ok_or(EngineError::NotFound)?;
        ns.public = public;
        self.namespace_commit(id)
    }

    /// Enables or disables worm mode. Worm (write once, read many) forbids
    /// overwriting and deleting existing keys.
    pub fn namespace_set_worm(&mut self, id: NamespaceId, worm: bool) -> Result<(), EngineError> {
        let ns = self.store.get_mut(id).ok_or(EngineError::NotFound)?;
        ns.worm = worm;
        self.namespace_commit(id)
    }

    pub fn namespace_set_maxsize(&mut self, id: NamespaceId, maxsize: u64) -> Result<(), EngineError> {
        let ns = self.store.get_mut(id).ok_or(EngineError::NotFound)?;
        ns.maxsize = maxsize;
        self.namespace_commit(id)
    }

    /// Switches the index mode of a fresh namespace by recreating its
    /// (empty) files with the new mode recorded. Refused once anything has
    /// been written.
    pub fn namespace_set_mode(
        &mut self,
        id: NamespaceId,
        mode: IndexMode,
    ) -> Result<(), EngineError> {
        if !self.settings.mode.allows(mode) {
            return Err(EngineError::ModeDenied);
        }

        {
            let ns = self.store.get(id).ok_or(EngineError::NotFound)?;
            if !ns.is_fresh() {
                return Err(EngineError::NotFresh);
            }

            if ns.index.mode() == mode {
                return Ok(());
            }
        }

        let settings = self.settings.clone();
        let (indexpath, datapath) = {
            let ns = self.store.get_mut(id).expect("resolved above");

            // release the descriptors, then recreate file pair 0 with the
            // requested mode in its headers
            ns.index = IndexLog::init_lazy(
                ns.indexpath.clone(),
                id,
                mode,
                SyncPolicy::new(settings.sync, settings.synctime),
            );
            ns.data = DataLog::init_lazy(
                ns.datapath.clone(),
                FileId::FIRST,
                SyncPolicy::new(settings.sync, settings.synctime),
            );
            (ns.indexpath.clone(), ns.datapath.clone())
        };

        storage_fs::dir_clean_payload(&indexpath).map_err(StorageError::from)?;
        storage_fs::dir_clean_payload(&datapath).map_err(StorageError::from)?;

        self.store.reload(&settings, id)
    }

    pub fn namespace_lock(&mut self, id: NamespaceId) -> Result<(), EngineError> {
        self.namespace_set_lock(id, LockState::ReadOnly)
    }

    pub fn namespace_unlock(&mut self, id: NamespaceId) -> Result<(), EngineError> {
        self.namespace_set_lock(id, LockState::Unlocked)
    }

    pub fn namespace_freeze(&mut self, id: NamespaceId) -> Result<(), EngineError> {
        self.namespace_set_lock(id, LockState::Frozen)
    }

    pub fn namespace_unfreeze(&mut self, id: NamespaceId) -> Result<(), EngineError> {
        self.namespace_set_lock(id, LockState::Unlocked)
    }

    fn namespace_set_lock(&mut self, id: NamespaceId, lock: LockState) -> Result<(), EngineError> {
        let ns = self.store.get_mut(id).ok_or(EngineError::NotFound)?;
        tracing::debug!(namespace = %ns.name, ?lock, "namespace: lock state change");
        ns.lock = lock;
        Ok(())
    }
}
