//! # cairn-engine: namespaces and API facade of the cairn storage engine
//!
//! The [`Engine`] is the single entry point: it validates the settings,
//! takes the exclusive directory locks, loads every namespace (replaying
//! their index logs into the shared bucket index) and exposes the five data
//! operations plus the namespace lifecycle.
//!
//! ```no_run
//! use cairn_engine::{Engine, Reply, Settings};
//!
//! # fn main() -> Result<(), cairn_engine::EngineError> {
//! let mut engine = Engine::open(Settings {
//!     datapath: "/var/lib/cairn/data".into(),
//!     indexpath: "/var/lib/cairn/index".into(),
//!     ..Settings::default()
//! })?;
//!
//! let ns = engine.namespace_default();
//! assert_eq!(engine.set(ns, b"hello", b"world"), Reply::Buffer(b"hello".to_vec()));
//! # Ok(())
//! # }
//! ```
//!
//! The engine is single-writer and synchronous: exactly one operation runs
//! at a time, driven to completion. The serving loop (wire protocol, client
//! multiplexing, authentication) lives outside this crate and consumes the
//! [`Reply`] variants.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use cairn_storage::fs::{self as storage_fs, DirLock};
use thiserror::Error;

pub use cairn_storage::{IndexStats, IoStats, StorageError};

mod api;
mod dataset;
mod hook;
pub mod namespace;
mod settings;

#[cfg(test)]
mod tests;

pub use api::Reply;
pub use cairn_storage::CursorKey;
pub use cairn_types::{
    EntryFlags, FileId, IndexMode, LockState, MAX_KEY_LENGTH, MAX_PAYLOAD_LENGTH, NamespaceId,
    RunMode, SeqId,
};
pub use dataset::{DatasetError, HistoryEntry, ScanItem, ScanPage};
pub use namespace::{MAX_NAMESPACE_NAME, NAMESPACE_DEFAULT, Namespace, valid_name};
pub use settings::{
    DEFAULT_DATA_MAXSIZE, DEFAULT_DATA_PATH, DEFAULT_INDEX_PATH, MAX_DATAFILE_SIZE, Settings,
    SettingsError,
};

use hook::Hooks;
use namespace::NamespaceStore;

/// Errors surfaced by the engine handle and the namespace lifecycle. The
/// data operations never return these; they fold everything into [`Reply`]
/// variants.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("invalid namespace name")]
    InvalidName,

    #[error("namespace already exists")]
    AlreadyExists,

    #[error("namespace not found")]
    NotFound,

    #[error("the default namespace cannot be removed")]
    DefaultProtected,

    #[error("only password-protected private namespaces may be flushed")]
    FlushDenied,

    #[error("namespace is not fresh, mode cannot be changed")]
    NotFresh,

    #[error("mode not allowed by engine settings")]
    ModeDenied,

    #[error("{path}: corrupt namespace descriptor")]
    CorruptDescriptor { path: PathBuf },

    #[error("{path}: unsupported descriptor version {version}")]
    UnsupportedDescriptor { path: PathBuf, version: u32 },
}

/// Aggregated instance statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    /// Loaded namespace count.
    pub namespaces: usize,
    /// Live keys across all namespaces.
    pub entries: u64,
    /// Live payload bytes across all namespaces.
    pub datasize: u64,
    /// Index log i/o counters, summed.
    pub index_io: IoStats,
    /// Data log i/o counters, summed.
    pub data_io: IoStats,
}

/// One running storage instance.
///
/// Owns the directory locks, the namespace slots, the shared bucket index
/// and the hook runner. Everything hangs off this handle; there is no
/// global state.
#[derive(Debug)]
pub struct Engine {
    pub(crate) settings: Settings,
    pub(crate) store: NamespaceStore,
    pub(crate) hooks: Hooks,
    iid: u32,
    _index_lock: DirLock,
    _data_lock: DirLock,
}

impl Engine {
    /// Validates the settings, locks both roots, loads the default
    /// namespace and every extra namespace found on disk.
    ///
    /// Fires `namespaces-init` (waited) before loading and `ready` after.
    pub fn open(settings: Settings) -> Result<Engine, EngineError> {
        settings.validate()?;

        storage_fs::dir_create(&settings.datapath).map_err(StorageError::from)?;
        storage_fs::dir_create(&settings.indexpath).map_err(StorageError::from)?;

        let datareal = settings.datapath.canonicalize().map_err(StorageError::from)?;
        let indexreal = settings
            .indexpath
            .canonicalize()
            .map_err(StorageError::from)?;

        if datareal == indexreal {
            return Err(SettingsError::SamePaths.into());
        }

        // only one instance per directory pair, ever
        let index_lock = DirLock::acquire(&settings.indexpath)?;
        let data_lock = DirLock::acquire(&settings.datapath)?;

        let iid = generate_instance_id();
        let instance = settings
            .instance
            .clone()
            .unwrap_or_else(|| "unknown-id".to_string());

        tracing::info!(instance = %instance, iid, "engine: initializing");

        let mut hooks = Hooks::new(settings.hook.clone(), instance);
        let indexroot = indexreal.to_string_lossy().into_owned();
        let dataroot = datareal.to_string_lossy().into_owned();
        hooks.fire_wait("namespaces-init", &[indexroot.as_str(), dataroot.as_str()]);

        let mut store = NamespaceStore::new(settings.bucket_bits);
        store.load(&settings, NAMESPACE_DEFAULT, None)?;

        let mut engine = Engine {
            settings,
            store,
            hooks,
            iid,
            _index_lock: index_lock,
            _data_lock: data_lock,
        };

        engine.scanload();
        engine.hooks.fire("ready", &[]);

        Ok(engine)
    }

    /// Loads every subdirectory of the index root that carries a valid
    /// namespace name. Failures are logged and skipped: one broken
    /// namespace must not take the instance down.
    fn scanload(&mut self) {
        let entries = match std::fs::read_dir(&self.settings.indexpath) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "namespaces: cannot scan index root");
                return;
            }
        };

        let mut loaded = 0usize;

        for entry in entries.flatten() {
            if !entry.file_type().is_ok_and(|ft| ft.is_dir()) {
                continue;
            }

            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !valid_name(name) {
                continue;
            }

            tracing::debug!(namespace = name, "namespaces: extra found");

            match self.store.load(&self.settings, name, None) {
                Ok(_) => loaded += 1,
                Err(e) => {
                    tracing::warn!(namespace = name, error = %e, "namespaces: load failed, skipping");
                }
            }
        }

        tracing::info!(loaded, "namespaces: extra namespaces loaded");
    }

    /// The random per-boot instance id.
    pub fn instance_id(&self) -> u32 {
        self.iid
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Fsyncs every namespace's active files. Meant for the signal-handling
    /// path of the serving daemon; errors are logged, never propagated.
    pub fn emergency(&mut self) {
        let Engine { store, hooks, .. } = self;

        for ns in store.iter_mut() {
            tracing::info!(namespace = %ns.name(), "namespaces: flushing");

            let index_file = ns.index.active_path().to_string_lossy().into_owned();
            let data_file = ns.data.active_path().to_string_lossy().into_owned();
            hooks.fire(
                "namespace-closing",
                &[ns.name(), index_file.as_str(), data_file.as_str()],
            );

            // only flush data if the index accepted the flush; a refusal
            // means the namespace never finished initializing
            if ns.index.emergency() {
                ns.data.emergency();
            }
        }
    }

    /// Fires the `crash` hook and syncs everything.
    pub fn crashed(&mut self) {
        self.hooks.fire("crash", &[]);
        self.emergency();
    }

    /// Reaps finished hook children; call between commands.
    pub fn hooks_cleanup(&mut self) {
        self.hooks.cleanup();
    }

    /// Graceful shutdown: sync, fire `close`, release the locks.
    pub fn close(mut self) {
        tracing::info!("engine: closing");
        self.emergency();
        self.hooks.fire("close", &[]);
    }

    /// Statistics of one namespace.
    pub fn namespace_stats(&self, ns: NamespaceId) -> Option<IndexStats> {
        self.store.get(ns).map(Namespace::stats)
    }

    /// Aggregated instance statistics.
    pub fn stats(&self) -> EngineStats {
        let mut stats = EngineStats::default();

        for ns in self.store.iter() {
            stats.namespaces += 1;
            stats.entries += ns.index.stats().entries;
            stats.datasize += ns.index.stats().datasize;
            stats.index_io.merge(ns.index.io_stats());
            stats.data_io.merge(ns.data.stats());
        }

        stats
    }
}

/// Random instance id, greater than zero, regenerated on every boot.
fn generate_instance_id() -> u32 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.subsec_nanos());

    let mixed = nanos.wrapping_mul(2_654_435_761) ^ std::process::id();
    (mixed % (1 << 30)) + 1
}
