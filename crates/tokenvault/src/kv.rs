//! Pluggable persistence for per-account records.
//!
//! Components never touch the filesystem directly; they read and replace whole records
//! through a [`KvStore`] handed to them at construction.
use crate::{errors::VaultError, fsutil, paths::VaultPaths};
use fs2::FileExt;
use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt as _;

pub type StoreResult<T> = Result<T, VaultError>;

fn lock_error<T>(_: PoisonError<T>) -> VaultError {
    VaultError::StorageUnavailable("store lock poisoned".into())
}

/// What an [`KvStore::update`] closure wants done with the value it was shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    Keep,
    Put(Vec<u8>),
    Remove,
}

/// Opaque key-value store scoped to the plugin.
///
/// Keys are `/`-separated composite keys such as `vault/1/0xabc...`. Values are whole records;
/// callers always replace the full value, never patch part of it.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Read-modify-write of one key. No other writer touches the store between the read
    /// handed to `f` and the write it asks for.
    fn update(
        &self,
        key: &str,
        f: &mut dyn FnMut(Option<Vec<u8>>) -> eyre::Result<Update>,
    ) -> eyre::Result<()>;
}

/// In-process store. Used by tests and `serve --ephemeral`.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    map: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.map.lock().map_err(lock_error)?.get(key).cloned())
    }

    fn update(
        &self,
        key: &str,
        f: &mut dyn FnMut(Option<Vec<u8>>) -> eyre::Result<Update>,
    ) -> eyre::Result<()> {
        let mut map = self.map.lock().map_err(lock_error)?;
        match f(map.get(key).cloned())? {
            Update::Keep => {}
            Update::Put(v) => {
                map.insert(key.to_owned(), v);
            }
            Update::Remove => {
                map.remove(key);
            }
        }
        Ok(())
    }
}

/// One JSON file per key under `<data_dir>/records`, written atomically with private perms.
///
/// Every `update` holds an exclusive lock on `<data_dir>/tokenvault.lock` from read to write,
/// so read-modify-write cycles are serialized across processes.
#[derive(Debug, Clone)]
pub struct FileKvStore {
    root: PathBuf,
    lock_path: PathBuf,
}

impl FileKvStore {
    pub fn open(paths: &VaultPaths) -> StoreResult<Self> {
        let root = paths.records_dir();
        fsutil::ensure_private_dir(&root).map_err(|e| VaultError::storage(format!("{e:#}")))?;
        Ok(Self {
            root,
            lock_path: paths.lock_path(),
        })
    }

    fn path_for(&self, key: &str) -> StoreResult<PathBuf> {
        let mut p = self.root.clone();
        for seg in key.split('/') {
            let valid = !seg.is_empty()
                && seg
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-'));
            if !valid {
                return Err(VaultError::StorageUnavailable(format!(
                    "invalid store key: {key}"
                )));
            }
            p.push(seg);
        }
        p.set_extension("json");
        Ok(p)
    }

    fn write_lock(&self) -> StoreResult<File> {
        let mut oo = OpenOptions::new();
        oo.create(true).read(true).write(true).truncate(false);
        #[cfg(unix)]
        {
            oo.mode(fsutil::MODE_FILE_PRIVATE);
        }
        let f = oo.open(&self.lock_path).map_err(VaultError::storage)?;
        f.lock_exclusive().map_err(VaultError::storage)?;
        Ok(f)
    }

    fn update_locked(
        &self,
        p: &Path,
        f: &mut dyn FnMut(Option<Vec<u8>>) -> eyre::Result<Update>,
    ) -> eyre::Result<()> {
        let current =
            fsutil::read_private(p).map_err(|e| VaultError::storage(format!("{e:#}")))?;
        match f(current)? {
            Update::Keep => {}
            Update::Put(v) => fsutil::write_atomic_private(p, &v)
                .map_err(|e| VaultError::storage(format!("{e:#}")))?,
            Update::Remove => {
                fsutil::remove_if_exists(p).map_err(|e| VaultError::storage(format!("{e:#}")))?;
            }
        }
        Ok(())
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let p = self.path_for(key)?;
        fsutil::read_private(&p).map_err(|e| VaultError::storage(format!("{e:#}")))
    }

    fn update(
        &self,
        key: &str,
        f: &mut dyn FnMut(Option<Vec<u8>>) -> eyre::Result<Update>,
    ) -> eyre::Result<()> {
        let p = self.path_for(key)?;
        let lock = self.write_lock()?;
        let res = self.update_locked(&p, f);
        drop(FileExt::unlock(&lock));
        res
    }
}
