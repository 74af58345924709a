//! Durable backing copy of the last installed snapshot.
//!
//! Storage is only consulted to seed the manager on startup and as a fallback when a live fetch
//! fails. The in-memory snapshot held by the manager stays authoritative.
use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Mutex, RwLock},
};

use tempfile::NamedTempFile;

use crate::{snapshot::Snapshot, Error, Result};

/// Pluggable storage for a serialized [`Snapshot`].
pub trait SnapshotStorage: Send + Sync {
    /// Atomically replace the stored snapshot.
    fn save(&self, snapshot: &Snapshot) -> Result<()>;

    /// Load the stored snapshot. Returns `Ok(None)` if nothing has been saved yet.
    fn load(&self) -> Result<Option<Snapshot>>;

    /// Remove the stored snapshot. Clearing an empty storage succeeds.
    fn clear(&self) -> Result<()>;
}

/// Process-lifetime storage.
#[derive(Default)]
pub struct InMemorySnapshotStorage {
    snapshot: RwLock<Option<Snapshot>>,
}

impl InMemorySnapshotStorage {
    #[allow(missing_docs)]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStorage for InMemorySnapshotStorage {
    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let snapshot = Some(snapshot.clone());
        *self.snapshot.write().expect("thread holding snapshot lock should not panic") = snapshot;
        Ok(())
    }

    fn load(&self) -> Result<Option<Snapshot>> {
        Ok(self
            .snapshot
            .read()
            .expect("thread holding snapshot lock should not panic")
            .clone())
    }

    fn clear(&self) -> Result<()> {
        *self.snapshot.write().expect("thread holding snapshot lock should not panic") = None;
        Ok(())
    }
}

/// Stores the snapshot as one JSON document inside a dedicated directory.
///
/// The directory is created on first save. Every write goes to its own temporary file in the same
/// directory that is then renamed over the previous snapshot, so a failed write never corrupts a
/// good file and concurrent writers (other instances or processes) never share a temporary file.
pub struct FileSnapshotStorage {
    dir: PathBuf,
    /// Orders save and clear within this instance. Readers only ever see a complete file.
    write_lock: Mutex<()>,
}

impl FileSnapshotStorage {
    /// Name of the snapshot document inside the storage directory.
    pub const FILE_NAME: &'static str = "snapshot.json";

    /// Create a storage rooted at `dir`. Nothing touches the filesystem until the first call.
    pub fn new(dir: impl Into<PathBuf>) -> FileSnapshotStorage {
        FileSnapshotStorage {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Storage directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Full path of the snapshot document.
    pub fn path(&self) -> PathBuf {
        self.dir.join(Self::FILE_NAME)
    }
}

impl SnapshotStorage for FileSnapshotStorage {
    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        // Serialize before taking the lock to minimize lock span.
        let data = serde_json::to_vec(snapshot)
            .map_err(|err| Error::persistence("failed to serialize snapshot", err))?;

        let _guard = self
            .write_lock
            .lock()
            .expect("thread holding storage lock should not panic");

        std::fs::create_dir_all(&self.dir)
            .map_err(|err| Error::persistence("failed to create storage directory", err))?;

        let mut tmp_file = NamedTempFile::new_in(&self.dir)
            .map_err(|err| Error::persistence("failed to create temporary snapshot file", err))?;
        tmp_file
            .write_all(&data)
            .map_err(|err| Error::persistence("failed to write snapshot file", err))?;
        tmp_file
            .persist(self.path())
            .map_err(|err| Error::persistence("failed to replace snapshot file", err.error))?;

        log::debug!(target: "flagent",
                    path:? = self.path(),
                    flags = snapshot.len();
                    "saved snapshot");
        Ok(())
    }

    fn load(&self) -> Result<Option<Snapshot>> {
        let data = match std::fs::read(self.path()) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Error::persistence("failed to read snapshot file", err)),
        };

        let snapshot = serde_json::from_slice(&data)
            .map_err(|err| Error::persistence("failed to parse snapshot file", err))?;
        Ok(Some(snapshot))
    }

    fn clear(&self) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .expect("thread holding storage lock should not panic");

        match std::fs::remove_file(self.path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::persistence("failed to remove snapshot file", err)),
        }
    }
}
