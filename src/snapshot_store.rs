use std::sync::{Arc, RwLock};

use crate::snapshot::Snapshot;

/// `SnapshotStore` holds the currently installed snapshot and allows concurrent access for
/// readers and writers.
///
/// Readers only ever get a complete snapshot: a new one is assembled outside of the lock and
/// swapped in as a whole.
pub(crate) struct SnapshotStore {
    snapshot: RwLock<Option<Arc<Snapshot>>>,
}

impl SnapshotStore {
    pub(crate) fn new() -> Self {
        Self {
            snapshot: RwLock::new(None),
        }
    }

    pub(crate) fn get_snapshot(&self) -> Option<Arc<Snapshot>> {
        // self.snapshot.read() should always return Ok(). Err() is possible only if the lock is
        // poisoned (writer panicked while holding the lock), which should never happen. Still,
        // using .ok()? here to not crash the app.
        let snapshot = self.snapshot.read().ok()?;
        snapshot.clone()
    }

    /// Install a new snapshot, returning the previous one.
    pub(crate) fn set_snapshot(
        &self,
        snapshot: impl Into<Arc<Snapshot>>,
    ) -> Option<Arc<Snapshot>> {
        // Constructing new value before requesting the lock to minimize lock span.
        let new_value = Some(snapshot.into());

        let mut snapshot_slot = self.snapshot.write().ok()?;
        std::mem::replace(&mut snapshot_slot, new_value)
    }

    /// Drop the current snapshot, returning it.
    pub(crate) fn clear(&self) -> Option<Arc<Snapshot>> {
        self.snapshot.write().ok()?.take()
    }
}
