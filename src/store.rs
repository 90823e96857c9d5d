//! Persistence seam and the in-memory reference backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;

use crate::cell::CellPos;
use crate::error::StoreError;
use crate::stage::StageId;

/// What persistence keeps per cell: the stage the content had reached and
/// its serialized form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedCell {
    pub stage: StageId,
    pub data: Bytes,
}

/// Lazily-started disk read shared by every driver of one record. Read
/// failures have already been degraded to `None` by the time this resolves;
/// the cell then simply regenerates from scratch.
pub type SharedLoad = Shared<BoxFuture<'static, Option<Arc<SavedCell>>>>;

/// Asynchronous cell persistence.
///
/// Implementations must tolerate concurrent reads of different cells. The
/// scheduler itself guarantees at most one in-flight write per cell.
pub trait RegionStore: Send + Sync {
    fn read(&self, cell: CellPos) -> BoxFuture<'static, Result<Option<SavedCell>, StoreError>>;

    fn write(&self, cell: CellPos, state: SavedCell) -> BoxFuture<'static, Result<(), StoreError>>;
}

/// Hash-map backend for tests and tooling. Clones share the same storage.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    cells: Mutex<HashMap<u64, SavedCell>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a cell as if a previous run had saved it.
    pub fn seed(&self, cell: CellPos, state: SavedCell) {
        self.inner
            .cells
            .lock()
            .expect("memory store mutex poisoned")
            .insert(cell.key(), state);
    }

    pub fn saved(&self, cell: CellPos) -> Option<SavedCell> {
        self.inner
            .cells
            .lock()
            .expect("memory store mutex poisoned")
            .get(&cell.key())
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner
            .cells
            .lock()
            .expect("memory store mutex poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read_count(&self) -> u64 {
        self.inner.reads.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.inner.writes.load(Ordering::Relaxed)
    }
}

impl RegionStore for MemoryStore {
    fn read(&self, cell: CellPos) -> BoxFuture<'static, Result<Option<SavedCell>, StoreError>> {
        let inner = Arc::clone(&self.inner);
        async move {
            inner.reads.fetch_add(1, Ordering::Relaxed);
            let saved = inner
                .cells
                .lock()
                .expect("memory store mutex poisoned")
                .get(&cell.key())
                .cloned();
            Ok(saved)
        }
        .boxed()
    }

    fn write(&self, cell: CellPos, state: SavedCell) -> BoxFuture<'static, Result<(), StoreError>> {
        let inner = Arc::clone(&self.inner);
        async move {
            inner.writes.fetch_add(1, Ordering::Relaxed);
            inner
                .cells
                .lock()
                .expect("memory store mutex poisoned")
                .insert(cell.key(), state);
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(stage: u8, data: &'static [u8]) -> SavedCell {
        SavedCell {
            stage: StageId(stage),
            data: Bytes::from_static(data),
        }
    }

    #[tokio::test]
    async fn test_read_back_what_was_written() {
        let store = MemoryStore::new();
        let cell = CellPos::new(4, -2);
        assert_eq!(store.read(cell).await.unwrap(), None);

        store.write(cell, state(2, b"hills")).await.unwrap();
        assert_eq!(store.read(cell).await.unwrap(), Some(state(2, b"hills")));
        assert_eq!(store.write_count(), 1);
        assert_eq!(store.read_count(), 2);
    }

    #[tokio::test]
    async fn test_clones_share_storage() {
        let store = MemoryStore::new();
        let clone = store.clone();
        store.seed(CellPos::new(0, 0), state(1, b"seeded"));
        assert_eq!(clone.saved(CellPos::new(0, 0)), Some(state(1, b"seeded")));
        assert_eq!(clone.len(), 1);
    }
}
