use crossbeam::atomic::AtomicCell;
use parking_lot::{RwLock, RwLockReadGuard};

use crate::core::ChunkVoxels;

/// Called while the writer lock is still held, after every write scope.
pub type ModifiedHook = Box<dyn Fn() + Send + Sync>;

/// The voxels of one chunk behind a reader/writer lock. All access goes through `read_scope` or
/// `write_scope`; the guards handed out by `read_lock`/`try_read_lock` exist only so that a
/// neighborhood can hold several grids at once in a fixed order.
pub struct VoxelGrid {
    voxels: RwLock<ChunkVoxels>,
    dirty: AtomicCell<bool>,
    on_modified: Option<ModifiedHook>,
}

impl VoxelGrid {
    pub fn new(voxels: ChunkVoxels) -> Self {
        Self {
            voxels: RwLock::new(voxels),
            dirty: AtomicCell::new(false),
            on_modified: None,
        }
    }

    pub fn with_hook(voxels: ChunkVoxels, on_modified: ModifiedHook) -> Self {
        Self {
            voxels: RwLock::new(voxels),
            dirty: AtomicCell::new(false),
            on_modified: Some(on_modified),
        }
    }

    /// Runs `f` with shared access. Any number of readers may run at once; writers wait.
    pub fn read_scope<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&ChunkVoxels) -> R,
    {
        let voxels = self.voxels.read();
        f(&voxels)
    }

    /// Runs `f` with exclusive access, then marks the grid dirty and runs the modification hook
    /// before the lock is released.
    pub fn write_scope<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut ChunkVoxels) -> R,
    {
        let mut voxels = self.voxels.write();
        let result = f(&mut voxels);
        self.voxel_data_was_modified();
        drop(voxels);
        result
    }

    /// Runs `f` with shared access and hands it the current dirty flag, clearing the flag while
    /// the reader lock is still held. No write can land between the copy and the clear.
    pub fn read_scope_taking_dirty<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&ChunkVoxels, bool) -> R,
    {
        let voxels = self.voxels.read();
        let was_dirty = self.dirty.swap(false);
        f(&voxels, was_dirty)
    }

    pub fn read_lock(&self) -> RwLockReadGuard<'_, ChunkVoxels> {
        self.voxels.read()
    }

    pub fn try_read_lock(&self) -> Option<RwLockReadGuard<'_, ChunkVoxels>> {
        self.voxels.try_read()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load()
    }

    /// Marks the grid as differing from what is on disk without touching the voxels, e.g. after
    /// a failed save or for freshly generated data.
    pub fn mark_dirty(&self) {
        self.dirty.store(true);
    }

    fn voxel_data_was_modified(&self) {
        self.dirty.store(true);
        if let Some(on_modified) = &self.on_modified {
            on_modified();
        }
    }
}

impl std::fmt::Debug for VoxelGrid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoxelGrid")
            .field("dirty", &self.dirty.load())
            .finish()
    }
}
