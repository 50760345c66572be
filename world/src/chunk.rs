use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use arc_swap::ArcSwap;
use cgmath::{MetricSpace, Point3};
use crossbeam::{atomic::AtomicCell, channel};
use parking_lot::Mutex;

use terra_util::{convert_bounds, Bounds};
use terra_voxels::{index_utils, persistence, ChunkVoxels, LightingBuffer, Voxel, VoxelGrid};

use crate::geometry::{BufferHandle, ChunkGeometry};

/// One resident chunk: its voxels, its sunlight and its geometry, plus the bookkeeping the store
/// needs to schedule work on it.
///
/// The voxel grid is the only part guarded by a lock. Sunlight and geometry are immutable
/// snapshots behind atomically swapped pointers, and everything else is a single atomic flag.
pub struct Chunk {
    coord: Point3<i64>,
    voxels: VoxelGrid,
    sunlight: ArcSwap<LightingBuffer>,
    geometry: Arc<ChunkGeometry>,

    lighting_dirty: Arc<AtomicCell<bool>>,
    lighting_in_flight: AtomicCell<bool>,
    build_in_flight: AtomicCell<bool>,
    in_flight: AtomicCell<usize>,
    evicted: AtomicCell<bool>,
    visible: AtomicCell<bool>,

    save_lock: Mutex<()>,
}

/// Held by a background task for as long as it works on a chunk.
pub struct ChunkTask<'a> {
    chunk: &'a Chunk,
}

impl Chunk {
    pub fn new(
        coord: Point3<i64>,
        voxels: ChunkVoxels,
        release_sender: channel::Sender<BufferHandle>,
    ) -> Self {
        let geometry = Arc::new(ChunkGeometry::new(release_sender));
        let lighting_dirty = Arc::new(AtomicCell::new(true));

        // every voxel write invalidates this chunk's mesh and sunlight
        let on_modified = {
            let geometry = geometry.clone();
            let lighting_dirty = lighting_dirty.clone();
            Box::new(move || {
                geometry.mark_dirty();
                lighting_dirty.store(true);
            })
        };

        Self {
            coord,
            voxels: VoxelGrid::with_hook(voxels, on_modified),
            sunlight: ArcSwap::from_pointee(LightingBuffer::full()),
            geometry,
            lighting_dirty,
            lighting_in_flight: AtomicCell::new(false),
            build_in_flight: AtomicCell::new(false),
            in_flight: AtomicCell::new(0),
            evicted: AtomicCell::new(false),
            visible: AtomicCell::new(true),
            save_lock: Mutex::new(()),
        }
    }

    #[inline]
    pub fn coord(&self) -> Point3<i64> {
        self.coord
    }

    #[inline]
    pub fn min_corner(&self) -> Point3<i64> {
        index_utils::chunk_min_corner(self.coord)
    }

    pub fn bounds(&self) -> Bounds<f64> {
        convert_bounds!(
            Bounds::new(self.min_corner(), index_utils::chunk_size()),
            f64
        )
    }

    /// World-space corners, for frustum culling.
    pub fn corners(&self) -> [Point3<f64>; 8] {
        self.bounds().corners()
    }

    /// Distance from `point` to the center of the chunk.
    pub fn distance_to(&self, point: Point3<f64>) -> f64 {
        chunk_distance(self.coord, point)
    }

    #[inline]
    pub fn voxels(&self) -> &VoxelGrid {
        &self.voxels
    }

    /// Reads one voxel by world position. Panics if the position is outside this chunk.
    pub fn voxel_at(&self, world_pos: Point3<i64>) -> Voxel {
        let (chunk_pos, local) = index_utils::to_chunk_pos(world_pos);
        assert_eq!(chunk_pos, self.coord, "voxel {:?} is not in chunk", world_pos);
        self.voxels.read_scope(|voxels| voxels.get_voxel(local))
    }

    /// Writes one voxel by world position. Panics if the position is outside this chunk.
    pub fn set_voxel_at(&self, world_pos: Point3<i64>, voxel: Voxel) {
        let (chunk_pos, local) = index_utils::to_chunk_pos(world_pos);
        assert_eq!(chunk_pos, self.coord, "voxel {:?} is not in chunk", world_pos);
        self.voxels
            .write_scope(|voxels| voxels.set_voxel(local, voxel));
    }

    pub fn sunlight(&self) -> Arc<LightingBuffer> {
        self.sunlight.load_full()
    }

    /// Publishes new sunlight. Returns whether it differs from what was there before.
    pub fn replace_sunlight(&self, sunlight: LightingBuffer) -> bool {
        if **self.sunlight.load() == sunlight {
            return false;
        }
        self.sunlight.store(Arc::new(sunlight));
        true
    }

    #[inline]
    pub fn geometry(&self) -> &Arc<ChunkGeometry> {
        &self.geometry
    }

    pub fn is_lighting_dirty(&self) -> bool {
        self.lighting_dirty.load()
    }

    pub fn mark_lighting_dirty(&self) {
        self.lighting_dirty.store(true);
    }

    pub fn is_lighting_in_flight(&self) -> bool {
        self.lighting_in_flight.load()
    }

    /// Claims the chunk for a lighting pass. Fails if sunlight is already current or a pass is
    /// already running; on success the dirty flag is cleared, so that edits made while the pass
    /// runs schedule another one.
    pub(crate) fn begin_lighting(&self) -> bool {
        if !self.lighting_dirty.load() {
            return false;
        }
        if self.lighting_in_flight.compare_exchange(false, true).is_err() {
            return false;
        }
        self.lighting_dirty.store(false);
        true
    }

    pub(crate) fn finish_lighting(&self) {
        self.lighting_in_flight.store(false);
    }

    pub fn is_build_in_flight(&self) -> bool {
        self.build_in_flight.load()
    }

    pub(crate) fn begin_build(&self) -> bool {
        self.build_in_flight.compare_exchange(false, true).is_ok()
    }

    pub(crate) fn finish_build(&self) {
        self.build_in_flight.store(false);
    }

    /// Number of background tasks currently working on this chunk.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load()
    }

    pub(crate) fn begin_task(&self) -> ChunkTask<'_> {
        self.in_flight.fetch_add(1);
        ChunkTask { chunk: self }
    }

    /// True once the store has let go of this chunk. Background tasks still holding a reference
    /// discard their results.
    pub fn is_evicted(&self) -> bool {
        self.evicted.load()
    }

    pub(crate) fn mark_evicted(&self) {
        self.evicted.store(true);
    }

    pub fn is_visible(&self) -> bool {
        self.visible.load()
    }

    pub fn set_visible(&self, visible: bool) {
        self.visible.store(visible);
    }

    /// True when the voxels differ from what was last saved.
    pub fn needs_save(&self) -> bool {
        self.voxels.is_dirty()
    }

    /// True when sunlight and geometry are both current and nothing is working on them.
    pub fn is_settled(&self) -> bool {
        !self.is_lighting_dirty()
            && !self.is_lighting_in_flight()
            && !self.is_build_in_flight()
            && !self.geometry.is_dirty()
    }

    /// Writes the voxels to `folder` if they changed since the last save. Saves of one chunk never
    /// overlap, and the data written is a copy taken inside a single read scope. A failed save
    /// leaves the chunk dirty. Returns whether anything was written.
    pub fn save(&self, folder: &Path) -> Result<bool> {
        let _save_guard = self.save_lock.lock();

        let snapshot = self.voxels.read_scope_taking_dirty(|voxels, dirty| {
            if dirty {
                Some(voxels.clone())
            } else {
                None
            }
        });

        let voxels = match snapshot {
            Some(voxels) => voxels,
            None => return Ok(false),
        };

        if let Err(err) = persistence::save_voxels(folder, self.min_corner(), &voxels) {
            self.voxels.mark_dirty();
            return Err(err.context(format!("Saving chunk {:?}", self.coord)));
        }

        metrics::counter!("world.chunks.saved", 1);
        Ok(true)
    }
}

/// Distance from `point` to the center of the chunk at `coord`, resident or not.
pub fn chunk_distance(coord: Point3<i64>, point: Point3<f64>) -> f64 {
    let half = index_utils::CHUNK_SIZE as f64 / 2.;
    let min_corner = index_utils::chunk_min_corner(coord);
    let center = Point3::new(
        min_corner.x as f64 + half,
        min_corner.y as f64 + half,
        min_corner.z as f64 + half,
    );
    center.distance(point)
}

impl Drop for ChunkTask<'_> {
    fn drop(&mut self) {
        self.chunk.in_flight.fetch_sub(1);
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("coord", &self.coord)
            .field("voxels", &self.voxels)
            .field("lighting_dirty", &self.lighting_dirty.load())
            .field("geometry", &self.geometry)
            .field("in_flight", &self.in_flight.load())
            .field("evicted", &self.evicted.load())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::test_util;

    fn test_chunk(coord: Point3<i64>) -> Chunk {
        let (sender, _receiver) = channel::unbounded();
        Chunk::new(coord, ChunkVoxels::empty(), sender)
    }

    #[test]
    fn test_edit_marks_geometry_and_lighting_dirty() {
        let chunk = test_chunk(Point3::new(1, 0, -1));
        assert!(chunk.begin_lighting());
        chunk.finish_lighting();
        chunk.geometry().clear_dirty_for_test();
        assert!(chunk.is_settled());
        assert!(!chunk.needs_save());

        chunk.set_voxel_at(Point3::new(40, 3, -20), Voxel::from_u16(2));

        assert!(chunk.is_lighting_dirty());
        assert!(chunk.geometry().is_dirty());
        assert!(chunk.needs_save());
        assert_eq!(chunk.voxel_at(Point3::new(40, 3, -20)), Voxel::from_u16(2));
    }

    #[test]
    #[should_panic]
    fn test_voxel_outside_chunk_panics() {
        test_chunk(Point3::new(0, 0, 0)).voxel_at(Point3::new(32, 0, 0));
    }

    #[test]
    fn test_lighting_claim() {
        let chunk = test_chunk(Point3::new(0, 0, 0));
        assert!(chunk.begin_lighting());
        // already running
        chunk.mark_lighting_dirty();
        assert!(!chunk.begin_lighting());
        chunk.finish_lighting();
        assert!(chunk.begin_lighting());
        chunk.finish_lighting();
        // clean
        assert!(!chunk.begin_lighting());
    }

    #[test]
    fn test_replace_sunlight_reports_change() {
        let chunk = test_chunk(Point3::new(0, 0, 0));
        assert!(!chunk.replace_sunlight(LightingBuffer::full()));
        assert!(chunk.replace_sunlight(LightingBuffer::dark()));
        assert_eq!(*chunk.sunlight(), LightingBuffer::dark());
    }

    #[test]
    fn test_task_count() {
        let chunk = test_chunk(Point3::new(0, 0, 0));
        {
            let _a = chunk.begin_task();
            let _b = chunk.begin_task();
            assert_eq!(chunk.in_flight(), 2);
        }
        assert_eq!(chunk.in_flight(), 0);
    }

    #[test]
    fn test_save_only_when_dirty() {
        let dir = test_util::scratch_dir("chunk_save");
        let chunk = test_chunk(Point3::new(-1, 2, 0));

        assert!(!chunk.save(&dir).unwrap());
        assert!(!persistence::voxel_data_path(&dir, chunk.min_corner()).exists());

        chunk.set_voxel_at(Point3::new(-30, 64, 5), Voxel::from_u16(3));
        assert!(chunk.save(&dir).unwrap());
        assert!(!chunk.needs_save());
        assert!(!chunk.save(&dir).unwrap());

        let loaded = persistence::load_voxels(&dir, chunk.min_corner()).unwrap();
        assert_eq!(loaded.get_voxel(Point3::new(2, 0, 5)), Voxel::from_u16(3));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_failed_save_stays_dirty() {
        let dir = test_util::scratch_dir("chunk_save_fail");
        let missing = dir.join("does_not_exist");
        let chunk = test_chunk(Point3::new(0, 0, 0));
        chunk.set_voxel_at(Point3::new(1, 1, 1), Voxel::from_u16(1));

        assert!(chunk.save(&missing).is_err());
        assert!(chunk.needs_save());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_corners() {
        let chunk = test_chunk(Point3::new(1, -1, 0));
        let corners = chunk.corners();
        assert_eq!(corners[0], Point3::new(32., -32., 0.));
        assert_eq!(corners[7], Point3::new(64., 0., 32.));
        assert_eq!(chunk.distance_to(Point3::new(48., -16., 16.)), 0.);
    }
}
