//! The chunk store: owns every resident chunk and keeps the set of resident chunks matched to the
//! region around the observer.
//!
//! Only the thread calling `update` and `draw_chunks` changes the chunk map. Loading, generation,
//! lighting, meshing and background saves run on the worker pool and report back through a
//! completion channel that `update` drains. Neither call ever waits for a background task.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use cgmath::{InnerSpace, Point3, Vector3};
use crossbeam::{atomic::AtomicCell, channel};
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use terra_util::ray::Ray;
use terra_util::{Bounds, OrdFloat, PoolSettings, TaskGroup, WorkerPool};
use terra_voxels::{index_utils, Face, Voxel, VoxelConfigHelper, VoxelDelta, VoxelRaycastHit};

use crate::chunk::{self, Chunk};
use crate::geometry::{BufferHandle, ChunkRenderer};
use crate::neighborhood::Neighborhood;
use crate::tasks::{self, ChunkSource, LoadRequest, TaskCompletion};
use crate::terrain::TerrainGenerator;

type ChunkMap = HashMap<Point3<i64>, Arc<Chunk>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// How many chunks around the observer's chunk the active region reaches along each axis.
    pub active_region_extent: Vector3<i64>,
    /// The most chunks kept resident. The nearest ones win.
    pub max_active_chunks: usize,
    /// Renderer buffers (re)generated per `draw_chunks` call.
    pub vbo_generations_per_frame: usize,
    /// Mesh builds handed to the worker pool per `update` call.
    pub geometry_builds_per_update: usize,
    /// How far away voxels can be edited from.
    pub max_edit_distance: f64,
    pub pool: PoolSettings,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            active_region_extent: Vector3::new(4, 2, 4),
            max_active_chunks: 256,
            vbo_generations_per_frame: 8,
            geometry_builds_per_update: 16,
            max_edit_distance: 64.,
            pool: PoolSettings::default(),
        }
    }
}

/// What the store knows about the observer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraState {
    pub position: Point3<f64>,
    pub look_at_dir: Vector3<f64>,
    /// False if the camera is known not to have moved since the previous update.
    pub modified: bool,
}

/// Work started and finished during one `update` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateStats {
    pub loads_enqueued: usize,
    pub evicted: usize,
    pub lighting_scheduled: usize,
    pub builds_scheduled: usize,
    pub completions: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrawStats {
    pub drawn: usize,
    pub generated: usize,
    pub released: usize,
}

pub struct ChunkStore {
    settings: StoreSettings,
    folder: PathBuf,
    generator: Arc<dyn TerrainGenerator>,
    voxel_helper: Arc<VoxelConfigHelper>,

    chunks: RwLock<ChunkMap>,
    /// Coordinates with a load in flight, and the epoch of the request that will be accepted.
    pending_loads: HashMap<Point3<i64>, u64>,
    next_epoch: u64,
    /// Every coordinate of the current active region.
    active_region: HashSet<Point3<i64>>,
    /// Loads that failed with an I/O error, retried on the next update.
    failed_loads: Vec<Point3<i64>>,

    pool: WorkerPool,
    saves: TaskGroup,
    stopping: Arc<AtomicCell<bool>>,
    completion_sender: channel::Sender<TaskCompletion>,
    completion_receiver: channel::Receiver<TaskCompletion>,
    release_sender: channel::Sender<BufferHandle>,
    release_receiver: channel::Receiver<BufferHandle>,

    center_chunk: Option<Point3<i64>>,
    camera: Option<CameraState>,
    placement_voxel: Voxel,
    shut_down: bool,
}

impl UpdateStats {
    /// True if the update started no new work.
    pub fn is_quiet(&self) -> bool {
        self.loads_enqueued == 0
            && self.evicted == 0
            && self.lighting_scheduled == 0
            && self.builds_scheduled == 0
    }
}

impl ChunkStore {
    /// Creates an empty store saving chunks to `folder`, which is created if necessary.
    pub fn new(
        settings: StoreSettings,
        folder: PathBuf,
        generator: Arc<dyn TerrainGenerator>,
        voxel_helper: Arc<VoxelConfigHelper>,
    ) -> Result<Self> {
        if settings.max_active_chunks == 0 {
            bail!("max_active_chunks must be at least 1");
        }
        if settings.active_region_extent.x < 0
            || settings.active_region_extent.y < 0
            || settings.active_region_extent.z < 0
        {
            bail!(
                "Active region extent must not be negative: {:?}",
                settings.active_region_extent
            );
        }

        fs::create_dir_all(&folder)
            .with_context(|| format!("Creating save folder {}", folder.display()))?;

        let pool = WorkerPool::new("chunk_worker", settings.pool.clone())?;
        let (completion_sender, completion_receiver) = channel::unbounded();
        let (release_sender, release_receiver) = channel::unbounded();

        let placement_voxel = Voxel::from_u16(1);
        let placement_voxel = if voxel_helper.is_known(placement_voxel) {
            placement_voxel
        } else {
            Voxel::air()
        };

        info!("Chunk store saving to {}", folder.display());

        Ok(Self {
            settings,
            folder,
            generator,
            voxel_helper,
            chunks: RwLock::new(HashMap::new()),
            pending_loads: HashMap::new(),
            next_epoch: 0,
            active_region: HashSet::new(),
            failed_loads: Vec::new(),
            pool,
            saves: TaskGroup::new(),
            stopping: Arc::new(AtomicCell::new(false)),
            completion_sender,
            completion_receiver,
            release_sender,
            release_receiver,
            center_chunk: None,
            camera: None,
            placement_voxel,
            shut_down: false,
        })
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn voxel_helper(&self) -> &VoxelConfigHelper {
        &self.voxel_helper
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.read().len()
    }

    pub fn pending_load_count(&self) -> usize {
        self.pending_loads.len()
    }

    /// Every resident chunk, ordered by coordinate.
    pub fn chunks(&self) -> Vec<Arc<Chunk>> {
        let mut chunks: Vec<_> = self.chunks.read().values().cloned().collect();
        chunks.sort_by_key(|chunk| coord_key(chunk.coord()));
        chunks
    }

    pub fn get_chunk(&self, coord: Point3<i64>) -> Option<Arc<Chunk>> {
        self.chunks.read().get(&coord).cloned()
    }

    /// The resident chunk containing a world position. `None` means the chunk is not loaded; it
    /// is never loaded on demand.
    pub fn get_chunk_at(&self, position: Point3<f64>) -> Option<Arc<Chunk>> {
        self.get_chunk(index_utils::chunk_containing(position))
    }

    /// Number of background jobs that returned an error.
    pub fn failed_tasks(&self) -> usize {
        self.pool.count_failed()
    }

    /// True when nothing is loading, no completions are waiting and every resident chunk has
    /// current sunlight and geometry.
    pub fn is_idle(&self) -> bool {
        self.pending_loads.is_empty()
            && self.failed_loads.is_empty()
            && self.completion_receiver.is_empty()
            && self
                .chunks
                .read()
                .values()
                .all(|chunk| chunk.is_settled() && chunk.in_flight() == 0)
    }

    pub fn placement_voxel(&self) -> Voxel {
        self.placement_voxel
    }

    pub fn set_placement_voxel(&mut self, voxel: Voxel) -> Result<()> {
        if !self.voxel_helper.is_known(voxel) {
            bail!("Cannot place unknown voxel type {}", voxel.to_u16());
        }
        self.placement_voxel = voxel;
        Ok(())
    }

    /// Advances the store by one frame: takes in finished background work, moves the active
    /// region if the observer changed chunks, and schedules lighting and mesh builds.
    pub fn update(&mut self, _elapsed: f64, camera: &CameraState) -> Result<UpdateStats> {
        if self.shut_down {
            bail!("Updating a chunk store that has been shut down");
        }

        let mut stats = UpdateStats::default();
        self.camera = Some(*camera);

        stats.completions = self.process_completions();

        if camera.modified || self.center_chunk.is_none() {
            let center = index_utils::chunk_containing(camera.position);
            if self.center_chunk != Some(center) {
                self.center_chunk = Some(center);
                self.move_region(center, camera.position, &mut stats)?;
            }
        }
        stats.loads_enqueued += self.retry_failed_loads()?;

        stats.lighting_scheduled = self.schedule_lighting()?;
        stats.builds_scheduled = self.schedule_builds(camera.position)?;

        metrics::gauge!("world.chunks.active", self.chunk_count() as i64);
        metrics::gauge!("world.chunks.pending", self.pending_loads.len() as i64);

        Ok(stats)
    }

    /// The chunks the active region should contain around `center`, nearest to `position` first.
    pub fn desired_region(&self, center: Point3<i64>, position: Point3<f64>) -> Vec<Point3<i64>> {
        let extent = self.settings.active_region_extent;
        let region = Bounds::new(center - extent, extent * 2 + Vector3::new(1, 1, 1));

        let mut coords: Vec<_> = region.iter_points().collect();
        coords.sort_by_key(|&coord| {
            (
                OrdFloat(chunk::chunk_distance(coord, position)),
                coord_key(coord),
            )
        });
        coords.truncate(self.settings.max_active_chunks);
        coords
    }

    fn move_region(
        &mut self,
        center: Point3<i64>,
        position: Point3<f64>,
        stats: &mut UpdateStats,
    ) -> Result<()> {
        let desired = self.desired_region(center, position);
        let desired_set: HashSet<_> = desired.iter().copied().collect();
        self.failed_loads.clear();

        let mut leaving: Vec<Arc<Chunk>> = {
            let mut chunks = self.chunks.write();
            let coords: Vec<_> = chunks
                .keys()
                .filter(|coord| !desired_set.contains(coord))
                .copied()
                .collect();
            coords
                .into_iter()
                .filter_map(|coord| chunks.remove(&coord))
                .collect()
        };

        // farthest first
        leaving.sort_by_key(|chunk| {
            (
                std::cmp::Reverse(OrdFloat(chunk.distance_to(position))),
                coord_key(chunk.coord()),
            )
        });
        for chunk in &leaving {
            self.evict(chunk);
        }
        stats.evicted = leaving.len();

        let cancelled = self.pending_loads.len();
        self.pending_loads
            .retain(|coord, _| desired_set.contains(coord));
        let cancelled = cancelled - self.pending_loads.len();
        self.active_region = desired_set;

        let missing: Vec<_> = {
            let chunks = self.chunks.read();
            desired
                .into_iter()
                .filter(|coord| !chunks.contains_key(coord) && !self.pending_loads.contains_key(coord))
                .collect()
        };
        for coord in missing {
            self.enqueue_load(coord)?;
            stats.loads_enqueued += 1;
        }

        info!(
            "Active region moved to {:?}: {} loads enqueued, {} chunks evicted, {} loads cancelled",
            center, stats.loads_enqueued, stats.evicted, cancelled
        );
        Ok(())
    }

    fn enqueue_load(&mut self, coord: Point3<i64>) -> Result<()> {
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        self.pending_loads.insert(coord, epoch);

        let request = LoadRequest {
            coord,
            epoch,
            folder: self.folder.clone(),
            generator: self.generator.clone(),
            voxel_helper: self.voxel_helper.clone(),
            stopping: self.stopping.clone(),
        };
        let completions = self.completion_sender.clone();
        self.pool
            .submit(move || tasks::load_chunk(request, &completions))
    }

    /// Enqueues the loads that failed since the last update again, if they are still wanted.
    fn retry_failed_loads(&mut self) -> Result<usize> {
        let failed = std::mem::take(&mut self.failed_loads);
        let mut count = 0;
        for coord in failed {
            if !self.active_region.contains(&coord)
                || self.pending_loads.contains_key(&coord)
                || self.chunks.read().contains_key(&coord)
            {
                continue;
            }
            debug!("Retrying load of chunk {:?}", coord);
            self.enqueue_load(coord)?;
            count += 1;
        }
        Ok(count)
    }

    /// Lets go of a chunk that has already been removed from the map. Unsaved edits are written
    /// before this returns. Resident neighbors now see air where the chunk was.
    fn evict(&self, chunk: &Chunk) {
        chunk.mark_evicted();
        self.invalidate_face_neighbors(chunk.coord());
        match chunk.save(&self.folder) {
            Ok(saved) => debug!("Evicted chunk {:?} (saved: {})", chunk.coord(), saved),
            Err(end_error) => {
                error!("Failed to save chunk {:?} on eviction", chunk.coord());
                for error in end_error.chain() {
                    error!("{}", error);
                }
            }
        }
        metrics::counter!("world.chunks.evicted", 1);
    }

    fn evict_all(&mut self) -> usize {
        let leaving: Vec<_> = self.chunks.write().drain().map(|(_, chunk)| chunk).collect();
        for chunk in &leaving {
            self.evict(chunk);
        }
        self.pending_loads.clear();
        self.failed_loads.clear();
        self.active_region.clear();
        leaving.len()
    }

    fn process_completions(&mut self) -> usize {
        let mut count = 0;
        while let Ok(completion) = self.completion_receiver.try_recv() {
            count += 1;
            match completion {
                TaskCompletion::Loaded {
                    coord,
                    epoch,
                    voxels,
                    source,
                } => {
                    if self.pending_loads.get(&coord) != Some(&epoch) {
                        debug!("Discarding stale load of chunk {:?}", coord);
                        continue;
                    }
                    self.pending_loads.remove(&coord);

                    let chunk = Arc::new(Chunk::new(coord, voxels, self.release_sender.clone()));
                    if source != ChunkSource::Loaded {
                        // not on disk yet
                        chunk.voxels().mark_dirty();
                    }
                    self.insert_chunk(chunk);
                }
                TaskCompletion::LoadFailed {
                    coord,
                    epoch,
                    error: load_error,
                } => {
                    if self.pending_loads.get(&coord) == Some(&epoch) {
                        self.pending_loads.remove(&coord);
                        self.failed_loads.push(coord);
                    }
                    error!("Failed to load chunk {:?}: {}", coord, load_error);
                    if let Some(source) = std::error::Error::source(&load_error) {
                        error!("{}", source);
                    }
                }
                TaskCompletion::Lit { coord, changed } => {
                    if changed {
                        // faces of the neighbors that look into this chunk are shaded by it
                        for neighbor in self.face_neighbors(coord) {
                            neighbor.geometry().mark_dirty();
                        }
                    }
                }
                TaskCompletion::Built { coord, built } => {
                    if !built {
                        debug!("Mesh build for chunk {:?} was contended; retrying", coord);
                    }
                }
            }
        }
        count
    }

    /// Makes a freshly loaded chunk resident. Its face neighbors were lit and meshed as if it
    /// were air, so they are redone.
    fn insert_chunk(&mut self, chunk: Arc<Chunk>) {
        let coord = chunk.coord();
        self.chunks.write().insert(coord, chunk);
        self.invalidate_face_neighbors(coord);
    }

    fn invalidate_face_neighbors(&self, coord: Point3<i64>) {
        for neighbor in self.face_neighbors(coord) {
            neighbor.mark_lighting_dirty();
            neighbor.geometry().mark_dirty();
        }
    }

    fn face_neighbors(&self, coord: Point3<i64>) -> Vec<Arc<Chunk>> {
        let chunks = self.chunks.read();
        Face::ALL
            .iter()
            .filter_map(|face| chunks.get(&(coord + face.normal())).cloned())
            .collect()
    }

    fn schedule_lighting(&mut self) -> Result<usize> {
        let neighborhoods: Vec<Neighborhood> = {
            let chunks = self.chunks.read();
            chunks
                .values()
                .filter(|chunk| chunk.begin_lighting())
                .map(|chunk| Neighborhood::gather(chunk.clone(), |p| chunks.get(&p).cloned()))
                .collect()
        };

        let count = neighborhoods.len();
        for neighborhood in neighborhoods {
            let completions = self.completion_sender.clone();
            self.pool
                .submit(move || tasks::relight_chunk(neighborhood, &completions))?;
        }
        Ok(count)
    }

    fn schedule_builds(&mut self, position: Point3<f64>) -> Result<usize> {
        let neighborhoods: Vec<Neighborhood> = {
            let chunks = self.chunks.read();
            let mut candidates: Vec<&Arc<Chunk>> = chunks
                .values()
                .filter(|chunk| {
                    chunk.geometry().is_dirty()
                        && !chunk.is_lighting_dirty()
                        && !chunk.is_lighting_in_flight()
                        && !chunk.is_build_in_flight()
                })
                .collect();

            candidates.sort_by_key(|chunk| {
                (OrdFloat(chunk.distance_to(position)), coord_key(chunk.coord()))
            });

            candidates
                .into_iter()
                .filter(|chunk| chunk.begin_build())
                .take(self.settings.geometry_builds_per_update)
                .map(|chunk| Neighborhood::gather(chunk.clone(), |p| chunks.get(&p).cloned()))
                .collect()
        };

        let count = neighborhoods.len();
        for neighborhood in neighborhoods {
            let completions = self.completion_sender.clone();
            let voxel_helper = self.voxel_helper.clone();
            self.pool.submit(move || {
                tasks::build_chunk(neighborhood, &voxel_helper, &completions)
            })?;
        }
        Ok(count)
    }

    /// Intersects the ray with every resident chunk's bounds and returns the nearest chunk hit
    /// along with the distance to it. A ray starting inside a chunk hits it at distance 0. Ties
    /// go to the lowest coordinate.
    pub fn ray_cast(&self, ray: &Ray<f64>) -> Option<(Arc<Chunk>, f64)> {
        self.ray_cast_all(ray).into_iter().next()
    }

    /// Every chunk hit by the ray, nearest first.
    fn ray_cast_all(&self, ray: &Ray<f64>) -> Vec<(Arc<Chunk>, f64)> {
        let ray = match normalized(ray) {
            Some(ray) => ray,
            None => return Vec::new(),
        };

        let mut hits: Vec<(Arc<Chunk>, f64)> = {
            let chunks = self.chunks.read();
            chunks
                .values()
                .filter_map(|chunk| {
                    let bounds = chunk.bounds();
                    let distance = if bounds.contains_point(ray.origin) {
                        0.
                    } else {
                        bounds.cast_ray(&ray)?.entry()?.t
                    };
                    Some((chunk.clone(), distance))
                })
                .collect()
        };

        hits.sort_by_key(|(chunk, distance)| (OrdFloat(*distance), coord_key(chunk.coord())));
        hits
    }

    /// The nearest solid voxel along the camera's line of sight, within editing distance.
    pub fn voxel_under_crosshairs(&self) -> Option<VoxelRaycastHit> {
        let camera = self.camera?;
        let ray = normalized(&Ray {
            origin: camera.position,
            dir: camera.look_at_dir,
        })?;
        let max_distance = self.settings.max_edit_distance;

        // chunk bounds never overlap, so the first chunk with a hit holds the nearest voxel
        for (chunk, distance) in self.ray_cast_all(&ray) {
            if distance > max_distance {
                break;
            }

            let hit = chunk
                .voxels()
                .read_scope(|voxels| voxels.cast_ray(&ray, chunk.min_corner()));
            if let Some(hit) = hit {
                if hit.intersection.t > max_distance {
                    return None;
                }
                return Some(hit);
            }
        }

        None
    }

    /// Sets the voxel under the crosshairs to air. Returns the edited position, if any.
    pub fn remove_block_under_crosshairs(&self) -> Result<Option<Point3<i64>>> {
        let hit = match self.voxel_under_crosshairs() {
            Some(hit) => hit,
            None => return Ok(None),
        };

        if !self.set_voxel(hit.voxel_pos, Voxel::air())? {
            return Ok(None);
        }
        Ok(Some(hit.voxel_pos))
    }

    /// Places the placement voxel against the face of the voxel under the crosshairs. Returns the
    /// edited position, if any.
    pub fn place_block_under_crosshairs(&self) -> Result<Option<Point3<i64>>> {
        let hit = match self.voxel_under_crosshairs() {
            Some(hit) => hit,
            None => return Ok(None),
        };

        let normal = hit.intersection.normal;
        let target = hit.voxel_pos
            + Vector3::new(
                normal.x.round() as i64,
                normal.y.round() as i64,
                normal.z.round() as i64,
            );

        if !self.set_voxel(target, self.placement_voxel)? {
            return Ok(None);
        }
        Ok(Some(target))
    }

    /// Writes a single voxel by world position, marks every chunk whose sunlight or geometry
    /// depends on it, and saves the edited chunk in the background. Returns false, logging a
    /// warning, if the chunk is not resident.
    pub fn set_voxel(&self, world_pos: Point3<i64>, voxel: Voxel) -> Result<bool> {
        let (chunk_pos, _) = index_utils::to_chunk_pos(world_pos);
        let chunk = match self.get_chunk(chunk_pos) {
            Some(chunk) => chunk,
            None => {
                warn!(
                    "Not editing voxel at {:?}: chunk {:?} is not loaded",
                    world_pos, chunk_pos
                );
                return Ok(false);
            }
        };

        chunk.set_voxel_at(world_pos, voxel);

        let mut delta = VoxelDelta::empty();
        delta.record_voxel_update(world_pos);
        {
            let chunks = self.chunks.read();
            for coord in &delta.modified_chunks {
                if let Some(affected) = chunks.get(coord) {
                    affected.geometry().mark_dirty();
                }
            }
            for coord in &delta.relit_chunks {
                if let Some(affected) = chunks.get(coord) {
                    affected.mark_lighting_dirty();
                }
            }
        }

        self.enqueue_save(chunk)?;
        Ok(true)
    }

    fn enqueue_save(&self, chunk: Arc<Chunk>) -> Result<()> {
        let token = self.saves.enter();
        let folder = self.folder.clone();
        self.pool
            .submit(move || tasks::save_chunk(chunk, folder, token))
    }

    /// Sets every chunk's visibility flag from a culling test over its eight corners. Returns the
    /// number of visible chunks.
    pub fn update_visibility<F>(&self, mut is_visible: F) -> usize
    where
        F: FnMut(&[Point3<f64>; 8]) -> bool,
    {
        let chunks = self.chunks.read();
        let mut count = 0;
        for chunk in chunks.values() {
            let visible = is_visible(&chunk.corners());
            chunk.set_visible(visible);
            if visible {
                count += 1;
            }
        }
        count
    }

    /// Draws every visible chunk, nearest first. At most `vbo_generations_per_frame` chunks get a
    /// new renderer buffer; the rest draw their previous one. Buffers given up since the last
    /// call are released first.
    pub fn draw_chunks<R>(&self, renderer: &mut R) -> Result<DrawStats>
    where
        R: ChunkRenderer + ?Sized,
    {
        let mut stats = DrawStats::default();

        for handle in self.release_receiver.try_iter() {
            renderer.release(handle);
            stats.released += 1;
        }

        let mut visible: Vec<Arc<Chunk>> = self
            .chunks
            .read()
            .values()
            .filter(|chunk| chunk.is_visible())
            .cloned()
            .collect();

        if let Some(camera) = self.camera {
            visible.sort_by_key(|chunk| {
                (
                    OrdFloat(chunk.distance_to(camera.position)),
                    coord_key(chunk.coord()),
                )
            });
        }

        let mut budget = self.settings.vbo_generations_per_frame;
        for chunk in visible {
            let geometry = chunk.geometry();
            if geometry.draw_generating_if_necessary(budget > 0, renderer)? {
                budget -= 1;
                stats.generated += 1;
            }
            if geometry.vertex_buffer().is_some() {
                stats.drawn += 1;
            }
        }

        Ok(stats)
    }

    /// Evicts every chunk, saving the dirty ones. The next update loads the region again from
    /// disk.
    pub fn purge(&mut self) -> usize {
        let evicted = self.evict_all();
        self.center_chunk = None;
        info!("Purged {} chunks", evicted);
        evicted
    }

    /// Evicts every chunk, waits for background saves and stops the worker pool. Queued loads,
    /// lighting passes and builds are dropped. Calling this more than once does nothing.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        self.stopping.store(true);

        let evicted = self.evict_all();
        info!(
            "Shutting down chunk store: {} chunks evicted, {} background saves outstanding",
            evicted,
            self.saves.outstanding()
        );

        let saves_finished = self.saves.wait(self.settings.pool.terminate_timeout);
        let pool_result = self.pool.finish();

        if !saves_finished {
            return Err(anyhow!(
                "{} chunk saves did not finish within {:?}",
                self.saves.outstanding(),
                self.settings.pool.terminate_timeout
            ));
        }
        pool_result
    }
}

impl Drop for ChunkStore {
    fn drop(&mut self) {
        if let Err(end_error) = self.shutdown() {
            for error in end_error.chain() {
                error!("{}", error);
                error!("========");
            }
        }
    }
}

fn coord_key(p: Point3<i64>) -> (i64, i64, i64) {
    (p.x, p.y, p.z)
}

/// The ray with a unit-length direction, so that ray parameters are distances. `None` if the
/// direction is zero.
fn normalized(ray: &Ray<f64>) -> Option<Ray<f64>> {
    if ray.dir.magnitude2() == 0. {
        return None;
    }
    Some(ray.normalized())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use terra_voxels::{persistence, ChunkVoxels, LoadError};

    use super::*;
    use crate::geometry::ChunkMesh;
    use crate::test_util::{scratch_dir, voxel_helper, wait_until};

    fn test_settings(extent: Vector3<i64>, max_active_chunks: usize) -> StoreSettings {
        StoreSettings {
            active_region_extent: extent,
            max_active_chunks,
            vbo_generations_per_frame: 1,
            geometry_builds_per_update: 4,
            max_edit_distance: 64.,
            pool: PoolSettings {
                worker_count: 2,
                ..PoolSettings::default()
            },
        }
    }

    /// Solid rock below y = 0, air above.
    fn floor_generator() -> Arc<dyn TerrainGenerator> {
        Arc::new(|p: Point3<i64>| {
            if p.y < 0 {
                Voxel::from_u16(3)
            } else {
                Voxel::air()
            }
        })
    }

    fn camera_at(x: f64, y: f64, z: f64) -> CameraState {
        CameraState {
            position: Point3::new(x, y, z),
            look_at_dir: Vector3::new(0., 0., 1.),
            modified: true,
        }
    }

    fn new_store(name: &str, settings: StoreSettings) -> ChunkStore {
        ChunkStore::new(settings, scratch_dir(name), floor_generator(), voxel_helper()).unwrap()
    }

    fn settle(store: &mut ChunkStore, camera: &CameraState) {
        wait_until("chunk store to settle", || {
            store.update(0.016, camera).unwrap();
            store.is_idle()
        });
    }

    fn coords(store: &ChunkStore) -> Vec<Point3<i64>> {
        store.chunks().iter().map(|chunk| chunk.coord()).collect()
    }

    fn chunk_file(store: &ChunkStore, coord: Point3<i64>) -> std::path::PathBuf {
        persistence::voxel_data_path(store.folder(), index_utils::chunk_min_corner(coord))
    }

    #[derive(Default)]
    struct CountingRenderer {
        next_handle: BufferHandle,
        uploads: usize,
        draws: usize,
        released: Vec<BufferHandle>,
    }

    impl ChunkRenderer for CountingRenderer {
        fn upload(&mut self, _mesh: &ChunkMesh) -> Result<BufferHandle> {
            self.next_handle += 1;
            self.uploads += 1;
            Ok(self.next_handle)
        }

        fn draw(&mut self, _handle: BufferHandle, _index_count: usize) {
            self.draws += 1;
        }

        fn release(&mut self, handle: BufferHandle) {
            self.released.push(handle);
        }
    }

    #[test]
    fn test_missing_chunk_is_generated_and_saved_on_purge() {
        let mut store = new_store("generate", test_settings(Vector3::new(0, 0, 0), 1));
        let camera = camera_at(16., -16., 16.);
        settle(&mut store, &camera);

        assert_eq!(coords(&store), vec![Point3::new(0, -1, 0)]);
        let chunk = store.get_chunk_at(Point3::new(1.5, -0.5, 1.5)).unwrap();
        assert_eq!(chunk.voxel_at(Point3::new(1, -1, 1)), Voxel::from_u16(3));
        assert!(chunk.needs_save());
        assert!(store.get_chunk_at(Point3::new(1.5, 0.5, 1.5)).is_none());

        let path = chunk_file(&store, Point3::new(0, -1, 0));
        assert!(!path.exists());

        assert_eq!(store.purge(), 1);
        assert_eq!(store.chunk_count(), 0);
        assert!(chunk.is_evicted());
        assert!(path.exists());
    }

    #[test]
    fn test_repeated_update_enqueues_nothing_new() {
        let gate = Arc::new(RwLock::new(()));
        let generator: Arc<dyn TerrainGenerator> = {
            let gate = gate.clone();
            Arc::new(move |p: Point3<i64>| {
                let _open = gate.read();
                if p.y < 0 {
                    Voxel::from_u16(3)
                } else {
                    Voxel::air()
                }
            })
        };

        let mut store = ChunkStore::new(
            test_settings(Vector3::new(1, 0, 0), 3),
            scratch_dir("idempotent"),
            generator,
            voxel_helper(),
        )
        .unwrap();
        let camera = camera_at(16., 16., 16.);

        let closed = gate.write();
        let first = store.update(0.016, &camera).unwrap();
        assert_eq!(first.loads_enqueued, 3);
        assert_eq!(store.pending_load_count(), 3);

        let second = store.update(0.016, &camera).unwrap();
        assert_eq!(second, UpdateStats::default());
        assert_eq!(store.pending_load_count(), 3);
        assert!(!store.is_idle());
        drop(closed);

        settle(&mut store, &camera);
        assert_eq!(
            coords(&store),
            vec![
                Point3::new(-1, 0, 0),
                Point3::new(0, 0, 0),
                Point3::new(1, 0, 0)
            ]
        );

        // moving within the same chunk changes nothing
        let nudged = camera_at(20., 10., 3.);
        let stats = store.update(0.016, &nudged).unwrap();
        assert!(stats.is_quiet());
        assert_eq!(stats.completions, 0);
    }

    #[test]
    fn test_capacity_evicts_farthest_and_saves_edits() {
        let mut store = new_store("capacity", test_settings(Vector3::new(1, 0, 0), 2));
        let camera = camera_at(20., 16., 16.);
        settle(&mut store, &camera);

        // (1, 0, 0) is nearer to the camera than (-1, 0, 0)
        assert_eq!(
            coords(&store),
            vec![Point3::new(0, 0, 0), Point3::new(1, 0, 0)]
        );

        let edited = store.get_chunk(Point3::new(1, 0, 0)).unwrap();
        assert!(store
            .set_voxel(Point3::new(40, 1, 1), Voxel::from_u16(2))
            .unwrap());

        let stats = store.update(0.016, &camera_at(-20., 16., 16.)).unwrap();
        assert_eq!(stats.evicted, 2);
        assert_eq!(stats.loads_enqueued, 2);
        assert!(edited.is_evicted());
        assert!(store.get_chunk(Point3::new(1, 0, 0)).is_none());

        // the save happened before update returned
        let saved = persistence::load_voxels(
            store.folder(),
            index_utils::chunk_min_corner(Point3::new(1, 0, 0)),
        )
        .unwrap();
        assert_eq!(saved.get_voxel(Point3::new(8, 1, 1)), Voxel::from_u16(2));
        assert!(chunk_file(&store, Point3::new(0, 0, 0)).exists());

        settle(&mut store, &camera_at(-20., 16., 16.));
        assert_eq!(
            coords(&store),
            vec![Point3::new(-2, 0, 0), Point3::new(-1, 0, 0)]
        );
    }

    #[test]
    fn test_eviction_exposes_faces_of_remaining_neighbor() {
        let mut store = new_store("evict_neighbors", test_settings(Vector3::new(1, 0, 0), 3));
        settle(&mut store, &camera_at(16., -16., 16.));

        // solid chunk with both x faces against solid neighbors: top, bottom and z sides only
        let center = store.get_chunk(Point3::new(0, -1, 0)).unwrap();
        let face_indices = 32 * 32 * 6;
        assert_eq!(center.geometry().current().index_count(), 4 * face_indices);

        let camera = camera_at(48., -16., 16.);
        let stats = store.update(0.016, &camera).unwrap();
        assert_eq!(stats.evicted, 1);
        assert!(store.get_chunk(Point3::new(-1, -1, 0)).is_none());
        // only the surviving neighbor of the evicted chunk is relit
        assert_eq!(stats.lighting_scheduled, 1);
        assert!(center.geometry().is_dirty());

        settle(&mut store, &camera);
        assert!(!center.is_evicted());
        assert_eq!(center.geometry().current().index_count(), 5 * face_indices);
    }

    #[test]
    fn test_failed_load_is_retried() {
        let gate = Arc::new(RwLock::new(()));
        let generator: Arc<dyn TerrainGenerator> = {
            let gate = gate.clone();
            Arc::new(move |p: Point3<i64>| {
                let _open = gate.read();
                if p.y < 0 {
                    Voxel::from_u16(3)
                } else {
                    Voxel::air()
                }
            })
        };

        let mut store = ChunkStore::new(
            test_settings(Vector3::new(0, 0, 0), 1),
            scratch_dir("retry"),
            generator,
            voxel_helper(),
        )
        .unwrap();
        let camera = camera_at(16., -16., 16.);
        let coord = Point3::new(0, -1, 0);

        let closed = gate.write();
        assert_eq!(store.update(0.016, &camera).unwrap().loads_enqueued, 1);
        let epoch = store.pending_loads[&coord];

        store
            .completion_sender
            .send(TaskCompletion::LoadFailed {
                coord,
                epoch,
                error: LoadError::Io {
                    path: chunk_file(&store, coord),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "disk unplugged"),
                },
            })
            .unwrap();

        let stats = store.update(0.016, &camera).unwrap();
        assert_eq!(stats.completions, 1);
        assert_eq!(stats.loads_enqueued, 1);
        assert_eq!(store.pending_load_count(), 1);
        assert_ne!(store.pending_loads[&coord], epoch);
        drop(closed);

        // the first load finishes too, but its epoch is stale
        settle(&mut store, &camera);
        assert_eq!(coords(&store), vec![coord]);
        assert_eq!(store.failed_tasks(), 0);
    }

    #[test]
    fn test_set_voxel_on_boundary_dirties_both_chunks() {
        let mut store = new_store("boundary", test_settings(Vector3::new(1, 0, 0), 3));
        let camera = camera_at(16., 16., 16.);
        settle(&mut store, &camera);

        let left = store.get_chunk(Point3::new(-1, 0, 0)).unwrap();
        let center = store.get_chunk(Point3::new(0, 0, 0)).unwrap();
        let right = store.get_chunk(Point3::new(1, 0, 0)).unwrap();
        assert!(center.geometry().current().is_empty());

        assert!(store
            .set_voxel(Point3::new(31, 5, 5), Voxel::from_u16(2))
            .unwrap());

        assert!(center.geometry().is_dirty());
        assert!(right.geometry().is_dirty());
        assert!(center.is_lighting_dirty());
        assert!(right.is_lighting_dirty());
        assert!(!left.geometry().is_dirty());
        assert!(!left.is_lighting_dirty());

        settle(&mut store, &camera);
        assert_eq!(center.geometry().current().index_count(), 36);
        assert!(right.geometry().current().is_empty());
    }

    #[test]
    fn test_set_voxel_in_missing_chunk_is_refused() {
        let mut store = new_store("refused", test_settings(Vector3::new(0, 0, 0), 1));
        settle(&mut store, &camera_at(16., 16., 16.));

        assert!(!store
            .set_voxel(Point3::new(100, 1, 1), Voxel::from_u16(2))
            .unwrap());
        assert!(store.get_chunk(Point3::new(3, 0, 0)).is_none());
    }

    #[test]
    fn test_ray_cast_picks_nearest_chunk() {
        let mut store = new_store("ray_cast", test_settings(Vector3::new(1, 0, 0), 3));
        settle(&mut store, &camera_at(16., 16., 16.));

        let ray = Ray {
            origin: Point3::new(16., 16., -10.),
            dir: Vector3::new(0., 0., 2.),
        };
        let (chunk, distance) = store.ray_cast(&ray).unwrap();
        assert_eq!(chunk.coord(), Point3::new(0, 0, 0));
        assert!((distance - 10.).abs() < 1e-9);

        // grazes the shared face of two chunks; the lower coordinate wins
        let ray = Ray {
            origin: Point3::new(0., 16., -10.),
            dir: Vector3::new(0., 0., 1.),
        };
        let (chunk, _) = store.ray_cast(&ray).unwrap();
        assert_eq!(chunk.coord(), Point3::new(-1, 0, 0));

        // starting inside a chunk
        let ray = Ray {
            origin: Point3::new(40., 5., 5.),
            dir: Vector3::new(-1., 0., 0.),
        };
        let (chunk, distance) = store.ray_cast(&ray).unwrap();
        assert_eq!(chunk.coord(), Point3::new(1, 0, 0));
        assert_eq!(distance, 0.);

        let ray = Ray {
            origin: Point3::new(16., 16., -10.),
            dir: Vector3::new(0., 1., 0.),
        };
        assert!(store.ray_cast(&ray).is_none());

        let ray = Ray {
            origin: Point3::new(16., 16., 16.),
            dir: Vector3::new(0., 0., 0.),
        };
        assert!(store.ray_cast(&ray).is_none());
    }

    #[test]
    fn test_crosshair_edits() {
        let mut store = new_store("crosshairs", test_settings(Vector3::new(0, 1, 0), 3));
        let camera = CameraState {
            position: Point3::new(16.5, 10.5, 16.5),
            look_at_dir: Vector3::new(0., -1., 0.),
            modified: true,
        };
        settle(&mut store, &camera);

        let target = Point3::new(16, -1, 16);
        assert_eq!(store.remove_block_under_crosshairs().unwrap(), Some(target));
        let floor = store.get_chunk(Point3::new(0, -1, 0)).unwrap();
        assert_eq!(floor.voxel_at(target), Voxel::air());

        // the voxel below is hit now, and the new one goes on top of it
        assert_eq!(store.place_block_under_crosshairs().unwrap(), Some(target));
        assert_eq!(floor.voxel_at(target), Voxel::from_u16(1));

        assert!(store.set_placement_voxel(Voxel::from_u16(99)).is_err());
        store.set_placement_voxel(Voxel::from_u16(2)).unwrap();
        assert_eq!(store.placement_voxel(), Voxel::from_u16(2));

        let looking_up = CameraState {
            look_at_dir: Vector3::new(0., 1., 0.),
            modified: false,
            ..camera
        };
        store.update(0.016, &looking_up).unwrap();
        assert_eq!(store.remove_block_under_crosshairs().unwrap(), None);
        assert_eq!(store.place_block_under_crosshairs().unwrap(), None);
    }

    #[test]
    fn test_edits_survive_purge() {
        let mut store = new_store("reload", test_settings(Vector3::new(0, 0, 0), 1));
        let camera = camera_at(16., -16., 16.);
        settle(&mut store, &camera);

        assert!(store
            .set_voxel(Point3::new(3, -30, 3), Voxel::air())
            .unwrap());
        store.purge();
        settle(&mut store, &camera);

        let chunk = store.get_chunk(Point3::new(0, -1, 0)).unwrap();
        assert_eq!(chunk.voxel_at(Point3::new(3, -30, 3)), Voxel::air());
        assert_eq!(chunk.voxel_at(Point3::new(4, -30, 3)), Voxel::from_u16(3));
        // loaded from disk, so there is nothing new to save
        assert!(!chunk.needs_save());
    }

    #[test]
    fn test_unusable_file_is_regenerated() {
        let folder = scratch_dir("regenerate");
        let min_corner = index_utils::chunk_min_corner(Point3::new(0, -1, 0));
        let path = persistence::voxel_data_path(&folder, min_corner);
        fs::write(&path, b"not voxels").unwrap();

        let mut store = ChunkStore::new(
            test_settings(Vector3::new(0, 0, 0), 1),
            folder.clone(),
            floor_generator(),
            voxel_helper(),
        )
        .unwrap();
        let camera = camera_at(16., -16., 16.);
        settle(&mut store, &camera);

        let chunk = store.get_chunk(Point3::new(0, -1, 0)).unwrap();
        assert_eq!(chunk.voxel_at(Point3::new(1, -1, 1)), Voxel::from_u16(3));
        store.purge();
        assert_eq!(
            fs::metadata(&path).unwrap().len(),
            persistence::VOXEL_FILE_SIZE
        );

        // a well-formed file naming a voxel type nobody knows about
        persistence::save_voxels(
            &folder,
            min_corner,
            &ChunkVoxels::from_fn(|_| Voxel::from_u16(77)),
        )
        .unwrap();
        settle(&mut store, &camera);
        let chunk = store.get_chunk(Point3::new(0, -1, 0)).unwrap();
        assert_eq!(chunk.voxel_at(Point3::new(1, -1, 1)), Voxel::from_u16(3));
        assert_eq!(store.failed_tasks(), 0);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut store = new_store("shutdown", test_settings(Vector3::new(0, 0, 0), 1));
        let camera = camera_at(16., -16., 16.);
        settle(&mut store, &camera);
        assert!(store
            .set_voxel(Point3::new(1, -1, 1), Voxel::from_u16(2))
            .unwrap());

        store.shutdown().unwrap();
        store.shutdown().unwrap();
        assert_eq!(store.chunk_count(), 0);
        assert!(store.update(0.016, &camera).is_err());

        let saved = persistence::load_voxels(
            store.folder(),
            index_utils::chunk_min_corner(Point3::new(0, -1, 0)),
        )
        .unwrap();
        assert_eq!(saved.get_voxel(Point3::new(1, 31, 1)), Voxel::from_u16(2));
    }

    #[test]
    fn test_draw_respects_generation_budget() {
        let mut store = new_store("draw", test_settings(Vector3::new(1, 0, 0), 3));
        let camera = camera_at(16., -16., 16.);
        settle(&mut store, &camera);

        let mut renderer = CountingRenderer::default();
        for expected_drawn in 1..=3 {
            let stats = store.draw_chunks(&mut renderer).unwrap();
            assert_eq!(stats.generated, 1);
            assert_eq!(stats.drawn, expected_drawn);
        }

        let stats = store.draw_chunks(&mut renderer).unwrap();
        assert_eq!(
            stats,
            DrawStats {
                drawn: 3,
                generated: 0,
                released: 0,
            }
        );
        assert_eq!(renderer.uploads, 3);

        assert_eq!(store.update_visibility(|_| false), 0);
        assert_eq!(store.draw_chunks(&mut renderer).unwrap().drawn, 0);
        assert_eq!(store.update_visibility(|corners| corners[0].x >= 0.), 2);
        assert_eq!(store.draw_chunks(&mut renderer).unwrap().drawn, 2);

        store.purge();
        let stats = store.draw_chunks(&mut renderer).unwrap();
        assert_eq!(stats.released, 3);
        assert_eq!(stats.drawn, 0);
        renderer.released.sort_unstable();
        assert_eq!(renderer.released, vec![1, 2, 3]);
        assert!(renderer.draws > 0);
    }
}
