//! Read access to a chunk and its six face neighbors at once.
//!
//! Lock order: the chunk map lock is never held while any voxel lock is held, and voxel locks of
//! several chunks are always taken in lexicographic order of their chunk coordinates. Writers only
//! ever hold a single voxel lock. Together these rule out circular waits between any number of
//! concurrent neighborhood readers and editors.
//!
//! A neighbor that is not resident reads as air. Meshing therefore emits faces toward it, and
//! lighting treats it as open sky. When the neighbor arrives, the store marks its face neighbors
//! for relighting and remeshing so that the seam is redone.

use std::sync::Arc;

use cgmath::{EuclideanSpace, Point3};
use parking_lot::RwLockReadGuard;

use terra_voxels::{
    index_utils, ChunkVoxels, Face, LightingBuffer, Voxel, VoxelGrid, VoxelSampler,
};

use crate::chunk::Chunk;

const SLOT_COUNT: usize = 7;
const CENTER_SLOT: usize = 6;

/// A center chunk plus whichever of its face neighbors were resident when it was gathered. Holds
/// references, not locks; locks are taken only for the duration of `read_voxels` and
/// `try_read_voxels`.
#[derive(Clone)]
pub struct Neighborhood {
    center: Arc<Chunk>,
    /// Indexed by `Face::index`.
    neighbors: [Option<Arc<Chunk>>; 6],
}

/// The locked voxels of a neighborhood. Positions are relative to the center chunk's minimum
/// corner.
pub struct NeighborhoodVoxels<'a> {
    center: &'a ChunkVoxels,
    neighbors: [Option<&'a ChunkVoxels>; 6],
}

impl Neighborhood {
    /// Collects the face neighbors of `center` through `lookup`, which returns the resident chunk
    /// at a chunk coordinate if there is one.
    pub fn gather<F>(center: Arc<Chunk>, mut lookup: F) -> Self
    where
        F: FnMut(Point3<i64>) -> Option<Arc<Chunk>>,
    {
        let coord = center.coord();
        let mut neighbors: [Option<Arc<Chunk>>; 6] = Default::default();
        for &face in Face::ALL.iter() {
            neighbors[face.index()] = lookup(coord + face.normal());
        }

        Self { center, neighbors }
    }

    #[inline]
    pub fn center(&self) -> &Arc<Chunk> {
        &self.center
    }

    #[inline]
    pub fn neighbor(&self, face: Face) -> Option<&Arc<Chunk>> {
        self.neighbors[face.index()].as_ref()
    }

    /// Sunlight of the neighbor across a face of the center chunk, if it is resident.
    pub fn neighbor_sunlight(&self, face: Face) -> Option<Arc<LightingBuffer>> {
        self.neighbor(face).map(|chunk| chunk.sunlight())
    }

    /// Coordinates of every resident chunk in the order their locks are acquired.
    pub fn lock_order(&self) -> Vec<Point3<i64>> {
        self.ordered_slots()
            .into_iter()
            .filter_map(|slot| self.slot(slot).map(|chunk| chunk.coord()))
            .collect()
    }

    /// Runs `f` with shared access to the center and all resident neighbors, blocking until
    /// every lock is available.
    pub fn read_voxels<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&NeighborhoodVoxels<'_>) -> R,
    {
        let guards = self.lock_all(|grid| Some(grid.read_lock()));
        match guards {
            Some(guards) => f(&NeighborhoodVoxels::new(&guards)),
            None => unreachable!("blocking lock acquisition cannot fail"),
        }
    }

    /// Like `read_voxels`, but gives up without waiting if any lock is held by a writer. All locks
    /// taken so far are released before returning `None`.
    pub fn try_read_voxels<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&NeighborhoodVoxels<'_>) -> R,
    {
        let guards = self.lock_all(VoxelGrid::try_read_lock)?;
        Some(f(&NeighborhoodVoxels::new(&guards)))
    }

    fn lock_all<'a, L>(
        &'a self,
        mut lock: L,
    ) -> Option<Vec<Option<RwLockReadGuard<'a, ChunkVoxels>>>>
    where
        L: FnMut(&'a VoxelGrid) -> Option<RwLockReadGuard<'a, ChunkVoxels>>,
    {
        let mut guards: Vec<Option<RwLockReadGuard<'a, ChunkVoxels>>> =
            (0..SLOT_COUNT).map(|_| None).collect();

        for slot in self.ordered_slots() {
            if let Some(chunk) = self.slot(slot) {
                guards[slot] = Some(lock(chunk.voxels())?);
            }
        }

        Some(guards)
    }

    fn slot(&self, slot: usize) -> Option<&Arc<Chunk>> {
        if slot == CENTER_SLOT {
            Some(&self.center)
        } else {
            self.neighbors[slot].as_ref()
        }
    }

    fn ordered_slots(&self) -> Vec<usize> {
        let mut slots: Vec<(usize, Point3<i64>)> = (0..SLOT_COUNT)
            .filter_map(|slot| self.slot(slot).map(|chunk| (slot, chunk.coord())))
            .collect();
        slots.sort_by_key(|&(_, p)| (p.x, p.y, p.z));
        slots.into_iter().map(|(slot, _)| slot).collect()
    }
}

impl<'a> NeighborhoodVoxels<'a> {
    fn new(guards: &'a [Option<RwLockReadGuard<'_, ChunkVoxels>>]) -> Self {
        let mut neighbors: [Option<&'a ChunkVoxels>; 6] = [None; 6];
        for (index, neighbor) in neighbors.iter_mut().enumerate() {
            *neighbor = guards[index].as_deref();
        }

        let center = match guards[CENTER_SLOT].as_deref() {
            Some(center) => center,
            None => unreachable!("center chunk is always locked"),
        };

        Self { center, neighbors }
    }

    #[inline]
    pub fn center(&self) -> &ChunkVoxels {
        self.center
    }
}

impl VoxelSampler for NeighborhoodVoxels<'_> {
    fn voxel_at(&self, p: Point3<i64>) -> Voxel {
        let (chunk_offset, local) = index_utils::to_chunk_pos(p);
        if chunk_offset == Point3::origin() {
            return self.center.get_voxel(local);
        }

        // only face neighbors are part of the neighborhood; anything diagonal reads as air
        match Face::from_normal(chunk_offset.to_vec()) {
            Some(face) => self.neighbors[face.index()]
                .map_or(Voxel::air(), |voxels| voxels.get_voxel(local)),
            None => Voxel::air(),
        }
    }
}
