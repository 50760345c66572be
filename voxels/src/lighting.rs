use std::collections::VecDeque;

use cgmath::Point3;

use crate::core::Voxel;
use crate::face::Face;
use crate::index_utils::{self, CHUNK_SIZE};

/// Brightest sunlight level. Each step through empty space away from open sky loses one level.
pub const CHUNK_LIGHTING_MAX: u8 = 15;

/// Read access to the voxels around a chunk. Positions are relative to the chunk's minimum
/// corner and may reach one chunk beyond it along a single axis.
pub trait VoxelSampler {
    fn voxel_at(&self, p: Point3<i64>) -> Voxel;
}

/// Per-voxel sunlight levels for one chunk.
#[derive(Clone, PartialEq, Eq)]
pub struct LightingBuffer {
    levels: Box<[u8]>,
}

impl LightingBuffer {
    /// A buffer with every voxel fully lit. Used before the first lighting pass has run.
    pub fn full() -> Self {
        Self {
            levels: vec![CHUNK_LIGHTING_MAX; index_utils::chunk_size_total()].into_boxed_slice(),
        }
    }

    pub fn dark() -> Self {
        Self {
            levels: vec![0; index_utils::chunk_size_total()].into_boxed_slice(),
        }
    }

    #[inline]
    pub fn light_at(&self, p: Point3<i64>) -> u8 {
        self.levels[index_utils::pack_within_chunk(p)]
    }

    /// Light level in `0.0..=1.0`.
    #[inline]
    pub fn brightness_at(&self, p: Point3<i64>) -> f32 {
        f32::from(self.light_at(p)) / f32::from(CHUNK_LIGHTING_MAX)
    }

    /// Recomputes sunlight for the chunk at the origin of `voxels` from scratch. Reads the chunk
    /// itself and its six face neighbors through the sampler.
    pub fn rebuild_sunlight<S: VoxelSampler>(voxels: &S) -> Self {
        let mut buffer = Self::dark();
        let mut queue = VecDeque::new();

        let size = CHUNK_SIZE;

        // Seed: every empty voxel with open sky above it is fully lit.
        for z in 0..size {
            for x in 0..size {
                let mut open = column_open_above(voxels, x, z, size);
                for y in (0..size).rev() {
                    let p = Point3::new(x, y, z);
                    if voxels.voxel_at(p).is_solid() {
                        open = false;
                        continue;
                    }
                    if open {
                        buffer.set(p, CHUNK_LIGHTING_MAX);
                        queue.push_back(p);
                    }
                }
            }
        }

        // Seed: light entering through the four sides from sky-exposed voxels next door.
        for &face in Face::SIDES.iter() {
            let normal = face.normal();
            for y in 0..size {
                for i in 0..size {
                    let inside = boundary_point(face, i, y);
                    let outside = inside + normal;
                    if voxels.voxel_at(inside).is_solid()
                        || !sky_exposed(voxels, outside, size)
                    {
                        continue;
                    }

                    let level = CHUNK_LIGHTING_MAX - 1;
                    if buffer.light_at(inside) < level {
                        buffer.set(inside, level);
                        queue.push_back(inside);
                    }
                }
            }
        }

        // Flood through empty voxels, losing one level per step.
        while let Some(p) = queue.pop_front() {
            let level = buffer.light_at(p);
            if level <= 1 {
                continue;
            }

            for &face in Face::ALL.iter() {
                let q = p + face.normal();
                if !index_utils::point_within_chunk(q) || voxels.voxel_at(q).is_solid() {
                    continue;
                }

                if buffer.light_at(q) < level - 1 {
                    buffer.set(q, level - 1);
                    queue.push_back(q);
                }
            }
        }

        buffer
    }

    #[inline]
    fn set(&mut self, p: Point3<i64>, level: u8) {
        self.levels[index_utils::pack_within_chunk(p)] = level;
    }
}

/// True if the column at (x, z) is empty from the top of the center chunk through the whole
/// chunk above it.
fn column_open_above<S: VoxelSampler>(voxels: &S, x: i64, z: i64, size: i64) -> bool {
    (size..2 * size).all(|y| voxels.voxel_at(Point3::new(x, y, z)).is_empty())
}

/// Whether a voxel in a horizontal neighbor is empty and has nothing solid above it in its own
/// chunk.
fn sky_exposed<S: VoxelSampler>(voxels: &S, p: Point3<i64>, size: i64) -> bool {
    (p.y..size).all(|y| voxels.voxel_at(Point3::new(p.x, y, p.z)).is_empty())
}

/// The voxel on the given side face of the chunk, parameterized by a horizontal index `i` and
/// height `y`.
fn boundary_point(face: Face, i: i64, y: i64) -> Point3<i64> {
    let last = CHUNK_SIZE - 1;
    match face {
        Face::NegX => Point3::new(0, y, i),
        Face::PosX => Point3::new(last, y, i),
        Face::NegZ => Point3::new(i, y, 0),
        Face::PosZ => Point3::new(i, y, last),
        Face::NegY | Face::PosY => unreachable!("not a side face: {:?}", face),
    }
}

impl std::fmt::Debug for LightingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lit = self.levels.iter().filter(|&&level| level > 0).count();
        write!(f, "LightingBuffer {{ lit: {} / {} }}", lit, self.levels.len())
    }
}
