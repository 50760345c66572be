use cgmath::{EuclideanSpace, Point3, Vector3};
use serde::{Deserialize, Serialize};

use terra_util::convert_bounds;
use terra_util::ray::{Intersection, Ray};
use terra_util::Bounds;

use crate::index_utils;

/// Represents the value of a single voxel in the world. The wrapped value is an index into the
/// VoxelConfig's list of VoxelInfo; index 0 is always air.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Voxel(u16);

/// The voxels of one chunk.
#[derive(Clone, PartialEq, Eq)]
pub struct ChunkVoxels {
    /* Memory layout (if chunk size were 4x3x2)
    z-level 0
       x - >
     y 0  1  2  3
     | 4  5  6  7
     v 8  9  10 11

     z-level 1
       x - >
     y 12 13 14 15
     | 16 17 18 19
     v 20 21 22 23
     */
    voxels: Box<[Voxel]>,
}

#[derive(Debug, Clone)]
pub struct VoxelRaycastHit {
    pub voxel: Voxel,
    pub voxel_pos: Point3<i64>,
    pub intersection: Intersection<f64>,
}

impl Voxel {
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_solid(self) -> bool {
        !self.is_empty()
    }

    pub fn from_u16(val: u16) -> Self {
        Voxel(val)
    }

    pub fn air() -> Self {
        Voxel(0)
    }

    pub fn to_u16(self) -> u16 {
        self.0
    }
}

impl Default for Voxel {
    fn default() -> Self {
        Voxel::air()
    }
}

impl ChunkVoxels {
    /// Creates a chunk filled with empty voxels.
    pub fn empty() -> Self {
        ChunkVoxels {
            voxels: vec![Voxel::air(); index_utils::chunk_size_total()].into_boxed_slice(),
        }
    }

    /// Creates a chunk by evaluating `f` at every local position.
    pub fn from_fn<F>(mut f: F) -> Self
    where
        F: FnMut(Point3<i64>) -> Voxel,
    {
        let voxels = (0..index_utils::chunk_size_total())
            .map(|index| f(index_utils::unpack_within_chunk(index)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        ChunkVoxels { voxels }
    }

    /// Wraps raw voxels laid out in chunk order. Panics if the length is not exactly one chunk.
    pub fn from_raw(voxels: Vec<Voxel>) -> Self {
        assert_eq!(voxels.len(), index_utils::chunk_size_total());
        ChunkVoxels {
            voxels: voxels.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn get_voxel(&self, p: Point3<i64>) -> Voxel {
        self.voxels[index_utils::pack_within_chunk(p)]
    }

    #[inline]
    pub fn set_voxel(&mut self, p: Point3<i64>, val: Voxel) {
        self.voxels[index_utils::pack_within_chunk(p)] = val;
    }

    /// Voxels in chunk order: x fastest, then y, then z.
    pub fn as_slice(&self) -> &[Voxel] {
        &self.voxels[..]
    }

    pub fn count_nonempty(&self) -> usize {
        self.voxels.iter().filter(|voxel| !voxel.is_empty()).count()
    }

    /// Finds the nearest non-empty voxel hit by the ray. `origin` is the world position of the
    /// chunk's minimum corner.
    pub fn cast_ray(&self, ray: &Ray<f64>, origin: Point3<i64>) -> Option<VoxelRaycastHit> {
        // TODO: walk the voxel grid along the ray instead of testing every voxel

        let mut nearest_hit: Option<VoxelRaycastHit> = None;

        for (index, &voxel) in self.voxels.iter().enumerate() {
            if voxel.is_empty() {
                continue;
            }

            let voxel_pos = origin + (index_utils::unpack_within_chunk(index) - Point3::origin());
            let bounds = convert_bounds!(Bounds::new(voxel_pos, Vector3::new(1, 1, 1)), f64);
            let cast = match bounds.cast_ray(ray) {
                Some(cast) => cast,
                None => continue,
            };

            // a ray starting inside a solid voxel hits that voxel immediately
            let intersection = match (cast.entry(), cast.exit()) {
                (Some(entry), _) => entry,
                (None, Some(exit)) => Intersection {
                    t: 0.0,
                    normal: -exit.normal,
                },
                (None, None) => continue,
            };

            let hit = VoxelRaycastHit {
                voxel,
                voxel_pos,
                intersection,
            };

            nearest_hit = match nearest_hit.take() {
                Some(old_hit) if old_hit.intersection.t <= hit.intersection.t => Some(old_hit),
                _ => Some(hit),
            }
        }

        nearest_hit
    }
}

impl std::fmt::Debug for ChunkVoxels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ChunkVoxels {{ nonempty: {} / {} }}",
            self.count_nonempty(),
            self.voxels.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_set() {
        let mut voxels = ChunkVoxels::empty();
        assert_eq!(voxels.count_nonempty(), 0);

        voxels.set_voxel(Point3::new(1, 2, 3), Voxel::from_u16(4));
        voxels.set_voxel(Point3::new(31, 31, 31), Voxel::from_u16(2));

        assert_eq!(voxels.get_voxel(Point3::new(1, 2, 3)), Voxel::from_u16(4));
        assert_eq!(voxels.get_voxel(Point3::new(31, 31, 31)), Voxel::from_u16(2));
        assert_eq!(voxels.get_voxel(Point3::new(3, 2, 1)), Voxel::air());
        assert_eq!(voxels.count_nonempty(), 2);
    }

    #[test]
    #[should_panic]
    fn test_out_of_bounds_access_panics() {
        ChunkVoxels::empty().get_voxel(Point3::new(0, 32, 0));
    }

    #[test]
    fn test_from_fn() {
        let voxels = ChunkVoxels::from_fn(|p| {
            if p.y < 4 {
                Voxel::from_u16(1)
            } else {
                Voxel::air()
            }
        });

        assert_eq!(voxels.count_nonempty(), 32 * 32 * 4);
        assert!(voxels.get_voxel(Point3::new(9, 3, 20)).is_solid());
        assert!(voxels.get_voxel(Point3::new(9, 4, 20)).is_empty());
    }

    #[test]
    fn test_cast_ray_finds_nearest() {
        let mut voxels = ChunkVoxels::empty();
        voxels.set_voxel(Point3::new(5, 5, 10), Voxel::from_u16(1));
        voxels.set_voxel(Point3::new(5, 5, 20), Voxel::from_u16(2));

        let origin = Point3::new(32, 0, 0);
        let ray = Ray {
            origin: Point3::new(37.5, 5.5, 0.5),
            dir: Vector3::new(0.0, 0.0, 1.0),
        };

        let hit = voxels.cast_ray(&ray, origin).expect("expected a hit");
        assert_eq!(hit.voxel, Voxel::from_u16(1));
        assert_eq!(hit.voxel_pos, Point3::new(37, 5, 10));
        assert_eq!(hit.intersection.t, 9.5);
        assert_eq!(hit.intersection.normal, Vector3::new(0.0, 0.0, -1.0));

        let miss = Ray {
            origin: Point3::new(0.5, 5.5, 0.5),
            dir: Vector3::new(0.0, 0.0, 1.0),
        };
        assert!(voxels.cast_ray(&miss, origin).is_none());
    }
}
