use cgmath::{EuclideanSpace, Point3, Vector3};

use terra_util::DivDown;

/// Edge length of a chunk along each axis, in voxels.
pub const CHUNK_SIZE: i64 = 32;

#[inline]
pub const fn chunk_size() -> Vector3<i64> {
    Vector3 {
        x: CHUNK_SIZE,
        y: CHUNK_SIZE,
        z: CHUNK_SIZE,
    }
}

#[inline]
pub const fn chunk_size_total() -> usize {
    (CHUNK_SIZE * CHUNK_SIZE * CHUNK_SIZE) as usize
}

#[inline]
pub fn point_within_chunk(p: Point3<i64>) -> bool {
    p.x >= 0 && p.x < CHUNK_SIZE && p.y >= 0 && p.y < CHUNK_SIZE && p.z >= 0 && p.z < CHUNK_SIZE
}

/// Index of a chunk-local point in the voxel array: x varies fastest, then y, then z.
#[inline]
pub fn pack_within_chunk(p: Point3<i64>) -> usize {
    assert!(
        point_within_chunk(p),
        "voxel position {:?} is outside the chunk",
        p
    );
    (p.x + p.y * CHUNK_SIZE + p.z * CHUNK_SIZE * CHUNK_SIZE) as usize
}

#[inline]
pub fn unpack_within_chunk(index: usize) -> Point3<i64> {
    assert!(index < chunk_size_total());
    let index = index as i64;
    let xy = index % (CHUNK_SIZE * CHUNK_SIZE);

    Point3 {
        x: xy % CHUNK_SIZE,
        y: xy / CHUNK_SIZE,
        z: index / (CHUNK_SIZE * CHUNK_SIZE),
    }
}

/// From a point in world voxel coordinates, return the coordinate of the chunk containing it and
/// the position of the voxel within that chunk.
#[inline]
pub fn to_chunk_pos(p: Point3<i64>) -> (Point3<i64>, Point3<i64>) {
    let chunk_pos = p.div_down(Point3::origin() + chunk_size());
    let inner_pos = Point3::new(
        p.x.rem_euclid(CHUNK_SIZE),
        p.y.rem_euclid(CHUNK_SIZE),
        p.z.rem_euclid(CHUNK_SIZE),
    );
    (chunk_pos, inner_pos)
}

/// World position of the minimum corner of a chunk.
#[inline]
pub fn chunk_min_corner(chunk_pos: Point3<i64>) -> Point3<i64> {
    Point3::new(
        chunk_pos.x * CHUNK_SIZE,
        chunk_pos.y * CHUNK_SIZE,
        chunk_pos.z * CHUNK_SIZE,
    )
}

/// Chunk containing a continuous world position.
#[inline]
pub fn chunk_containing(p: Point3<f64>) -> Point3<i64> {
    let size = CHUNK_SIZE as f64;
    Point3::new(
        (p.x / size).floor() as i64,
        (p.y / size).floor() as i64,
        (p.z / size).floor() as i64,
    )
}
