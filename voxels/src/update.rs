use std::collections::HashSet;

use cgmath::Point3;

use crate::face::Face;
use crate::index_utils::{self, CHUNK_SIZE};

/// The chunks affected by a batch of voxel edits. Geometry must be rebuilt for every chunk in
/// `modified_chunks`; lighting must be rebuilt for every chunk in `relit_chunks`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoxelDelta {
    pub modified_chunks: HashSet<Point3<i64>>,
    pub relit_chunks: HashSet<Point3<i64>>,
}

impl VoxelDelta {
    pub fn empty() -> Self {
        Self {
            modified_chunks: HashSet::new(),
            relit_chunks: HashSet::new(),
        }
    }

    /// Records an edit to the voxel at world position `point`.
    ///
    /// The owning chunk always needs new geometry and lighting, and so does every neighbor that
    /// shares a face with the edited voxel. The chunk below needs new lighting too, since the
    /// edit can open or close the sky for its columns.
    pub fn record_voxel_update(&mut self, point: Point3<i64>) {
        let (chunk_pos, local) = index_utils::to_chunk_pos(point);

        self.modified_chunks.insert(chunk_pos);
        self.relit_chunks.insert(chunk_pos);
        self.relit_chunks.insert(chunk_pos + Face::NegY.normal());

        for &face in touched_faces(local).iter().flatten() {
            let neighbor = chunk_pos + face.normal();
            self.modified_chunks.insert(neighbor);
            self.relit_chunks.insert(neighbor);
        }
    }
}

/// Chunk faces that a chunk-local voxel lies against, at most one per axis.
fn touched_faces(local: Point3<i64>) -> [Option<Face>; 3] {
    let last = CHUNK_SIZE - 1;
    let axis = |value: i64, neg: Face, pos: Face| {
        if value == 0 {
            Some(neg)
        } else if value == last {
            Some(pos)
        } else {
            None
        }
    };

    [
        axis(local.x, Face::NegX, Face::PosX),
        axis(local.y, Face::NegY, Face::PosY),
        axis(local.z, Face::NegZ, Face::PosZ),
    ]
}
