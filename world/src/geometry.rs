//! Chunk meshes and the double buffer between the builder and the renderer.
//!
//! A build produces a whole new immutable `ChunkMesh` and publishes it with a single atomic
//! pointer swap, so the render thread always sees either the previous mesh or the new one in
//! full. The render thread alone turns meshes into renderer buffers.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use arc_swap::ArcSwap;
use cgmath::{EuclideanSpace, Point3, Vector3};
use crossbeam::{atomic::AtomicCell, channel};
use parking_lot::Mutex;

use terra_util::{convert_vec, Bounds};
use terra_voxels::{index_utils, Face, LightingBuffer, VoxelConfigHelper, VoxelSampler};

use crate::neighborhood::{Neighborhood, NeighborhoodVoxels};

/// Identifies a vertex/index buffer owned by the renderer.
pub type BufferHandle = u64;

/// Vertex order within a quad: origin, origin + horizontal, origin + vertical, far corner.
const QUAD_INDICES: [u32; 6] = [0, 1, 3, 0, 3, 2];
const QUAD_TEX_COORDS: [[f32; 2]; 4] = [[0., 1.], [1., 1.], [0., 0.], [1., 0.]];

/// Renderable geometry for one chunk, in world space.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkMesh {
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    /// Texture coordinates plus the texture array layer.
    pub tex_coords: Vec<[f32; 3]>,
    /// Sunlight brightness in `0..=1` for every vertex.
    pub sunlight: Vec<f32>,
    pub indices: Vec<u32>,
}

/// The external renderer. Only ever called from the thread that drives `ChunkStore::draw_chunks`.
pub trait ChunkRenderer {
    /// Copies a mesh into a new renderer buffer.
    fn upload(&mut self, mesh: &ChunkMesh) -> Result<BufferHandle>;
    fn draw(&mut self, handle: BufferHandle, index_count: usize);
    fn release(&mut self, handle: BufferHandle);
}

/// A live renderer buffer. When the last reference goes away the handle is queued for release on
/// the render thread, wherever the drop happened.
pub struct VertexBufferHolder {
    handle: BufferHandle,
    index_count: usize,
    release_sender: channel::Sender<BufferHandle>,
}

/// The geometry of one chunk: the current mesh, the renderer buffer made from it and the flags
/// that say whether either is out of date.
pub struct ChunkGeometry {
    current: ArcSwap<ChunkMesh>,
    dirty: AtomicCell<bool>,
    needs_upload: AtomicCell<bool>,
    vertex_buffer: Mutex<Option<Arc<VertexBufferHolder>>>,
    release_sender: channel::Sender<BufferHandle>,
}

impl ChunkMesh {
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// The world-space box around every vertex, or `None` for an empty mesh.
    pub fn bounds(&self) -> Option<Bounds<f32>> {
        let first = self.positions.first()?;
        let mut min = Point3::new(first[0], first[1], first[2]);
        let mut max = min;
        for &[x, y, z] in &self.positions {
            min = Point3::new(min.x.min(x), min.y.min(y), min.z.min(z));
            max = Point3::new(max.x.max(x), max.y.max(y), max.z.max(z));
        }
        Some(Bounds::from_limit(min, max))
    }

    fn push_quad(
        &mut self,
        quad: &[Point3<f32>; 4],
        normal: Vector3<f32>,
        layer: u32,
        light: f32,
    ) {
        let base = self.positions.len() as u32;
        for (corner, tex_coord) in quad.iter().zip(QUAD_TEX_COORDS.iter()) {
            self.positions.push([corner.x, corner.y, corner.z]);
            self.normals.push([normal.x, normal.y, normal.z]);
            self.tex_coords
                .push([tex_coord[0], tex_coord[1], layer as f32]);
            self.sunlight.push(light);
        }
        self.indices
            .extend(QUAD_INDICES.iter().map(|index| base + index));
    }
}

impl VertexBufferHolder {
    #[inline]
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    #[inline]
    pub fn index_count(&self) -> usize {
        self.index_count
    }
}

impl Drop for VertexBufferHolder {
    fn drop(&mut self) {
        // the receiver only disappears when the store is gone, and with it the renderer
        let _ = self.release_sender.send(self.handle);
    }
}

impl ChunkGeometry {
    pub fn new(release_sender: channel::Sender<BufferHandle>) -> Self {
        Self {
            current: ArcSwap::from_pointee(ChunkMesh::default()),
            dirty: AtomicCell::new(true),
            needs_upload: AtomicCell::new(false),
            vertex_buffer: Mutex::new(None),
            release_sender,
        }
    }

    /// The most recently built mesh.
    pub fn current(&self) -> Arc<ChunkMesh> {
        self.current.load_full()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load()
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true);
    }

    /// True when a mesh has been built that the renderer has not yet received.
    pub fn needs_upload(&self) -> bool {
        self.needs_upload.load()
    }

    pub fn vertex_buffer(&self) -> Option<Arc<VertexBufferHolder>> {
        self.vertex_buffer.lock().clone()
    }

    /// Rebuilds the mesh from the neighborhood, whose center must be the chunk owning this
    /// geometry. Never waits for a lock: if any voxel grid in the neighborhood is being written,
    /// nothing happens, the geometry stays dirty and `false` is returned.
    ///
    /// The dirty flag is cleared while the voxel locks are held, before sunlight is read. Any
    /// edit or relight that lands after the snapshot marks the geometry dirty again.
    pub fn try_build(&self, neighborhood: &Neighborhood, voxel_helper: &VoxelConfigHelper) -> bool {
        let ts_start = Instant::now();

        let mesh = neighborhood.try_read_voxels(|voxels| {
            self.dirty.store(false);
            build_mesh(neighborhood, voxels, voxel_helper)
        });

        let mesh = match mesh {
            Some(mesh) => mesh,
            None => {
                metrics::counter!("world.geometry.build_contended", 1);
                return false;
            }
        };

        self.current.store(Arc::new(mesh));
        self.needs_upload.store(true);

        metrics::timing!("world.geometry.build", ts_start.elapsed());
        true
    }

    /// Draws the chunk, first replacing its renderer buffer with the current mesh if a newer mesh
    /// exists and `allow_generation` is set. Returns whether a new buffer was generated. Does
    /// nothing but draw when the buffer is up to date.
    pub fn draw_generating_if_necessary<R>(
        &self,
        allow_generation: bool,
        renderer: &mut R,
    ) -> Result<bool>
    where
        R: ChunkRenderer + ?Sized,
    {
        let mut vertex_buffer = self.vertex_buffer.lock();
        let mut generated = false;

        if allow_generation && self.needs_upload.swap(false) {
            let mesh = self.current.load_full();
            let new_buffer = if mesh.is_empty() {
                None
            } else {
                match renderer.upload(&mesh) {
                    Ok(handle) => Some(Arc::new(VertexBufferHolder {
                        handle,
                        index_count: mesh.index_count(),
                        release_sender: self.release_sender.clone(),
                    })),
                    Err(err) => {
                        self.needs_upload.store(true);
                        return Err(err);
                    }
                }
            };

            // dropping the old holder queues its handle for release
            *vertex_buffer = new_buffer;
            generated = true;
        }

        if let Some(holder) = &*vertex_buffer {
            renderer.draw(holder.handle, holder.index_count);
        }

        Ok(generated)
    }

    #[cfg(test)]
    pub(crate) fn clear_dirty_for_test(&self) {
        self.dirty.store(false);
    }
}

impl std::fmt::Debug for ChunkGeometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkGeometry")
            .field("dirty", &self.dirty.load())
            .field("needs_upload", &self.needs_upload.load())
            .field("index_count", &self.current.load().index_count())
            .finish()
    }
}

/// Emits one quad for every voxel face that borders an empty voxel, inside the chunk or across
/// its boundary.
fn build_mesh(
    neighborhood: &Neighborhood,
    voxels: &NeighborhoodVoxels<'_>,
    voxel_helper: &VoxelConfigHelper,
) -> ChunkMesh {
    let center = neighborhood.center();
    let origin = center.min_corner();
    let own_light = center.sunlight();

    let mut neighbor_light: [Option<Arc<LightingBuffer>>; 6] = Default::default();
    for &face in Face::ALL.iter() {
        neighbor_light[face.index()] = neighborhood.neighbor_sunlight(face);
    }

    let face_brightness = |p: Point3<i64>| -> f32 {
        if index_utils::point_within_chunk(p) {
            return own_light.brightness_at(p);
        }
        let (chunk_offset, local) = index_utils::to_chunk_pos(p);
        match Face::from_normal(chunk_offset.to_vec()) {
            Some(face) => neighbor_light[face.index()]
                .as_ref()
                .map_or(1., |light| light.brightness_at(local)),
            None => 1.,
        }
    };

    let unit_quads = Bounds::from_size(Vector3::new(1f32, 1., 1.)).face_quads();

    let mut mesh = ChunkMesh::default();
    let chunk_bounds = Bounds::new(Point3::origin(), index_utils::chunk_size());

    for p in chunk_bounds.iter_points() {
        let voxel = voxels.center().get_voxel(p);
        if voxel.is_empty() {
            continue;
        }

        let world_offset = convert_vec!((origin + p.to_vec()).to_vec(), f32);

        for &face in Face::ALL.iter() {
            let adjacent = p + face.normal();
            if voxels.voxel_at(adjacent).is_solid() {
                continue;
            }

            let quad = &unit_quads[quad_index(face)];
            let corners = [
                quad.origin + world_offset,
                quad.origin + quad.horizontal + world_offset,
                quad.origin + quad.vertical + world_offset,
                quad.origin + quad.horizontal + quad.vertical + world_offset,
            ];

            mesh.push_quad(
                &corners,
                convert_vec!(face.normal(), f32),
                voxel_helper.face_texture_index(voxel, face),
                face_brightness(adjacent),
            );
        }
    }

    mesh
}

/// Position of a face in the array returned by `Bounds::face_quads`.
fn quad_index(face: Face) -> usize {
    match face {
        Face::NegZ => 0,
        Face::PosZ => 1,
        Face::NegX => 2,
        Face::PosX => 3,
        Face::NegY => 4,
        Face::PosY => 5,
    }
}
