//! Types used to represent the voxel-based world.
//!
pub mod config;
mod core;
pub mod face;
pub mod grid;
pub mod index_utils;
pub mod lighting;
pub mod persistence;
mod update;

pub use crate::{
    config::{VoxelConfig, VoxelConfigHelper},
    core::{ChunkVoxels, Voxel, VoxelRaycastHit},
    face::Face,
    grid::VoxelGrid,
    lighting::{LightingBuffer, VoxelSampler, CHUNK_LIGHTING_MAX},
    persistence::LoadError,
    update::VoxelDelta,
};
