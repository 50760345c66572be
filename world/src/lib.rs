//! Resident chunks and the store that loads, lights, meshes and saves them around an observer.

pub mod chunk;
pub mod geometry;
pub mod neighborhood;
pub mod store;
mod tasks;
pub mod terrain;

#[cfg(test)]
mod test_util;

pub use chunk::Chunk;
pub use geometry::{BufferHandle, ChunkGeometry, ChunkMesh, ChunkRenderer, VertexBufferHolder};
pub use neighborhood::Neighborhood;
pub use store::{CameraState, ChunkStore, DrawStats, StoreSettings, UpdateStats};
pub use terrain::{GenerateTerrainConfig, HeightFieldTerrain, TerrainGenerator};
