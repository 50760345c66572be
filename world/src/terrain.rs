use std::f64::consts::PI;
use std::time::Instant;

use anyhow::{anyhow, Result};
use cgmath::{EuclideanSpace, Point3};
use log::info;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use terra_voxels::{index_utils, ChunkVoxels, Voxel, VoxelConfigHelper};

/// Produces the voxel at any world position. Must be a pure function of the position, since it is
/// called concurrently from every chunk generation task.
pub trait TerrainGenerator: Send + Sync {
    fn voxel_at(&self, p: Point3<i64>) -> Voxel;
}

impl<F> TerrainGenerator for F
where
    F: Fn(Point3<i64>) -> Voxel + Send + Sync,
{
    fn voxel_at(&self, p: Point3<i64>) -> Voxel {
        self(p)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateTerrainConfig {
    pub seed: u64,
    /// Height of the lowest valleys.
    pub base_height: f64,
    /// Difference in height between the lowest valleys and the highest peaks.
    pub terrain_height: f64,
    /// Horizontal distance between neighboring peaks.
    pub wavelength: f64,
    pub subsurface_depth: f64,
    pub surface_voxel: String,
    pub subsurface_voxel: String,
    pub rock_voxel: String,
}

/// Rolling hills: a seeded sine/cosine height field with a surface layer, a subsurface layer and
/// rock below.
#[derive(Debug, Clone)]
pub struct HeightFieldTerrain {
    base_height: f64,
    terrain_height: f64,
    subsurface_depth: f64,
    frequency_x: f64,
    frequency_z: f64,
    phase_x: f64,
    phase_z: f64,
    surface_voxel: Voxel,
    subsurface_voxel: Voxel,
    rock_voxel: Voxel,
}

impl HeightFieldTerrain {
    pub fn new(config: &GenerateTerrainConfig, voxel_helper: &VoxelConfigHelper) -> Result<Self> {
        info!("Creating terrain generator: {:?}", config);

        if config.wavelength <= 0. {
            return Err(anyhow!(
                "Terrain wavelength must be positive, got {}",
                config.wavelength
            ));
        }

        let lookup = |name: &str| -> Result<Voxel> {
            voxel_helper
                .voxel_by_name(name)
                .map(|(voxel, _)| voxel)
                .ok_or_else(|| anyhow!("Missing voxel config for {}", name))
        };

        let surface_voxel = lookup(&config.surface_voxel)?;
        let subsurface_voxel = lookup(&config.subsurface_voxel)?;
        let rock_voxel = lookup(&config.rock_voxel)?;

        let mut rng = StdRng::seed_from_u64(config.seed);

        let cos_factor = 2.0;
        let sin_factor = 1.0;
        let base_frequency = 2. * PI / config.wavelength;

        Ok(Self {
            base_height: config.base_height,
            terrain_height: config.terrain_height,
            subsurface_depth: config.subsurface_depth,
            frequency_x: base_frequency * sin_factor,
            frequency_z: base_frequency * cos_factor,
            phase_x: rng.gen_range(0., 2. * PI),
            phase_z: rng.gen_range(0., 2. * PI),
            surface_voxel,
            subsurface_voxel,
            rock_voxel,
        })
    }

    /// Height of the terrain surface at a horizontal position.
    pub fn height_at(&self, x: f64, z: f64) -> f64 {
        // val in range [0, 1]
        let val = 0.5
            * (1.0
                + (x * self.frequency_x + self.phase_x).sin()
                    * (z * self.frequency_z + self.phase_z).cos());
        self.base_height + val * self.terrain_height
    }
}

impl TerrainGenerator for HeightFieldTerrain {
    fn voxel_at(&self, p: Point3<i64>) -> Voxel {
        // sample the height at the center of the column
        let height_here = self.height_at(p.x as f64 + 0.5, p.z as f64 + 0.5);
        let y = p.y as f64;

        if y > height_here {
            Voxel::air()
        } else if y > height_here - 1. {
            self.surface_voxel
        } else if y > height_here - self.subsurface_depth {
            self.subsurface_voxel
        } else {
            self.rock_voxel
        }
    }
}

/// Fills one chunk from the generator.
pub fn generate_chunk(generator: &dyn TerrainGenerator, chunk_pos: Point3<i64>) -> ChunkVoxels {
    let ts_start = Instant::now();

    let origin = index_utils::chunk_min_corner(chunk_pos);
    let voxels = ChunkVoxels::from_fn(|p| generator.voxel_at(origin + p.to_vec()));

    metrics::timing!("world.worldgen.chunk", ts_start.elapsed());
    metrics::counter!("world.chunks.generated", 1);

    voxels
}
