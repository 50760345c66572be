use cgmath::{Point3, Vector3};
use serde::{Deserialize, Serialize};

use terra_voxels::VoxelConfig;
use terra_world::{GenerateTerrainConfig, StoreSettings};

/// Settings specific to this particular installation.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Settings {
    pub store: StoreSettings,
    pub explore: ExploreParams,
}

/// Settings specific to the engine and its data files.
#[derive(Debug, Serialize, Deserialize)]
pub struct CoreSettings {
    pub game_name: String,
    /// Directory under the user's documents holding saves and settings.
    pub path_name: String,
    pub save_dir_name: String,
    pub voxel_config: VoxelConfig,
    pub terrain_config: GenerateTerrainConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExploreParams {
    pub game_step_millis: u64,
    pub frames: u64,
    pub initial_camera_pos: Point3<f64>,
    pub look_at_dir: Vector3<f64>,
    /// Frames flown straight ahead before turning.
    pub leg_frames: u64,
    /// Yaw at the end of each leg.
    pub turn_degrees: f64,
    /// Chunks with no corner this close to the camera are culled.
    pub view_distance: f64,
    /// Every this many frames the voxel under the crosshairs is removed or placed. Zero disables
    /// edits.
    pub edit_interval_frames: u64,
    pub metrics_log_interval_secs: Option<u64>,
}

impl Default for ExploreParams {
    fn default() -> Self {
        Self {
            game_step_millis: 16,
            frames: 600,
            initial_camera_pos: Point3::new(0.5, 40.5, 0.5),
            look_at_dir: Vector3::new(1., -0.6, 1.),
            leg_frames: 120,
            turn_degrees: 60.,
            view_distance: 160.,
            edit_interval_frames: 30,
            metrics_log_interval_secs: Some(5),
        }
    }
}
