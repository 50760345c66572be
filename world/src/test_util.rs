use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use terra_voxels::VoxelConfigHelper;

const VOXEL_CONFIG: &str = r#"
voxels:
  - name: Air
    category: air
    texture:
      Uniform:
        resource: air
  - name: Grass
    category: ground
    texture:
      Nonuniform:
        top:
          resource: grass_top
        bottom:
          resource: dirt
        side:
          resource: grass_side
  - name: Dirt
    category: ground
    texture:
      Uniform:
        resource: dirt
  - name: Rock
    category: ground
    texture:
      Uniform:
        resource: rock
"#;

static SCRATCH_COUNTER: AtomicUsize = AtomicUsize::new(0);

pub fn voxel_helper() -> Arc<VoxelConfigHelper> {
    Arc::new(VoxelConfigHelper::from_yaml(VOXEL_CONFIG).unwrap())
}

/// A fresh empty directory under the system temp dir.
pub fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "terra_world_{}_{}_{}",
        name,
        std::process::id(),
        SCRATCH_COUNTER.fetch_add(1, Ordering::SeqCst)
    ));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// Polls `condition` until it holds, panicking after a generous timeout.
pub fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(20);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(2));
    }
}
