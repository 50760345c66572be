mod controls;
pub mod files;
pub mod settings;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use cgmath::{Deg, InnerSpace, MetricSpace, Point3, Rad, Vector3};

use terra_voxels::{index_utils, persistence, LoadError, VoxelConfigHelper};
use terra_world::{
    BufferHandle, CameraState, ChunkMesh, ChunkRenderer, ChunkStore, StoreSettings,
    TerrainGenerator, UpdateStats,
};

use settings::ExploreParams;

pub struct ExploreArgs {
    pub store_settings: StoreSettings,
    pub params: ExploreParams,
    pub save_dir: PathBuf,
    pub voxel_helper: Arc<VoxelConfigHelper>,
    pub generator: Arc<dyn TerrainGenerator>,
    pub metrics_controller: metrics_runtime::Controller,
}

/// Totals over a whole fly-through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExploreSummary {
    pub frames: u64,
    pub loads_enqueued: usize,
    pub evicted: usize,
    pub builds_scheduled: usize,
    pub peak_chunks: usize,
    pub uploads: usize,
    pub releases: usize,
    pub draws: usize,
    pub edits: usize,
}

/// What is on disk for one chunk of a saved world.
#[derive(Debug)]
pub enum ChunkReport {
    NotFound {
        path: PathBuf,
    },
    Invalid {
        path: PathBuf,
        reason: String,
    },
    Valid {
        path: PathBuf,
        /// Voxel name (or id, for voxels the config does not know) and count, most common first.
        histogram: Vec<(String, usize)>,
    },
}

/// Stands in for a GPU: hands out buffer handles and counts what it is asked to do.
#[derive(Debug, Default)]
pub struct CountingRenderer {
    next_handle: BufferHandle,
    live: HashMap<BufferHandle, usize>,
    pub uploads: usize,
    pub releases: usize,
    pub draws: usize,
    pub drawn_indices: usize,
}

struct TimingParams {
    log_interval: Option<Duration>,
}

type MetricsObserver = <metrics_runtime::observers::YamlBuilder as metrics_core::Builder>::Output;

struct EventTracker {
    metrics_key: Option<metrics::Key>,
    prev_event: Option<Instant>,
}

struct TimeTracker {
    args: TimingParams,

    frame_event: EventTracker,
    log_event: EventTracker,

    metrics_controller: metrics_runtime::Controller,
    metrics_observer: MetricsObserver,
}

/// Flies a camera through the world, driving the chunk store the way a game loop would: update,
/// cull, draw, and every so often edit the voxel under the crosshairs. Shuts the store down at
/// the end so every edit is on disk.
pub fn explore(args: ExploreArgs) -> Result<ExploreSummary> {
    let ExploreArgs {
        store_settings,
        params,
        save_dir,
        voxel_helper,
        generator,
        metrics_controller,
    } = args;

    let mut store = ChunkStore::new(store_settings, save_dir, generator, voxel_helper)?;
    let mut controls = controls::ControlState::new(&params);
    let mut renderer = CountingRenderer::default();

    use metrics_core::Builder;
    let metrics_observer = metrics_runtime::observers::YamlBuilder::new().build();
    let mut time_tracker = TimeTracker::new(
        TimingParams {
            log_interval: params.metrics_log_interval_secs.map(Duration::from_secs),
        },
        metrics_observer,
        metrics_controller,
    );

    let step = Duration::from_millis(params.game_step_millis);
    let mut summary = ExploreSummary::default();

    controls.steer(Vector3::new(0, 0, 1));

    for frame in 0..params.frames {
        let frame_start = Instant::now();
        time_tracker.tick(frame_start);

        if params.leg_frames > 0 && frame > 0 && frame % params.leg_frames == 0 {
            controls.turn(Deg(params.turn_degrees).into(), Rad(0.));
        }

        let camera = controls.tick(step.as_secs_f64());
        let stats = store.update(step.as_secs_f64(), &camera)?;
        summary.record_update(&stats);
        summary.peak_chunks = summary.peak_chunks.max(store.chunk_count());

        store.update_visibility(|corners| in_view(&camera, corners, params.view_distance));
        store.draw_chunks(&mut renderer)?;

        if params.edit_interval_frames > 0
            && frame % params.edit_interval_frames == params.edit_interval_frames - 1
        {
            let edited = if summary.edits % 2 == 0 {
                store.remove_block_under_crosshairs()?
            } else {
                store.place_block_under_crosshairs()?
            };

            if let Some(pos) = edited {
                log::info!("Frame {}: edited voxel at {:?}", frame, pos);
                summary.edits += 1;
            }
        }

        summary.frames += 1;

        let frame_time = frame_start.elapsed();
        if frame_time < step {
            std::thread::sleep(step - frame_time);
        }
    }

    log::info!("Final metrics: {}", time_tracker.drain_metrics());
    log::debug!("{} renderer buffers live before shutdown", renderer.live_buffers());

    store.shutdown()?;
    summary.uploads = renderer.uploads;
    summary.releases = renderer.releases;
    summary.draws = renderer.draws;

    log::info!("Explore finished: {:?}", summary);
    Ok(summary)
}

/// Reads one chunk file of a saved world without going through a chunk store.
pub fn inspect_chunk(
    save_dir: &Path,
    chunk_pos: Point3<i64>,
    voxel_helper: &VoxelConfigHelper,
) -> Result<ChunkReport> {
    if !save_dir.is_dir() {
        bail!(
            "Saved world does not exist: expected {} to be a directory",
            save_dir.to_string_lossy()
        );
    }

    let min_corner = index_utils::chunk_min_corner(chunk_pos);
    let voxels = match persistence::load_voxels(save_dir, min_corner) {
        Ok(voxels) => voxels,
        Err(LoadError::NotFound { path }) => return Ok(ChunkReport::NotFound { path }),
        Err(LoadError::InvalidData { path, reason }) => {
            return Ok(ChunkReport::Invalid { path, reason })
        }
        Err(err) => return Err(err.into()),
    };

    let mut counts: BTreeMap<u16, usize> = BTreeMap::new();
    for voxel in voxels.as_slice() {
        *counts.entry(voxel.to_u16()).or_insert(0) += 1;
    }

    let mut histogram: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(id, count)| {
            let name = match voxel_helper.voxel_info(terra_voxels::Voxel::from_u16(id)) {
                Some(info) => info.name.clone(),
                None => format!("unknown voxel {}", id),
            };
            (name, count)
        })
        .collect();
    histogram.sort_by(|(_, a), (_, b)| b.cmp(a));

    Ok(ChunkReport::Valid {
        path: persistence::voxel_data_path(save_dir, min_corner),
        histogram,
    })
}

/// A rough view cone: some corner of the chunk is within `view_distance` of the camera and not
/// behind it. The chunk containing the camera is always in view.
pub fn in_view(camera: &CameraState, corners: &[Point3<f64>; 8], view_distance: f64) -> bool {
    let (min, max) = (corners[0], corners[7]);
    let p = camera.position;
    if (0..3).all(|axis| p[axis] >= min[axis] && p[axis] < max[axis]) {
        return true;
    }

    corners.iter().any(|&corner| {
        corner.distance(p) <= view_distance && (corner - p).dot(camera.look_at_dir) >= 0.
    })
}

impl ExploreSummary {
    fn record_update(&mut self, stats: &UpdateStats) {
        self.loads_enqueued += stats.loads_enqueued;
        self.evicted += stats.evicted;
        self.builds_scheduled += stats.builds_scheduled;
    }
}

impl CountingRenderer {
    /// Number of buffers uploaded and not yet released.
    pub fn live_buffers(&self) -> usize {
        self.live.len()
    }
}

impl ChunkRenderer for CountingRenderer {
    fn upload(&mut self, mesh: &ChunkMesh) -> Result<BufferHandle> {
        self.next_handle += 1;
        self.uploads += 1;
        self.live.insert(self.next_handle, mesh.index_count());
        Ok(self.next_handle)
    }

    fn draw(&mut self, handle: BufferHandle, index_count: usize) {
        if self.live.contains_key(&handle) {
            self.draws += 1;
            self.drawn_indices += index_count;
        } else {
            log::error!(
                "Drawing buffer {} which was never uploaded or already released",
                handle
            );
        }
    }

    fn release(&mut self, handle: BufferHandle) {
        if self.live.remove(&handle).is_some() {
            self.releases += 1;
        } else {
            log::error!("Releasing unknown buffer {}", handle);
        }
    }
}

impl fmt::Display for ChunkReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkReport::NotFound { path } => {
                write!(f, "{}: not found (would be generated)", path.display())
            }
            ChunkReport::Invalid { path, reason } => {
                write!(f, "{}: invalid ({}; would be regenerated)", path.display(), reason)
            }
            ChunkReport::Valid { path, histogram } => {
                writeln!(f, "{}: valid", path.display())?;
                for (name, count) in histogram {
                    writeln!(f, "  {:>8} {}", count, name)?;
                }
                Ok(())
            }
        }
    }
}

impl EventTracker {
    fn check_ready(&mut self, now: Instant, period: Duration) -> bool {
        let prev_event = match &mut self.prev_event {
            None => {
                self.prev_event = Some(now);
                return true;
            }
            Some(prev_event) => prev_event,
        };

        let elapsed = now.duration_since(*prev_event);
        let ready = elapsed >= period;
        if ready {
            *prev_event = now;
            if let Some(metrics_key) = &self.metrics_key {
                metrics::recorder()
                    .record_histogram(metrics_key.clone(), elapsed.as_nanos() as u64);
            }
        }

        ready
    }
}

impl TimeTracker {
    pub fn new(
        args: TimingParams,
        metrics_observer: MetricsObserver,
        metrics_controller: metrics_runtime::Controller,
    ) -> Self {
        Self {
            frame_event: EventTracker {
                metrics_key: Some(metrics::Key::from_name("terra.frame_interval")),
                prev_event: None,
            },
            log_event: EventTracker {
                metrics_key: None,
                prev_event: None,
            },
            args,
            metrics_controller,
            metrics_observer,
        }
    }

    /// Records the start of a frame, and logs the metrics gathered so far if the log interval has
    /// passed.
    pub fn tick(&mut self, now: Instant) {
        self.frame_event.check_ready(now, Duration::from_secs(0));

        if let Some(log_interval) = self.args.log_interval {
            if self.log_event.check_ready(now, log_interval) {
                log::info!("{}", self.drain_metrics());
            }
        }
    }

    pub fn drain_metrics(&mut self) -> String {
        use metrics_core::{Drain, Observe};
        self.metrics_controller.observe(&mut self.metrics_observer);
        self.metrics_observer.drain()
    }
}
