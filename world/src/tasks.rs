//! The work the store hands to its worker pool. Every task reports back to the store's thread
//! through a completion channel; only the store mutates the chunk map.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use cgmath::Point3;
use crossbeam::{atomic::AtomicCell, channel};
use log::{debug, warn};

use terra_util::TaskToken;
use terra_voxels::{
    index_utils, persistence, ChunkVoxels, LightingBuffer, LoadError, VoxelConfigHelper,
};

use crate::chunk::Chunk;
use crate::neighborhood::Neighborhood;
use crate::terrain::{self, TerrainGenerator};

/// Where a chunk's voxels came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkSource {
    Loaded,
    Generated,
    /// Saved data existed but was unusable.
    Regenerated,
}

pub(crate) enum TaskCompletion {
    Loaded {
        coord: Point3<i64>,
        epoch: u64,
        voxels: ChunkVoxels,
        source: ChunkSource,
    },
    LoadFailed {
        coord: Point3<i64>,
        epoch: u64,
        error: LoadError,
    },
    Lit {
        coord: Point3<i64>,
        changed: bool,
    },
    Built {
        coord: Point3<i64>,
        built: bool,
    },
}

pub(crate) type CompletionSender = channel::Sender<TaskCompletion>;

pub(crate) struct LoadRequest {
    pub coord: Point3<i64>,
    pub epoch: u64,
    pub folder: PathBuf,
    pub generator: Arc<dyn TerrainGenerator>,
    pub voxel_helper: Arc<VoxelConfigHelper>,
    pub stopping: Arc<AtomicCell<bool>>,
}

/// Reads a chunk from disk, or generates it if there is nothing usable on disk.
pub(crate) fn load_chunk(request: LoadRequest, completions: &CompletionSender) -> Result<()> {
    if request.stopping.load() {
        return Ok(());
    }

    let (coord, epoch) = (request.coord, request.epoch);
    let completion = match load_or_generate(&request) {
        Ok((voxels, source)) => TaskCompletion::Loaded {
            coord,
            epoch,
            voxels,
            source,
        },
        Err(error) => TaskCompletion::LoadFailed {
            coord,
            epoch,
            error,
        },
    };

    send(completions, completion)
}

fn load_or_generate(request: &LoadRequest) -> Result<(ChunkVoxels, ChunkSource), LoadError> {
    let coord = request.coord;
    let min_corner = index_utils::chunk_min_corner(coord);
    let generate = || terrain::generate_chunk(&*request.generator, coord);

    match persistence::load_voxels(&request.folder, min_corner) {
        Ok(voxels) => {
            let unknown = voxels
                .as_slice()
                .iter()
                .find(|&&voxel| !request.voxel_helper.is_known(voxel));

            match unknown {
                None => {
                    debug!("Loaded chunk {:?} from disk", coord);
                    metrics::counter!("world.chunks.loaded", 1);
                    Ok((voxels, ChunkSource::Loaded))
                }
                Some(voxel) => {
                    warn!(
                        "Saved data for chunk {:?} contains unknown voxel type {}; regenerating",
                        coord,
                        voxel.to_u16()
                    );
                    Ok((generate(), ChunkSource::Regenerated))
                }
            }
        }
        Err(LoadError::NotFound { .. }) => {
            debug!("No saved data for chunk {:?}; generating", coord);
            Ok((generate(), ChunkSource::Generated))
        }
        Err(err @ LoadError::InvalidData { .. }) => {
            warn!("{}; regenerating chunk {:?}", err, coord);
            Ok((generate(), ChunkSource::Regenerated))
        }
        Err(err) => Err(err),
    }
}

/// Recomputes the sunlight of the neighborhood's center chunk.
pub(crate) fn relight_chunk(
    neighborhood: Neighborhood,
    completions: &CompletionSender,
) -> Result<()> {
    let chunk = neighborhood.center().clone();
    let _task = chunk.begin_task();

    if chunk.is_evicted() {
        chunk.finish_lighting();
        return Ok(());
    }

    let ts_start = Instant::now();
    let sunlight = neighborhood.read_voxels(|voxels| LightingBuffer::rebuild_sunlight(voxels));

    // an evicted chunk keeps whatever it had; nobody will draw it again
    let changed = !chunk.is_evicted() && chunk.replace_sunlight(sunlight);
    if changed {
        chunk.geometry().mark_dirty();
    }

    metrics::timing!("world.lighting.rebuild", ts_start.elapsed());

    let result = send(
        completions,
        TaskCompletion::Lit {
            coord: chunk.coord(),
            changed,
        },
    );
    chunk.finish_lighting();
    result
}

/// Tries once to rebuild the mesh of the neighborhood's center chunk.
pub(crate) fn build_chunk(
    neighborhood: Neighborhood,
    voxel_helper: &VoxelConfigHelper,
    completions: &CompletionSender,
) -> Result<()> {
    let chunk = neighborhood.center().clone();
    let _task = chunk.begin_task();

    let built = !chunk.is_evicted() && chunk.geometry().try_build(&neighborhood, voxel_helper);

    let result = send(
        completions,
        TaskCompletion::Built {
            coord: chunk.coord(),
            built,
        },
    );
    chunk.finish_build();
    result
}

/// Saves a chunk in the background. The token keeps the store's shutdown waiting until the save
/// is done.
pub(crate) fn save_chunk(chunk: Arc<Chunk>, folder: PathBuf, _token: TaskToken) -> Result<()> {
    let _task = chunk.begin_task();
    if chunk.save(&folder)? {
        debug!("Saved chunk {:?} in the background", chunk.coord());
    }
    Ok(())
}

fn send(completions: &CompletionSender, completion: TaskCompletion) -> Result<()> {
    completions
        .send(completion)
        .map_err(|_| anyhow!("chunk store stopped listening for task completions"))
}

#[cfg(test)]
mod tests {
    use terra_voxels::Voxel;

    use super::*;
    use crate::test_util::{scratch_dir, voxel_helper};

    fn solid_chunk(coord: Point3<i64>) -> (Arc<Chunk>, channel::Receiver<crate::BufferHandle>) {
        let (release_sender, release_receiver) = channel::unbounded();
        let voxels = ChunkVoxels::from_fn(|_| Voxel::from_u16(3));
        (
            Arc::new(Chunk::new(coord, voxels, release_sender)),
            release_receiver,
        )
    }

    fn load_request(coord: Point3<i64>, folder: PathBuf, stopping: bool) -> LoadRequest {
        LoadRequest {
            coord,
            epoch: 7,
            folder,
            generator: Arc::new(|_: Point3<i64>| Voxel::from_u16(2)),
            voxel_helper: voxel_helper(),
            stopping: Arc::new(AtomicCell::new(stopping)),
        }
    }

    #[test]
    fn test_relight_publishes_new_sunlight() {
        let (chunk, _release) = solid_chunk(Point3::new(0, 0, 0));
        let before = chunk.sunlight();
        assert!(chunk.begin_lighting());
        chunk.geometry().clear_dirty_for_test();

        let (sender, receiver) = channel::unbounded();
        relight_chunk(Neighborhood::gather(chunk.clone(), |_| None), &sender).unwrap();

        assert!(!Arc::ptr_eq(&before, &chunk.sunlight()));
        assert!(chunk.geometry().is_dirty());
        assert!(!chunk.is_lighting_in_flight());
        assert_eq!(chunk.in_flight(), 0);
        match receiver.try_recv() {
            Ok(TaskCompletion::Lit { coord, changed }) => {
                assert_eq!(coord, Point3::new(0, 0, 0));
                assert!(changed);
            }
            _ => panic!("expected a lighting completion"),
        }
    }

    #[test]
    fn test_evicted_chunk_results_are_discarded() {
        let helper = voxel_helper();
        let (chunk, _release) = solid_chunk(Point3::new(0, 0, 0));
        let sunlight = chunk.sunlight();
        let mesh = chunk.geometry().current();
        assert!(chunk.begin_lighting());
        assert!(chunk.begin_build());
        chunk.mark_evicted();

        let (sender, receiver) = channel::unbounded();
        relight_chunk(Neighborhood::gather(chunk.clone(), |_| None), &sender).unwrap();
        build_chunk(
            Neighborhood::gather(chunk.clone(), |_| None),
            &helper,
            &sender,
        )
        .unwrap();

        assert!(Arc::ptr_eq(&sunlight, &chunk.sunlight()));
        assert!(Arc::ptr_eq(&mesh, &chunk.geometry().current()));
        assert!(chunk.geometry().is_dirty());
        assert!(!chunk.geometry().needs_upload());
        assert!(!chunk.is_lighting_in_flight());
        assert!(!chunk.is_build_in_flight());
        assert_eq!(chunk.in_flight(), 0);

        match receiver.try_recv() {
            Ok(TaskCompletion::Built { built, .. }) => assert!(!built),
            _ => panic!("expected a build completion"),
        }
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_load_generates_then_reads_saved_chunk() {
        let folder = scratch_dir("tasks_load");
        let coord = Point3::new(1, -2, 0);
        let (sender, receiver) = channel::unbounded();

        load_chunk(load_request(coord, folder.clone(), false), &sender).unwrap();
        let voxels = match receiver.try_recv() {
            Ok(TaskCompletion::Loaded {
                coord: loaded,
                epoch,
                voxels,
                source,
            }) => {
                assert_eq!(loaded, coord);
                assert_eq!(epoch, 7);
                assert_eq!(source, ChunkSource::Generated);
                voxels
            }
            _ => panic!("expected a generated chunk"),
        };
        assert_eq!(voxels.get_voxel(Point3::new(4, 4, 4)), Voxel::from_u16(2));

        let mut edited = voxels;
        edited.set_voxel(Point3::new(4, 4, 4), Voxel::from_u16(1));
        persistence::save_voxels(&folder, index_utils::chunk_min_corner(coord), &edited).unwrap();

        load_chunk(load_request(coord, folder, false), &sender).unwrap();
        match receiver.try_recv() {
            Ok(TaskCompletion::Loaded { voxels, source, .. }) => {
                assert_eq!(source, ChunkSource::Loaded);
                assert_eq!(voxels.get_voxel(Point3::new(4, 4, 4)), Voxel::from_u16(1));
            }
            _ => panic!("expected a loaded chunk"),
        }
    }

    #[test]
    fn test_load_after_stop_reports_nothing() {
        let (sender, receiver) = channel::unbounded();
        load_chunk(
            load_request(Point3::new(0, 0, 0), scratch_dir("tasks_stopped"), true),
            &sender,
        )
        .unwrap();
        assert!(receiver.try_recv().is_err());
    }
}
