use anyhow::{anyhow, bail, Result};
use cgmath::Point3;
use log::{error, info};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use structopt::StructOpt;

use terra::files::FileContext;
use terra_voxels::VoxelConfigHelper;
use terra_world::HeightFieldTerrain;

#[derive(Debug, StructOpt)]
struct Opts {
    #[structopt(short, long)]
    data_root: Option<PathBuf>,
    /// Directory holding saved worlds. Defaults to a folder in the user's documents.
    #[structopt(long)]
    save_root: Option<PathBuf>,
    #[structopt(subcommand)]
    action: Action,
}

#[derive(Debug, StructOpt)]
enum Action {
    /// Fly a camera through a world, loading, generating and editing chunks as it goes.
    Explore {
        #[structopt(flatten)]
        options: ExploreOpts,
    },
    /// Report what a saved world holds for one chunk.
    Inspect {
        #[structopt(flatten)]
        options: InspectOpts,
    },
}

#[derive(Debug, StructOpt)]
struct ExploreOpts {
    #[structopt(short, long)]
    save_name: String,
    /// Overrides the frame count from the settings file.
    #[structopt(short, long)]
    frames: Option<u64>,
}

#[derive(Debug, StructOpt)]
struct InspectOpts {
    #[structopt(short, long)]
    save_name: String,
    /// Chunk coordinate as three integers.
    #[structopt(long, number_of_values = 3, allow_hyphen_values = true)]
    chunk: Vec<i64>,
}

fn run(opt: Opts) -> Result<()> {
    let data_root: PathBuf = match opt.data_root {
        None => {
            let exe_fp = env::current_exe()?;
            exe_fp
                .parent()
                .ok_or_else(|| anyhow!("Expected absolute directory for current exe"))?
                .into()
        }
        Some(data_root) => data_root,
    };

    let ctx = FileContext::load(data_root, opt.save_root)?;
    ctx.ensure_directories()?;

    match &opt.action {
        Action::Explore { options } => run_explore(&ctx, options),
        Action::Inspect { options } => run_inspect(&ctx, options),
    }
}

fn run_explore(ctx: &FileContext, options: &ExploreOpts) -> Result<()> {
    let receiver = metrics_runtime::Receiver::builder()
        .build()
        .map_err(|err| anyhow!("Failed to build metrics receiver: {:?}", err))?;
    let metrics_controller = receiver.controller();
    receiver.install();

    let settings = ctx.load_settings()?;
    let mut params = settings.explore;
    if let Some(frames) = options.frames {
        params.frames = frames;
    }

    let voxel_helper = Arc::new(VoxelConfigHelper::new(&ctx.core_settings.voxel_config)?);
    let generator = Arc::new(HeightFieldTerrain::new(
        &ctx.core_settings.terrain_config,
        &voxel_helper,
    )?);

    let save_dir = ctx.save_dir(options.save_name.as_str())?;
    info!("Exploring world {:?}", save_dir);

    let summary = terra::explore(terra::ExploreArgs {
        store_settings: settings.store,
        params,
        save_dir,
        voxel_helper,
        generator,
        metrics_controller,
    })?;

    println!("{:#?}", summary);
    Ok(())
}

fn run_inspect(ctx: &FileContext, options: &InspectOpts) -> Result<()> {
    let chunk = match options.chunk.as_slice() {
        &[x, y, z] => Point3::new(x, y, z),
        _ => bail!("Expected three chunk coordinates, got {:?}", options.chunk),
    };

    let voxel_helper = VoxelConfigHelper::new(&ctx.core_settings.voxel_config)?;
    let save_dir = ctx.save_dir(options.save_name.as_str())?;

    let report = terra::inspect_chunk(&save_dir, chunk, &voxel_helper)?;
    print!("{}", report);
    Ok(())
}

fn main() {
    env_logger::init();

    match run(Opts::from_args()) {
        Ok(()) => (),
        Err(end_error) => {
            for error in end_error.chain() {
                error!("{}", error);
                error!("========");
            }
        }
    }
}
