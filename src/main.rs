//! campy: record synchronized video from several triggered cameras.

use std::path::PathBuf;
use std::sync::Arc;

use campy::capture::{DeviceSystem, EmuConfig, EmuModule};
use campy::pipeline::{acquire_camera, StopLevel};
use campy::settings::{self, Overrides};
use campy::StopSignal;
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "campy", version, about = "Multi-camera triggered acquisition")]
struct Args {
    /// Run configuration (TOML).
    config: PathBuf,

    #[arg(long)]
    video_folder: Option<PathBuf>,
    #[arg(long)]
    video_filename: Option<String>,
    #[arg(long)]
    frame_rate: Option<f64>,
    #[arg(long)]
    rec_time_in_sec: Option<f64>,
    #[arg(long)]
    num_cams: Option<usize>,
    /// Comma-separated, one per camera.
    #[arg(long, value_delimiter = ',')]
    camera_names: Option<Vec<String>>,
    /// Comma-separated device indices, one per camera.
    #[arg(long, value_delimiter = ',')]
    camera_selection: Option<Vec<usize>>,
    #[arg(long)]
    chunk_length_in_sec: Option<f64>,
    #[arg(long)]
    display_frame_rate: Option<f64>,
    #[arg(long)]
    display_downsample: Option<usize>,

    /// Number of emulated cameras the backend exposes (defaults to num_cams).
    #[arg(long)]
    emulated_cameras: Option<usize>,
}

impl From<&Args> for Overrides {
    fn from(args: &Args) -> Self {
        Overrides {
            video_folder: args.video_folder.clone(),
            video_filename: args.video_filename.clone(),
            num_cams: args.num_cams,
            camera_names: args.camera_names.clone(),
            camera_selection: args.camera_selection.clone(),
            frame_rate: args.frame_rate,
            rec_time_in_sec: args.rec_time_in_sec,
            chunk_length_in_sec: args.chunk_length_in_sec,
            display_frame_rate: args.display_frame_rate,
            display_downsample: args.display_downsample,
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("campy=info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_timer(fmt::time::uptime()));

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let args = Args::parse();
    let run = settings::load(&args.config, &Overrides::from(&args))?;
    let cameras = run.all_camera_parameters()?;
    info!(
        "campy launching: {} camera(s), {} s at up to {} fps",
        cameras.len(),
        run.rec_time_in_sec,
        cameras.iter().map(|c| c.frame_rate).fold(0.0, f64::max)
    );

    let emu = EmuConfig::for_cameras(&cameras, args.emulated_cameras.unwrap_or(run.num_cams));
    let system = Arc::new(DeviceSystem::new(EmuModule::new(emu)));

    let stop = StopSignal::new();
    let ctrl_c = {
        let stop = stop.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                match stop.escalate() {
                    StopLevel::Aborted => {
                        warn!("Aborting, camera shutdown will not be retried");
                        break;
                    }
                    _ => info!("Stopping after the current frame (Ctrl-C again to abort)"),
                }
            }
        })
    };

    let sessions: Vec<_> = cameras
        .into_iter()
        .map(|params| {
            let system = Arc::clone(&system);
            let stop = stop.clone();
            let name = params.name.clone();
            let task = tokio::task::spawn_blocking(move || acquire_camera(&*system, params, stop));
            (name, task)
        })
        .collect();

    let mut failed = Vec::new();
    for (name, task) in sessions {
        match task.await {
            Ok(Ok(report)) if report.is_clean() => {
                info!("{}: {} frames ({:?})", name, report.frames(), report.stop_reason)
            }
            Ok(Ok(report)) => {
                warn!(
                    "{}: session ended uncleanly ({:?}, {:?})",
                    name, report.stop_reason, report.close
                );
                failed.push(name);
            }
            Ok(Err(e)) => {
                error!("{}: {}", name, e);
                failed.push(name);
            }
            Err(e) => {
                error!("{}: acquisition task failed: {}", name, e);
                failed.push(name);
            }
        }
    }
    ctrl_c.abort();

    match Arc::try_unwrap(system) {
        Ok(system) => system.release()?,
        Err(_) => warn!("Camera system still shared at exit"),
    }

    if failed.is_empty() {
        info!("All sessions finished");
        Ok(())
    } else {
        Err(eyre!("acquisition failed for {}", failed.join(", ")))
    }
}
