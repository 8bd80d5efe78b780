pub mod grab;
pub mod preview;
pub mod sink;
pub mod stop;
pub mod writer;

use std::thread::JoinHandle;

use tracing::{error, info, instrument, warn};

pub use grab::{
    AcquisitionLoop, CloseOutcome, CloseRetryPolicy, DisplayCadence, SessionReport, SessionState,
    StopReason, Throughput,
};
pub use preview::Preview;
pub use sink::{write_queue, DisplayBuffer, DisplayStats, FrameSink, SinkClosed, SinkMessage};
pub use stop::{StopLevel, StopSignal};
pub use writer::{RawFrameWriter, WriterSummary};

use crate::capture::{open_camera, CameraModule, DeviceSystem};
use crate::metadata::CsvRecorder;
use crate::{CameraParameters, Error, Result};

/// Frames the preview may lag behind before the oldest is dropped.
pub const DISPLAY_DEPTH: usize = 2;

/// Record one camera: open and configure it, start the writer and preview
/// consumers, run the acquisition loop and wait for the consumers to drain.
///
/// Meant to run on the camera's dedicated thread.
#[instrument(skip_all, fields(camera = %params.name))]
pub fn acquire_camera<M: CameraModule>(
    system: &DeviceSystem<M>,
    mut params: CameraParameters,
    stop: StopSignal,
) -> Result<SessionReport> {
    params.validate()?;
    if let Some(core) = params.pin_core {
        pin_current_thread(core);
    }

    let mut camera = open_camera(system, &mut params)?;

    let (write_tx, write_rx) = write_queue();
    let writer = RawFrameWriter::new(params.raw_video_path(), write_rx).spawn(&params.name)?;

    let display = DisplayBuffer::new(DISPLAY_DEPTH);
    let finished = StopSignal::new();
    let preview = match params.display_cadence() {
        DisplayCadence::Never => None,
        DisplayCadence::Every(_) => Some(
            Preview::new(
                &params.name,
                display.clone(),
                finished.clone(),
                params.display_frame_rate,
            )
            .spawn()?,
        ),
    };

    let result =
        AcquisitionLoop::new(&params, write_tx, display, CsvRecorder, stop).run(&mut camera);
    finished.raise();
    drop(camera);

    let written = join(writer, "writer").and_then(|summary| summary);
    if let Some(preview) = preview {
        if let Err(e) = join(preview, "preview") {
            warn!("{}", e);
        }
    }

    let report = result?;
    match written {
        Ok(summary) if summary.frames != report.frames() => warn!(
            "{}: writer saved {} of {} frames",
            params.name,
            summary.frames,
            report.frames()
        ),
        Ok(_) => {}
        Err(e) => {
            error!("{}: video writer failed: {}", params.name, e);
            return Err(e);
        }
    }

    info!(
        "{} finished: {} frames, metadata in {}",
        params.name,
        report.frames(),
        report.metadata_path.display()
    );
    Ok(report)
}

fn join<T>(handle: JoinHandle<T>, what: &str) -> Result<T> {
    handle
        .join()
        .map_err(|_| Error::Thread(format!("{} thread panicked", what)))
}

fn pin_current_thread(core: usize) {
    let target = core_affinity::get_core_ids()
        .unwrap_or_default()
        .into_iter()
        .find(|id| id.id == core);
    match target {
        Some(id) if core_affinity::set_for_current(id) => info!("Pinned to core {}", core),
        _ => warn!("Could not pin acquisition thread to core {}", core),
    }
}
