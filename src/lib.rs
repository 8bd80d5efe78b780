//! Timed machine-vision acquisition with per-frame timing metadata.
//!
//! A camera is opened and configured through [`capture`], then driven by the
//! acquisition loop in [`pipeline`], which hands full-resolution frames to a
//! disk writer, downsampled frames to a live preview and finally persists the
//! `(frameNumber, timeStamp)` table through [`metadata`].

pub mod capture;
pub mod error;
pub mod metadata;
pub mod pipeline;
pub mod settings;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use capture::{BufferHandling, Frame, PixelFormat, TriggerSource};
pub use error::{Error, Result};
pub use metadata::{CsvRecorder, GrabRecord, MetadataRecorder};
pub use pipeline::{AcquisitionLoop, DisplayCadence, SessionReport, StopSignal};

/// Parameters for one camera stream.
///
/// Everything except the identity fields filled in by
/// [`capture::open_camera`] (serial, model, frame size) is read-only once
/// acquisition begins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraParameters {
    /// Camera number within the run (0-based).
    pub index: usize,
    pub name: String,
    /// Device index handed to the camera module.
    pub selection: usize,
    pub serial: String,
    pub model: String,

    /// Trigger frequency in frames per second.
    pub frame_rate: f64,
    pub rec_time_in_sec: f64,
    /// Exposure time in microseconds.
    pub exposure_us: f64,
    /// Gain in dB.
    pub gain_db: f64,
    pub trigger: TriggerSource,
    pub buffer_mode: BufferHandling,
    pub buffer_size: u32,

    /// Preview rate in Hz. Zero or negative disables the preview.
    pub display_frame_rate: f64,
    pub display_downsample: usize,
    /// Interval between throughput reports.
    pub chunk_length_in_sec: f64,

    pub frame_width: u32,
    pub frame_height: u32,

    /// Output folder for this camera.
    pub video_folder: PathBuf,
    pub video_filename: String,

    /// Upper bound on a single grab wait.
    pub grab_timeout_ms: u64,
    /// CPU core the acquisition thread is pinned to.
    pub pin_core: Option<usize>,
}

impl Default for CameraParameters {
    fn default() -> Self {
        Self {
            index: 0,
            name: "Camera0".into(),
            selection: 0,
            serial: String::new(),
            model: String::new(),
            frame_rate: 100.0,
            rec_time_in_sec: 10.0,
            exposure_us: 5000.0,
            gain_db: 0.0,
            trigger: TriggerSource::Hardware,
            buffer_mode: BufferHandling::OldestFirst,
            buffer_size: 100,
            display_frame_rate: 10.0,
            display_downsample: 2,
            chunk_length_in_sec: 30.0,
            frame_width: 0,
            frame_height: 0,
            video_folder: PathBuf::from("."),
            video_filename: "0.mp4".into(),
            grab_timeout_ms: 5,
            pin_core: None,
        }
    }
}

impl CameraParameters {
    /// Number of frames after which the recording is complete.
    pub fn target_frame_count(&self) -> u64 {
        let frames = self.rec_time_in_sec * self.frame_rate;
        if !(frames.is_finite() && frames > 0.0) {
            return 0;
        }
        // Products like 0.07 * 100 land a hair above the whole number.
        let whole = frames.round();
        if (frames - whole).abs() < 1e-9 {
            whole as u64
        } else {
            frames.ceil() as u64
        }
    }

    /// Throughput report interval in frames; `None` disables reporting.
    pub fn chunk_length_in_frames(&self) -> Option<u64> {
        let frames = (self.chunk_length_in_sec * self.frame_rate).round();
        (frames.is_finite() && frames >= 1.0).then_some(frames as u64)
    }

    pub fn display_cadence(&self) -> DisplayCadence {
        DisplayCadence::from_rates(self.frame_rate, self.display_frame_rate)
    }

    pub fn grab_timeout(&self) -> Duration {
        Duration::from_millis(self.grab_timeout_ms)
    }

    /// `videoFilename` without its extension.
    pub fn video_stem(&self) -> &str {
        Path::new(&self.video_filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.video_filename)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.video_folder
            .join(format!("metadata{}.csv", self.video_stem()))
    }

    pub fn params_path(&self) -> PathBuf {
        self.video_folder
            .join(format!("params{}.toml", self.video_stem()))
    }

    pub fn raw_video_path(&self) -> PathBuf {
        self.video_folder.join(format!("{}.raw", self.video_stem()))
    }

    /// Sanity checks applied before a camera is opened.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidConfig(format!("{}: {}", self.name, msg)));

        if !(self.frame_rate > 0.0) {
            return invalid(format!("frame_rate must be > 0, got {}", self.frame_rate));
        }
        if !(self.rec_time_in_sec > 0.0) {
            return invalid(format!(
                "rec_time_in_sec must be > 0, got {}",
                self.rec_time_in_sec
            ));
        }
        if self.display_downsample == 0 {
            return invalid("display_downsample must be >= 1".into());
        }
        if self.display_frame_rate > self.frame_rate {
            return invalid(format!(
                "display_frame_rate ({}) exceeds frame_rate ({})",
                self.display_frame_rate, self.frame_rate
            ));
        }
        if self.buffer_size == 0 {
            return invalid("buffer_size must be >= 1".into());
        }
        if self.chunk_length_in_sec < 0.0 {
            return invalid("chunk_length_in_sec must not be negative".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_frame_count_is_duration_times_rate() {
        let params = CameraParameters {
            frame_rate: 30.0,
            rec_time_in_sec: 10.0,
            ..Default::default()
        };
        assert_eq!(params.target_frame_count(), 300);

        let fractional = CameraParameters {
            frame_rate: 29.97,
            rec_time_in_sec: 1.0,
            ..Default::default()
        };
        assert_eq!(fractional.target_frame_count(), 30);

        // 0.07 * 100.0 == 7.000000000000001 in f64.
        let inexact = CameraParameters {
            frame_rate: 100.0,
            rec_time_in_sec: 0.07,
            ..Default::default()
        };
        assert_eq!(inexact.target_frame_count(), 7);
        let tenth = CameraParameters {
            frame_rate: 30.0,
            rec_time_in_sec: 0.1,
            ..Default::default()
        };
        assert_eq!(tenth.target_frame_count(), 3);
    }

    #[test]
    fn chunk_length_rounds_to_frames() {
        let params = CameraParameters {
            frame_rate: 30.0,
            chunk_length_in_sec: 0.5,
            ..Default::default()
        };
        assert_eq!(params.chunk_length_in_frames(), Some(15));

        let disabled = CameraParameters {
            chunk_length_in_sec: 0.0,
            ..Default::default()
        };
        assert_eq!(disabled.chunk_length_in_frames(), None);
    }

    #[test]
    fn output_paths_use_video_stem() {
        let params = CameraParameters {
            video_folder: PathBuf::from("/data/session/Camera1"),
            video_filename: "0.mp4".into(),
            ..Default::default()
        };
        assert_eq!(
            params.metadata_path(),
            PathBuf::from("/data/session/Camera1/metadata0.csv")
        );
        assert_eq!(
            params.params_path(),
            PathBuf::from("/data/session/Camera1/params0.toml")
        );
        assert_eq!(
            params.raw_video_path(),
            PathBuf::from("/data/session/Camera1/0.raw")
        );
    }

    #[test]
    fn validate_rejects_display_faster_than_capture() {
        let params = CameraParameters {
            frame_rate: 30.0,
            display_frame_rate: 60.0,
            ..Default::default()
        };
        assert!(matches!(params.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn validate_rejects_zero_downsample() {
        let params = CameraParameters {
            display_downsample: 0,
            ..Default::default()
        };
        assert!(params.validate().is_err());
        assert!(CameraParameters::default().validate().is_ok());
    }
}
