//! Run configuration.
//!
//! A TOML file describes the whole multi-camera run. Every per-camera option
//! may be given either once for all cameras or as a list with one entry per
//! camera:
//!
//! ```toml
//! video_folder = "/data/session1"
//! num_cams = 2
//! camera_names = ["Camera0", "Camera1"]
//! rec_time_in_sec = 600
//! frame_rate = 100
//! exposure = [5000, 7500]
//! ```
//!
//! Values are layered as file < `CAMPY_*` environment < command line.

use std::path::{Path, PathBuf};

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use tracing::info;

use crate::capture::{BufferHandling, TriggerSource};
use crate::{CameraParameters, Error, Result};

/// A value shared by all cameras or listed per camera.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PerCamera<T> {
    Each(Vec<T>),
    All(T),
}

impl<T: Clone> PerCamera<T> {
    fn for_camera(&self, key: &str, n_cam: usize, num_cams: usize) -> Result<T> {
        match self {
            PerCamera::All(value) => Ok(value.clone()),
            PerCamera::Each(values) if values.len() == num_cams => {
                values.get(n_cam).cloned().ok_or_else(|| out_of_range(key, n_cam, num_cams))
            }
            PerCamera::Each(values) => Err(Error::InvalidConfig(format!(
                "{} has {} entries but num_cams is {}",
                key,
                values.len(),
                num_cams
            ))),
        }
    }
}

fn out_of_range(key: &str, n_cam: usize, num_cams: usize) -> Error {
    Error::InvalidConfig(format!(
        "{}: camera {} out of range for num_cams {}",
        key, n_cam, num_cams
    ))
}

impl<T> From<T> for PerCamera<T> {
    fn from(value: T) -> Self {
        PerCamera::All(value)
    }
}

fn default_video_filename() -> String {
    "0.mp4".into()
}
fn default_frame_rate() -> PerCamera<f64> {
    100.0.into()
}
fn default_exposure() -> PerCamera<f64> {
    5000.0.into()
}
fn default_gain() -> PerCamera<f64> {
    0.0.into()
}
fn default_trigger() -> PerCamera<TriggerSource> {
    TriggerSource::Hardware.into()
}
fn default_buffer_mode() -> PerCamera<BufferHandling> {
    BufferHandling::OldestFirst.into()
}
fn default_buffer_size() -> PerCamera<u32> {
    100.into()
}
fn default_chunk_length() -> PerCamera<f64> {
    30.0.into()
}
fn default_display_frame_rate() -> PerCamera<f64> {
    10.0.into()
}
fn default_display_downsample() -> PerCamera<usize> {
    2.into()
}
fn default_grab_timeout_ms() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    pub video_folder: PathBuf,
    #[serde(default = "default_video_filename")]
    pub video_filename: String,
    pub num_cams: usize,
    pub camera_names: Vec<String>,
    pub rec_time_in_sec: f64,

    /// Device index per camera; defaults to the camera number.
    #[serde(default)]
    pub camera_selection: Option<PerCamera<usize>>,
    #[serde(default = "default_frame_rate")]
    pub frame_rate: PerCamera<f64>,
    /// Microseconds.
    #[serde(default = "default_exposure")]
    pub exposure: PerCamera<f64>,
    /// dB.
    #[serde(default = "default_gain")]
    pub gain: PerCamera<f64>,
    #[serde(default = "default_trigger")]
    pub trigger: PerCamera<TriggerSource>,
    #[serde(default = "default_buffer_mode")]
    pub buffer_mode: PerCamera<BufferHandling>,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: PerCamera<u32>,
    #[serde(default = "default_chunk_length")]
    pub chunk_length_in_sec: PerCamera<f64>,
    #[serde(default = "default_display_frame_rate")]
    pub display_frame_rate: PerCamera<f64>,
    #[serde(default = "default_display_downsample")]
    pub display_downsample: PerCamera<usize>,
    #[serde(default = "default_grab_timeout_ms")]
    pub grab_timeout_ms: u64,
    /// CPU core per camera acquisition thread.
    #[serde(default)]
    pub pin_cores: Option<Vec<usize>>,
}

/// Command line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub video_folder: Option<PathBuf>,
    pub video_filename: Option<String>,
    pub num_cams: Option<usize>,
    pub camera_names: Option<Vec<String>>,
    pub camera_selection: Option<Vec<usize>>,
    pub frame_rate: Option<f64>,
    pub rec_time_in_sec: Option<f64>,
    pub chunk_length_in_sec: Option<f64>,
    pub display_frame_rate: Option<f64>,
    pub display_downsample: Option<usize>,
}

/// Load `path`, apply environment and command line overrides, and validate.
pub fn load(path: &Path, overrides: &Overrides) -> Result<RunConfig> {
    info!("Loading configuration from {}", path.display());
    let builder = Config::builder()
        .add_source(File::from(path))
        .add_source(Environment::with_prefix("CAMPY").try_parsing(true));
    build(builder, overrides)
}

/// Parse configuration from a TOML string (no environment layer).
pub fn from_toml_str(toml: &str, overrides: &Overrides) -> Result<RunConfig> {
    build(
        Config::builder().add_source(File::from_str(toml, FileFormat::Toml)),
        overrides,
    )
}

fn build(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
    overrides: &Overrides,
) -> Result<RunConfig> {
    let config = builder
        .set_override_option(
            "video_folder",
            overrides
                .video_folder
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        )?
        .set_override_option("video_filename", overrides.video_filename.clone())?
        .set_override_option("num_cams", overrides.num_cams.map(|n| n as i64))?
        .set_override_option("camera_names", overrides.camera_names.clone())?
        .set_override_option(
            "camera_selection",
            overrides
                .camera_selection
                .as_ref()
                .map(|s| s.iter().map(|&n| n as i64).collect::<Vec<_>>()),
        )?
        .set_override_option("frame_rate", overrides.frame_rate)?
        .set_override_option("rec_time_in_sec", overrides.rec_time_in_sec)?
        .set_override_option("chunk_length_in_sec", overrides.chunk_length_in_sec)?
        .set_override_option("display_frame_rate", overrides.display_frame_rate)?
        .set_override_option(
            "display_downsample",
            overrides.display_downsample.map(|n| n as i64),
        )?
        .build()?;

    let run: RunConfig = config.try_deserialize()?;
    run.validate()?;
    Ok(run)
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_cams == 0 {
            return Err(Error::InvalidConfig("num_cams must be >= 1".into()));
        }
        if self.camera_names.len() != self.num_cams {
            return Err(Error::InvalidConfig(format!(
                "camera_names has {} entries but num_cams is {}",
                self.camera_names.len(),
                self.num_cams
            )));
        }
        for n_cam in 0..self.num_cams {
            self.camera_parameters(n_cam)?;
        }
        Ok(())
    }

    /// Parameters for camera `n_cam`, written to `<video_folder>/<name>/`.
    pub fn camera_parameters(&self, n_cam: usize) -> Result<CameraParameters> {
        let num = self.num_cams;
        if n_cam >= num {
            return Err(out_of_range("camera_names", n_cam, num));
        }
        let name = self.camera_names.get(n_cam).cloned().ok_or_else(|| {
            Error::InvalidConfig(format!("no camera name for camera {}", n_cam))
        })?;

        let selection = match &self.camera_selection {
            Some(selection) => selection.for_camera("camera_selection", n_cam, num)?,
            None => n_cam,
        };
        let pin_core = match &self.pin_cores {
            Some(cores) if cores.len() == num => Some(
                cores
                    .get(n_cam)
                    .copied()
                    .ok_or_else(|| out_of_range("pin_cores", n_cam, num))?,
            ),
            Some(cores) => {
                return Err(Error::InvalidConfig(format!(
                    "pin_cores has {} entries but num_cams is {}",
                    cores.len(),
                    num
                )))
            }
            None => None,
        };

        let params = CameraParameters {
            index: n_cam,
            video_folder: self.video_folder.join(&name),
            name,
            selection,
            serial: String::new(),
            model: String::new(),
            frame_rate: self.frame_rate.for_camera("frame_rate", n_cam, num)?,
            rec_time_in_sec: self.rec_time_in_sec,
            exposure_us: self.exposure.for_camera("exposure", n_cam, num)?,
            gain_db: self.gain.for_camera("gain", n_cam, num)?,
            trigger: self.trigger.for_camera("trigger", n_cam, num)?,
            buffer_mode: self.buffer_mode.for_camera("buffer_mode", n_cam, num)?,
            buffer_size: self.buffer_size.for_camera("buffer_size", n_cam, num)?,
            display_frame_rate: self
                .display_frame_rate
                .for_camera("display_frame_rate", n_cam, num)?,
            display_downsample: self
                .display_downsample
                .for_camera("display_downsample", n_cam, num)?,
            chunk_length_in_sec: self
                .chunk_length_in_sec
                .for_camera("chunk_length_in_sec", n_cam, num)?,
            frame_width: 0,
            frame_height: 0,
            video_filename: self.video_filename.clone(),
            grab_timeout_ms: self.grab_timeout_ms,
            pin_core,
        };
        params.validate()?;
        Ok(params)
    }

    /// Parameters for every camera, in camera order.
    pub fn all_camera_parameters(&self) -> Result<Vec<CameraParameters>> {
        (0..self.num_cams)
            .map(|n_cam| self.camera_parameters(n_cam))
            .collect()
    }
}
