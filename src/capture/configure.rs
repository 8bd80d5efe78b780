//! One-time device setup applied before streaming starts.
//!
//! [`prepare_camera`] runs an ordered list of steps and stops at the first one
//! that fails: a partially configured camera records meaningless data.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use super::source::DeviceError;
use crate::{CameraParameters, Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcquisitionMode {
    Continuous,
    SingleFrame,
    MultiFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerSelector {
    FrameStart,
    AcquisitionStart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// Frame start on an edge of input line 0.
    Hardware,
    Software,
}

/// Order in which the device hands out filled stream buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferHandling {
    OldestFirst,
    NewestFirst,
    NewestOnly,
    OldestFirstOverwrite,
}

/// Feature access needed to prepare a camera.
pub trait CameraControl {
    fn set_acquisition_mode(&mut self, mode: AcquisitionMode) -> Result<(), DeviceError>;

    fn set_exposure_auto(&mut self, enabled: bool) -> Result<(), DeviceError>;
    /// Microseconds.
    fn exposure_time_max(&self) -> Result<f64, DeviceError>;
    /// Microseconds.
    fn set_exposure_time(&mut self, us: f64) -> Result<(), DeviceError>;

    fn set_gain_auto(&mut self, enabled: bool) -> Result<(), DeviceError>;
    /// dB.
    fn gain_max(&self) -> Result<f64, DeviceError>;
    /// dB.
    fn set_gain(&mut self, db: f64) -> Result<(), DeviceError>;

    fn set_gamma_enabled(&mut self, enabled: bool) -> Result<(), DeviceError>;

    fn set_trigger_mode(&mut self, enabled: bool) -> Result<(), DeviceError>;
    fn set_trigger_selector(&mut self, selector: TriggerSelector) -> Result<(), DeviceError>;
    fn set_trigger_source(&mut self, source: TriggerSource) -> Result<(), DeviceError>;

    fn set_buffer_count_manual(&mut self) -> Result<(), DeviceError>;
    fn buffer_count_max(&self) -> Result<u32, DeviceError>;
    fn set_buffer_count(&mut self, count: u32) -> Result<(), DeviceError>;
    fn set_buffer_handling(&mut self, mode: BufferHandling) -> Result<(), DeviceError>;
}

/// The subset of [`CameraParameters`] the configurator applies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceSettings {
    pub exposure_us: f64,
    pub gain_db: f64,
    pub trigger: TriggerSource,
    pub buffer_mode: BufferHandling,
    pub buffer_size: u32,
}

impl From<&CameraParameters> for DeviceSettings {
    fn from(params: &CameraParameters) -> Self {
        Self {
            exposure_us: params.exposure_us,
            gain_db: params.gain_db,
            trigger: params.trigger,
            buffer_mode: params.buffer_mode,
            buffer_size: params.buffer_size,
        }
    }
}

type Step<C> = (&'static str, fn(&mut C, &DeviceSettings) -> Result<(), DeviceError>);

/// Apply every setup step in order, aborting on the first failure.
#[instrument(skip_all)]
pub fn prepare_camera<C: CameraControl>(
    camera: &mut C,
    settings: &DeviceSettings,
) -> crate::Result<()> {
    let steps: [Step<C>; 6] = [
        ("acquisition mode", configure_acquisition_mode),
        ("exposure", configure_exposure),
        ("gain", configure_gain),
        ("gamma", disable_gamma),
        ("trigger", configure_trigger),
        ("buffer", configure_buffer),
    ];

    for (step, apply) in steps {
        apply(camera, settings).map_err(|e| {
            error!(step = step, "Camera configuration failed: {}", e);
            Error::Configure {
                step,
                reason: e.to_string(),
            }
        })?;
        debug!(step = step, "configured");
    }

    info!("Camera configured");
    Ok(())
}

fn configure_acquisition_mode<C: CameraControl>(
    camera: &mut C,
    _: &DeviceSettings,
) -> Result<(), DeviceError> {
    camera.set_acquisition_mode(AcquisitionMode::Continuous)
}

fn configure_exposure<C: CameraControl>(
    camera: &mut C,
    settings: &DeviceSettings,
) -> Result<(), DeviceError> {
    camera.set_exposure_auto(false)?;

    let max = camera.exposure_time_max()?;
    let exposure = settings.exposure_us.min(max);
    if exposure < settings.exposure_us {
        warn!("Max. exposure is {} us", max);
    }
    camera.set_exposure_time(exposure)?;
    info!("Exposure time set to {} us", exposure);
    Ok(())
}

fn configure_gain<C: CameraControl>(
    camera: &mut C,
    settings: &DeviceSettings,
) -> Result<(), DeviceError> {
    camera.set_gain_auto(false)?;

    let max = camera.gain_max()?;
    let gain = if settings.gain_db > max {
        warn!("Max. gain is {} dB", max);
        max
    } else {
        settings.gain_db.max(0.0)
    };
    camera.set_gain(gain)?;
    info!("Gain set to {} dB", gain);
    Ok(())
}

fn disable_gamma<C: CameraControl>(camera: &mut C, _: &DeviceSettings) -> Result<(), DeviceError> {
    camera.set_gamma_enabled(false)
}

fn configure_trigger<C: CameraControl>(
    camera: &mut C,
    settings: &DeviceSettings,
) -> Result<(), DeviceError> {
    // The source can only be changed while trigger mode is off.
    camera.set_trigger_mode(false)?;
    camera.set_trigger_selector(TriggerSelector::FrameStart)?;
    camera.set_trigger_source(settings.trigger)?;
    camera.set_trigger_mode(true)?;
    info!("Trigger source set to {:?}", settings.trigger);
    Ok(())
}

fn configure_buffer<C: CameraControl>(
    camera: &mut C,
    settings: &DeviceSettings,
) -> Result<(), DeviceError> {
    camera.set_buffer_count_manual()?;

    let max = camera.buffer_count_max()?;
    if settings.buffer_size > max {
        return Err(DeviceError::fatal(format!(
            "buffer count {} exceeds maximum {}",
            settings.buffer_size, max
        )));
    }
    camera.set_buffer_count(settings.buffer_size)?;
    camera.set_buffer_handling(settings.buffer_mode)?;
    info!(
        "Buffer count set to {}, handling mode {:?}",
        settings.buffer_size, settings.buffer_mode
    );
    Ok(())
}
