//! Emulated camera backend.
//!
//! Frames are produced on a simulated external trigger at a fixed rate, with
//! hardware timestamps taken from the trigger schedule. A fixed pool of buffer
//! slots mirrors a real device: a grabbed buffer occupies its slot until it is
//! dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::configure::{
    AcquisitionMode, BufferHandling, CameraControl, TriggerSelector, TriggerSource,
};
use super::frame::{Frame, FrameMetadata, PixelFormat};
use super::source::{DeviceError, FrameBuffer, FrameSource, GrabOutcome};
use super::system::{Camera, CameraModule, DeviceInfo};
use crate::CameraParameters;

const EXPOSURE_MAX_US: f64 = 30_000_000.0;
const GAIN_MAX_DB: f64 = 47.99;
const BUFFER_COUNT_MAX: u32 = 1000;
const DEFAULT_TRIGGER_RATE: f64 = 100.0;

#[derive(Debug, Clone)]
pub struct EmuConfig {
    pub cameras: usize,
    pub width: u32,
    pub height: u32,
    /// Trigger rate per camera index; cameras past the end use the last entry.
    pub trigger_rates: Vec<f64>,
    /// Buffer slots that may be held by the host at once.
    pub buffer_slots: usize,
    /// Frames delivered before the stream ends on its own.
    pub max_frames: Option<u64>,
    /// Transient "busy" errors reported by the first `stop_streaming` calls.
    pub busy_on_stop: u32,
    /// Transient "busy" errors reported by the first `close` calls.
    pub busy_on_close: u32,
}

impl Default for EmuConfig {
    fn default() -> Self {
        Self {
            cameras: 1,
            width: 640,
            height: 512,
            trigger_rates: vec![DEFAULT_TRIGGER_RATE],
            buffer_slots: 4,
            max_frames: None,
            busy_on_stop: 0,
            busy_on_close: 0,
        }
    }
}

impl EmuConfig {
    /// Backend for a run: `devices` emulated cameras, each triggered at the
    /// frame rate of the camera that selects it.
    ///
    /// `devices` is raised if a camera selects an index past it; unselected
    /// devices keep the default rate.
    pub fn for_cameras(cameras: &[CameraParameters], devices: usize) -> Self {
        let devices = cameras
            .iter()
            .map(|c| c.selection + 1)
            .fold(devices, usize::max);
        let mut trigger_rates = vec![DEFAULT_TRIGGER_RATE; devices];
        for camera in cameras {
            trigger_rates[camera.selection] = camera.frame_rate;
        }
        Self {
            cameras: devices,
            trigger_rates,
            ..Default::default()
        }
    }

    fn trigger_rate(&self, index: usize) -> f64 {
        self.trigger_rates
            .get(index)
            .or_else(|| self.trigger_rates.last())
            .copied()
            .unwrap_or(DEFAULT_TRIGGER_RATE)
    }
}

pub struct EmuModule {
    config: EmuConfig,
}

impl EmuModule {
    pub fn new(config: EmuConfig) -> Self {
        Self { config }
    }
}

impl CameraModule for EmuModule {
    type CameraType = EmuCamera;

    fn name(&self) -> &str {
        "emu"
    }

    fn camera_count(&self) -> Result<usize, DeviceError> {
        Ok(self.config.cameras)
    }

    fn open(&self, index: usize) -> Result<EmuCamera, DeviceError> {
        if index >= self.config.cameras {
            return Err(DeviceError::fatal(format!("no emulated camera {}", index)));
        }
        debug!("Opening emulated camera {}", index);
        Ok(EmuCamera::new(index, &self.config))
    }

    fn release(&self) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// Buffer slot returned by [`EmuCamera::grab`].
pub struct EmuBuffer {
    frame: Frame,
    slots_in_use: Arc<AtomicUsize>,
}

impl FrameBuffer for EmuBuffer {
    fn timestamp_ns(&self) -> u64 {
        self.frame.timestamp_ns()
    }

    fn extract(&self) -> Frame {
        self.frame.clone()
    }
}

impl Drop for EmuBuffer {
    fn drop(&mut self) {
        self.slots_in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct EmuCamera {
    index: usize,
    width: u32,
    height: u32,
    trigger_rate: f64,
    buffer_slots: usize,
    max_frames: Option<u64>,
    busy_on_stop: u32,
    busy_on_close: u32,

    slots_in_use: Arc<AtomicUsize>,
    stream_start: Option<Instant>,
    delivered: u64,
    closed: bool,

    acquisition_mode: AcquisitionMode,
    exposure_auto: bool,
    exposure_us: f64,
    gain_auto: bool,
    gain_db: f64,
    gamma: bool,
    trigger_mode: bool,
    trigger_selector: TriggerSelector,
    trigger_source: TriggerSource,
    buffer_count: u32,
    buffer_handling: BufferHandling,
}

impl EmuCamera {
    fn new(index: usize, config: &EmuConfig) -> Self {
        Self {
            index,
            width: config.width,
            height: config.height,
            trigger_rate: config.trigger_rate(index),
            buffer_slots: config.buffer_slots.max(1),
            max_frames: config.max_frames,
            busy_on_stop: config.busy_on_stop,
            busy_on_close: config.busy_on_close,
            slots_in_use: Arc::new(AtomicUsize::new(0)),
            stream_start: None,
            delivered: 0,
            closed: false,
            acquisition_mode: AcquisitionMode::SingleFrame,
            exposure_auto: true,
            exposure_us: 10_000.0,
            gain_auto: true,
            gain_db: 0.0,
            gamma: true,
            trigger_mode: false,
            trigger_selector: TriggerSelector::AcquisitionStart,
            trigger_source: TriggerSource::Software,
            buffer_count: 10,
            buffer_handling: BufferHandling::NewestOnly,
        }
    }

    pub fn acquisition_mode(&self) -> AcquisitionMode {
        self.acquisition_mode
    }

    pub fn exposure_us(&self) -> f64 {
        self.exposure_us
    }

    pub fn gain_db(&self) -> f64 {
        self.gain_db
    }

    pub fn gamma_enabled(&self) -> bool {
        self.gamma
    }

    pub fn buffer_count(&self) -> u32 {
        self.buffer_count
    }

    pub fn buffer_handling(&self) -> BufferHandling {
        self.buffer_handling
    }

    pub fn trigger(&self) -> (bool, TriggerSelector, TriggerSource) {
        (self.trigger_mode, self.trigger_selector, self.trigger_source)
    }

    pub fn slots_in_use(&self) -> usize {
        self.slots_in_use.load(Ordering::Acquire)
    }

    /// Hardware timestamp of trigger `n`, on a clock that starts at an
    /// arbitrary per-camera offset.
    fn trigger_timestamp_ns(&self, n: u64) -> u64 {
        let offset = 1_000_000_000 * (self.index as u64 + 1);
        offset + (n as f64 * 1e9 / self.trigger_rate) as u64
    }

    fn render(&self, n: u64) -> Frame {
        let w = self.width as usize;
        let mut data = vec![0u8; w * self.height as usize];
        for (y, row) in data.chunks_exact_mut(w.max(1)).enumerate() {
            for (x, px) in row.iter_mut().enumerate() {
                *px = (x + y + n as usize) as u8;
            }
        }
        Frame::new(
            data,
            FrameMetadata {
                width: self.width,
                height: self.height,
                format: PixelFormat::Mono8,
                timestamp_ns: self.trigger_timestamp_ns(n),
            },
        )
    }

    fn check_open(&self) -> Result<(), DeviceError> {
        if self.closed {
            return Err(DeviceError::fatal("camera is closed"));
        }
        Ok(())
    }
}

impl FrameSource for EmuCamera {
    type Buffer = EmuBuffer;

    fn start_streaming(&mut self) -> Result<(), DeviceError> {
        self.check_open()?;
        if self.stream_start.is_some() {
            return Err(DeviceError::fatal("stream already started"));
        }
        self.stream_start = Some(Instant::now());
        self.delivered = 0;
        info!(
            "Emulated camera {} streaming at {} Hz",
            self.index, self.trigger_rate
        );
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        self.stream_start.is_some()
    }

    fn grab(&mut self, timeout: Duration) -> Result<GrabOutcome<EmuBuffer>, DeviceError> {
        let start = self
            .stream_start
            .ok_or_else(|| DeviceError::fatal("stream not started"))?;

        if self.max_frames.is_some_and(|max| self.delivered >= max) {
            return Ok(GrabOutcome::StreamEnded);
        }
        if self.slots_in_use.load(Ordering::Acquire) >= self.buffer_slots {
            return Err(DeviceError::fatal("no free stream buffer"));
        }

        let due = start + Duration::from_secs_f64(self.delivered as f64 / self.trigger_rate);
        let now = Instant::now();
        if due > now {
            let wait = due - now;
            if wait > timeout {
                thread::sleep(timeout);
                return Ok(GrabOutcome::NotYetAvailable);
            }
            thread::sleep(wait);
        }

        let frame = self.render(self.delivered);
        self.delivered += 1;
        self.slots_in_use.fetch_add(1, Ordering::AcqRel);
        Ok(GrabOutcome::Success(EmuBuffer {
            frame,
            slots_in_use: Arc::clone(&self.slots_in_use),
        }))
    }

    fn stop_streaming(&mut self) -> Result<(), DeviceError> {
        if self.busy_on_stop > 0 {
            self.busy_on_stop -= 1;
            return Err(DeviceError::transient("device busy"));
        }
        self.stream_start = None;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if self.is_streaming() {
            return Err(DeviceError::fatal("cannot close while streaming"));
        }
        if self.busy_on_close > 0 {
            self.busy_on_close -= 1;
            return Err(DeviceError::transient("device busy"));
        }
        self.closed = true;
        Ok(())
    }
}

impl CameraControl for EmuCamera {
    fn set_acquisition_mode(&mut self, mode: AcquisitionMode) -> Result<(), DeviceError> {
        self.check_open()?;
        self.acquisition_mode = mode;
        Ok(())
    }

    fn set_exposure_auto(&mut self, enabled: bool) -> Result<(), DeviceError> {
        self.exposure_auto = enabled;
        Ok(())
    }

    fn exposure_time_max(&self) -> Result<f64, DeviceError> {
        Ok(EXPOSURE_MAX_US)
    }

    fn set_exposure_time(&mut self, us: f64) -> Result<(), DeviceError> {
        if self.exposure_auto {
            return Err(DeviceError::fatal("ExposureTime not writable while ExposureAuto is on"));
        }
        if !(0.0..=EXPOSURE_MAX_US).contains(&us) {
            return Err(DeviceError::fatal(format!("exposure {} us out of range", us)));
        }
        self.exposure_us = us;
        Ok(())
    }

    fn set_gain_auto(&mut self, enabled: bool) -> Result<(), DeviceError> {
        self.gain_auto = enabled;
        Ok(())
    }

    fn gain_max(&self) -> Result<f64, DeviceError> {
        Ok(GAIN_MAX_DB)
    }

    fn set_gain(&mut self, db: f64) -> Result<(), DeviceError> {
        if self.gain_auto {
            return Err(DeviceError::fatal("Gain not writable while GainAuto is on"));
        }
        if !(0.0..=GAIN_MAX_DB).contains(&db) {
            return Err(DeviceError::fatal(format!("gain {} dB out of range", db)));
        }
        self.gain_db = db;
        Ok(())
    }

    fn set_gamma_enabled(&mut self, enabled: bool) -> Result<(), DeviceError> {
        self.gamma = enabled;
        Ok(())
    }

    fn set_trigger_mode(&mut self, enabled: bool) -> Result<(), DeviceError> {
        self.trigger_mode = enabled;
        Ok(())
    }

    fn set_trigger_selector(&mut self, selector: TriggerSelector) -> Result<(), DeviceError> {
        if self.trigger_mode {
            return Err(DeviceError::fatal("TriggerSelector not writable while TriggerMode is on"));
        }
        self.trigger_selector = selector;
        Ok(())
    }

    fn set_trigger_source(&mut self, source: TriggerSource) -> Result<(), DeviceError> {
        if self.trigger_mode {
            return Err(DeviceError::fatal("TriggerSource not writable while TriggerMode is on"));
        }
        self.trigger_source = source;
        Ok(())
    }

    fn set_buffer_count_manual(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn buffer_count_max(&self) -> Result<u32, DeviceError> {
        Ok(BUFFER_COUNT_MAX)
    }

    fn set_buffer_count(&mut self, count: u32) -> Result<(), DeviceError> {
        if count == 0 || count > BUFFER_COUNT_MAX {
            return Err(DeviceError::fatal(format!("buffer count {} out of range", count)));
        }
        self.buffer_count = count;
        Ok(())
    }

    fn set_buffer_handling(&mut self, mode: BufferHandling) -> Result<(), DeviceError> {
        self.buffer_handling = mode;
        Ok(())
    }
}

impl Camera for EmuCamera {
    fn info(&self) -> Result<DeviceInfo, DeviceError> {
        Ok(DeviceInfo {
            serial: format!("EMU{:05}", self.index),
            model: "Emulated Camera".into(),
            width: self.width,
            height: self.height,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{prepare_camera, DeviceSettings};

    fn camera(config: EmuConfig) -> EmuCamera {
        EmuModule::new(config).open(0).unwrap()
    }

    fn small() -> EmuConfig {
        EmuConfig {
            width: 8,
            height: 4,
            trigger_rates: vec![1000.0],
            ..Default::default()
        }
    }

    #[test]
    fn trigger_rates_follow_camera_selection() {
        let cameras = [
            CameraParameters {
                index: 0,
                selection: 2,
                frame_rate: 30.0,
                ..Default::default()
            },
            CameraParameters {
                index: 1,
                selection: 0,
                frame_rate: 60.0,
                ..Default::default()
            },
        ];
        let config = EmuConfig::for_cameras(&cameras, 2);
        assert_eq!(config.cameras, 3);
        assert_eq!(config.trigger_rates, vec![60.0, DEFAULT_TRIGGER_RATE, 30.0]);

        let module = EmuModule::new(config);
        assert_eq!(module.open(2).unwrap().trigger_rate, 30.0);
        assert_eq!(module.open(0).unwrap().trigger_rate, 60.0);
    }

    #[test]
    fn prepare_camera_applies_settings() {
        let mut cam = camera(small());
        let params = CameraParameters {
            exposure_us: 2500.0,
            gain_db: 6.0,
            buffer_size: 50,
            ..Default::default()
        };
        prepare_camera(&mut cam, &DeviceSettings::from(&params)).unwrap();

        assert_eq!(cam.acquisition_mode(), AcquisitionMode::Continuous);
        assert_eq!(cam.exposure_us(), 2500.0);
        assert_eq!(cam.gain_db(), 6.0);
        assert!(!cam.gamma_enabled());
        assert_eq!(cam.buffer_count(), 50);
        assert_eq!(cam.buffer_handling(), BufferHandling::OldestFirst);
        assert_eq!(
            cam.trigger(),
            (true, TriggerSelector::FrameStart, TriggerSource::Hardware)
        );
    }

    #[test]
    fn timestamps_follow_trigger_schedule() {
        let mut cam = camera(small());
        cam.start_streaming().unwrap();

        let mut stamps = Vec::new();
        while stamps.len() < 3 {
            if let GrabOutcome::Success(buf) = cam.grab(Duration::from_millis(50)).unwrap() {
                stamps.push(buf.timestamp_ns());
            }
        }
        assert_eq!(stamps[1] - stamps[0], 1_000_000);
        assert_eq!(stamps[2] - stamps[1], 1_000_000);
    }

    #[test]
    fn zero_timeout_reports_not_yet_available() {
        let mut cam = camera(EmuConfig {
            trigger_rates: vec![1.0],
            ..small()
        });
        cam.start_streaming().unwrap();
        // Trigger 0 fires at stream start, trigger 1 a second later.
        assert!(matches!(cam.grab(Duration::ZERO), Ok(GrabOutcome::Success(_))));
        assert!(matches!(
            cam.grab(Duration::ZERO),
            Ok(GrabOutcome::NotYetAvailable)
        ));
    }

    #[test]
    fn held_buffers_exhaust_the_pool() {
        let mut cam = camera(EmuConfig {
            buffer_slots: 2,
            ..small()
        });
        cam.start_streaming().unwrap();

        let mut held = Vec::new();
        while held.len() < 2 {
            if let GrabOutcome::Success(buf) = cam.grab(Duration::from_millis(50)).unwrap() {
                held.push(buf);
            }
        }
        let err = cam.grab(Duration::from_millis(50)).unwrap_err();
        assert!(!err.is_transient());

        held.clear();
        assert_eq!(cam.slots_in_use(), 0);
    }

    #[test]
    fn stream_ends_after_max_frames() {
        let mut cam = camera(EmuConfig {
            max_frames: Some(1),
            ..small()
        });
        cam.start_streaming().unwrap();
        assert!(matches!(
            cam.grab(Duration::from_millis(50)),
            Ok(GrabOutcome::Success(_))
        ));
        assert!(matches!(
            cam.grab(Duration::from_millis(50)),
            Ok(GrabOutcome::StreamEnded)
        ));
    }

    #[test]
    fn busy_close_is_transient() {
        let mut cam = camera(EmuConfig {
            busy_on_close: 1,
            ..small()
        });
        cam.start_streaming().unwrap();
        cam.stop_streaming().unwrap();
        assert!(cam.close().unwrap_err().is_transient());
        cam.close().unwrap();
    }
}
