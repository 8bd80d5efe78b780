//! Ownership of the camera system and the handles opened from it.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use super::configure::{prepare_camera, CameraControl, DeviceSettings};
use super::source::{DeviceError, FrameSource, GrabOutcome};
use crate::{CameraParameters, Error};

/// Identity and geometry reported by an opened camera.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub serial: String,
    pub model: String,
    pub width: u32,
    pub height: u32,
}

/// A camera that can be configured and streamed.
pub trait Camera: FrameSource + CameraControl {
    fn info(&self) -> Result<DeviceInfo, DeviceError>;
}

/// A camera backend (e.g. a vendor SDK system instance).
pub trait CameraModule: Send + Sync {
    type CameraType: Camera;

    fn name(&self) -> &str;
    fn camera_count(&self) -> Result<usize, DeviceError>;
    fn open(&self, index: usize) -> Result<Self::CameraType, DeviceError>;
    /// Release the backend. No handle may be used afterwards.
    fn release(&self) -> Result<(), DeviceError>;
}

/// Single owner of a [`CameraModule`].
///
/// Every camera is opened through the system, which counts live handles and
/// refuses to release the backend while any of them is still open.
pub struct DeviceSystem<M: CameraModule> {
    module: M,
    open_handles: Arc<AtomicUsize>,
    released: AtomicBool,
}

impl<M: CameraModule> DeviceSystem<M> {
    pub fn new(module: M) -> Self {
        info!("Camera system '{}' acquired", module.name());
        Self {
            module,
            open_handles: Arc::new(AtomicUsize::new(0)),
            released: AtomicBool::new(false),
        }
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    pub fn camera_count(&self) -> crate::Result<usize> {
        Ok(self.module.camera_count()?)
    }

    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::Acquire)
    }

    pub fn open(&self, index: usize) -> crate::Result<CameraHandle<M::CameraType>> {
        let available = self.module.camera_count()?;
        if index >= available {
            return Err(Error::CameraNotFound { index, available });
        }

        let camera = self.module.open(index)?;
        self.open_handles.fetch_add(1, Ordering::AcqRel);
        Ok(CameraHandle {
            camera,
            closed: false,
            lease: Arc::clone(&self.open_handles),
        })
    }

    /// Release the backend once every handle has been dropped.
    pub fn release(self) -> crate::Result<()> {
        let outstanding = self.open_handles();
        if outstanding > 0 {
            return Err(Error::HandlesOutstanding(outstanding));
        }
        self.released.store(true, Ordering::Release);
        self.module.release()?;
        info!("Camera system '{}' released", self.module.name());
        Ok(())
    }
}

impl<M: CameraModule> Drop for DeviceSystem<M> {
    fn drop(&mut self) {
        if self.released.load(Ordering::Acquire) {
            return;
        }
        let outstanding = self.open_handles();
        if outstanding > 0 {
            warn!("Releasing camera system with {} open handle(s)", outstanding);
        }
        if let Err(e) = self.module.release() {
            error!("Failed to release camera system: {}", e);
        }
    }
}

/// A camera opened through a [`DeviceSystem`].
///
/// Closing goes through [`FrameSource::close`]; a handle dropped without a
/// successful close is closed on a best-effort basis.
pub struct CameraHandle<C: Camera> {
    camera: C,
    closed: bool,
    lease: Arc<AtomicUsize>,
}

impl<C: Camera> CameraHandle<C> {
    pub fn camera(&self) -> &C {
        &self.camera
    }

    pub fn camera_mut(&mut self) -> &mut C {
        &mut self.camera
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl<C: Camera> FrameSource for CameraHandle<C> {
    type Buffer = C::Buffer;

    fn start_streaming(&mut self) -> Result<(), DeviceError> {
        self.camera.start_streaming()
    }

    fn is_streaming(&self) -> bool {
        self.camera.is_streaming()
    }

    fn grab(&mut self, timeout: Duration) -> Result<GrabOutcome<Self::Buffer>, DeviceError> {
        self.camera.grab(timeout)
    }

    fn stop_streaming(&mut self) -> Result<(), DeviceError> {
        self.camera.stop_streaming()
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if !self.closed {
            self.camera.close()?;
            self.closed = true;
        }
        Ok(())
    }
}

impl<C: Camera> Drop for CameraHandle<C> {
    fn drop(&mut self) {
        if !self.closed {
            if self.camera.is_streaming() {
                if let Err(e) = self.camera.stop_streaming() {
                    warn!("Failed to stop streaming on drop: {}", e);
                }
            }
            if let Err(e) = self.camera.close() {
                warn!("Failed to close camera on drop: {}", e);
            }
        }
        self.lease.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Open camera `params.selection`, configure it and record its identity.
///
/// Fills in `serial`, `model`, `frame_width` and `frame_height`.
#[instrument(skip_all, fields(camera = %params.name))]
pub fn open_camera<M: CameraModule>(
    system: &DeviceSystem<M>,
    params: &mut CameraParameters,
) -> crate::Result<CameraHandle<M::CameraType>> {
    let mut handle = system.open(params.selection)?;
    prepare_camera(handle.camera_mut(), &DeviceSettings::from(&*params))?;

    let info = handle.camera().info()?;
    params.serial = info.serial;
    params.model = info.model;
    params.frame_width = info.width;
    params.frame_height = info.height;

    info!(
        "Started {} serial# {} ({}x{}, {})",
        params.name, params.serial, params.frame_width, params.frame_height, params.model
    );
    Ok(handle)
}
