pub mod configure;
pub mod emu;
pub mod frame;
pub mod source;
pub mod system;

pub use configure::{
    prepare_camera, AcquisitionMode, BufferHandling, CameraControl, DeviceSettings,
    TriggerSelector, TriggerSource,
};
pub use emu::{EmuConfig, EmuModule};
pub use frame::{Frame, FrameMetadata, PixelFormat};
pub use source::{DeviceError, ErrorKind, FrameBuffer, FrameSource, GrabOutcome};
pub use system::{open_camera, Camera, CameraHandle, CameraModule, DeviceInfo, DeviceSystem};
