use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Frame data with zero-copy semantics
#[derive(Debug, Clone)]
pub struct Frame {
    /// Immutable pixel data, row-major with no row padding
    pub data: Bytes,

    pub meta: FrameMetadata,
}

/// Frame metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMetadata {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Hardware timestamp in nanoseconds, device clock
    pub timestamp_ns: u64,
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Mono8,
    Mono16,
    Rgb24,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Mono8 => 1,
            PixelFormat::Mono16 => 2,
            PixelFormat::Rgb24 => 3,
        }
    }
}

impl Frame {
    pub fn new(data: impl Into<Bytes>, meta: FrameMetadata) -> Self {
        Self {
            data: data.into(),
            meta,
        }
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn timestamp_ns(&self) -> u64 {
        self.meta.timestamp_ns
    }

    /// Keep every `factor`-th pixel along both axes, starting at (0, 0).
    ///
    /// The result is `ceil(width / factor) x ceil(height / factor)`. A factor
    /// of 0 or 1 returns the frame unchanged without copying.
    pub fn downsample(&self, factor: usize) -> Frame {
        let bpp = self.meta.format.bytes_per_pixel();
        let width = self.meta.width as usize;
        let height = self.meta.height as usize;
        if factor <= 1 || width == 0 || height == 0 {
            return self.clone();
        }

        let out_width = width.div_ceil(factor);
        let out_height = height.div_ceil(factor);
        let mut out = Vec::with_capacity(out_width * out_height * bpp);

        for row in self
            .data
            .chunks_exact(width * bpp)
            .step_by(factor)
            .take(out_height)
        {
            for pixel in row.chunks_exact(bpp).step_by(factor) {
                out.extend_from_slice(pixel);
            }
        }

        Frame {
            data: Bytes::from(out),
            meta: FrameMetadata {
                width: out_width as u32,
                height: out_height as u32,
                ..self.meta
            },
        }
    }
}
