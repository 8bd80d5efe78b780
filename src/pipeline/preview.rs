//! Live preview consumer. Reports what it would show; rendering is done
//! elsewhere.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info};

use super::sink::{DisplayBuffer, SinkMessage};
use super::stop::StopSignal;
use crate::capture::Frame;
use crate::Result;

pub struct Preview {
    camera: String,
    buffer: DisplayBuffer,
    finished: StopSignal,
    poll_interval: Duration,
}

impl Preview {
    /// `finished` is raised by the producer once no more frames will be queued.
    pub fn new(camera: &str, buffer: DisplayBuffer, finished: StopSignal, rate_hz: f64) -> Self {
        let poll_interval = if rate_hz > 0.0 {
            Duration::from_secs_f64(0.5 / rate_hz)
        } else {
            Duration::from_millis(50)
        };
        Self {
            camera: camera.to_string(),
            buffer,
            finished,
            poll_interval,
        }
    }

    pub fn spawn(self) -> Result<JoinHandle<u64>> {
        Ok(thread::Builder::new()
            .name(format!("{}-preview", self.camera))
            .spawn(move || self.run())?)
    }

    /// Consume frames until the producer has finished and the buffer is
    /// drained. Returns the number of frames shown.
    pub fn run(self) -> u64 {
        let mut shown = 0u64;
        loop {
            match self.buffer.pop() {
                Some(SinkMessage::Frame(frame)) => {
                    shown += 1;
                    debug!(
                        "{} preview {}x{} mean {:.1}",
                        self.camera,
                        frame.width(),
                        frame.height(),
                        mean_intensity(&frame)
                    );
                }
                Some(SinkMessage::EndOfStream) => break,
                None if self.finished.is_raised() => break,
                None => thread::sleep(self.poll_interval),
            }
        }

        let stats = self.buffer.stats();
        info!(
            "{} preview showed {} frames ({} skipped)",
            self.camera, shown, stats.dropped
        );
        shown
    }
}

fn mean_intensity(frame: &Frame) -> f64 {
    if frame.data.is_empty() {
        return 0.0;
    }
    let sum: u64 = frame.data.iter().map(|&b| b as u64).sum();
    sum as f64 / frame.data.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameMetadata, PixelFormat};
    use crate::pipeline::sink::FrameSink;

    #[test]
    fn drains_buffer_after_finish() {
        let buffer = DisplayBuffer::new(2);
        let finished = StopSignal::new();
        for fill in [10u8, 20] {
            let frame = Frame::new(
                vec![fill; 4],
                FrameMetadata {
                    width: 2,
                    height: 2,
                    format: PixelFormat::Mono8,
                    timestamp_ns: 0,
                },
            );
            buffer.push(SinkMessage::Frame(frame)).unwrap();
        }
        finished.raise();

        let shown = Preview::new("cam", buffer.clone(), finished, 10.0).run();
        assert_eq!(shown, 2);
        assert!(buffer.is_empty());
    }
}
