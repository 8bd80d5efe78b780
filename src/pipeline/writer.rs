//! Disk consumer of the write queue.
//!
//! Frames are appended to a raw file exactly as they arrive; compression is
//! left to downstream tools.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::thread::{self, JoinHandle};

use flume::Receiver;
use tracing::{info, warn};

use super::sink::SinkMessage;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterSummary {
    pub path: PathBuf,
    pub frames: u64,
    pub bytes: u64,
    /// The end-of-stream marker was received.
    pub completed: bool,
}

pub struct RawFrameWriter {
    path: PathBuf,
    rx: Receiver<SinkMessage>,
}

impl RawFrameWriter {
    pub fn new(path: PathBuf, rx: Receiver<SinkMessage>) -> Self {
        Self { path, rx }
    }

    /// Run on a dedicated thread named after the camera.
    pub fn spawn(self, camera: &str) -> Result<JoinHandle<Result<WriterSummary>>> {
        Ok(thread::Builder::new()
            .name(format!("{}-writer", camera))
            .spawn(move || self.run())?)
    }

    /// Drain the queue until the end-of-stream marker or until the producer
    /// goes away.
    pub fn run(self) -> Result<WriterSummary> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = BufWriter::new(File::create(&self.path)?);
        let mut frames = 0u64;
        let mut bytes = 0u64;
        let mut completed = false;

        while let Ok(message) = self.rx.recv() {
            match message {
                SinkMessage::Frame(frame) => {
                    out.write_all(&frame.data)?;
                    frames += 1;
                    bytes += frame.data.len() as u64;
                }
                SinkMessage::EndOfStream => {
                    completed = true;
                    break;
                }
            }
        }
        out.flush()?;

        if !completed {
            warn!("Write queue closed without end of stream marker");
        }
        info!(
            "Wrote {} frames ({} bytes) to {}",
            frames,
            bytes,
            self.path.display()
        );
        Ok(WriterSummary {
            path: self.path,
            frames,
            bytes,
            completed,
        })
    }
}
