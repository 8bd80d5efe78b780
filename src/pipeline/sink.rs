//! Hand-off channels between the acquisition loop and its consumers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use crossbeam::utils::CachePadded;
use thiserror::Error;

use crate::capture::Frame;

/// Item travelling through a sink.
#[derive(Debug, Clone)]
pub enum SinkMessage {
    Frame(Frame),
    /// No more frames will follow.
    EndOfStream,
}

impl SinkMessage {
    pub fn into_frame(self) -> Option<Frame> {
        match self {
            SinkMessage::Frame(frame) => Some(frame),
            SinkMessage::EndOfStream => None,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("sink consumer disconnected")]
pub struct SinkClosed;

/// Producer side of a single-producer hand-off channel.
pub trait FrameSink: Send {
    fn push(&self, message: SinkMessage) -> Result<(), SinkClosed>;
}

impl FrameSink for flume::Sender<SinkMessage> {
    fn push(&self, message: SinkMessage) -> Result<(), SinkClosed> {
        self.send(message).map_err(|_| SinkClosed)
    }
}

/// Unbounded, ordered queue of full-resolution frames for the disk writer.
pub fn write_queue() -> (flume::Sender<SinkMessage>, flume::Receiver<SinkMessage>) {
    flume::unbounded()
}

/// Lock-free overwrite queue for the live preview.
///
/// Holds at most `capacity` frames; when full the oldest frame is dropped so
/// the preview always shows recent data and never slows the loop down.
#[derive(Clone)]
pub struct DisplayBuffer {
    inner: Arc<DisplayInner>,
}

struct DisplayInner {
    ring: ArrayQueue<SinkMessage>,
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicUsize,
    frames_read: AtomicUsize,
    frames_dropped: AtomicUsize,
}

/// Counters of a [`DisplayBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayStats {
    pub written: usize,
    pub read: usize,
    pub dropped: usize,
}

impl DisplayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(DisplayInner {
                ring: ArrayQueue::new(capacity.max(1)),
                stats: CachePadded::new(Stats::default()),
            }),
        }
    }

    /// Consumer: pop the oldest queued message.
    pub fn pop(&self) -> Option<SinkMessage> {
        let message = self.inner.ring.pop()?;
        self.inner.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        Some(message)
    }

    pub fn len(&self) -> usize {
        self.inner.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.ring.is_empty()
    }

    pub fn stats(&self) -> DisplayStats {
        let stats = &self.inner.stats;
        DisplayStats {
            written: stats.frames_written.load(Ordering::Relaxed),
            read: stats.frames_read.load(Ordering::Relaxed),
            dropped: stats.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

impl FrameSink for DisplayBuffer {
    fn push(&self, message: SinkMessage) -> Result<(), SinkClosed> {
        if self.inner.ring.force_push(message).is_some() {
            self.inner.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.stats.frames_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
