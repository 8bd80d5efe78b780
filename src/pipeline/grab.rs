//! The acquisition loop.
//!
//! One loop drives one camera on a dedicated thread. Each iteration checks the
//! stop conditions, makes one bounded grab, and routes a successful frame to
//! the write sink and (at a reduced cadence) the display sink. Transient grab
//! failures are retried after a short backoff; anything else is logged and the
//! loop carries on, so a sporadic SDK error never aborts a long recording.
//!
//! Finalization runs exactly once on every exit path: metadata is persisted,
//! the writer is told the stream has ended, and the camera is stopped and
//! closed with a bounded, abortable retry.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::sink::{FrameSink, SinkMessage};
use super::stop::StopSignal;
use crate::capture::{DeviceError, FrameBuffer, FrameSource, GrabOutcome};
use crate::metadata::{GrabRecord, MetadataRecorder};
use crate::{CameraParameters, Result};

/// Backoff after a frame was not ready or a transient error.
pub const RETRY_BACKOFF: Duration = Duration::from_micros(100);

/// Which frames are forwarded to the display sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayCadence {
    Never,
    /// Every n-th frame (n >= 1), counted from frame number n.
    Every(u64),
}

impl DisplayCadence {
    pub fn from_rates(frame_rate: f64, display_frame_rate: f64) -> Self {
        if !(display_frame_rate > 0.0) {
            return DisplayCadence::Never;
        }
        let ratio = (frame_rate / display_frame_rate).round();
        if ratio.is_finite() && ratio > 1.0 {
            DisplayCadence::Every(ratio as u64)
        } else {
            DisplayCadence::Every(1)
        }
    }

    pub fn should_display(self, frame_number: u64) -> bool {
        match self {
            DisplayCadence::Never => false,
            DisplayCadence::Every(ratio) => frame_number % ratio == 0,
        }
    }
}

/// Bounds on the stop/close sequence run during finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseRetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for CloseRetryPolicy {
    fn default() -> Self {
        // 600 x 100 ms: a device that is still busy after a minute is not
        // coming back.
        Self {
            max_attempts: 600,
            backoff: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Streaming,
    Finalizing,
    Closed,
}

/// Why the loop left the streaming state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    TargetReached,
    StopSignal,
    StreamEnded,
    /// Streaming could not be started.
    StartFailed,
}

/// Result of the camera stop/close sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    Closed { attempts: u32 },
    /// The stop signal was escalated to abort while retrying.
    Aborted { attempts: u32 },
    /// Still busy after the policy's last attempt.
    GaveUp { attempts: u32, last_error: DeviceError },
    Failed(DeviceError),
}

impl CloseOutcome {
    pub fn is_closed(&self) -> bool {
        matches!(self, CloseOutcome::Closed { .. })
    }
}

/// Periodic progress report, emitted every chunk of frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throughput {
    pub frames: u64,
    /// Frames per second since the first frame; `None` while no time has
    /// elapsed.
    pub fps: Option<f64>,
}

/// What a finished session hands back to its caller.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub records: Vec<GrabRecord>,
    pub throughput: Vec<Throughput>,
    pub stop_reason: StopReason,
    pub metadata_path: std::path::PathBuf,
    pub close: CloseOutcome,
}

impl SessionReport {
    pub fn frames(&self) -> u64 {
        self.records.len() as u64
    }

    /// Streaming started and the camera was closed.
    pub fn is_clean(&self) -> bool {
        self.stop_reason != StopReason::StartFailed && self.close.is_closed()
    }
}

/// Bookkeeping owned by one run of the loop.
#[derive(Debug)]
struct Session {
    records: Vec<GrabRecord>,
    throughput: Vec<Throughput>,
    count: u64,
    time_zero_ns: Option<u64>,
    state: SessionState,
}

impl Session {
    fn new(expected: u64) -> Self {
        Self {
            records: Vec::with_capacity(expected.min(1 << 20) as usize),
            throughput: Vec::new(),
            count: 0,
            time_zero_ns: None,
            state: SessionState::NotStarted,
        }
    }

    fn transition(&mut self, to: SessionState) {
        debug!("Session {:?} -> {:?}", self.state, to);
        self.state = to;
    }

    /// Register a grabbed frame and return its record.
    fn record(&mut self, timestamp_ns: u64) -> GrabRecord {
        let time_zero = *self.time_zero_ns.get_or_insert(timestamp_ns);
        // Hardware clocks are monotonic; a stamp before time zero is clamped.
        let relative = timestamp_ns.saturating_sub(time_zero) as f64 / 1e9;

        self.count += 1;
        let record = GrabRecord {
            frame_number: self.count,
            timestamp: relative,
        };
        self.records.push(record);
        record
    }
}

/// Acquisition loop for one camera.
pub struct AcquisitionLoop<'a, W, D, R> {
    params: &'a CameraParameters,
    write_sink: W,
    display_sink: D,
    recorder: R,
    stop: StopSignal,
    retry_backoff: Duration,
    close_policy: CloseRetryPolicy,
}

impl<'a, W, D, R> AcquisitionLoop<'a, W, D, R>
where
    W: FrameSink,
    D: FrameSink,
    R: MetadataRecorder,
{
    pub fn new(
        params: &'a CameraParameters,
        write_sink: W,
        display_sink: D,
        recorder: R,
        stop: StopSignal,
    ) -> Self {
        Self {
            params,
            write_sink,
            display_sink,
            recorder,
            stop,
            retry_backoff: RETRY_BACKOFF,
            close_policy: CloseRetryPolicy::default(),
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_close_policy(mut self, policy: CloseRetryPolicy) -> Self {
        self.close_policy = policy;
        self
    }

    /// Stream from `source` until a stop condition, then finalize.
    ///
    /// Returns an error only when the metadata could not be persisted; the
    /// end-of-stream marker is sent and the camera closed regardless.
    pub fn run<S: FrameSource>(self, source: &mut S) -> Result<SessionReport> {
        let params = self.params;
        let target = params.target_frame_count();
        let cadence = params.display_cadence();
        let chunk = params.chunk_length_in_frames();
        let timeout = params.grab_timeout();

        let frames_grabbed = metrics::counter!("campy_frames_grabbed", "camera" => params.name.clone());
        let frames_displayed =
            metrics::counter!("campy_frames_displayed", "camera" => params.name.clone());
        let grab_retries = metrics::counter!("campy_grab_retries", "camera" => params.name.clone());

        let mut session = Session::new(target);

        if let Err(e) = source.start_streaming() {
            error!("{}: failed to start streaming: {}", params.name, e);
            return self.finalize(session, source, StopReason::StartFailed);
        }
        session.transition(SessionState::Streaming);
        info!("{} ready to trigger, expecting {} frames", params.name, target);

        let mut write_sink_lost = false;
        let started = Instant::now();

        let reason = loop {
            if self.stop.is_raised() {
                break StopReason::StopSignal;
            }
            if session.count >= target {
                break StopReason::TargetReached;
            }
            if !source.is_streaming() {
                break StopReason::StreamEnded;
            }

            let buffer = match source.grab(timeout) {
                Ok(GrabOutcome::Success(buffer)) => buffer,
                Ok(GrabOutcome::NotYetAvailable) => {
                    thread::sleep(self.retry_backoff);
                    continue;
                }
                Ok(GrabOutcome::StreamEnded) => break StopReason::StreamEnded,
                Err(e) if e.is_transient() => {
                    debug!("{}: {}", params.name, e);
                    grab_retries.increment(1);
                    thread::sleep(self.retry_backoff);
                    continue;
                }
                Err(e) => {
                    error!("{}: grab failed: {}", params.name, e);
                    thread::sleep(self.retry_backoff);
                    continue;
                }
            };

            let record = session.record(buffer.timestamp_ns());
            let frame = buffer.extract();
            // Hand the slot back before anything else can block.
            drop(buffer);
            frames_grabbed.increment(1);

            if cadence.should_display(record.frame_number) {
                let preview = frame.downsample(params.display_downsample);
                if self.display_sink.push(SinkMessage::Frame(preview)).is_ok() {
                    frames_displayed.increment(1);
                }
            }

            if let Err(e) = self.write_sink.push(SinkMessage::Frame(frame)) {
                if !write_sink_lost {
                    error!("{}: write sink lost, frames are no longer saved: {}", params.name, e);
                    write_sink_lost = true;
                }
            }

            if chunk.is_some_and(|c| record.frame_number % c == 0) {
                session.throughput.push(report_throughput(params, &record));
            }
        };

        info!(
            "{}: acquisition stopped ({:?}) after {} frames in {:.1} s",
            params.name,
            reason,
            session.count,
            started.elapsed().as_secs_f64()
        );
        self.finalize(session, source, reason)
    }

    fn finalize<S: FrameSource>(
        self,
        mut session: Session,
        source: &mut S,
        stop_reason: StopReason,
    ) -> Result<SessionReport> {
        session.transition(SessionState::Finalizing);
        info!("Closing {}... Please wait.", self.params.name);

        let persisted = self.recorder.persist(self.params, &session.records);
        if let Err(e) = &persisted {
            error!("{}: metadata was not saved: {}", self.params.name, e);
        }

        if self.write_sink.push(SinkMessage::EndOfStream).is_err() {
            warn!("{}: write sink gone before end of stream", self.params.name);
        }

        let close = self.shut_down(source);
        session.transition(SessionState::Closed);

        Ok(SessionReport {
            metadata_path: persisted?,
            records: session.records,
            throughput: session.throughput,
            stop_reason,
            close,
        })
    }

    /// Stop streaming and close the camera, retrying while the device is busy.
    fn shut_down<S: FrameSource>(&self, source: &mut S) -> CloseOutcome {
        let name = &self.params.name;
        let close_attempts = metrics::counter!("campy_close_attempts", "camera" => name.clone());
        let mut streaming = source.is_streaming();
        let mut last_error = None;

        for attempt in 1..=self.close_policy.max_attempts {
            if self.stop.is_aborted() {
                warn!("{}: close aborted after {} attempt(s)", name, attempt - 1);
                return CloseOutcome::Aborted {
                    attempts: attempt - 1,
                };
            }
            close_attempts.increment(1);

            match stop_and_close(source, &mut streaming) {
                Ok(()) => {
                    info!("{} closed", name);
                    return CloseOutcome::Closed { attempts: attempt };
                }
                Err(e) if e.is_transient() => {
                    debug!("{}: close attempt {} failed: {}", name, attempt, e);
                    last_error = Some(e);
                    thread::sleep(self.close_policy.backoff);
                }
                Err(e) => {
                    error!("{}: failed to close camera: {}", name, e);
                    return CloseOutcome::Failed(e);
                }
            }
        }

        let attempts = self.close_policy.max_attempts;
        let last_error =
            last_error.unwrap_or_else(|| DeviceError::fatal("close was never attempted"));
        error!("{}: gave up closing after {} attempts: {}", name, attempts, last_error);
        CloseOutcome::GaveUp {
            attempts,
            last_error,
        }
    }
}

fn stop_and_close<S: FrameSource>(
    source: &mut S,
    streaming: &mut bool,
) -> std::result::Result<(), DeviceError> {
    if *streaming {
        source.stop_streaming()?;
        *streaming = false;
    }
    source.close()
}

fn report_throughput(params: &CameraParameters, record: &GrabRecord) -> Throughput {
    let fps = (record.timestamp > 0.0)
        .then(|| (record.frame_number as f64 / record.timestamp).round());
    match fps {
        Some(fps) => info!(
            "{} collected {} frames at {} fps",
            params.name, record.frame_number, fps
        ),
        None => info!("{} collected {} frames", params.name, record.frame_number),
    }
    Throughput {
        frames: record.frame_number,
        fps,
    }
}
