use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use approx::assert_abs_diff_eq;
use campy::capture::{
    DeviceError, DeviceSystem, EmuConfig, EmuModule, Frame, FrameBuffer, FrameMetadata,
    FrameSource, GrabOutcome, PixelFormat,
};
use campy::metadata::{CsvRecorder, GrabRecord, MetadataRecorder};
use campy::pipeline::{
    acquire_camera, write_queue, AcquisitionLoop, CloseOutcome, CloseRetryPolicy, DisplayBuffer,
    SinkMessage, StopReason, StopSignal,
};
use campy::{CameraParameters, Error};

const FRAME_PERIOD_NS: u64 = 33_333_333;

enum Step {
    Frame(u64),
    NotYet,
    Transient,
    Fatal,
    End,
}

struct ScriptedBuffer {
    timestamp_ns: u64,
}

impl FrameBuffer for ScriptedBuffer {
    fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    fn extract(&self) -> Frame {
        Frame::new(
            vec![(self.timestamp_ns % 251) as u8; 16],
            FrameMetadata {
                width: 4,
                height: 4,
                format: PixelFormat::Mono8,
                timestamp_ns: self.timestamp_ns,
            },
        )
    }
}

/// Camera that replays a fixed script, then reports "not yet" forever.
#[derive(Default)]
struct ScriptedSource {
    script: VecDeque<Step>,
    streaming: bool,
    closed: bool,
    fail_start: bool,
    busy_on_stop: u32,
    busy_on_close: u32,
    grabs: usize,
    stop_calls: usize,
    close_calls: usize,
}

impl ScriptedSource {
    fn new(script: impl IntoIterator<Item = Step>) -> Self {
        Self {
            script: script.into_iter().collect(),
            ..Default::default()
        }
    }

    /// `n` frames spaced at 30 fps on a clock starting at 5 s.
    fn frames(n: u64) -> Self {
        Self::new((0..n).map(|i| Step::Frame(5_000_000_000 + i * FRAME_PERIOD_NS)))
    }
}

impl FrameSource for ScriptedSource {
    type Buffer = ScriptedBuffer;

    fn start_streaming(&mut self) -> Result<(), DeviceError> {
        if self.fail_start {
            return Err(DeviceError::fatal("cannot start"));
        }
        self.streaming = true;
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        self.streaming
    }

    fn grab(&mut self, _timeout: Duration) -> Result<GrabOutcome<ScriptedBuffer>, DeviceError> {
        self.grabs += 1;
        match self.script.pop_front() {
            Some(Step::Frame(timestamp_ns)) => {
                Ok(GrabOutcome::Success(ScriptedBuffer { timestamp_ns }))
            }
            Some(Step::NotYet) => Ok(GrabOutcome::NotYetAvailable),
            Some(Step::Transient) => Err(DeviceError::transient("frame incomplete")),
            Some(Step::Fatal) => Err(DeviceError::fatal("bus reset")),
            Some(Step::End) => Ok(GrabOutcome::StreamEnded),
            None => {
                thread::sleep(Duration::from_millis(1));
                Ok(GrabOutcome::NotYetAvailable)
            }
        }
    }

    fn stop_streaming(&mut self) -> Result<(), DeviceError> {
        self.stop_calls += 1;
        if self.busy_on_stop > 0 {
            self.busy_on_stop -= 1;
            return Err(DeviceError::transient("busy"));
        }
        self.streaming = false;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.close_calls += 1;
        if self.busy_on_close > 0 {
            self.busy_on_close -= 1;
            return Err(DeviceError::transient("busy"));
        }
        self.closed = true;
        Ok(())
    }
}

/// Keeps records in memory; optionally refuses to persist.
#[derive(Clone, Default)]
struct MemoryRecorder {
    saved: Arc<Mutex<Option<Vec<GrabRecord>>>>,
    fail: bool,
}

impl MetadataRecorder for MemoryRecorder {
    fn persist(&self, params: &CameraParameters, records: &[GrabRecord]) -> campy::Result<PathBuf> {
        if self.fail {
            return Err(Error::Metadata {
                path: params.metadata_path(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            });
        }
        *self.saved.lock().unwrap() = Some(records.to_vec());
        Ok(params.metadata_path())
    }
}

fn params(frame_rate: f64, rec_time_in_sec: f64, folder: &Path) -> CameraParameters {
    CameraParameters {
        name: "Camera0".into(),
        frame_rate,
        rec_time_in_sec,
        display_frame_rate: 0.0,
        video_folder: folder.to_path_buf(),
        ..Default::default()
    }
}

fn fast_close() -> CloseRetryPolicy {
    CloseRetryPolicy {
        max_attempts: 5,
        backoff: Duration::ZERO,
    }
}

fn drain(rx: &flume::Receiver<SinkMessage>) -> Vec<SinkMessage> {
    rx.try_iter().collect()
}

#[test]
fn records_every_frame_until_target() {
    let dir = tempfile::tempdir().unwrap();
    let params = CameraParameters {
        display_frame_rate: 5.0,
        display_downsample: 2,
        chunk_length_in_sec: 0.5,
        ..params(30.0, 10.0, dir.path())
    };
    let (write_tx, write_rx) = write_queue();
    let (display_tx, display_rx) = write_queue();
    let mut source = ScriptedSource::frames(400);

    let report = AcquisitionLoop::new(&params, write_tx, display_tx, CsvRecorder, StopSignal::new())
        .run(&mut source)
        .unwrap();

    assert_eq!(report.stop_reason, StopReason::TargetReached);
    assert_eq!(report.frames(), 300);
    assert_eq!(source.grabs, 300, "no grab after the target is reached");
    assert_eq!(report.records[0].timestamp, 0.0);
    assert_abs_diff_eq!(
        report.records[299].timestamp,
        299.0 * FRAME_PERIOD_NS as f64 / 1e9,
        epsilon = 1e-9
    );
    for (i, record) in report.records.iter().enumerate() {
        assert_eq!(record.frame_number, i as u64 + 1);
    }

    let written = drain(&write_rx);
    assert_eq!(written.len(), 301);
    assert!(matches!(written.last(), Some(SinkMessage::EndOfStream)));
    let stamps: Vec<u64> = written
        .into_iter()
        .filter_map(SinkMessage::into_frame)
        .map(|f| f.timestamp_ns())
        .collect();
    assert!(stamps.windows(2).all(|w| w[0] < w[1]));

    // Frames 6, 12, ..., 300 reach the preview at half resolution.
    let shown: Vec<Frame> = drain(&display_rx)
        .into_iter()
        .filter_map(SinkMessage::into_frame)
        .collect();
    assert_eq!(shown.len(), 50);
    assert_eq!(shown[0].width(), 2);
    assert_eq!(shown[0].height(), 2);
    assert_eq!(shown[0].timestamp_ns(), 5_000_000_000 + 5 * FRAME_PERIOD_NS);

    // One progress report per 15 frames, rate measured from the first frame.
    let reported: Vec<u64> = report.throughput.iter().map(|t| t.frames).collect();
    assert_eq!(reported, (1..=20).map(|k| k * 15).collect::<Vec<u64>>());
    assert_eq!(report.throughput[0].fps, Some(32.0));
    assert_eq!(report.throughput[19].fps, Some(30.0));

    assert_eq!(report.close, CloseOutcome::Closed { attempts: 1 });
    assert!(report.is_clean());
    assert!(source.closed);

    let csv = std::fs::read_to_string(dir.path().join("metadata0.csv")).unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines.len(), 301);
    assert_eq!(lines[0], "frameNumber,timeStamp");
    assert_eq!(lines[1], "1,0.000000000");
    assert!(lines[300].starts_with("300,9.96666"));
}

#[test]
fn not_yet_available_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let params = params(10.0, 0.1, dir.path());
    let (write_tx, write_rx) = write_queue();
    let mut source = ScriptedSource::new([
        Step::NotYet,
        Step::NotYet,
        Step::NotYet,
        Step::Frame(42),
    ]);

    let report = AcquisitionLoop::new(
        &params,
        write_tx,
        DisplayBuffer::new(2),
        MemoryRecorder::default(),
        StopSignal::new(),
    )
    .with_retry_backoff(Duration::ZERO)
    .run(&mut source)
    .unwrap();

    assert_eq!(source.grabs, 4);
    assert_eq!(report.frames(), 1);
    // Default 30 s chunk never completes within a single frame.
    assert!(report.throughput.is_empty());
    assert_eq!(report.records[0].frame_number, 1);
    assert_eq!(drain(&write_rx).len(), 2);
}

#[test]
fn grab_errors_do_not_end_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let params = params(20.0, 0.1, dir.path());
    let recorder = MemoryRecorder::default();
    let mut source = ScriptedSource::new([
        Step::Transient,
        Step::Frame(1_000),
        Step::Fatal,
        Step::Transient,
        Step::Frame(2_000),
    ]);
    let (write_tx, _write_rx) = write_queue();

    let report = AcquisitionLoop::new(
        &params,
        write_tx,
        DisplayBuffer::new(2),
        recorder.clone(),
        StopSignal::new(),
    )
    .with_retry_backoff(Duration::ZERO)
    .run(&mut source)
    .unwrap();

    assert_eq!(report.stop_reason, StopReason::TargetReached);
    assert_eq!(report.frames(), 2);
    assert_abs_diff_eq!(report.records[1].timestamp, 1e-6, epsilon = 1e-15);
    assert_eq!(recorder.saved.lock().unwrap().as_ref().map(Vec::len), Some(2));
}

#[test]
fn stream_end_finishes_early() {
    let dir = tempfile::tempdir().unwrap();
    let params = params(30.0, 60.0, dir.path());
    let (write_tx, write_rx) = write_queue();
    let mut source = ScriptedSource::new([Step::Frame(10), Step::Frame(20), Step::End]);

    let report = AcquisitionLoop::new(
        &params,
        write_tx,
        DisplayBuffer::new(2),
        MemoryRecorder::default(),
        StopSignal::new(),
    )
    .run(&mut source)
    .unwrap();

    assert_eq!(report.stop_reason, StopReason::StreamEnded);
    assert_eq!(report.frames(), 2);
    assert!(matches!(
        drain(&write_rx).last(),
        Some(SinkMessage::EndOfStream)
    ));
    assert!(source.closed);
}

#[test]
fn stop_signal_from_another_thread_ends_promptly() {
    let dir = tempfile::tempdir().unwrap();
    let params = params(30.0, 3600.0, dir.path());
    let stop = StopSignal::new();
    let recorder = MemoryRecorder::default();
    let (write_tx, write_rx) = write_queue();
    let mut source = ScriptedSource::frames(5);

    let stopper = {
        let stop = stop.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            stop.raise();
        })
    };

    let started = Instant::now();
    let report = AcquisitionLoop::new(
        &params,
        write_tx,
        DisplayBuffer::new(2),
        recorder.clone(),
        stop,
    )
    .run(&mut source)
    .unwrap();
    stopper.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(report.stop_reason, StopReason::StopSignal);
    assert_eq!(report.frames(), 5);
    assert_eq!(recorder.saved.lock().unwrap().as_ref().map(Vec::len), Some(5));
    assert!(matches!(
        drain(&write_rx).last(),
        Some(SinkMessage::EndOfStream)
    ));
}

#[test]
fn stop_before_first_frame_still_writes_header() {
    let dir = tempfile::tempdir().unwrap();
    let params = params(30.0, 10.0, dir.path());
    let stop = StopSignal::new();
    stop.raise();
    let (write_tx, write_rx) = write_queue();
    let mut source = ScriptedSource::frames(10);

    let report = AcquisitionLoop::new(&params, write_tx, DisplayBuffer::new(2), CsvRecorder, stop)
        .run(&mut source)
        .unwrap();

    assert_eq!(report.frames(), 0);
    assert_eq!(source.grabs, 0);
    let csv = std::fs::read_to_string(report.metadata_path).unwrap();
    assert_eq!(csv.trim_end(), "frameNumber,timeStamp");
    let written = drain(&write_rx);
    assert_eq!(written.len(), 1);
    assert!(matches!(written[0], SinkMessage::EndOfStream));
}

#[test]
fn failed_start_is_reported_and_finalized() {
    let dir = tempfile::tempdir().unwrap();
    let params = params(30.0, 10.0, dir.path());
    let recorder = MemoryRecorder::default();
    let (write_tx, write_rx) = write_queue();
    let mut source = ScriptedSource {
        fail_start: true,
        ..ScriptedSource::frames(10)
    };

    let report = AcquisitionLoop::new(
        &params,
        write_tx,
        DisplayBuffer::new(2),
        recorder.clone(),
        StopSignal::new(),
    )
    .run(&mut source)
    .unwrap();

    assert_eq!(report.stop_reason, StopReason::StartFailed);
    assert!(!report.is_clean());
    assert_eq!(source.grabs, 0);
    assert_eq!(source.stop_calls, 0);
    assert!(source.closed);
    assert_eq!(recorder.saved.lock().unwrap().as_ref().map(Vec::len), Some(0));
    assert_eq!(drain(&write_rx).len(), 1);
}

#[test]
fn metadata_failure_is_returned_after_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let params = params(3.0, 1.0, dir.path());
    let (write_tx, write_rx) = write_queue();
    let mut source = ScriptedSource::frames(3);
    let recorder = MemoryRecorder {
        fail: true,
        ..Default::default()
    };

    let err = AcquisitionLoop::new(
        &params,
        write_tx,
        DisplayBuffer::new(2),
        recorder,
        StopSignal::new(),
    )
    .run(&mut source)
    .unwrap_err();

    assert!(matches!(err, Error::Metadata { .. }));
    assert!(source.closed, "camera is closed even when metadata fails");
    assert!(matches!(
        drain(&write_rx).last(),
        Some(SinkMessage::EndOfStream)
    ));
}

#[test]
fn busy_device_is_closed_after_retries() {
    let dir = tempfile::tempdir().unwrap();
    let params = params(3.0, 1.0, dir.path());
    let (write_tx, _write_rx) = write_queue();
    let mut source = ScriptedSource {
        busy_on_stop: 3,
        busy_on_close: 2,
        ..ScriptedSource::frames(3)
    };

    let report = AcquisitionLoop::new(
        &params,
        write_tx,
        DisplayBuffer::new(2),
        MemoryRecorder::default(),
        StopSignal::new(),
    )
    .with_close_policy(CloseRetryPolicy {
        max_attempts: 10,
        backoff: Duration::ZERO,
    })
    .run(&mut source)
    .unwrap();

    // Three busy stops, then the stream stops once and close is retried.
    assert_eq!(report.close, CloseOutcome::Closed { attempts: 6 });
    assert_eq!(source.stop_calls, 4);
    assert_eq!(source.close_calls, 3);
    assert!(report.is_clean());
}

#[test]
fn close_retry_gives_up_at_the_bound() {
    let dir = tempfile::tempdir().unwrap();
    let params = params(3.0, 1.0, dir.path());
    let (write_tx, _write_rx) = write_queue();
    let mut source = ScriptedSource {
        busy_on_close: u32::MAX,
        ..ScriptedSource::frames(3)
    };

    let report = AcquisitionLoop::new(
        &params,
        write_tx,
        DisplayBuffer::new(2),
        MemoryRecorder::default(),
        StopSignal::new(),
    )
    .with_close_policy(fast_close())
    .run(&mut source)
    .unwrap();

    assert!(matches!(report.close, CloseOutcome::GaveUp { attempts: 5, .. }));
    assert_eq!(source.close_calls, 5);
    assert!(!report.is_clean());
}

#[test]
fn abort_interrupts_close_retries() {
    let dir = tempfile::tempdir().unwrap();
    let params = params(3.0, 1.0, dir.path());
    let stop = StopSignal::new();
    let (write_tx, _write_rx) = write_queue();
    let mut source = ScriptedSource {
        busy_on_close: u32::MAX,
        ..ScriptedSource::frames(3)
    };

    let aborter = {
        let stop = stop.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            stop.abort();
        })
    };

    let started = Instant::now();
    let report = AcquisitionLoop::new(
        &params,
        write_tx,
        DisplayBuffer::new(2),
        MemoryRecorder::default(),
        stop,
    )
    .with_close_policy(CloseRetryPolicy {
        max_attempts: 10_000,
        backoff: Duration::from_millis(5),
    })
    .run(&mut source)
    .unwrap();
    aborter.join().unwrap();

    assert!(matches!(report.close, CloseOutcome::Aborted { .. }));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(report.frames(), 3);
}

#[test]
fn throughput_reported_on_every_chunk_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let params = CameraParameters {
        chunk_length_in_sec: 0.1,
        ..params(10.0, 0.3, dir.path())
    };
    let (write_tx, _write_rx) = write_queue();
    let mut source =
        ScriptedSource::new((0..3).map(|i| Step::Frame(2_000_000_000 + i * 100_000_000)));

    let report = AcquisitionLoop::new(
        &params,
        write_tx,
        DisplayBuffer::new(2),
        MemoryRecorder::default(),
        StopSignal::new(),
    )
    .run(&mut source)
    .unwrap();

    assert_eq!(report.frames(), 3);
    let reported: Vec<(u64, Option<f64>)> =
        report.throughput.iter().map(|t| (t.frames, t.fps)).collect();
    // No rate for the first frame: no time has elapsed yet.
    assert_eq!(
        reported,
        vec![(1, None), (2, Some(20.0)), (3, Some(15.0))]
    );
}

#[test]
fn preview_keeps_only_recent_frames() {
    let dir = tempfile::tempdir().unwrap();
    let params = CameraParameters {
        display_frame_rate: 10.0,
        display_downsample: 1,
        ..params(10.0, 1.0, dir.path())
    };
    let display = DisplayBuffer::new(2);
    let (write_tx, _write_rx) = write_queue();
    let mut source = ScriptedSource::new((1..=10).map(|i| Step::Frame(i * 100_000_000)));

    let report = AcquisitionLoop::new(
        &params,
        write_tx,
        display.clone(),
        MemoryRecorder::default(),
        StopSignal::new(),
    )
    .run(&mut source)
    .unwrap();

    assert_eq!(report.frames(), 10);
    let stats = display.stats();
    assert_eq!(stats.written, 10);
    assert_eq!(stats.dropped, 8);
    let newest: Vec<u64> = std::iter::from_fn(|| display.pop())
        .filter_map(SinkMessage::into_frame)
        .map(|f| f.timestamp_ns())
        .collect();
    assert_eq!(newest, vec![900_000_000, 1_000_000_000]);
}

#[test]
fn emulated_camera_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let system = DeviceSystem::new(EmuModule::new(EmuConfig {
        width: 8,
        height: 8,
        trigger_rates: vec![40.0],
        busy_on_stop: 2,
        ..Default::default()
    }));
    let params = CameraParameters {
        name: "Camera0".into(),
        frame_rate: 40.0,
        rec_time_in_sec: 0.5,
        display_frame_rate: 10.0,
        display_downsample: 2,
        video_folder: dir.path().join("Camera0"),
        ..Default::default()
    };

    let report = acquire_camera(&system, params, StopSignal::new()).unwrap();

    assert_eq!(report.stop_reason, StopReason::TargetReached);
    assert_eq!(report.frames(), 20);
    assert!(report.is_clean());
    assert_eq!(report.close, CloseOutcome::Closed { attempts: 3 });
    assert_abs_diff_eq!(report.records[19].timestamp, 19.0 / 40.0, epsilon = 1e-6);

    let folder = dir.path().join("Camera0");
    let csv = std::fs::read_to_string(folder.join("metadata0.csv")).unwrap();
    assert_eq!(csv.lines().count(), 21);
    assert!(folder.join("params0.toml").exists());
    let raw = std::fs::metadata(folder.join("0.raw")).unwrap();
    assert_eq!(raw.len(), 20 * 64);

    assert_eq!(system.open_handles(), 0);
    system.release().unwrap();
}

#[test]
fn emulated_session_honors_stop() {
    let dir = tempfile::tempdir().unwrap();
    let system = Arc::new(DeviceSystem::new(EmuModule::new(EmuConfig {
        width: 4,
        height: 4,
        trigger_rates: vec![100.0],
        ..Default::default()
    })));
    let params = CameraParameters {
        frame_rate: 100.0,
        rec_time_in_sec: 3600.0,
        display_frame_rate: 0.0,
        video_folder: dir.path().to_path_buf(),
        ..Default::default()
    };
    let stop = StopSignal::new();

    let session = {
        let system = Arc::clone(&system);
        let stop = stop.clone();
        thread::spawn(move || acquire_camera(&*system, params, stop))
    };
    thread::sleep(Duration::from_millis(200));
    stop.raise();

    let report = session.join().unwrap().unwrap();
    assert_eq!(report.stop_reason, StopReason::StopSignal);
    assert!(report.frames() > 0);
    assert!(report.is_clean());
}

#[test]
fn system_release_waits_for_handles() {
    let system = DeviceSystem::new(EmuModule::new(EmuConfig {
        cameras: 2,
        ..Default::default()
    }));
    assert_eq!(system.camera_count().unwrap(), 2);
    assert!(matches!(
        system.open(5),
        Err(Error::CameraNotFound {
            index: 5,
            available: 2
        })
    ));

    let handle = system.open(1).unwrap();
    assert_eq!(system.open_handles(), 1);
    drop(handle);
    assert_eq!(system.open_handles(), 0);

    let _held = system.open(0).unwrap();
    assert!(matches!(
        system.release(),
        Err(Error::HandlesOutstanding(1))
    ));
}
