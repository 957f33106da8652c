//! Per-source worker loop.
//!
//! ```text
//!   start ──► connecting ──open ok──► active ──(read loop)──┐
//!                 ▲   │                                     │ threshold of
//!                 │   └─open failed─► error ─┐              │ invalid frames
//!                 │                          │ autodetect?  │
//!                 └──── reconnect delay ◄────┴──────────────┘
//!   stop signal at any wait ──► inactive
//! ```
//!
//! Every wait is interruptible by the stop signal, and faults inside a
//! session (errors or backend panics) are reported as `error` and retried.

use anyhow::Result;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::cache::{FrameCache, SourceState};
use crate::frame::Frame;
use crate::ingest::{Backend, Capture};
use crate::monitor::DecoderWarningMonitor;
use crate::select::BackendSelector;
use crate::storage::StatusRecorder;

// ----------------------------------------------------------------------------
// StopSignal: cooperative cancellation
// ----------------------------------------------------------------------------

/// Cancellation flag with an interruptible sleep.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock().unwrap_or_else(|p| p.into_inner()) = true;
        cvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Sleep up to `timeout`. Returns true if stopped before or during the wait.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(|p| p.into_inner());
        if *guard {
            return true;
        }
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(|p| p.into_inner());
        *guard
    }
}

// ----------------------------------------------------------------------------
// Shared worker context
// ----------------------------------------------------------------------------

/// Timing and threshold knobs for the read loop.
#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub read_throttle: Duration,
    pub reconnect_delay: Duration,
    pub jpeg_quality: u8,
    pub max_consecutive_failures: u32,
    pub corruption_window: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            read_throttle: Duration::from_millis(80),
            reconnect_delay: Duration::from_secs(2),
            jpeg_quality: 85,
            max_consecutive_failures: 5,
            corruption_window: Duration::from_secs(1),
        }
    }
}

/// Process-scoped collaborators every worker uses.
pub struct WorkerContext {
    pub cache: Arc<FrameCache>,
    pub monitor: Arc<DecoderWarningMonitor>,
    pub selector: Arc<BackendSelector>,
    pub recorder: Arc<dyn StatusRecorder>,
    pub settings: WorkerSettings,
}

impl WorkerContext {
    /// Update the cache and, best-effort, the registry.
    pub fn publish_status(&self, source: &str, state: SourceState, error: Option<String>) {
        self.cache.set_status(source, state, error);
        if let Err(err) = self.recorder.record_status(source, state) {
            log::warn!("{}: failed to record status {}: {:#}", source, state, err);
        }
    }
}

/// Backend choice shared between a running worker and its supervisor handle.
#[derive(Debug)]
pub struct BackendSlot {
    backend: Mutex<Backend>,
    autodetect: AtomicBool,
}

impl BackendSlot {
    pub fn new(backend: Backend, autodetect: bool) -> Self {
        Self {
            backend: Mutex::new(backend),
            autodetect: AtomicBool::new(autodetect),
        }
    }

    pub fn backend(&self) -> Backend {
        *self.backend.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn autodetect(&self) -> bool {
        self.autodetect.load(Ordering::SeqCst)
    }

    fn adopt(&self, backend: Backend) {
        *self.backend.lock().unwrap_or_else(|p| p.into_inner()) = backend;
        self.autodetect.store(false, Ordering::SeqCst);
    }
}

// ----------------------------------------------------------------------------
// Worker loop
// ----------------------------------------------------------------------------

enum SessionEnd {
    Stopped,
    Reconnect,
}

enum ReadOutcome {
    Valid(Frame),
    Invalid(String),
}

fn classify(read: Result<Option<Frame>>) -> ReadOutcome {
    match read {
        Ok(Some(frame)) if !frame.is_empty() => ReadOutcome::Valid(frame),
        Ok(Some(_)) => ReadOutcome::Invalid("empty frame".to_string()),
        Ok(None) => ReadOutcome::Invalid("no frame".to_string()),
        Err(err) => ReadOutcome::Invalid(format!("read failed: {:#}", err)),
    }
}

pub(crate) struct SourceWorker {
    source: String,
    address: String,
    ctx: Arc<WorkerContext>,
    slot: Arc<BackendSlot>,
    stop: StopSignal,
}

impl SourceWorker {
    pub(crate) fn new(
        source: &str,
        address: &str,
        ctx: Arc<WorkerContext>,
        slot: Arc<BackendSlot>,
        stop: StopSignal,
    ) -> Self {
        Self {
            source: source.to_string(),
            address: address.to_string(),
            ctx,
            slot,
            stop,
        }
    }

    /// Run until the stop signal fires.
    pub(crate) fn run(self) {
        let settings = self.ctx.settings.clone();
        while !self.stop.is_stopped() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.connect_and_stream()));
            let fault = match outcome {
                Ok(Ok(SessionEnd::Stopped)) => break,
                Ok(Ok(SessionEnd::Reconnect)) => None,
                Ok(Err(err)) => Some(format!("{:#}", err)),
                Err(payload) => Some(panic_message(payload.as_ref())),
            };
            if let Some(message) = fault {
                log::error!("{}: worker crashed: {}", self.source, message);
                self.ctx
                    .publish_status(&self.source, SourceState::Error, Some(message));
            }
            if self.stop.wait(settings.reconnect_delay) {
                break;
            }
        }

        self.ctx
            .publish_status(&self.source, SourceState::Inactive, None);
        log::info!("{}: worker stopped", self.source);
    }

    /// One open attempt plus, on success, the read loop.
    fn connect_and_stream(&self) -> Result<SessionEnd> {
        loop {
            let backend = self.slot.backend();
            match self.ctx.selector.open_for_streaming(&self.address, backend) {
                Ok(capture) => {
                    self.ctx
                        .publish_status(&self.source, SourceState::Active, None);
                    log::info!("{}: connected via {}", self.source, backend);
                    return self.stream(capture);
                }
                Err(failure) => {
                    log::error!("{}: failed to open stream ({})", self.source, failure);
                    self.ctx.publish_status(
                        &self.source,
                        SourceState::Error,
                        Some(failure.note),
                    );
                    if self.slot.autodetect() && self.redetect() {
                        if self.stop.is_stopped() {
                            return Ok(SessionEnd::Stopped);
                        }
                        continue;
                    }
                    return Ok(SessionEnd::Reconnect);
                }
            }
        }
    }

    /// Re-run backend selection. Returns true when a new backend was adopted.
    fn redetect(&self) -> bool {
        match self.ctx.selector.select(&self.address, None) {
            Ok(selection) => {
                self.slot.adopt(selection.backend);
                log::info!(
                    "{}: backend autodetect succeeded with {}",
                    self.source,
                    selection.label
                );
                true
            }
            Err(err) => {
                log::debug!("{}: backend autodetect still failing: {}", self.source, err);
                false
            }
        }
    }

    fn stream(&self, mut capture: Box<dyn Capture>) -> Result<SessionEnd> {
        let result = self.read_loop(capture.as_mut());
        capture.release();
        result
    }

    fn read_loop(&self, capture: &mut dyn Capture) -> Result<SessionEnd> {
        let settings = &self.ctx.settings;
        let threshold = settings.max_consecutive_failures.max(1);
        let mut consecutive_failures: u32 = 0;

        while !self.stop.is_stopped() {
            match classify(capture.read()) {
                ReadOutcome::Invalid(reason) => {
                    consecutive_failures += 1;
                    if consecutive_failures >= threshold {
                        self.ctx
                            .publish_status(&self.source, SourceState::Connecting, None);
                        log::warn!(
                            "{}: too many invalid frames ({}), reconnecting",
                            self.source,
                            reason
                        );
                        return Ok(SessionEnd::Reconnect);
                    }
                    log::debug!(
                        "{}: skipping invalid frame ({}/{}): {}",
                        self.source,
                        consecutive_failures,
                        threshold,
                        reason
                    );
                }
                ReadOutcome::Valid(frame) => {
                    if self
                        .ctx
                        .monitor
                        .had_recent_warning_for_source(&self.source, settings.corruption_window)
                    {
                        log::debug!("{}: dropping frame after decoder warning", self.source);
                    } else {
                        consecutive_failures = 0;
                        self.ctx
                            .cache
                            .store_frame(&self.source, frame, settings.jpeg_quality);
                    }
                }
            }

            if self.stop.wait(settings.read_throttle) {
                break;
            }
        }
        Ok(SessionEnd::Stopped)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::BuildSupport;
    use crate::select::BackendOrder;
    use crate::testing::{FakeDriver, RecordingRecorder, Script, Step};
    use std::time::Instant;

    struct Harness {
        driver: Arc<FakeDriver>,
        recorder: Arc<RecordingRecorder>,
        ctx: Arc<WorkerContext>,
        stop: StopSignal,
    }

    fn harness(monitor: DecoderWarningMonitor, threshold: u32) -> Harness {
        let stop = StopSignal::new();
        let driver = Arc::new(FakeDriver::with_support(BuildSupport {
            ffmpeg: true,
            gstreamer: false,
        }));
        driver.attach_stop(stop.clone());
        let recorder = Arc::new(RecordingRecorder::default());
        let ctx = Arc::new(WorkerContext {
            cache: Arc::new(FrameCache::new()),
            monitor: Arc::new(monitor),
            selector: Arc::new(BackendSelector::new(
                driver.clone(),
                Duration::from_millis(100),
                BackendOrder::FfmpegFirst,
            )),
            recorder: recorder.clone(),
            settings: WorkerSettings {
                read_throttle: Duration::ZERO,
                reconnect_delay: Duration::ZERO,
                jpeg_quality: 75,
                max_consecutive_failures: threshold,
                corruption_window: Duration::from_secs(30),
            },
        });
        Harness {
            driver,
            recorder,
            ctx,
            stop,
        }
    }

    fn run(h: &Harness, backend: Backend, autodetect: bool) -> Arc<BackendSlot> {
        let slot = Arc::new(BackendSlot::new(backend, autodetect));
        SourceWorker::new(
            "cam",
            "rtsp://example",
            h.ctx.clone(),
            slot.clone(),
            h.stop.clone(),
        )
        .run();
        slot
    }

    #[test]
    fn stop_signal_interrupts_wait() {
        let stop = StopSignal::new();
        let waiter = stop.clone();
        let started = Instant::now();
        let handle = std::thread::spawn(move || waiter.wait(Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(20));
        stop.stop();
        assert!(handle.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(stop.wait(Duration::ZERO));
    }

    #[test]
    fn invalid_then_valid_frame_is_cached_without_reconnect() {
        let h = harness(DecoderWarningMonitor::disabled(), 2);
        h.driver.accept(Backend::Ffmpeg, || {
            Script::steps(vec![Step::Fail, Step::Valid]).then_stop()
        });

        run(&h, Backend::Ffmpeg, false);

        assert!(h.ctx.cache.get_encoded("cam", None).is_some());
        let states = h.recorder.states();
        assert!(!states.contains(&SourceState::Connecting), "{:?}", states);
        assert_eq!(states.first(), Some(&SourceState::Active));
        assert_eq!(states.last(), Some(&SourceState::Inactive));
    }

    #[test]
    fn failure_counter_resets_after_valid_frame() {
        let h = harness(DecoderWarningMonitor::disabled(), 2);
        h.driver.accept(Backend::Ffmpeg, || {
            Script::steps(vec![
                Step::Empty,
                Step::Valid,
                Step::Nothing,
                Step::Valid,
                Step::Fail,
                Step::Valid,
            ])
            .then_stop()
        });

        run(&h, Backend::Ffmpeg, false);

        assert!(!h.recorder.states().contains(&SourceState::Connecting));
        assert_eq!(h.driver.opened(), vec![Backend::Ffmpeg]);
    }

    #[test]
    fn consecutive_invalid_frames_trigger_reconnect() {
        let h = harness(DecoderWarningMonitor::disabled(), 5);
        h.driver.accept(Backend::Ffmpeg, || {
            Script::steps(vec![Step::Fail, Step::Empty, Step::Nothing, Step::Fail, Step::Fail])
                .then(Step::Valid)
        });
        h.driver.stop_after_opens(2);

        run(&h, Backend::Ffmpeg, false);

        let states = h.recorder.states();
        assert!(states.contains(&SourceState::Connecting), "{:?}", states);
        assert!(h.driver.opened().len() >= 2, "worker must reopen the stream");
        assert!(h.driver.released() >= 1, "stalled connection must be released");
    }

    #[test]
    fn stalled_feed_never_reaches_cache() {
        let h = harness(DecoderWarningMonitor::disabled(), 2);
        h.driver
            .accept(Backend::Ffmpeg, || Script::steps(vec![Step::Fail, Step::Fail]));
        h.driver.stop_after_opens(2);

        run(&h, Backend::Ffmpeg, false);

        assert!(h.recorder.states().contains(&SourceState::Connecting));
        assert!(h.ctx.cache.get_encoded("cam", None).is_none());
    }

    #[test]
    fn corrupted_frames_are_discarded() {
        let monitor = DecoderWarningMonitor::new(true);
        monitor.record_warning_for_source("cam");
        let h = harness(monitor, 2);
        h.driver
            .accept(Backend::Ffmpeg, || Script::steps(vec![Step::Valid, Step::Valid]).then_stop());

        run(&h, Backend::Ffmpeg, false);

        assert!(h.ctx.cache.get_encoded("cam", None).is_none());
        assert!(!h.recorder.states().contains(&SourceState::Connecting));
    }

    #[test]
    fn corrupted_frame_keeps_failure_count() {
        let monitor = DecoderWarningMonitor::new(true);
        monitor.record_warning_for_source("cam");
        let h = harness(monitor, 2);
        h.driver.accept(Backend::Ffmpeg, || {
            Script::steps(vec![Step::Fail, Step::Valid, Step::Fail])
        });
        h.driver.stop_after_opens(2);

        run(&h, Backend::Ffmpeg, false);

        let states = h.recorder.states();
        assert!(states.contains(&SourceState::Connecting), "{:?}", states);
        assert_eq!(h.driver.opened(), vec![Backend::Ffmpeg, Backend::Ffmpeg]);
        assert!(h.ctx.cache.get_encoded("cam", None).is_none());
    }

    #[test]
    fn warnings_for_other_sources_do_not_discard_frames() {
        let monitor = DecoderWarningMonitor::new(true);
        monitor.record_warning_for_source("other");
        let h = harness(monitor, 2);
        h.driver
            .accept(Backend::Ffmpeg, || Script::steps(vec![Step::Valid]).then_stop());

        run(&h, Backend::Ffmpeg, false);

        assert!(h.ctx.cache.get_encoded("cam", None).is_some());
    }

    #[test]
    fn open_failure_reports_error_and_retries() {
        let h = harness(DecoderWarningMonitor::disabled(), 2);
        h.driver.stop_after_opens(3);

        run(&h, Backend::Ffmpeg, false);

        let states = h.recorder.states();
        assert_eq!(
            states.iter().filter(|s| **s == SourceState::Error).count(),
            3,
            "{:?}",
            states
        );
        assert_eq!(states.last(), Some(&SourceState::Inactive));
        let status = h.ctx.cache.get_status("cam");
        assert_eq!(status.state, SourceState::Inactive);
    }

    #[test]
    fn autodetect_adopts_new_backend_after_failed_open() {
        let h = harness(DecoderWarningMonitor::disabled(), 2);
        h.driver
            .accept(Backend::Ffmpeg, || Script::steps(vec![Step::Valid]).then_stop());

        let slot = run(&h, Backend::Gstreamer, true);

        assert_eq!(slot.backend(), Backend::Ffmpeg);
        assert!(!slot.autodetect());
        assert!(h.ctx.cache.get_encoded("cam", None).is_some());
        let opened = h.driver.opened();
        assert_eq!(opened.first(), Some(&Backend::Gstreamer));
        assert!(opened.contains(&Backend::Ffmpeg));
    }

    #[test]
    fn backend_panic_is_recovered() {
        let h = harness(DecoderWarningMonitor::disabled(), 2);
        h.driver.accept(Backend::Ffmpeg, || Script::steps(vec![Step::Panic]));
        h.driver.stop_after_opens(2);

        run(&h, Backend::Ffmpeg, false);

        let states = h.recorder.states();
        assert!(states.contains(&SourceState::Error), "{:?}", states);
        assert_eq!(states.last(), Some(&SourceState::Inactive));
        assert!(h.driver.opened().len() >= 2);
    }
}
