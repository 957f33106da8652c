//! Backend selection.
//!
//! Registration-time validation opens a short, disposable probe connection and
//! releases it immediately. Long-lived read loops use `open_for_streaming`,
//! which neither probes nor releases.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::ingest::{Backend, Capture, CaptureDriver};

/// Delay between probe reads.
const PROBE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Order in which autodetection tries the native backends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackendOrder {
    #[default]
    FfmpegFirst,
    GstreamerFirst,
}

impl BackendOrder {
    pub fn from_ffmpeg_first(ffmpeg_first: bool) -> Self {
        if ffmpeg_first {
            BackendOrder::FfmpegFirst
        } else {
            BackendOrder::GstreamerFirst
        }
    }

    /// Candidates in try order. `Backend::Default` is always last.
    pub fn candidates(self) -> [Backend; 3] {
        match self {
            BackendOrder::FfmpegFirst => [Backend::Ffmpeg, Backend::Gstreamer, Backend::Default],
            BackendOrder::GstreamerFirst => {
                [Backend::Gstreamer, Backend::Ffmpeg, Backend::Default]
            }
        }
    }
}

/// Error type for backend selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectError {
    /// Preference string names no known backend
    InvalidPreference(String),
    /// No backend could read a frame from the address
    NoBackendAvailable(String),
}

impl fmt::Display for SelectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectError::InvalidPreference(prefer) => {
                write!(f, "Invalid backend preference: {}", prefer)
            }
            SelectError::NoBackendAvailable(detail) => write!(f, "{}", detail),
        }
    }
}

impl std::error::Error for SelectError {}

/// Failure to open a streaming connection, with the backend's diagnostic note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenFailure {
    pub note: String,
}

impl fmt::Display for OpenFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.note)
    }
}

/// Outcome of a successful selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub backend: Backend,
    pub label: &'static str,
}

impl Selection {
    fn new(backend: Backend) -> Self {
        Self {
            backend,
            label: backend.label(),
        }
    }
}

pub struct BackendSelector {
    driver: Arc<dyn CaptureDriver>,
    probe_timeout: Duration,
    order: BackendOrder,
}

impl BackendSelector {
    pub fn new(driver: Arc<dyn CaptureDriver>, probe_timeout: Duration, order: BackendOrder) -> Self {
        Self {
            driver,
            probe_timeout,
            order,
        }
    }

    pub fn driver(&self) -> &Arc<dyn CaptureDriver> {
        &self.driver
    }

    /// Determine which backend can open `address`.
    ///
    /// With a preference, only that backend is probed. Without one, the
    /// compiled backends are tried in the configured order with the default
    /// backend last. A blank preference counts as none.
    pub fn select(&self, address: &str, prefer: Option<&str>) -> Result<Selection, SelectError> {
        let prefer = prefer.filter(|prefer| !prefer.trim().is_empty());
        if let Some(prefer) = prefer {
            let backend = Backend::from_preference(prefer)
                .ok_or_else(|| SelectError::InvalidPreference(prefer.to_string()))?;
            if self.probe(address, backend) {
                return Ok(Selection::new(backend));
            }
            return Err(SelectError::NoBackendAvailable(
                "Cannot open stream with preferred backend".to_string(),
            ));
        }

        let support = self.driver.build_support();
        for backend in self.order.candidates() {
            if !support.supports(backend) {
                log::debug!("backend {} not compiled in, skipping", backend);
                continue;
            }
            if self.probe(address, backend) {
                return Ok(Selection::new(backend));
            }
        }

        Err(SelectError::NoBackendAvailable(
            "Cannot open stream with any backend".to_string(),
        ))
    }

    /// Open a long-lived connection for the read loop. No probe, no release.
    pub fn open_for_streaming(
        &self,
        address: &str,
        backend: Backend,
    ) -> Result<Box<dyn Capture>, OpenFailure> {
        self.driver.open(address, backend).map_err(|err| OpenFailure {
            note: format!("backend {} failed: {:#}", backend, err),
        })
    }

    /// Open, poll for one readable frame within the probe timeout, release.
    fn probe(&self, address: &str, backend: Backend) -> bool {
        let mut capture = match self.driver.open(address, backend) {
            Ok(capture) => capture,
            Err(err) => {
                log::debug!("probe: {} could not open stream: {:#}", backend, err);
                return false;
            }
        };

        let started = Instant::now();
        let mut readable = false;
        while started.elapsed() < self.probe_timeout {
            match capture.read() {
                Ok(Some(frame)) if !frame.is_empty() => {
                    readable = true;
                    break;
                }
                Ok(_) => {}
                Err(err) => log::debug!("probe: {} read failed: {:#}", backend, err),
            }
            std::thread::sleep(PROBE_POLL_INTERVAL);
        }
        capture.release();

        if !readable {
            log::debug!(
                "probe: {} produced no frame within {:?}",
                backend,
                self.probe_timeout
            );
        }
        readable
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
