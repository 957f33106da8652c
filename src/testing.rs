//! Scripted capture driver and recorder shared by unit tests.

use anyhow::{anyhow, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cache::SourceState;
use crate::frame::{gradient_frame, Frame};
use crate::ingest::{Backend, BuildSupport, Capture, CaptureDriver};
use crate::storage::StatusRecorder;
use crate::worker::StopSignal;

/// One scripted read result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Step {
    /// `Err` from the backend.
    Fail,
    /// `Ok(None)`.
    Nothing,
    /// A frame with an empty buffer.
    Empty,
    Valid,
    Panic,
    /// Block for half a second, ignoring the stop signal, then `Ok(None)`.
    Stall,
}

#[derive(Clone, Copy, Debug)]
enum Tail {
    Repeat(Step),
    Stop,
}

/// Read results for one opened connection.
pub(crate) struct Script {
    steps: VecDeque<Step>,
    tail: Tail,
}

impl Script {
    /// The given steps, then `Nothing` forever.
    pub(crate) fn steps(steps: Vec<Step>) -> Self {
        Self {
            steps: steps.into(),
            tail: Tail::Repeat(Step::Nothing),
        }
    }

    /// Repeat `step` once the listed steps run out.
    pub(crate) fn then(mut self, step: Step) -> Self {
        self.tail = Tail::Repeat(step);
        self
    }

    /// Fire the driver's stop signal once the listed steps run out.
    pub(crate) fn then_stop(mut self) -> Self {
        self.tail = Tail::Stop;
        self
    }

    pub(crate) fn valid_forever() -> Self {
        Self::steps(Vec::new()).then(Step::Valid)
    }

    pub(crate) fn invalid_forever() -> Self {
        Self::steps(Vec::new()).then(Step::Fail)
    }

    fn next(&mut self) -> Tail {
        match self.steps.pop_front() {
            Some(step) => Tail::Repeat(step),
            None => self.tail,
        }
    }
}

type ScriptFactory = Arc<dyn Fn() -> Script + Send + Sync>;

/// Driver whose connections replay scripts per backend.
///
/// Opening a backend without an accepted script fails.
pub(crate) struct FakeDriver {
    support: BuildSupport,
    scripts: Mutex<HashMap<Backend, ScriptFactory>>,
    opened: Mutex<Vec<Backend>>,
    released: Arc<AtomicUsize>,
    stop: Mutex<Option<StopSignal>>,
    stop_after_opens: Mutex<Option<usize>>,
}

impl Default for FakeDriver {
    fn default() -> Self {
        Self::with_support(BuildSupport {
            ffmpeg: false,
            gstreamer: false,
        })
    }
}

impl FakeDriver {
    pub(crate) fn with_support(support: BuildSupport) -> Self {
        Self {
            support,
            scripts: Mutex::new(HashMap::new()),
            opened: Mutex::new(Vec::new()),
            released: Arc::new(AtomicUsize::new(0)),
            stop: Mutex::new(None),
            stop_after_opens: Mutex::new(None),
        }
    }

    pub(crate) fn accept(&self, backend: Backend, factory: impl Fn() -> Script + Send + Sync + 'static) {
        self.scripts
            .lock()
            .unwrap()
            .insert(backend, Arc::new(factory));
    }

    /// Signal fired by `then_stop` scripts and `stop_after_opens`.
    pub(crate) fn attach_stop(&self, stop: StopSignal) {
        *self.stop.lock().unwrap() = Some(stop);
    }

    /// Fire the attached stop signal right after the `n`th open attempt.
    pub(crate) fn stop_after_opens(&self, n: usize) {
        *self.stop_after_opens.lock().unwrap() = Some(n);
    }

    /// Every open attempt, successful or not, in order.
    pub(crate) fn opened(&self) -> Vec<Backend> {
        self.opened.lock().unwrap().clone()
    }

    pub(crate) fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    fn stop_signal(&self) -> Option<StopSignal> {
        self.stop.lock().unwrap().clone()
    }
}

impl CaptureDriver for FakeDriver {
    fn build_support(&self) -> BuildSupport {
        self.support
    }

    fn open(&self, address: &str, backend: Backend) -> Result<Box<dyn Capture>> {
        let attempt = {
            let mut opened = self.opened.lock().unwrap();
            opened.push(backend);
            opened.len()
        };
        let factory = self.scripts.lock().unwrap().get(&backend).cloned();

        let result: Result<Box<dyn Capture>> = match factory {
            Some(factory) => Ok(Box::new(FakeCapture {
                script: factory(),
                released: self.released.clone(),
                stop: self.stop_signal(),
                is_released: false,
            })),
            None => Err(anyhow!("{} cannot open {}", backend, address)),
        };

        if *self.stop_after_opens.lock().unwrap() == Some(attempt) {
            if let Some(stop) = self.stop_signal() {
                stop.stop();
            }
        }
        result
    }
}

struct FakeCapture {
    script: Script,
    released: Arc<AtomicUsize>,
    stop: Option<StopSignal>,
    is_released: bool,
}

impl Capture for FakeCapture {
    fn read(&mut self) -> Result<Option<Frame>> {
        if self.is_released {
            return Ok(None);
        }
        match self.script.next() {
            Tail::Repeat(Step::Fail) => Err(anyhow!("scripted read failure")),
            Tail::Repeat(Step::Nothing) => Ok(None),
            Tail::Repeat(Step::Empty) => Ok(Some(Frame::empty())),
            Tail::Repeat(Step::Valid) => Ok(Some(gradient_frame(16, 12))),
            Tail::Repeat(Step::Panic) => panic!("scripted backend panic"),
            Tail::Repeat(Step::Stall) => {
                std::thread::sleep(Duration::from_millis(500));
                Ok(None)
            }
            Tail::Stop => {
                if let Some(stop) = &self.stop {
                    stop.stop();
                }
                Ok(None)
            }
        }
    }

    fn release(&mut self) {
        if !self.is_released {
            self.is_released = true;
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Recorder that keeps every transition in order.
#[derive(Default)]
pub(crate) struct RecordingRecorder {
    transitions: Mutex<Vec<(String, SourceState)>>,
}

impl RecordingRecorder {
    pub(crate) fn states(&self) -> Vec<SourceState> {
        self.transitions
            .lock()
            .unwrap()
            .iter()
            .map(|(_, state)| *state)
            .collect()
    }

    pub(crate) fn states_for(&self, source: &str) -> Vec<SourceState> {
        self.transitions
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == source)
            .map(|(_, state)| *state)
            .collect()
    }
}

impl StatusRecorder for RecordingRecorder {
    fn record_status(&self, source: &str, state: SourceState) -> Result<()> {
        self.transitions
            .lock()
            .unwrap()
            .push((source.to_string(), state));
        Ok(())
    }
}
