//! Worker Supervisor: the process-wide table of running source workers.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::cache::SourceState;
use crate::ingest::Backend;
use crate::worker::{BackendSlot, SourceWorker, StopSignal, WorkerContext};

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

struct WorkerHandle {
    stop: StopSignal,
    slot: Arc<BackendSlot>,
    join: JoinHandle<()>,
}

pub struct WorkerSupervisor {
    ctx: Arc<WorkerContext>,
    join_timeout: Duration,
    workers: Mutex<HashMap<String, WorkerHandle>>,
    /// Serializes start and stop so a restart cannot orphan a worker.
    lifecycle: Mutex<()>,
}

impl WorkerSupervisor {
    /// `join_timeout` bounds each join during `stop_all` and restarts.
    pub fn new(ctx: Arc<WorkerContext>, join_timeout: Duration) -> Self {
        Self {
            ctx,
            join_timeout,
            workers: Mutex::new(HashMap::new()),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn join_timeout(&self) -> Duration {
        self.join_timeout
    }

    pub fn context(&self) -> &Arc<WorkerContext> {
        &self.ctx
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<String, WorkerHandle>> {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lifecycle(&self) -> MutexGuard<'_, ()> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn a worker for `source`. A worker already running for the same
    /// source is stopped first.
    pub fn start(
        &self,
        source: &str,
        address: &str,
        backend: Option<Backend>,
        autodetect: bool,
    ) -> Result<()> {
        let _lifecycle = self.lifecycle();
        if self.is_running(source) {
            log::info!("{}: restarting worker", source);
            self.stop_locked(source, self.join_timeout);
        }

        let stop = StopSignal::new();
        let slot = Arc::new(BackendSlot::new(backend.unwrap_or_default(), autodetect));

        self.ctx
            .publish_status(source, SourceState::Connecting, None);
        self.ctx.monitor.register_stream(source, address);

        let worker = SourceWorker::new(source, address, self.ctx.clone(), slot.clone(), stop.clone());
        let join = std::thread::Builder::new()
            .name(format!("camera-{}", source))
            .spawn(move || worker.run())
            .with_context(|| format!("spawn worker for {}", source))?;

        log::info!(
            "{}: worker started (backend {}, autodetect {})",
            source,
            slot.backend(),
            autodetect
        );
        self.workers().insert(
            source.to_string(),
            WorkerHandle { stop, slot, join },
        );
        Ok(())
    }

    /// Signal `source` to stop and wait up to `join_timeout` for it.
    ///
    /// The handle is dropped and status set `inactive` either way. Returns
    /// true only if the worker thread finished in time; false also covers an
    /// unknown source.
    pub fn stop(&self, source: &str, join_timeout: Duration) -> bool {
        let _lifecycle = self.lifecycle();
        self.stop_locked(source, join_timeout)
    }

    fn stop_locked(&self, source: &str, join_timeout: Duration) -> bool {
        let handle = match self.workers().remove(source) {
            Some(handle) => handle,
            None => return false,
        };
        handle.stop.stop();
        self.finish(source, handle, Instant::now() + join_timeout)
    }

    /// Stop every tracked worker. All workers are signalled before any join.
    pub fn stop_all(&self) {
        let _lifecycle = self.lifecycle();
        let handles: Vec<(String, WorkerHandle)> = self.workers().drain().collect();
        if handles.is_empty() {
            return;
        }
        log::info!("stopping {} worker(s)", handles.len());
        for (_, handle) in &handles {
            handle.stop.stop();
        }
        let deadline = Instant::now() + self.join_timeout;
        for (source, handle) in handles {
            self.finish(&source, handle, deadline);
        }
    }

    fn finish(&self, source: &str, handle: WorkerHandle, deadline: Instant) -> bool {
        while !handle.join.is_finished() && Instant::now() < deadline {
            std::thread::sleep(JOIN_POLL_INTERVAL);
        }

        let joined = handle.join.is_finished();
        if joined {
            if handle.join.join().is_err() {
                log::warn!("{}: worker thread panicked during shutdown", source);
            }
        } else {
            log::warn!("{}: worker did not stop in time, detaching", source);
        }

        self.ctx
            .publish_status(source, SourceState::Inactive, None);
        self.ctx.monitor.unregister_stream(source);
        joined
    }

    /// Current backend choice of a running worker.
    pub fn backend_for(&self, source: &str) -> Option<Backend> {
        self.workers().get(source).map(|handle| handle.slot.backend())
    }

    pub fn is_running(&self, source: &str) -> bool {
        self.workers().contains_key(source)
    }

    pub fn sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = self.workers().keys().cloned().collect();
        sources.sort();
        sources
    }

    pub fn len(&self) -> usize {
        self.workers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
