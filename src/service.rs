//! Process-scoped service composition.
//!
//! `SnapshotService` owns the registry, the frame cache, the backend selector
//! and the worker supervisor, and exposes the operations the HTTP layer maps
//! onto routes. Construct one per process and share it behind an `Arc`.

use anyhow::{Context, Result};
use rand::RngCore;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{FrameCache, SourceState};
use crate::ingest::{BuildSupport, CaptureDriver};
use crate::monitor::DecoderWarningMonitor;
use crate::select::{BackendOrder, BackendSelector};
use crate::storage::CameraStore;
use crate::supervisor::WorkerSupervisor;
use crate::worker::{WorkerContext, WorkerSettings};

const TOKEN_BYTES: usize = 16;

/// Tunables the service hands to the selector, supervisor and workers.
#[derive(Clone, Debug)]
pub struct ServiceOptions {
    pub worker: WorkerSettings,
    pub probe_timeout: Duration,
    pub backend_order: BackendOrder,
    pub stop_join_timeout: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            worker: WorkerSettings::default(),
            probe_timeout: Duration::from_secs(4),
            backend_order: BackendOrder::FfmpegFirst,
            stop_join_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Registration {
    pub token: String,
    pub backend: &'static str,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Unregistration {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusReport {
    pub token: String,
    pub status: SourceState,
    pub last_seen: Option<f64>,
    pub backend: &'static str,
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub ok: bool,
    pub backends_built: BuildSupport,
}

pub struct SnapshotService {
    store: Arc<CameraStore>,
    cache: Arc<FrameCache>,
    selector: Arc<BackendSelector>,
    supervisor: WorkerSupervisor,
}

impl SnapshotService {
    pub fn new(
        store: Arc<CameraStore>,
        driver: Arc<dyn CaptureDriver>,
        monitor: Arc<DecoderWarningMonitor>,
        options: ServiceOptions,
    ) -> Self {
        let cache = Arc::new(FrameCache::new());
        let selector = Arc::new(BackendSelector::new(
            driver,
            options.probe_timeout,
            options.backend_order,
        ));
        let ctx = Arc::new(WorkerContext {
            cache: cache.clone(),
            monitor,
            selector: selector.clone(),
            recorder: store.clone(),
            settings: options.worker,
        });
        let supervisor = WorkerSupervisor::new(ctx, options.stop_join_timeout);
        Self {
            store,
            cache,
            selector,
            supervisor,
        }
    }

    pub fn cache(&self) -> &Arc<FrameCache> {
        &self.cache
    }

    pub fn supervisor(&self) -> &WorkerSupervisor {
        &self.supervisor
    }

    pub fn store(&self) -> &Arc<CameraStore> {
        &self.store
    }

    /// Validate `rtsp_url`, persist it under a fresh token and start its worker.
    ///
    /// Selection failures are returned as `SelectError` inside the `anyhow`
    /// error so callers can tell rejections from internal failures.
    pub fn register(&self, rtsp_url: &str, prefer: Option<&str>) -> Result<Registration> {
        let selection = self.selector.select(rtsp_url, prefer)?;
        let token = self.fresh_token()?;

        self.cache
            .set_status(&token, SourceState::Connecting, None);
        self.store
            .add_camera(&token, rtsp_url, SourceState::Connecting)?;
        self.supervisor
            .start(&token, rtsp_url, Some(selection.backend), false)?;

        log::info!("{}: registered with backend {}", token, selection.label);
        Ok(Registration {
            token,
            backend: selection.label,
        })
    }

    fn fresh_token(&self) -> Result<String> {
        loop {
            let mut bytes = [0u8; TOKEN_BYTES];
            rand::thread_rng().fill_bytes(&mut bytes);
            let token = hex::encode(bytes);
            if self.store.get_camera(&token)?.is_none() {
                return Ok(token);
            }
        }
    }

    pub fn unregister(&self, token: &str) -> Result<Unregistration> {
        if self.store.get_camera(token)?.is_none() {
            return Ok(Unregistration {
                ok: true,
                message: Some("already removed".to_string()),
            });
        }

        self.supervisor
            .stop(token, self.supervisor.join_timeout());
        self.cache.clear(token);
        self.store.delete_camera(token)?;
        log::info!("{}: unregistered", token);
        Ok(Unregistration {
            ok: true,
            message: None,
        })
    }

    /// Latest JPEG for `token`; `None` while no frame has been cached.
    pub fn snapshot(&self, token: &str, quality: Option<u8>) -> Option<Arc<Vec<u8>>> {
        self.cache.get_encoded(token, quality)
    }

    /// Status projection, or `None` when the registry has no such token.
    pub fn status(&self, token: &str) -> Result<Option<StatusReport>> {
        if self.store.get_camera(token)?.is_none() {
            return Ok(None);
        }
        let record = self.cache.get_status(token);
        let backend = self
            .supervisor
            .backend_for(token)
            .unwrap_or_default()
            .label();
        Ok(Some(StatusReport {
            token: token.to_string(),
            status: record.state,
            last_seen: record.last_seen_epoch_s(),
            backend,
            error: record.error,
        }))
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            ok: true,
            backends_built: self.selector.driver().build_support(),
        }
    }

    /// Start a worker for every registered camera. Returns how many started.
    ///
    /// A camera whose backend cannot be detected still gets a worker in
    /// autodetect mode and is marked `error`.
    pub fn bootstrap(&self) -> Result<usize> {
        let cameras = self.store.list_cameras().context("list registered cameras")?;
        let mut started = 0;
        for camera in cameras {
            let result = match self.selector.select(&camera.rtsp_url, None) {
                Ok(selection) => {
                    log::info!("{}: startup backend {}", camera.token, selection.label);
                    self.supervisor
                        .start(&camera.token, &camera.rtsp_url, Some(selection.backend), false)
                }
                Err(err) => {
                    log::warn!(
                        "{}: startup backend detection failed, retrying in background: {}",
                        camera.token,
                        err
                    );
                    let outcome = self
                        .supervisor
                        .start(&camera.token, &camera.rtsp_url, None, true);
                    let message = err.to_string();
                    self.cache
                        .set_status(&camera.token, SourceState::Error, Some(message));
                    if let Err(err) = self.store.update_status(&camera.token, SourceState::Error) {
                        log::warn!("{}: failed to record status error: {:#}", camera.token, err);
                    }
                    outcome
                }
            };
            match result {
                Ok(()) => started += 1,
                Err(err) => log::error!("{}: could not start worker: {:#}", camera.token, err),
            }
        }
        Ok(started)
    }

    /// Stop every worker and drop all cached data.
    pub fn shutdown(&self) {
        self.supervisor.stop_all();
        self.cache.clear_all();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
