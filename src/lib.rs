//! RTSP snapshot service
//!
//! Exposes live network video streams as periodically refreshed JPEG stills
//! over HTTP, tolerating flaky sources, backend incompatibilities and silent
//! decoder corruption.
//!
//! # Architecture
//!
//! One worker thread per registered source opens the stream through a decode
//! backend, validates every frame, reconnects with backoff, and publishes the
//! latest good frame into a shared cache. The HTTP layer only reads from that
//! cache.
//!
//! # Module Structure
//!
//! - `ingest`: decode backends (FFmpeg, GStreamer, synthetic `stub://`)
//! - `select`: backend probing and autodetection
//! - `cache`: latest frame, its JPEG and per-source status
//! - `monitor`: decoder warning interception and attribution
//! - `worker` / `supervisor`: per-source state machine and its thread table
//! - `storage`: SQLite camera registry
//! - `service`: process-scoped composition used by `api` and `snapshotd`

pub mod api;
pub mod cache;
pub mod config;
pub mod frame;
pub mod ingest;
pub mod monitor;
pub mod select;
pub mod service;
pub mod storage;
pub mod supervisor;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{FrameCache, SourceState, StatusRecord};
pub use config::SnapshotConfig;
pub use frame::{encode_jpeg, Frame};
pub use ingest::{Backend, BuildSupport, Capture, CaptureDriver, MediaDriver};
pub use monitor::DecoderWarningMonitor;
pub use select::{BackendOrder, BackendSelector, OpenFailure, SelectError, Selection};
pub use service::{ServiceOptions, SnapshotService};
pub use storage::{Camera, CameraStore, StatusRecorder};
pub use supervisor::WorkerSupervisor;
pub use worker::{StopSignal, WorkerContext, WorkerSettings};
