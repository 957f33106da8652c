//! In-memory runtime caches shared by workers and the read path.
//!
//! Two independently locked stores:
//! - frame store: latest raw frame, its default-quality JPEG, the quality used,
//!   and the last-seen time, replaced together under one lock
//! - status store: lifecycle state and last error per source
//!
//! Re-encoding at a non-default quality happens outside both locks.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::frame::{encode_jpeg, Frame};

/// Lifecycle state reported for a source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceState {
    #[default]
    Unknown,
    Connecting,
    Active,
    Error,
    Inactive,
}

impl SourceState {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceState::Unknown => "unknown",
            SourceState::Connecting => "connecting",
            SourceState::Active => "active",
            SourceState::Error => "error",
            SourceState::Inactive => "inactive",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "connecting" => SourceState::Connecting,
            "active" => SourceState::Active,
            "error" => SourceState::Error,
            "inactive" => SourceState::Inactive,
            _ => SourceState::Unknown,
        }
    }
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status projection for one source.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StatusRecord {
    pub state: SourceState,
    pub error: Option<String>,
    /// Set only once a valid frame has been cached.
    pub last_seen: Option<SystemTime>,
}

impl StatusRecord {
    pub fn last_seen_epoch_s(&self) -> Option<f64> {
        self.last_seen
            .and_then(|ts| ts.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs_f64())
    }
}

struct CacheEntry {
    frame: Arc<Frame>,
    jpeg: Arc<Vec<u8>>,
    quality: u8,
    last_seen: SystemTime,
}

#[derive(Default)]
struct StatusEntry {
    state: SourceState,
    error: Option<String>,
}

#[derive(Default)]
pub struct FrameCache {
    frames: Mutex<HashMap<String, CacheEntry>>,
    statuses: Mutex<HashMap<String, StatusEntry>>,
}

// A panic while holding a cache lock leaves the maps structurally valid.
fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl FrameCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode `frame` at `quality` and publish it as the latest snapshot.
    ///
    /// On encode failure the previous entry stays visible. Returns whether the
    /// entry was replaced.
    pub fn store_frame(&self, source: &str, frame: Frame, quality: u8) -> bool {
        let jpeg = match encode_jpeg(&frame, quality) {
            Ok(jpeg) => jpeg,
            Err(err) => {
                log::debug!("{}: keeping previous snapshot, encode failed: {:#}", source, err);
                return false;
            }
        };
        let entry = CacheEntry {
            frame: Arc::new(frame),
            jpeg: Arc::new(jpeg),
            quality,
            last_seen: SystemTime::now(),
        };
        relock(&self.frames).insert(source.to_string(), entry);
        true
    }

    /// Cached JPEG bytes, re-encoded on demand when `quality` differs from the
    /// stored default.
    pub fn get_encoded(&self, source: &str, quality: Option<u8>) -> Option<Arc<Vec<u8>>> {
        let (frame, jpeg, cached_quality) = {
            let frames = relock(&self.frames);
            let entry = frames.get(source)?;
            (entry.frame.clone(), entry.jpeg.clone(), entry.quality)
        };

        match quality {
            None => Some(jpeg),
            Some(q) if q == cached_quality => Some(jpeg),
            Some(q) => match encode_jpeg(&frame, q) {
                Ok(bytes) => Some(Arc::new(bytes)),
                Err(err) => {
                    log::debug!("{}: re-encode at quality {} failed: {:#}", source, q, err);
                    None
                }
            },
        }
    }

    pub fn set_status(&self, source: &str, state: SourceState, error: Option<String>) {
        relock(&self.statuses).insert(source.to_string(), StatusEntry { state, error });
    }

    pub fn get_status(&self, source: &str) -> StatusRecord {
        let last_seen = relock(&self.frames)
            .get(source)
            .map(|entry| entry.last_seen);
        let statuses = relock(&self.statuses);
        let (state, error) = statuses
            .get(source)
            .map(|entry| (entry.state, entry.error.clone()))
            .unwrap_or_default();
        StatusRecord {
            state,
            error,
            last_seen,
        }
    }

    /// Remove all cached data for one source. Safe to call repeatedly.
    pub fn clear(&self, source: &str) {
        relock(&self.frames).remove(source);
        relock(&self.statuses).remove(source);
    }

    pub fn clear_all(&self) {
        relock(&self.frames).clear();
        relock(&self.statuses).clear();
    }

    pub fn len(&self) -> usize {
        relock(&self.frames).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
