use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::select::BackendOrder;
use crate::service::ServiceOptions;
use crate::worker::WorkerSettings;

const DEFAULT_DB_PATH: &str = "cameras.db";
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_API_ADDR: &str = "0.0.0.0:8000";
const DEFAULT_READ_THROTTLE_MS: u64 = 80;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 2000;
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 4000;
const DEFAULT_JPEG_QUALITY: u8 = 85;
const DEFAULT_MAX_FRAME_FAILURES: u32 = 5;
const DEFAULT_STOP_JOIN_TIMEOUT_MS: u64 = 2000;
const DEFAULT_DECODER_WINDOW_MS: u64 = 1000;

#[derive(Debug, Deserialize, Default)]
struct SnapshotConfigFile {
    db_path: Option<String>,
    log_level: Option<String>,
    api: Option<ApiConfigFile>,
    stream: Option<StreamConfigFile>,
    decoder_monitor: Option<DecoderMonitorConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    read_throttle_ms: Option<u64>,
    reconnect_delay_ms: Option<u64>,
    probe_timeout_ms: Option<u64>,
    ffmpeg_first: Option<bool>,
    jpeg_quality: Option<u8>,
    max_consecutive_failures: Option<u32>,
    stop_join_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DecoderMonitorConfigFile {
    enabled: Option<bool>,
    window_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    pub db_path: String,
    pub log_level: String,
    pub api_addr: String,
    pub stream: StreamSettings,
    pub decoder_monitor: DecoderMonitorSettings,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub read_throttle: Duration,
    pub reconnect_delay: Duration,
    pub probe_timeout: Duration,
    pub ffmpeg_first: bool,
    pub jpeg_quality: u8,
    pub max_consecutive_failures: u32,
    pub stop_join_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DecoderMonitorSettings {
    pub enabled: bool,
    pub window: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self::from_file(SnapshotConfigFile::default())
    }
}

impl SnapshotConfig {
    /// Load from `SNAPSHOT_CONFIG` (if set), then environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SNAPSHOT_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SnapshotConfigFile) -> Self {
        let stream = file.stream.unwrap_or_default();
        let monitor = file.decoder_monitor.unwrap_or_default();
        Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            log_level: file
                .log_level
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            api_addr: file
                .api
                .and_then(|api| api.addr)
                .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            stream: StreamSettings {
                read_throttle: Duration::from_millis(
                    stream.read_throttle_ms.unwrap_or(DEFAULT_READ_THROTTLE_MS),
                ),
                reconnect_delay: Duration::from_millis(
                    stream
                        .reconnect_delay_ms
                        .unwrap_or(DEFAULT_RECONNECT_DELAY_MS),
                ),
                probe_timeout: Duration::from_millis(
                    stream.probe_timeout_ms.unwrap_or(DEFAULT_PROBE_TIMEOUT_MS),
                ),
                ffmpeg_first: stream.ffmpeg_first.unwrap_or(true),
                jpeg_quality: stream.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
                max_consecutive_failures: stream
                    .max_consecutive_failures
                    .unwrap_or(DEFAULT_MAX_FRAME_FAILURES),
                stop_join_timeout: Duration::from_millis(
                    stream
                        .stop_join_timeout_ms
                        .unwrap_or(DEFAULT_STOP_JOIN_TIMEOUT_MS),
                ),
            },
            decoder_monitor: DecoderMonitorSettings {
                enabled: monitor.enabled.unwrap_or(true),
                window: Duration::from_millis(
                    monitor.window_ms.unwrap_or(DEFAULT_DECODER_WINDOW_MS),
                ),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_string("SNAPSHOT_DB_PATH") {
            self.db_path = path;
        }
        if let Some(level) = env_string("SNAPSHOT_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(addr) = env_string("SNAPSHOT_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(ms) = env_parsed::<u64>("SNAPSHOT_READ_THROTTLE_MS", "milliseconds")? {
            self.stream.read_throttle = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parsed::<u64>("SNAPSHOT_RECONNECT_DELAY_MS", "milliseconds")? {
            self.stream.reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parsed::<u64>("SNAPSHOT_PROBE_TIMEOUT_MS", "milliseconds")? {
            self.stream.probe_timeout = Duration::from_millis(ms);
        }
        if let Some(flag) = env_flag("SNAPSHOT_FFMPEG_FIRST")? {
            self.stream.ffmpeg_first = flag;
        }
        if let Some(quality) = env_parsed::<u8>("SNAPSHOT_JPEG_QUALITY", "quality")? {
            self.stream.jpeg_quality = quality;
        }
        if let Some(limit) = env_parsed::<u32>("SNAPSHOT_MAX_FRAME_FAILURES", "count")? {
            self.stream.max_consecutive_failures = limit;
        }
        if let Some(flag) = env_flag("SNAPSHOT_DECODER_MONITOR")? {
            self.decoder_monitor.enabled = flag;
        }
        if let Some(ms) = env_parsed::<u64>("SNAPSHOT_DECODER_WINDOW_MS", "milliseconds")? {
            self.decoder_monitor.window = Duration::from_millis(ms);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        if !(1..=100).contains(&self.stream.jpeg_quality) {
            return Err(anyhow!(
                "jpeg_quality must be between 1 and 100, got {}",
                self.stream.jpeg_quality
            ));
        }
        if self.stream.probe_timeout.is_zero() {
            return Err(anyhow!("probe_timeout_ms must be greater than zero"));
        }
        if self.stream.max_consecutive_failures == 0 {
            return Err(anyhow!("max_consecutive_failures must be greater than zero"));
        }
        Ok(())
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            read_throttle: self.stream.read_throttle,
            reconnect_delay: self.stream.reconnect_delay,
            jpeg_quality: self.stream.jpeg_quality,
            max_consecutive_failures: self.stream.max_consecutive_failures,
            corruption_window: self.decoder_monitor.window,
        }
    }

    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            worker: self.worker_settings(),
            probe_timeout: self.stream.probe_timeout,
            backend_order: BackendOrder::from_ffmpeg_first(self.stream.ffmpeg_first),
            stop_join_timeout: self.stream.stop_join_timeout,
        }
    }
}

fn read_config_file(path: &Path) -> Result<SnapshotConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str, unit: &str) -> Result<Option<T>> {
    match env_string(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be an integer {}, got '{}'", key, unit, raw)),
        None => Ok(None),
    }
}

fn env_flag(key: &str) -> Result<Option<bool>> {
    let Some(raw) = env_string(key) else {
        return Ok(None);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(anyhow!("{} must be a boolean, got '{}'", key, raw)),
    }
}
