//! Decoder warning monitor.
//!
//! FFmpeg and GStreamer report concealment and bitstream corruption only as
//! free-form text on stderr. The monitor redirects the process stderr through
//! a pipe, forwards every byte to the original descriptor unchanged, and scans
//! each line for known corruption phrases.
//!
//! Attribution to a source, in order:
//! 1. a `[decoder @ 0x...]` pointer already mapped to a source
//! 2. a keyword match against the source's address (host, port, path); the
//!    pointer on that line is then remembered for later lines
//! 3. otherwise the event only updates the unattributed timestamp
//!
//! Redirection needs `pipe`/`dup2`; on other platforms `start` is a no-op and
//! every query answers "no warning".

use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

const WARNING_PATTERNS: &[&str] = &[
    "error while decoding",
    "cabac decode",
    "co located pocs unavailable",
    "concealing",
    "corrupt input",
    "corrupt macroblock",
    "error received from element",
];

fn pointer_regex() -> Option<&'static Regex> {
    static POINTER: OnceLock<Option<Regex>> = OnceLock::new();
    POINTER
        .get_or_init(|| Regex::new(r"\[[^\[]*?@\s*(0x[0-9a-fA-F]+)\]").ok())
        .as_ref()
}

/// Decoder instance pointer embedded in a libav-style log prefix, lowercased.
fn extract_pointer(line: &str) -> Option<String> {
    pointer_regex()?
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_lowercase())
}

fn is_warning(folded_line: &str) -> bool {
    WARNING_PATTERNS
        .iter()
        .any(|pattern| folded_line.contains(pattern))
}

/// Address-derived keywords: hostname, explicit port, path with and without
/// surrounding slashes.
pub fn keywords_for_address(address: &str) -> HashSet<String> {
    let mut keywords = HashSet::new();
    let Ok(parsed) = url::Url::parse(address) else {
        return keywords;
    };
    if let Some(host) = parsed.host_str() {
        keywords.insert(host.to_lowercase());
    }
    if let Some(port) = parsed.port() {
        keywords.insert(port.to_string());
    }
    let path = parsed.path();
    if !path.is_empty() && path != "/" {
        keywords.insert(path.to_lowercase());
        keywords.insert(path.trim_matches('/').to_lowercase());
    }
    keywords.retain(|word| !word.is_empty());
    keywords
}

#[derive(Default)]
struct MonitorState {
    last_warning_global: Option<Instant>,
    last_warning_by_source: HashMap<String, Instant>,
    pointers_by_source: HashMap<String, HashSet<String>>,
    source_by_pointer: HashMap<String, String>,
    /// Registration order; earlier sources win ties.
    keywords_by_source: Vec<(String, HashSet<String>)>,
}

impl MonitorState {
    fn purge_source(&mut self, source: &str) {
        if let Some(pointers) = self.pointers_by_source.remove(source) {
            for pointer in pointers {
                self.source_by_pointer.remove(&pointer);
            }
        }
        self.last_warning_by_source.remove(source);
    }

    fn forget_keywords(&mut self, source: &str) {
        self.keywords_by_source.retain(|(name, _)| name != source);
    }

    /// Source whose matching keywords cover the most characters of the line.
    fn source_for_line(&self, folded_line: &str) -> Option<String> {
        let mut best: Option<(&str, usize)> = None;
        for (source, keywords) in &self.keywords_by_source {
            let score: usize = keywords
                .iter()
                .filter(|kw| folded_line.contains(kw.as_str()))
                .map(|kw| kw.len())
                .sum();
            if score > 0 && best.map_or(true, |(_, top)| score > top) {
                best = Some((source.as_str(), score));
            }
        }
        best.map(|(source, _)| source.to_string())
    }
}

pub struct DecoderWarningMonitor {
    enabled: bool,
    active: AtomicBool,
    state: Mutex<MonitorState>,
}

impl DecoderWarningMonitor {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            active: AtomicBool::new(false),
            state: Mutex::new(MonitorState::default()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false)
    }

    fn state(&self) -> MutexGuard<'_, MonitorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Redirect stderr through the interceptor. Idempotent.
    ///
    /// Failure to redirect is logged and leaves the monitor inert.
    pub fn start(monitor: &Arc<Self>) {
        if !monitor.enabled {
            return;
        }
        if monitor.active.swap(true, Ordering::SeqCst) {
            return;
        }
        match intercept::redirect_stderr(monitor.clone()) {
            Ok(()) => log::debug!("decoder warning monitor started"),
            Err(err) => {
                monitor.active.store(false, Ordering::SeqCst);
                log::warn!("decoder warning monitor disabled: {}", err);
            }
        }
    }

    /// Scan one diagnostic line.
    pub(crate) fn handle_line(&self, raw_line: &str) {
        let line = raw_line.trim();
        if line.is_empty() {
            return;
        }
        let folded = line.to_lowercase();
        let pointer = extract_pointer(line);

        let mut state = self.state();
        let mapped = pointer
            .as_ref()
            .and_then(|p| state.source_by_pointer.get(p).cloned());
        let source = match mapped {
            Some(source) => Some(source),
            None => {
                let source = state.source_for_line(&folded);
                if let (Some(source), Some(pointer)) = (source.as_ref(), pointer) {
                    state
                        .source_by_pointer
                        .insert(pointer.clone(), source.clone());
                    state
                        .pointers_by_source
                        .entry(source.clone())
                        .or_default()
                        .insert(pointer);
                }
                source
            }
        };

        if !is_warning(&folded) {
            return;
        }
        let now = Instant::now();
        state.last_warning_global = Some(now);
        if let Some(source) = source {
            state.last_warning_by_source.insert(source, now);
        }
    }

    /// Track `address` keywords for `source`, dropping any state left from a
    /// previous registration of the same identifier.
    pub fn register_stream(&self, source: &str, address: &str) {
        if !self.enabled {
            return;
        }
        let keywords = keywords_for_address(address);
        let mut state = self.state();
        state.purge_source(source);
        state.forget_keywords(source);
        state.keywords_by_source.push((source.to_string(), keywords));
    }

    pub fn unregister_stream(&self, source: &str) {
        if !self.enabled {
            return;
        }
        let mut state = self.state();
        state.forget_keywords(source);
        state.purge_source(source);
    }

    pub fn had_recent_warning(&self, window: Duration) -> bool {
        if !self.enabled {
            return false;
        }
        self.state()
            .last_warning_global
            .is_some_and(|ts| ts.elapsed() <= window)
    }

    pub fn had_recent_warning_for_source(&self, source: &str, window: Duration) -> bool {
        if !self.enabled {
            return false;
        }
        self.state()
            .last_warning_by_source
            .get(source)
            .is_some_and(|ts| ts.elapsed() <= window)
    }

    /// Mark an unattributed warning now.
    pub fn record_warning(&self) {
        if !self.enabled {
            return;
        }
        self.state().last_warning_global = Some(Instant::now());
    }

    /// Mark a warning for `source` now.
    pub fn record_warning_for_source(&self, source: &str) {
        if !self.enabled {
            return;
        }
        let now = Instant::now();
        let mut state = self.state();
        state.last_warning_by_source.insert(source.to_string(), now);
        state.last_warning_global = Some(now);
    }
}

// ----------------------------------------------------------------------------
// stderr interception
// ----------------------------------------------------------------------------

#[cfg(unix)]
mod intercept {
    use std::fs::File;
    use std::io::{self, Read, Write};
    use std::os::unix::io::FromRawFd;
    use std::sync::Arc;

    use super::DecoderWarningMonitor;

    pub(super) fn redirect_stderr(monitor: Arc<DecoderWarningMonitor>) -> io::Result<()> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: fds is a valid two-element buffer.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let (pipe_r, pipe_w) = (fds[0], fds[1]);

        // SAFETY: plain descriptor duplication; every error path closes what it opened.
        let orig_stderr = unsafe { libc::dup(libc::STDERR_FILENO) };
        if orig_stderr < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(pipe_r);
                libc::close(pipe_w);
            }
            return Err(err);
        }
        if unsafe { libc::dup2(pipe_w, libc::STDERR_FILENO) } < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(pipe_r);
                libc::close(pipe_w);
                libc::close(orig_stderr);
            }
            return Err(err);
        }
        unsafe { libc::close(pipe_w) };

        // SAFETY: both descriptors are owned exclusively by the pump thread from here on.
        let reader = unsafe { File::from_raw_fd(pipe_r) };
        let original = unsafe { File::from_raw_fd(orig_stderr) };

        std::thread::Builder::new()
            .name("decoder-log".to_string())
            .spawn(move || pump(reader, original, &monitor))?;
        Ok(())
    }

    fn pump(mut reader: File, mut original: File, monitor: &DecoderWarningMonitor) {
        let mut chunk = [0u8; 4096];
        let mut pending: Vec<u8> = Vec::new();
        loop {
            let n = match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            };
            // Forwarding is best effort; scanning continues regardless.
            let _ = original.write_all(&chunk[..n]);
            pending.extend_from_slice(&chunk[..n]);
            drain_lines(&mut pending, monitor);
        }
        if !pending.is_empty() {
            monitor.handle_line(&String::from_utf8_lossy(&pending));
        }
    }

    pub(super) fn drain_lines(pending: &mut Vec<u8>, monitor: &DecoderWarningMonitor) {
        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            monitor.handle_line(&String::from_utf8_lossy(&line[..line.len() - 1]));
        }
    }
}

#[cfg(not(unix))]
mod intercept {
    use std::io;
    use std::sync::Arc;

    use super::DecoderWarningMonitor;

    pub(super) fn redirect_stderr(_monitor: Arc<DecoderWarningMonitor>) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "stderr redirection is not supported on this platform",
        ))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
