use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::select::SelectError;
use crate::service::SnapshotService;

const MAX_HEAD_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8000".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    service: Arc<SnapshotService>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, service: Arc<SnapshotService>) -> Self {
        Self { cfg, service }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid api address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("bind api listener on {}", configured_addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let service = self.service;
        let join = std::thread::Builder::new()
            .name("snapshot-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, service, shutdown_thread) {
                    log::error!("snapshot api stopped: {}", err);
                }
            })?;

        log::info!("snapshot api listening on {}", addr);
        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    service: Arc<SnapshotService>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let service = service.clone();
                let spawned = std::thread::Builder::new()
                    .name("snapshot-api-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &service) {
                            log::warn!("snapshot api request from {} rejected: {}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::error!("snapshot api could not spawn handler: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    rtsp_url: String,
    prefer: Option<String>,
}

fn handle_connection(mut stream: TcpStream, service: &SnapshotService) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            write_error(&mut stream, 400, "bad_request")?;
            return Err(err);
        }
    };

    let segments: Vec<&str> = request
        .path
        .trim_matches('/')
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();

    match (request.method.as_str(), segments.as_slice()) {
        ("POST", ["register"]) => handle_register(&mut stream, service, &request.body),
        ("POST", ["unregister", token]) => match service.unregister(token) {
            Ok(response) => write_json(&mut stream, 200, &serde_json::to_vec(&response)?),
            Err(err) => {
                log::error!("unregister {} failed: {:#}", token, err);
                write_error(&mut stream, 500, "unregistration failed")
            }
        },
        ("GET", ["snapshot", token]) => {
            let raw_quality = request
                .query_param("quality")
                .or_else(|| request.query_param("q"));
            let quality = match raw_quality {
                None => None,
                Some(raw) => match parse_quality(raw) {
                    Some(quality) => Some(quality),
                    None => return write_error(&mut stream, 400, "quality must be 1-100"),
                },
            };
            match service.snapshot(token, quality) {
                Some(jpeg) => write_response(&mut stream, 200, "image/jpeg", &jpeg),
                None => write_error(&mut stream, 503, "No frame available yet"),
            }
        }
        ("GET", ["status", token]) => match service.status(token) {
            Ok(Some(report)) => write_json(&mut stream, 200, &serde_json::to_vec(&report)?),
            Ok(None) => write_error(&mut stream, 404, "invalid_token"),
            Err(err) => {
                log::error!("status {} failed: {:#}", token, err);
                write_error(&mut stream, 500, "status lookup failed")
            }
        },
        ("GET", ["health"]) => write_json(&mut stream, 200, &serde_json::to_vec(&service.health())?),
        (_, ["register"])
        | (_, ["unregister", _])
        | (_, ["snapshot", _])
        | (_, ["status", _])
        | (_, ["health"]) => write_error(&mut stream, 405, "method_not_allowed"),
        _ => write_error(&mut stream, 404, "not_found"),
    }
}

fn handle_register(stream: &mut TcpStream, service: &SnapshotService, body: &[u8]) -> Result<()> {
    let payload: RegisterRequest = match serde_json::from_slice(body) {
        Ok(payload) => payload,
        Err(err) => return write_error(stream, 400, &format!("invalid register body: {}", err)),
    };
    let rtsp_url = payload.rtsp_url.trim();
    if rtsp_url.is_empty() {
        return write_error(stream, 400, "rtsp_url must not be empty");
    }

    match service.register(rtsp_url, payload.prefer.as_deref()) {
        Ok(registration) => write_json(stream, 200, &serde_json::to_vec(&registration)?),
        Err(err) => match err.downcast_ref::<SelectError>() {
            Some(rejection) => write_error(stream, 400, &rejection.to_string()),
            None => {
                log::error!("register {} failed: {:#}", rtsp_url, err);
                write_error(stream, 500, "registration failed")
            }
        },
    }
}

fn parse_quality(raw: &str) -> Option<u8> {
    raw.parse::<u8>()
        .ok()
        .filter(|quality| (1..=100).contains(quality))
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let head_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEAD_BYTES {
            return Err(anyhow!("request head too large"));
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
    };
    if head_end > MAX_HEAD_BYTES {
        return Err(anyhow!("request head too large"));
    }

    let head = String::from_utf8_lossy(&data[..head_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length '{}'", value))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(anyhow!("request body too large"));
    }
    let mut body = data[head_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path.to_string(), Some(query.to_string())),
        None => (raw_path.to_string(), None),
    };
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        query,
        body,
    })
}

fn write_error(stream: &mut TcpStream, status: u16, message: &str) -> Result<()> {
    let body = serde_json::to_vec(&json!({ "error": message }))?;
    write_json(stream, status, &body)
}

fn write_json(stream: &mut TcpStream, status: u16, body: &[u8]) -> Result<()> {
    write_response(stream, status, "application/json", body)
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: Option<String>,
    body: Vec<u8>,
}

impl HttpRequest {
    fn query_param(&self, key: &str) -> Option<&str> {
        self.query
            .as_deref()?
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }
}
