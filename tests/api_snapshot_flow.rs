use anyhow::Result;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::tempdir;

use rtsp_snapshot::api::{ApiConfig, ApiHandle, ApiServer};
use rtsp_snapshot::{
    BuildSupport, CameraStore, DecoderWarningMonitor, MediaDriver, ServiceOptions,
    SnapshotService, SourceState, WorkerSettings,
};

struct Response {
    status: u16,
    headers: String,
    body: Vec<u8>,
}

impl Response {
    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("json body")
    }
}

fn send(addr: SocketAddr, method: &str, path: &str, body: Option<&str>) -> Result<Response> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    let body = body.unwrap_or("");
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {len}\r\n\r\n{body}",
        method = method,
        path = path,
        len = body.len(),
        body = body
    );
    stream.write_all(request.as_bytes())?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw)?;
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response head");
    let headers = String::from_utf8_lossy(&raw[..split]).to_string();
    let status = headers
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("status code");
    Ok(Response {
        status,
        headers,
        body: raw[split + 4..].to_vec(),
    })
}

fn expected_backend() -> &'static str {
    let support = BuildSupport::compiled();
    if support.ffmpeg {
        "ffmpeg"
    } else if support.gstreamer {
        "gstreamer"
    } else {
        "default"
    }
}

struct TestApi {
    _dir: tempfile::TempDir,
    db_path: std::path::PathBuf,
    service: Arc<SnapshotService>,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new() -> Result<Self> {
        let dir = tempdir()?;
        let db_path = dir.path().join("cameras.db");
        let store = Arc::new(CameraStore::open(&db_path.to_string_lossy())?);
        let options = ServiceOptions {
            worker: WorkerSettings {
                read_throttle: Duration::from_millis(10),
                reconnect_delay: Duration::from_millis(50),
                ..WorkerSettings::default()
            },
            probe_timeout: Duration::from_millis(500),
            ..ServiceOptions::default()
        };
        let service = Arc::new(SnapshotService::new(
            store,
            Arc::new(MediaDriver::new()),
            Arc::new(DecoderWarningMonitor::disabled()),
            options,
        ));
        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
        };
        let api_handle = ApiServer::new(api_config, service.clone()).spawn()?;
        Ok(Self {
            _dir: dir,
            db_path,
            service,
            api_handle: Some(api_handle),
        })
    }

    fn addr(&self) -> SocketAddr {
        self.api_handle.as_ref().expect("api handle").addr
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            let _ = handle.stop();
        }
        self.service.shutdown();
    }
}

fn wait_for_snapshot(addr: SocketAddr, token: &str) -> Result<Response> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let response = send(addr, "GET", &format!("/snapshot/{}", token), None)?;
        if response.status == 200 || Instant::now() >= deadline {
            return Ok(response);
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn register_snapshot_status_unregister() -> Result<()> {
    let api = TestApi::new()?;
    let addr = api.addr();

    let response = send(
        addr,
        "POST",
        "/register",
        Some(r#"{"rtsp_url": "stub://front_door"}"#),
    )?;
    assert_eq!(response.status, 200);
    let payload = response.json();
    let token = payload["token"].as_str().expect("token").to_string();
    assert_eq!(token.len(), 32);
    assert_eq!(payload["backend"], expected_backend());

    let snapshot = wait_for_snapshot(addr, &token)?;
    assert_eq!(snapshot.status, 200);
    assert!(snapshot.headers.contains("Content-Type: image/jpeg"));
    assert_eq!(&snapshot.body[..2], &[0xFF, 0xD8]);

    let low = send(addr, "GET", &format!("/snapshot/{}?quality=10", token), None)?;
    assert_eq!(low.status, 200);
    assert!(low.body.len() < snapshot.body.len());

    let short = send(addr, "GET", &format!("/snapshot/{}?q=10", token), None)?;
    assert_eq!(short.status, 200);
    assert!(short.body.len() < snapshot.body.len());

    let status = send(addr, "GET", &format!("/status/{}", token), None)?;
    assert_eq!(status.status, 200);
    let status = status.json();
    assert_eq!(status["token"], token.as_str());
    assert_eq!(status["status"], "active");
    assert!(status["last_seen"].as_f64().is_some());
    assert_eq!(status["backend"], expected_backend());
    assert!(status["error"].is_null());

    let response = send(addr, "POST", &format!("/unregister/{}", token), None)?;
    assert_eq!(response.status, 200);
    assert_eq!(response.json(), serde_json::json!({ "ok": true }));

    let status = send(addr, "GET", &format!("/status/{}", token), None)?;
    assert_eq!(status.status, 404);
    assert_eq!(status.json()["error"], "invalid_token");

    let again = send(addr, "POST", &format!("/unregister/{}", token), None)?;
    assert_eq!(
        again.json(),
        serde_json::json!({ "ok": true, "message": "already removed" })
    );
    Ok(())
}

#[test]
fn register_rejects_unknown_preference() -> Result<()> {
    let api = TestApi::new()?;
    let response = send(
        api.addr(),
        "POST",
        "/register",
        Some(r#"{"rtsp_url": "stub://front_door", "prefer": "vlc"}"#),
    )?;
    assert_eq!(response.status, 400);
    let error = response.json()["error"].as_str().unwrap_or("").to_string();
    assert!(error.contains("vlc"), "{}", error);
    assert!(api.service.supervisor().is_empty());
    assert!(api.service.store().list_cameras()?.is_empty());
    Ok(())
}

#[test]
fn register_treats_blank_preference_as_autodetect() -> Result<()> {
    let api = TestApi::new()?;
    let response = send(
        api.addr(),
        "POST",
        "/register",
        Some(r#"{"rtsp_url": "stub://porch", "prefer": ""}"#),
    )?;
    assert_eq!(response.status, 200);
    assert_eq!(response.json()["backend"], expected_backend());
    Ok(())
}

#[test]
fn registry_failure_returns_500() -> Result<()> {
    let api = TestApi::new()?;
    rusqlite::Connection::open(&api.db_path)?.execute_batch("DROP TABLE cameras;")?;

    let status = send(api.addr(), "GET", "/status/abc", None)?;
    assert_eq!(status.status, 500);
    assert_eq!(status.json()["error"], "status lookup failed");

    let unregister = send(api.addr(), "POST", "/unregister/abc", None)?;
    assert_eq!(unregister.status, 500);
    assert_eq!(unregister.json()["error"], "unregistration failed");
    Ok(())
}

#[test]
fn register_rejects_malformed_body() -> Result<()> {
    let api = TestApi::new()?;
    let response = send(api.addr(), "POST", "/register", Some(r#"{"url": 1}"#))?;
    assert_eq!(response.status, 400);

    let response = send(api.addr(), "POST", "/register", Some(r#"{"rtsp_url": "  "}"#))?;
    assert_eq!(response.status, 400);
    Ok(())
}

#[test]
fn snapshot_before_first_frame_is_unavailable() -> Result<()> {
    let api = TestApi::new()?;
    api.service
        .store()
        .add_camera("pending", "stub://pending", SourceState::Inactive)?;

    let response = send(api.addr(), "GET", "/snapshot/pending", None)?;
    assert_eq!(response.status, 503);
    Ok(())
}

#[test]
fn snapshot_rejects_bad_quality() -> Result<()> {
    let api = TestApi::new()?;
    for query in ["quality=0", "quality=101", "quality=best", "q=0"] {
        let response = send(api.addr(), "GET", &format!("/snapshot/abc?{}", query), None)?;
        assert_eq!(response.status, 400, "{}", query);
    }
    Ok(())
}

#[test]
fn health_reports_compiled_backends() -> Result<()> {
    let api = TestApi::new()?;
    let response = send(api.addr(), "GET", "/health", None)?;
    assert_eq!(response.status, 200);
    let payload = response.json();
    let support = BuildSupport::compiled();
    assert_eq!(payload["ok"], true);
    assert_eq!(payload["backends_built"]["ffmpeg"], support.ffmpeg);
    assert_eq!(payload["backends_built"]["gstreamer"], support.gstreamer);
    Ok(())
}

#[test]
fn unknown_routes_and_methods() -> Result<()> {
    let api = TestApi::new()?;
    assert_eq!(send(api.addr(), "GET", "/nope", None)?.status, 404);
    assert_eq!(send(api.addr(), "DELETE", "/health", None)?.status, 405);
    assert_eq!(send(api.addr(), "GET", "/register", None)?.status, 405);
    Ok(())
}

#[test]
fn bootstrap_restores_registered_cameras() -> Result<()> {
    let api = TestApi::new()?;
    api.service
        .store()
        .add_camera("restored", "stub://garage", SourceState::Active)?;

    assert_eq!(api.service.bootstrap()?, 1);
    let snapshot = wait_for_snapshot(api.addr(), "restored")?;
    assert_eq!(snapshot.status, 200);
    Ok(())
}
