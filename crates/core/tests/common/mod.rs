//! Shared fakes for core integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use mudband_common::{BandCreated, Error, Result, SessionState};
use mudband_core::control::{ConfigFetch, ConfigRequest, ControlPlane, EnrollRequest};
use mudband_core::{
    Core, CoreConfig, LocalCorePort, PermissionRequest, TunnelEngine, VpnPlatform,
};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

pub const BAND: &str = "0b0a3721-7dc0-4391-969d-b3b0d1e00925";
pub const OTHER: &str = "6f1c2a7e-9d4b-4f0e-8a11-2c3d4e5f6a7b";

// ============================================================================
// Control plane
// ============================================================================

/// Scripted control plane reply
#[derive(Clone)]
pub enum Reply<T> {
    Ok(T),
    Protocol(i64, &'static str),
    Network,
}

impl<T: Clone> Reply<T> {
    fn result(&self) -> Result<T> {
        match self {
            Reply::Ok(value) => Ok(value.clone()),
            Reply::Protocol(status, message) => Err(Error::Protocol {
                status: *status,
                message: message.to_string(),
            }),
            Reply::Network => Err(Error::Network("connection refused".into())),
        }
    }
}

pub struct FakeControl {
    pub create: Mutex<Reply<BandCreated>>,
    pub token: Mutex<Reply<String>>,
    pub enroll: Mutex<Reply<String>>,
    pub unenroll: Mutex<Reply<String>>,
    pub config: Mutex<Reply<ConfigFetch>>,
    pub calls: Mutex<Vec<&'static str>>,
    pub last_enroll: Mutex<Option<EnrollRequest>>,
    pub config_tokens: Mutex<Vec<Option<String>>>,
    pub unenroll_credentials: Mutex<Vec<String>>,
    /// When set, `unenroll` waits for a notification before replying.
    pub unenroll_gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeControl {
    pub fn new() -> Self {
        Self {
            create: Mutex::new(Reply::Ok(BandCreated {
                band_uuid: BAND.into(),
                admin_token: "admin-jwt".into(),
            })),
            token: Mutex::new(Reply::Ok("enroll-token".into())),
            enroll: Mutex::new(Reply::Ok(enroll_body(BAND, "home"))),
            unenroll: Mutex::new(Reply::Ok(json!({"status": 200}).to_string())),
            config: Mutex::new(Reply::Ok(config_fetch("v1", default_peers()))),
            calls: Mutex::new(Vec::new()),
            last_enroll: Mutex::new(None),
            config_tokens: Mutex::new(Vec::new()),
            unenroll_credentials: Mutex::new(Vec::new()),
            unenroll_gate: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().iter().filter(|c| **c == call).count()
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl ControlPlane for FakeControl {
    async fn create_anonymous_band(&self, _name: &str, _description: &str) -> Result<BandCreated> {
        self.record("create_band");
        self.create.lock().result()
    }

    async fn create_enrollment_token(&self, admin_token: &str) -> Result<String> {
        self.record("create_token");
        assert_eq!(admin_token, "admin-jwt");
        self.token.lock().result()
    }

    async fn enroll(&self, request: &EnrollRequest) -> Result<String> {
        self.record("enroll");
        *self.last_enroll.lock() = Some(request.clone());
        self.enroll.lock().result()
    }

    async fn unenroll(&self, credential: &str) -> Result<String> {
        self.record("unenroll");
        self.unenroll_credentials.lock().push(credential.to_string());
        let gate = self.unenroll_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.unenroll.lock().result()
    }

    async fn fetch_config(
        &self,
        _credential: &str,
        validation_token: Option<&str>,
        _request: &ConfigRequest,
    ) -> Result<ConfigFetch> {
        self.record("fetch_config");
        self.config_tokens
            .lock()
            .push(validation_token.map(str::to_string));
        self.config.lock().result()
    }
}

pub fn enroll_body(uuid: &str, name: &str) -> String {
    json!({
        "status": 200,
        "band": {"uuid": uuid, "name": name, "jwt": format!("jwt-{}", name), "opt_public": false}
    })
    .to_string()
}

pub fn default_peers() -> serde_json::Value {
    json!([{"name": "dev1", "private_ip": "100.64.0.2", "wireguard_pubkey": "pk1"}])
}

pub fn config_fetch(token: &str, peers: serde_json::Value) -> ConfigFetch {
    ConfigFetch::Fetched {
        validation_token: Some(token.to_string()),
        body: json!({
            "status": 200,
            "conf": {
                "interface": {"nat_type": 0, "listen_port": 51820, "name": "laptop", "private_ip": "100.64.0.1"},
                "peers": peers,
                "links": [{"name": "wiki", "url": "https://wiki.example"}]
            }
        })
        .to_string(),
    }
}

// ============================================================================
// Platform and engine
// ============================================================================

pub struct FakePlatform {
    pub permission: Mutex<PermissionRequest>,
    pub service_running: AtomicBool,
    pub establish_fails: AtomicBool,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self {
            permission: Mutex::new(PermissionRequest::Granted),
            service_running: AtomicBool::new(true),
            establish_fails: AtomicBool::new(false),
        }
    }
}

impl VpnPlatform for FakePlatform {
    fn request_permission(&self) -> PermissionRequest {
        *self.permission.lock()
    }

    fn establish(&self) -> Result<i32> {
        if self.establish_fails.load(Ordering::SeqCst) {
            Err(Error::Tunnel("no tun device".into()))
        } else {
            Ok(42)
        }
    }

    fn is_service_running(&self) -> bool {
        self.service_running.load(Ordering::SeqCst)
    }
}

pub struct FakeEngine {
    pub init_code: Mutex<i32>,
    /// Codes returned by successive loop iterations before idling.
    pub script: Mutex<VecDeque<i32>>,
    pub stopped: AtomicBool,
    pub fini_calls: AtomicUsize,
    /// Threads currently inside `run_once`.
    pub looping: AtomicUsize,
    /// Set when `init` ran while another thread was still looping.
    pub overlapped: AtomicBool,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            init_code: Mutex::new(0),
            script: Mutex::new(VecDeque::new()),
            stopped: AtomicBool::new(false),
            fini_calls: AtomicUsize::new(0),
            looping: AtomicUsize::new(0),
            overlapped: AtomicBool::new(false),
        }
    }
}

impl FakeEngine {
    fn step(&self) -> i32 {
        if self.stopped.load(Ordering::SeqCst) {
            return 101;
        }
        if let Some(code) = self.script.lock().pop_front() {
            return code;
        }
        std::thread::sleep(Duration::from_millis(20));
        0
    }
}

impl TunnelEngine for FakeEngine {
    fn init(&self, _fd: i32, _config: &str) -> i32 {
        if self.looping.load(Ordering::SeqCst) > 0 {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        self.stopped.store(false, Ordering::SeqCst);
        *self.init_code.lock()
    }

    fn run_once(&self) -> i32 {
        self.looping.fetch_add(1, Ordering::SeqCst);
        let code = self.step();
        self.looping.fetch_sub(1, Ordering::SeqCst);
        code
    }

    fn fini(&self) {
        self.fini_calls.fetch_add(1, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub dir: TempDir,
    pub control: Arc<FakeControl>,
    pub platform: Arc<FakePlatform>,
    pub engine: Arc<FakeEngine>,
    pub core: Core,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = CoreConfig::default();
        config.root_dir = dir.path().to_path_buf();

        let control = Arc::new(FakeControl::new());
        let platform = Arc::new(FakePlatform::new());
        let engine = Arc::new(FakeEngine::new());
        let port = Arc::new(LocalCorePort::new(&config).with_engine(engine.clone()));

        let core = Core::open(config, port, control.clone(), platform.clone())
            .await
            .unwrap();

        Self {
            dir,
            control,
            platform,
            engine,
            core,
        }
    }

    /// Harness with the default band already joined.
    pub async fn enrolled() -> Self {
        let harness = Self::new().await;
        harness
            .core
            .join_band("enroll-token", "laptop", None)
            .await
            .unwrap();
        harness
    }

    pub fn write_status(&self, value: serde_json::Value) {
        std::fs::write(
            self.dir.path().join("status_snapshot.json"),
            value.to_string(),
        )
        .unwrap();
    }

    /// Wait until the session reaches a state matching `pred`.
    pub async fn wait_for(&self, pred: impl Fn(&SessionState) -> bool) -> SessionState {
        for _ in 0..200 {
            let state = self.core.session().state();
            if pred(&state) {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session stuck in {}", self.core.session().state());
    }
}

impl Drop for Harness {
    // Runtime shutdown waits for blocking tasks; make sure no loop outlives a test.
    fn drop(&mut self) {
        self.engine.fini();
    }
}

/// Poll `pred` until it holds, failing the test after two seconds.
pub async fn eventually(what: &str, pred: impl Fn() -> bool) {
    for _ in 0..200 {
        if pred() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
