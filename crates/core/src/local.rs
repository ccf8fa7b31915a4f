//! File-backed native core port
//!
//! Reference [`NativeCorePort`] adapter for desktop hosts. Enrollment state
//! lives under the configured root:
//!
//! ```text
//! <root>/mudband.conf              {"default_band_uuid": ...}
//! <root>/enroll/band_<uuid>.json   band object plus wireguard_privkey
//! <root>/enroll/conf_<uuid>.json   last applied config document plus etag
//! <root>/admin/admin_<uuid>.json   {"band_uuid", "jwt"}
//! <root>/status_snapshot.json      telemetry written by the tunnel engine
//! ```
//!
//! Packet processing is delegated to an optional [`TunnelEngine`].

use crate::config::CoreConfig;
use crate::port::NativeCorePort;
use mudband_common::WireguardKeys;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Interface addresses reported to the control plane are capped at this count.
pub const MAX_IF_ADDRS: usize = 16;

pub const CODE_OK: i32 = 0;
pub const CODE_IO: i32 = -1;
pub const CODE_MALFORMED: i32 = -2;
pub const CODE_STATUS: i32 = -3;
pub const CODE_NO_BAND: i32 = -4;

/// Abort code returned by `tunnel_loop` when no engine is attached.
const CODE_LOOP_ABORT: i32 = 101;

/// Control plane statuses that still let an unenroll proceed locally.
const UNENROLL_FORCE_STATUSES: [i64; 2] = [505, 506];

/// WireGuard packet engine driven by the port's tunnel operations.
pub trait TunnelEngine: Send + Sync {
    /// Bring up the engine on `fd`. `config` is the active config document
    /// with the band's `wireguard_privkey` added at the top level.
    fn init(&self, fd: i32, config: &str) -> i32;

    /// Run one iteration; same code convention as `tunnel_loop`.
    fn run_once(&self) -> i32;

    /// Ask a running loop to exit.
    fn fini(&self);

    /// Apply a newly stored config document to a running engine.
    fn reload(&self, _config: &str) -> i32 {
        0
    }

    fn nat_type(&self) -> i32 {
        0
    }

    fn mapped_addr(&self) -> Option<String> {
        None
    }
}

// ============================================================================
// On-disk documents
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BandFile {
    uuid: String,
    name: String,
    jwt: String,
    #[serde(default)]
    opt_public: bool,
    #[serde(default)]
    wireguard_privkey: String,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProgConf {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    default_band_uuid: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AdminFile {
    band_uuid: String,
    jwt: String,
}

#[derive(Deserialize)]
struct EnrollEnvelope {
    status: i64,
    #[serde(default)]
    band: Option<BandFile>,
}

#[derive(Deserialize)]
struct ConfEnvelope {
    status: i64,
    #[serde(default)]
    conf: Option<Value>,
}

#[derive(Deserialize)]
struct StatusOnly {
    status: i64,
}

// ============================================================================
// Port
// ============================================================================

/// File-backed port
pub struct LocalCorePort {
    root: RwLock<PathBuf>,
    default_band: RwLock<Option<String>>,
    listen_port: u16,
    if_addrs: Vec<String>,
    engine: Option<Arc<dyn TunnelEngine>>,
}

impl LocalCorePort {
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            root: RwLock::new(config.root_dir.clone()),
            default_band: RwLock::new(None),
            listen_port: config.tunnel.listen_port,
            if_addrs: config.tunnel.if_addrs.clone(),
            engine: None,
        }
    }

    /// Attach a packet engine for the tunnel operations.
    pub fn with_engine(mut self, engine: Arc<dyn TunnelEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    fn root(&self) -> PathBuf {
        self.root.read().clone()
    }

    fn enroll_dir(&self) -> PathBuf {
        self.root().join("enroll")
    }

    fn band_path(&self, uuid: &str) -> PathBuf {
        self.enroll_dir().join(format!("band_{}.json", uuid))
    }

    fn conf_path(&self, uuid: &str) -> PathBuf {
        self.enroll_dir().join(format!("conf_{}.json", uuid))
    }

    fn admin_path(&self, uuid: &str) -> PathBuf {
        self.root().join("admin").join(format!("admin_{}.json", uuid))
    }

    fn progconf_path(&self) -> PathBuf {
        self.root().join("mudband.conf")
    }

    fn set_default(&self, uuid: Option<&str>) -> std::io::Result<()> {
        let conf = ProgConf {
            default_band_uuid: uuid.map(str::to_string),
        };
        write_json(&self.progconf_path(), &conf)?;
        *self.default_band.write() = conf.default_band_uuid;
        Ok(())
    }

    fn active_band(&self) -> Option<BandFile> {
        let uuid = self.active_band_uuid()?;
        read_json(&self.band_path(&uuid))
    }

    fn active_conf(&self) -> Option<Value> {
        let uuid = self.active_band_uuid()?;
        read_json(&self.conf_path(&uuid))
    }

    /// Active config plus the band's private key, as handed to the engine.
    fn engine_document(&self) -> Option<String> {
        let band = self.active_band()?;
        let mut conf = match self.active_conf()? {
            Value::Object(conf) => conf,
            _ => return None,
        };
        conf.insert(
            "wireguard_privkey".to_string(),
            Value::String(band.wireguard_privkey),
        );
        serde_json::to_string(&Value::Object(conf)).ok()
    }

    fn active_interface_field(&self, field: &str) -> Option<String> {
        self.active_conf()?
            .get("interface")?
            .get(field)?
            .as_str()
            .map(str::to_string)
    }
}

impl NativeCorePort for LocalCorePort {
    fn init(&self, root_dir: &Path) -> i32 {
        *self.root.write() = root_dir.to_path_buf();

        for dir in [self.enroll_dir(), self.root().join("admin")] {
            if let Err(e) = std::fs::create_dir_all(&dir) {
                warn!("Failed to create {}: {}", dir.display(), e);
                return CODE_IO;
            }
        }

        let progconf: ProgConf = read_json(&self.progconf_path()).unwrap_or_default();
        let default = match progconf.default_band_uuid {
            Some(uuid) if self.band_path(&uuid).exists() => Some(uuid),
            _ => self.band_uuids().into_iter().next(),
        };

        if let Some(uuid) = &default {
            debug!(band_uuid = %uuid, "Default band selected");
            if let Err(e) = self.set_default(Some(uuid)) {
                warn!("Failed to persist default band: {}", e);
                return CODE_IO;
            }
        } else {
            *self.default_band.write() = None;
        }

        CODE_OK
    }

    fn is_enrolled(&self) -> bool {
        self.active_band().is_some()
    }

    fn is_band_public(&self) -> bool {
        self.active_band().map_or(false, |band| band.opt_public)
    }

    fn band_uuids(&self) -> Vec<String> {
        let entries = match std::fs::read_dir(self.enroll_dir()) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut uuids: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter_map(|name| {
                name.strip_prefix("band_")
                    .and_then(|rest| rest.strip_suffix(".json"))
                    .filter(|uuid| valid_uuid(uuid))
                    .map(str::to_string)
            })
            .collect();
        uuids.sort();
        uuids
    }

    fn band_name_by_uuid(&self, uuid: &str) -> Option<String> {
        if !valid_uuid(uuid) {
            return None;
        }
        read_json::<BandFile>(&self.band_path(uuid)).map(|band| band.name)
    }

    fn change_enrollment(&self, uuid: &str) {
        if !valid_uuid(uuid) || !self.band_path(uuid).exists() {
            warn!(band_uuid = %uuid, "Ignoring switch to unknown band");
            return;
        }
        match self.set_default(Some(uuid)) {
            Ok(()) => info!(band_uuid = %uuid, "Active band changed"),
            Err(e) => warn!("Failed to persist default band: {}", e),
        }
    }

    fn parse_enrollment_response(&self, private_key: &str, body: &str) -> i32 {
        let envelope: EnrollEnvelope = match serde_json::from_str(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Malformed enrollment response: {}", e);
                return CODE_MALFORMED;
            }
        };
        if envelope.status != 200 {
            return CODE_STATUS;
        }
        let mut band = match envelope.band {
            Some(band) if valid_uuid(&band.uuid) && !band.jwt.is_empty() => band,
            _ => {
                warn!("Enrollment response carries no usable band");
                return CODE_MALFORMED;
            }
        };
        band.wireguard_privkey = private_key.to_string();

        if let Err(e) = write_json(&self.band_path(&band.uuid), &band) {
            warn!("Failed to store enrollment: {}", e);
            return CODE_IO;
        }
        remove_if_exists(&self.conf_path(&band.uuid));
        if let Err(e) = self.set_default(Some(&band.uuid)) {
            warn!("Failed to persist default band: {}", e);
            return CODE_IO;
        }

        info!(band_uuid = %band.uuid, band_name = %band.name, "Enrollment stored");
        CODE_OK
    }

    fn parse_config_response(&self, validation_token: Option<&str>, body: &str) -> i32 {
        let uuid = match self.active_band_uuid() {
            Some(uuid) => uuid,
            None => return CODE_NO_BAND,
        };
        let envelope: ConfEnvelope = match serde_json::from_str(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Malformed config response: {}", e);
                return CODE_MALFORMED;
            }
        };
        if envelope.status != 200 {
            return CODE_STATUS;
        }
        let mut conf = match envelope.conf {
            Some(Value::Object(conf)) => conf,
            _ => return CODE_MALFORMED,
        };
        if let Some(token) = validation_token {
            conf.insert("etag".to_string(), Value::String(token.to_string()));
        }

        if let Err(e) = write_json(&self.conf_path(&uuid), &Value::Object(conf)) {
            warn!("Failed to store config: {}", e);
            return CODE_IO;
        }
        debug!(band_uuid = %uuid, "Config stored");

        if let (Some(engine), Some(document)) = (&self.engine, self.engine_document()) {
            let code = engine.reload(&document);
            if code != CODE_OK {
                warn!(code, "Tunnel engine rejected the new config");
            }
        }
        CODE_OK
    }

    fn parse_unenrollment_response(&self, body: &str) -> i32 {
        match self.active_band_uuid() {
            Some(uuid) => self.parse_unenrollment_response_for(&uuid, body),
            None => CODE_NO_BAND,
        }
    }

    fn parse_unenrollment_response_for(&self, uuid: &str, body: &str) -> i32 {
        let envelope: StatusOnly = match serde_json::from_str(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Malformed unenrollment response: {}", e);
                return CODE_MALFORMED;
            }
        };
        if envelope.status != 200 && !UNENROLL_FORCE_STATUSES.contains(&envelope.status) {
            return CODE_STATUS;
        }
        if UNENROLL_FORCE_STATUSES.contains(&envelope.status) {
            warn!(status = envelope.status, "Band or device already gone remotely; removing locally");
        }
        if !valid_uuid(uuid) || !self.band_path(uuid).exists() {
            return CODE_NO_BAND;
        }

        remove_if_exists(&self.band_path(uuid));
        remove_if_exists(&self.conf_path(uuid));
        remove_if_exists(&self.admin_path(uuid));
        if self.active_band_uuid().as_deref() == Some(uuid) {
            if let Err(e) = self.set_default(None) {
                warn!("Failed to clear default band: {}", e);
                return CODE_IO;
            }
        }

        info!(band_uuid = %uuid, "Unenrolled");
        CODE_OK
    }

    fn band_config_etag(&self) -> Option<String> {
        self.active_conf()?
            .get("etag")?
            .as_str()
            .map(str::to_string)
    }

    fn band_config_string(&self) -> Option<String> {
        let uuid = self.active_band_uuid()?;
        std::fs::read_to_string(self.conf_path(&uuid)).ok()
    }

    fn status_snapshot_string(&self) -> Option<String> {
        std::fs::read_to_string(self.root().join("status_snapshot.json"))
            .ok()
            .filter(|body| !body.trim().is_empty())
    }

    fn save_band_admin(&self, uuid: &str, token: &str) -> bool {
        if !valid_uuid(uuid) || token.is_empty() {
            return false;
        }
        let admin = AdminFile {
            band_uuid: uuid.to_string(),
            jwt: token.to_string(),
        };
        match write_json(&self.admin_path(uuid), &admin) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to store band admin: {}", e);
                false
            }
        }
    }

    fn band_admin(&self) -> Option<String> {
        let uuid = self.active_band_uuid()?;
        read_json::<AdminFile>(&self.admin_path(&uuid)).map(|admin| admin.jwt)
    }

    fn create_wireguard_keys(&self) -> Option<WireguardKeys> {
        Some(generate_wireguard_keys())
    }

    fn listen_port(&self) -> u16 {
        self.listen_port
    }

    fn if_addrs(&self) -> Vec<String> {
        advertisable_addrs(&self.if_addrs)
    }

    fn stun_nat_type(&self) -> i32 {
        self.engine.as_ref().map_or(0, |engine| engine.nat_type())
    }

    fn stun_mapped_addr(&self) -> Option<String> {
        self.engine.as_ref().and_then(|engine| engine.mapped_addr())
    }

    fn tunnel_init(&self, fd: i32) -> i32 {
        let engine = match &self.engine {
            Some(engine) => engine,
            None => {
                warn!("No tunnel engine attached");
                return CODE_IO;
            }
        };
        match self.engine_document() {
            Some(document) => engine.init(fd, &document),
            None => CODE_NO_BAND,
        }
    }

    fn tunnel_loop(&self) -> i32 {
        self.engine
            .as_ref()
            .map_or(CODE_LOOP_ABORT, |engine| engine.run_once())
    }

    fn tunnel_fini(&self) {
        if let Some(engine) = &self.engine {
            engine.fini();
        }
    }

    fn active_band_uuid(&self) -> Option<String> {
        self.default_band.read().clone()
    }

    fn band_jwt(&self) -> Option<String> {
        self.active_band().map(|band| band.jwt)
    }

    fn band_jwt_by_uuid(&self, uuid: &str) -> Option<String> {
        if !valid_uuid(uuid) {
            return None;
        }
        read_json::<BandFile>(&self.band_path(uuid)).map(|band| band.jwt)
    }

    fn active_band_name(&self) -> Option<String> {
        self.active_band().map(|band| band.name)
    }

    fn active_device_name(&self) -> Option<String> {
        self.active_interface_field("name")
    }

    fn active_private_ip(&self) -> Option<String> {
        self.active_interface_field("private_ip")
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn valid_uuid(uuid: &str) -> bool {
    uuid::Uuid::parse_str(uuid).is_ok()
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring unreadable {}: {}", path.display(), e);
            None
        }
    }
}

/// Write through a temporary file so readers never see a torn document.
fn write_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    std::fs::rename(&tmp, path)
}

fn remove_if_exists(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}

/// Generate a WireGuard key pair
pub fn generate_wireguard_keys() -> WireguardKeys {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use rand::RngCore;
    use x25519_dalek::{PublicKey, StaticSecret};

    let mut private_key_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut private_key_bytes);

    // Curve25519 clamping
    private_key_bytes[0] &= 248;
    private_key_bytes[31] &= 127;
    private_key_bytes[31] |= 64;

    let secret = StaticSecret::from(private_key_bytes);
    let public = PublicKey::from(&secret);

    WireguardKeys {
        private_key: STANDARD.encode(private_key_bytes),
        public_key: STANDARD.encode(public.as_bytes()),
    }
}

/// Filter candidate endpoint addresses down to what peers can reach.
pub fn advertisable_addrs(candidates: &[String]) -> Vec<String> {
    let mut addrs: Vec<String> = Vec::new();

    for raw in candidates {
        let ip: IpAddr = match raw.parse() {
            Ok(ip) => ip,
            Err(_) => {
                debug!("Skipping unparsable interface address {}", raw);
                continue;
            }
        };
        if !is_advertisable(&ip) {
            continue;
        }
        let ip = ip.to_string();
        if !addrs.contains(&ip) {
            addrs.push(ip);
        }
        if addrs.len() == MAX_IF_ADDRS {
            break;
        }
    }

    addrs
}

fn is_advertisable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            // 198.18.0.0/15 is the benchmarking range used by some VPN stacks.
            let benchmark = octets[0] == 198 && (octets[1] & 0xfe) == 18;
            !(v4.is_loopback() || v4.is_unspecified() || v4.is_broadcast() || benchmark)
        }
        IpAddr::V6(v6) => !(v6.is_loopback() || v6.is_unspecified()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
    use tempfile::TempDir;

    const BAND: &str = "0b0a3721-7dc0-4391-969d-b3b0d1e00925";
    const OTHER: &str = "6f1c2a7e-9d4b-4f0e-8a11-2c3d4e5f6a7b";

    fn port(dir: &TempDir) -> LocalCorePort {
        let mut config = CoreConfig::default();
        config.root_dir = dir.path().to_path_buf();
        let port = LocalCorePort::new(&config);
        assert_eq!(port.init(dir.path()), CODE_OK);
        port
    }

    fn enroll_body(uuid: &str, name: &str, public: bool) -> String {
        serde_json::json!({
            "status": 200,
            "band": {"uuid": uuid, "name": name, "jwt": format!("jwt-{}", name), "opt_public": public}
        })
        .to_string()
    }

    #[test]
    fn test_enrollment_persists_and_activates() {
        let dir = TempDir::new().unwrap();
        let port = port(&dir);
        assert!(!port.is_enrolled());

        assert_eq!(port.parse_enrollment_response("priv", &enroll_body(BAND, "home", true)), CODE_OK);
        assert!(port.is_enrolled());
        assert!(port.is_band_public());
        assert_eq!(port.active_band_uuid().as_deref(), Some(BAND));
        assert_eq!(port.band_jwt().as_deref(), Some("jwt-home"));
        assert_eq!(port.band_name_by_uuid(BAND).as_deref(), Some("home"));

        let stored: BandFile = read_json(&port.band_path(BAND)).unwrap();
        assert_eq!(stored.wireguard_privkey, "priv");
    }

    #[test]
    fn test_failed_enrollment_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let port = port(&dir);

        let body = r#"{"status": 400, "msg": "token expired"}"#;
        assert_eq!(port.parse_enrollment_response("priv", body), CODE_STATUS);
        assert_eq!(port.parse_enrollment_response("priv", "not json"), CODE_MALFORMED);
        assert!(port.band_uuids().is_empty());
        assert!(!port.is_enrolled());
    }

    #[test]
    fn test_reenrollment_drops_stale_config() {
        let dir = TempDir::new().unwrap();
        let port = port(&dir);
        port.parse_enrollment_response("priv", &enroll_body(BAND, "home", false));

        let conf = r#"{"status": 200, "conf": {"interface": {"name": "laptop", "private_ip": "100.64.0.1"}, "peers": []}}"#;
        assert_eq!(port.parse_config_response(Some("v1"), conf), CODE_OK);
        assert_eq!(port.band_config_etag().as_deref(), Some("v1"));
        assert_eq!(port.active_device_name().as_deref(), Some("laptop"));
        assert_eq!(port.active_private_ip().as_deref(), Some("100.64.0.1"));

        port.parse_enrollment_response("priv2", &enroll_body(BAND, "home", false));
        assert!(port.band_config_string().is_none());
    }

    #[test]
    fn test_config_requires_active_band() {
        let dir = TempDir::new().unwrap();
        let port = port(&dir);
        let conf = r#"{"status": 200, "conf": {"interface": {}}}"#;
        assert_eq!(port.parse_config_response(None, conf), CODE_NO_BAND);
    }

    #[test]
    fn test_unenroll_removes_files_and_clears_default() {
        let dir = TempDir::new().unwrap();
        let port = port(&dir);
        port.parse_enrollment_response("priv", &enroll_body(BAND, "home", false));
        assert!(port.save_band_admin(BAND, "admin-jwt"));
        assert_eq!(port.band_admin().as_deref(), Some("admin-jwt"));

        assert_eq!(port.parse_unenrollment_response(r#"{"status": 200}"#), CODE_OK);
        assert!(!port.is_enrolled());
        assert!(port.active_band_uuid().is_none());
        assert!(!port.band_path(BAND).exists());
        assert!(!port.admin_path(BAND).exists());
    }

    #[test]
    fn test_unenroll_inactive_band_keeps_default() {
        let dir = TempDir::new().unwrap();
        let port = port(&dir);
        port.parse_enrollment_response("priv", &enroll_body(BAND, "home", false));
        port.parse_enrollment_response("priv", &enroll_body(OTHER, "work", false));
        assert_eq!(port.active_band_uuid().as_deref(), Some(OTHER));
        assert_eq!(port.band_jwt_by_uuid(BAND).as_deref(), Some("jwt-home"));

        assert_eq!(
            port.parse_unenrollment_response_for(BAND, r#"{"status": 200}"#),
            CODE_OK
        );
        assert_eq!(port.active_band_uuid().as_deref(), Some(OTHER));
        assert_eq!(port.band_uuids(), vec![OTHER.to_string()]);
        assert!(port.band_jwt_by_uuid(BAND).is_none());

        let progconf: ProgConf = read_json(&port.progconf_path()).unwrap();
        assert_eq!(progconf.default_band_uuid.as_deref(), Some(OTHER));
        assert_eq!(
            port.parse_unenrollment_response_for(BAND, r#"{"status": 200}"#),
            CODE_NO_BAND
        );
    }

    #[test]
    fn test_unenroll_forced_when_band_gone_remotely() {
        let dir = TempDir::new().unwrap();
        let port = port(&dir);
        port.parse_enrollment_response("priv", &enroll_body(BAND, "home", false));

        assert_eq!(port.parse_unenrollment_response(r#"{"status": 400}"#), CODE_STATUS);
        assert!(port.is_enrolled());
        assert_eq!(port.parse_unenrollment_response(r#"{"status": 506, "msg": "No device found"}"#), CODE_OK);
        assert!(!port.is_enrolled());
    }

    #[test]
    fn test_switch_and_restart_restore_default() {
        let dir = TempDir::new().unwrap();
        let port = port(&dir);
        port.parse_enrollment_response("a", &enroll_body(BAND, "home", false));
        port.parse_enrollment_response("b", &enroll_body(OTHER, "work", false));
        assert_eq!(port.active_band_uuid().as_deref(), Some(OTHER));

        port.change_enrollment(BAND);
        port.change_enrollment("../../etc/passwd");
        assert_eq!(port.active_band_uuid().as_deref(), Some(BAND));

        let reopened = super::tests::port(&dir);
        assert_eq!(reopened.active_band_uuid().as_deref(), Some(BAND));
        assert_eq!(reopened.band_uuids(), vec![BAND.to_string(), OTHER.to_string()]);
    }

    #[test]
    fn test_init_adopts_enrollment_without_default() {
        let dir = TempDir::new().unwrap();
        let port = port(&dir);
        port.parse_enrollment_response("a", &enroll_body(OTHER, "work", false));
        std::fs::remove_file(dir.path().join("mudband.conf")).unwrap();
        std::fs::write(dir.path().join("enroll").join("band_junk.json"), "{}").unwrap();

        let reopened = super::tests::port(&dir);
        assert_eq!(reopened.active_band_uuid().as_deref(), Some(OTHER));
        assert_eq!(reopened.band_uuids().len(), 1);
    }

    #[test]
    fn test_wireguard_keys_decode() {
        use base64::{engine::general_purpose::STANDARD, Engine};

        let keys = generate_wireguard_keys();
        let private = STANDARD.decode(&keys.private_key).unwrap();
        let public = STANDARD.decode(&keys.public_key).unwrap();
        assert_eq!(private.len(), 32);
        assert_eq!(public.len(), 32);
        assert_eq!(private[0] & 7, 0);
        assert_ne!(keys.private_key, generate_wireguard_keys().private_key);
    }

    #[test]
    fn test_advertisable_addrs() {
        let candidates: Vec<String> = [
            "127.0.0.1",
            "0.0.0.0",
            "255.255.255.255",
            "198.18.0.1",
            "198.19.255.1",
            "192.168.1.10",
            "192.168.1.10",
            "::1",
            "fe80::1",
            "eth0",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        assert_eq!(advertisable_addrs(&candidates), vec!["192.168.1.10", "fe80::1"]);

        let many: Vec<String> = (1..40).map(|i| format!("10.0.0.{}", i)).collect();
        assert_eq!(advertisable_addrs(&many).len(), MAX_IF_ADDRS);
    }

    #[test]
    fn test_tunnel_without_engine_fails() {
        let dir = TempDir::new().unwrap();
        let port = port(&dir);
        assert_eq!(port.tunnel_init(3), CODE_IO);
        assert_eq!(port.tunnel_loop(), CODE_LOOP_ABORT);
        port.tunnel_fini();
    }

    struct CountingEngine {
        ticks: AtomicI32,
        stopped: AtomicBool,
        reloads: AtomicI32,
    }

    impl TunnelEngine for CountingEngine {
        fn init(&self, fd: i32, config: &str) -> i32 {
            assert_eq!(fd, 7);
            let document: Value = serde_json::from_str(config).unwrap();
            assert!(document.get("interface").is_some());
            assert_eq!(document["wireguard_privkey"], "priv");
            0
        }

        fn reload(&self, config: &str) -> i32 {
            assert!(config.contains("wireguard_privkey"));
            self.reloads.fetch_add(1, Ordering::SeqCst);
            0
        }

        fn run_once(&self) -> i32 {
            if self.stopped.load(Ordering::SeqCst) {
                return 101;
            }
            self.ticks.fetch_add(1, Ordering::SeqCst);
            0
        }

        fn fini(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }

        fn nat_type(&self) -> i32 {
            3
        }
    }

    #[test]
    fn test_tunnel_delegates_to_engine() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(CountingEngine {
            ticks: AtomicI32::new(0),
            stopped: AtomicBool::new(false),
            reloads: AtomicI32::new(0),
        });
        let mut config = CoreConfig::default();
        config.root_dir = dir.path().to_path_buf();
        let port = LocalCorePort::new(&config).with_engine(engine.clone());
        port.init(dir.path());

        port.parse_enrollment_response("priv", &enroll_body(BAND, "home", false));
        assert_eq!(port.tunnel_init(7), CODE_NO_BAND);
        port.parse_config_response(None, r#"{"status": 200, "conf": {"interface": {}}}"#);
        assert_eq!(engine.reloads.load(Ordering::SeqCst), 1);

        assert_eq!(port.tunnel_init(7), CODE_OK);
        assert_eq!(port.tunnel_loop(), 0);
        port.tunnel_fini();
        assert_eq!(port.tunnel_loop(), 101);
        assert_eq!(engine.ticks.load(Ordering::SeqCst), 1);
        assert_eq!(port.stun_nat_type(), 3);
    }
}
