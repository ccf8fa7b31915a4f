//! Config/status reconciliation
//!
//! Keeps the last valid configuration and status documents for the active
//! band and the device list derived from them. Readers get an immutable
//! [`ReconcileView`]; a failed refresh leaves the previous view in place.

use crate::control::{
    normalize_etag, ConfigFetch, ConfigRequest, ConfigRequestInterface, ControlPlane,
    CONFIG_FETCH_TYPE,
};
use crate::port::{check, NativeCorePort};
use crate::prefs::Preferences;
use crate::sync::ChangeSignal;
use mudband_common::{
    ConfigSnapshot, DeviceView, Error, MfaState, Result, StatusSnapshot,
};
use parking_lot::RwLock;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Outcome of a config refresh
#[derive(Debug, Clone)]
pub enum ConfigRefresh {
    Updated(Arc<ConfigSnapshot>),
    /// The server reported the validation token we already hold.
    Unchanged,
}

/// Outcome of a status refresh
#[derive(Debug, Clone)]
pub enum StatusRefresh {
    Updated(Arc<StatusSnapshot>),
    /// No telemetry available; not an error.
    Absent,
}

/// Immutable reconciled state
#[derive(Debug, Clone, Default)]
pub struct ReconcileView {
    pub version: u64,
    pub config: Option<Arc<ConfigSnapshot>>,
    pub status: Option<Arc<StatusSnapshot>>,
    pub devices: Arc<Vec<DeviceView>>,
}

impl ReconcileView {
    pub fn mfa_state(&self) -> MfaState {
        match &self.status {
            Some(status) => MfaState {
                required: status.mfa_required(),
                url: status.mfa_url().to_string(),
            },
            None => MfaState::default(),
        }
    }
}

#[derive(Deserialize)]
struct ConfigReply {
    status: i64,
    #[serde(default, alias = "message")]
    msg: Option<String>,
    #[serde(default)]
    sso_url: Option<String>,
    #[serde(default)]
    conf: Option<serde_json::Value>,
}

/// Parse a configuration document. Unknown fields are ignored.
pub fn parse_config(body: &str) -> Result<ConfigSnapshot> {
    serde_json::from_str(body).map_err(|e| Error::Parse(format!("config document: {}", e)))
}

/// Parse a status telemetry document. Unknown fields are ignored.
pub fn parse_status(body: &str) -> Result<StatusSnapshot> {
    serde_json::from_str(body).map_err(|e| Error::Parse(format!("status document: {}", e)))
}

/// Join config peers with status peers on `private_ip == iface_addr`.
///
/// When several status peers share an address the first one wins.
pub fn build_device_views(
    config: &ConfigSnapshot,
    status: Option<&StatusSnapshot>,
) -> Vec<DeviceView> {
    config
        .peers
        .iter()
        .map(|peer| {
            let heartbeat_time = status
                .and_then(|status| {
                    status
                        .peers
                        .iter()
                        .find(|candidate| candidate.iface_addr == peer.private_ip)
                })
                .map_or(0, |matched| matched.heartbeat_time);

            DeviceView {
                name: peer.name.clone(),
                private_ip: peer.private_ip.clone(),
                wireguard_pubkey: peer.wireguard_pubkey.clone(),
                heartbeat_time,
            }
        })
        .collect()
}

/// Config/status reconciliation engine
pub struct Reconciler {
    port: Arc<dyn NativeCorePort>,
    control: Arc<dyn ControlPlane>,
    prefs: Arc<Preferences>,
    signal: ChangeSignal,
    view: RwLock<ReconcileView>,
    config_writer: Mutex<()>,
}

impl Reconciler {
    pub fn new(
        port: Arc<dyn NativeCorePort>,
        control: Arc<dyn ControlPlane>,
        prefs: Arc<Preferences>,
        signal: ChangeSignal,
    ) -> Self {
        Self {
            port,
            control,
            prefs,
            signal,
            view: RwLock::new(ReconcileView::default()),
            config_writer: Mutex::new(()),
        }
    }

    /// Current reconciled state
    pub fn view(&self) -> ReconcileView {
        self.view.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.view.read().version
    }

    pub fn config(&self) -> Option<Arc<ConfigSnapshot>> {
        self.view.read().config.clone()
    }

    pub fn devices(&self) -> Arc<Vec<DeviceView>> {
        self.view.read().devices.clone()
    }

    pub fn mfa_state(&self) -> MfaState {
        self.view.read().mfa_state()
    }

    /// Validation token of the held config, if any.
    pub fn validation_token(&self) -> Option<String> {
        self.view
            .read()
            .config
            .as_ref()
            .and_then(|config| config.validation_token.clone())
    }

    /// Seed the view from what the port has cached for the active band.
    pub fn load_cached(&self) {
        let config = match self.port.band_config_string() {
            Some(body) => match parse_config(&body) {
                Ok(mut config) => {
                    if config.validation_token.is_none() {
                        config.validation_token = self.port.band_config_etag();
                    }
                    Some(Arc::new(config))
                }
                Err(e) => {
                    warn!("Ignoring cached config: {}", e);
                    None
                }
            },
            None => None,
        };
        let status = self.read_status().ok().flatten();

        let loaded = config.is_some();
        self.install(config, status);
        if loaded {
            debug!("Loaded cached config");
        }
    }

    /// Drop everything held for the previous band.
    pub fn clear(&self) {
        self.install(None, None);
    }

    /// Fetch the config document, re-parsing only when its token changed.
    pub async fn refresh_config(&self, current_token: Option<&str>) -> Result<ConfigRefresh> {
        let _writer = self.config_writer.lock().await;

        let band_uuid = self
            .port
            .active_band_uuid()
            .ok_or_else(|| Error::State("no active band".into()))?;
        let credential = self
            .port
            .band_jwt()
            .ok_or_else(|| Error::State(format!("band {} has no stored credential", band_uuid)))?;

        let request = self.config_request();
        let fetched = self
            .control
            .fetch_config(&credential, current_token, &request)
            .await?;

        let (validation_token, body) = match fetched {
            ConfigFetch::NotModified => {
                debug!(band_uuid = %band_uuid, "Config not modified");
                return Ok(ConfigRefresh::Unchanged);
            }
            ConfigFetch::Fetched {
                validation_token,
                body,
            } => (validation_token, body),
        };

        if let (Some(current), Some(fetched)) = (current_token, validation_token.as_deref()) {
            if normalize_etag(current) == fetched {
                debug!(band_uuid = %band_uuid, "Config token unchanged");
                return Ok(ConfigRefresh::Unchanged);
            }
        }

        let reply: ConfigReply = serde_json::from_str(&body)
            .map_err(|e| Error::Parse(format!("config reply: {}", e)))?;
        match reply.status {
            200 => {}
            301 => {
                let url = reply
                    .sso_url
                    .filter(|url| !url.is_empty())
                    .ok_or_else(|| Error::Parse("MFA config reply lacks sso_url".into()))?;
                self.prefs.set_pending_mfa_url(&url)?;
                self.signal.notify();
                return Err(Error::MfaRequired { url });
            }
            status => {
                return Err(Error::Protocol {
                    status,
                    message: reply.msg.unwrap_or_default(),
                });
            }
        }

        let conf = reply
            .conf
            .ok_or_else(|| Error::Parse("config reply lacks conf".into()))?;
        let mut config: ConfigSnapshot = serde_json::from_value(conf)
            .map_err(|e| Error::Parse(format!("config document: {}", e)))?;
        config.validation_token = validation_token.clone();

        // A band switch while the request was in flight makes this reply stale.
        if self.port.active_band_uuid().as_deref() != Some(band_uuid.as_str()) {
            return Err(Error::State("active band changed during config fetch".into()));
        }
        check(
            self.port
                .parse_config_response(validation_token.as_deref(), &body),
            "config response",
        )?;
        if self.prefs.pending_mfa_url().is_some() {
            self.prefs.reset_mfa()?;
        }

        let config = Arc::new(config);
        self.install_config(config.clone());
        info!(
            band_uuid = %band_uuid,
            peers = config.peers.len(),
            "Config updated"
        );
        Ok(ConfigRefresh::Updated(config))
    }

    /// Read the latest status telemetry.
    pub async fn refresh_status(&self) -> Result<StatusRefresh> {
        match self.read_status()? {
            Some(status) => {
                self.install_status(Some(status.clone()));
                Ok(StatusRefresh::Updated(status))
            }
            None => {
                self.install_status(None);
                Ok(StatusRefresh::Absent)
            }
        }
    }

    /// Refresh config and status concurrently.
    ///
    /// Both are attempted; the first failure is returned.
    pub async fn refresh(&self) -> Result<()> {
        let token = self.validation_token();
        let (config, status) = tokio::join!(
            self.refresh_config(token.as_deref()),
            self.refresh_status()
        );
        config?;
        status?;
        Ok(())
    }

    fn read_status(&self) -> Result<Option<Arc<StatusSnapshot>>> {
        let body = match self.port.status_snapshot_string() {
            Some(body) => body,
            None => return Ok(None),
        };
        let status = parse_status(&body)?;

        // Telemetry left behind by another band is not ours to show.
        let active = self.port.active_band_uuid();
        if !status.band_uuid.is_empty() && active.as_deref() != Some(status.band_uuid.as_str()) {
            debug!(status_band = %status.band_uuid, "Ignoring telemetry for inactive band");
            return Ok(None);
        }
        Ok(Some(Arc::new(status)))
    }

    fn config_request(&self) -> ConfigRequest {
        ConfigRequest {
            fetch_type: CONFIG_FETCH_TYPE.to_string(),
            stun_mapped_addr: self.port.stun_mapped_addr(),
            stun_nattype: self.port.stun_nat_type(),
            interface: ConfigRequestInterface {
                listen_port: self.port.listen_port(),
                addresses: self.port.if_addrs(),
            },
        }
    }

    fn install(
        &self,
        config: Option<Arc<ConfigSnapshot>>,
        status: Option<Arc<StatusSnapshot>>,
    ) {
        self.update(|held_config, held_status| {
            *held_config = config;
            *held_status = status;
        });
    }

    fn install_config(&self, config: Arc<ConfigSnapshot>) {
        self.update(|held_config, _| *held_config = Some(config));
    }

    fn install_status(&self, status: Option<Arc<StatusSnapshot>>) {
        self.update(|_, held_status| *held_status = status);
    }

    /// Apply a change and rederive devices under one write lock.
    fn update(
        &self,
        apply: impl FnOnce(&mut Option<Arc<ConfigSnapshot>>, &mut Option<Arc<StatusSnapshot>>),
    ) {
        {
            let mut view = self.view.write();
            let mut config = view.config.clone();
            let mut status = view.status.clone();
            apply(&mut config, &mut status);

            if view.config == config && view.status == status {
                return;
            }
            let devices = match &config {
                Some(config) => build_device_views(config, status.as_deref()),
                None => Vec::new(),
            };
            *view = ReconcileView {
                version: view.version + 1,
                config,
                status,
                devices: Arc::new(devices),
            };
        }
        self.signal.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mudband_common::{ConfigPeer, InterfaceConfig, StatusFlags, StatusPeer};

    fn config() -> ConfigSnapshot {
        ConfigSnapshot {
            validation_token: None,
            interface: InterfaceConfig {
                nat_type: 0,
                listen_port: 51820,
            },
            peers: vec![ConfigPeer {
                name: "dev1".into(),
                private_ip: "100.64.0.2".into(),
                wireguard_pubkey: "pk1".into(),
            }],
            links: vec![],
        }
    }

    fn status_peer(iface_addr: &str, heartbeat_time: i64) -> StatusPeer {
        StatusPeer {
            iface_addr: iface_addr.into(),
            endpoint_ip: "1.2.3.4".into(),
            endpoint_port: 51820,
            heartbeat_time,
        }
    }

    #[test]
    fn test_devices_without_status() {
        let devices = build_device_views(&config(), None);
        assert_eq!(
            devices,
            vec![DeviceView {
                name: "dev1".into(),
                private_ip: "100.64.0.2".into(),
                wireguard_pubkey: "pk1".into(),
                heartbeat_time: 0,
            }]
        );
    }

    #[test]
    fn test_devices_with_matching_status() {
        let status = StatusSnapshot {
            band_uuid: "b1".into(),
            status: StatusFlags::default(),
            peers: vec![status_peer("100.64.0.9", 5), status_peer("100.64.0.2", 1_700_000_000)],
        };
        let devices = build_device_views(&config(), Some(&status));
        assert_eq!(devices[0].heartbeat_time, 1_700_000_000);
    }

    #[test]
    fn test_duplicate_status_peers_first_match_wins() {
        let status = StatusSnapshot {
            band_uuid: "b1".into(),
            status: StatusFlags::default(),
            peers: vec![status_peer("100.64.0.2", 10), status_peer("100.64.0.2", 20)],
        };
        let devices = build_device_views(&config(), Some(&status));
        assert_eq!(devices[0].heartbeat_time, 10);
    }

    #[test]
    fn test_duplicate_config_peers_share_match() {
        let mut conf = config();
        conf.peers.push(ConfigPeer {
            name: "dev1-clone".into(),
            private_ip: "100.64.0.2".into(),
            wireguard_pubkey: "pk2".into(),
        });
        let status = StatusSnapshot {
            peers: vec![status_peer("100.64.0.2", 42)],
            ..Default::default()
        };
        let devices = build_device_views(&conf, Some(&status));
        assert_eq!(devices.len(), 2);
        assert!(devices.iter().all(|d| d.heartbeat_time == 42));
    }

    #[test]
    fn test_parse_config_tolerates_unknown_fields() {
        let body = r#"{
            "interface": {"nat_type": 0, "listen_port": 51820, "device_uuid": "d1"},
            "peers": [{"name": "dev1", "private_ip": "100.64.0.2", "wireguard_pubkey": "pk1", "otp_sender": 1}],
            "links": [{"name": "wiki", "url": "https://wiki", "icon": "book"}],
            "acl": {"default_policy": "allow", "programs": []}
        }"#;
        let parsed = parse_config(body).unwrap();
        assert_eq!(parsed.peers, config().peers);
        assert_eq!(parsed.links[0].url, "https://wiki");
    }

    #[test]
    fn test_parse_config_rejects_malformed() {
        assert!(matches!(parse_config("[1, 2]"), Err(Error::Parse(_))));
        assert!(matches!(
            parse_config(r#"{"interface": {"listen_port": "high"}}"#),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn test_mfa_state_from_view() {
        let mut view = ReconcileView::default();
        assert_eq!(view.mfa_state(), MfaState::default());

        view.status = Some(Arc::new(StatusSnapshot {
            band_uuid: "b1".into(),
            status: StatusFlags {
                mfa_required: true,
                mfa_url: "https://sso".into(),
            },
            peers: vec![],
        }));
        let mfa = view.mfa_state();
        assert!(mfa.required);
        assert_eq!(mfa.url, "https://sso");
    }
}
