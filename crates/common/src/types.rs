//! Core types for Mud.band
//!
//! Wire-facing documents (config, status) keep the control plane's field
//! names through serde renames; everything else is plain data handed to
//! front-ends.

use serde::{Deserialize, Serialize};

// ============================================================================
// Bands and enrollment
// ============================================================================

/// A mesh network a device can be enrolled into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Band {
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub is_public: bool,
}

/// Membership of this device in one band.
#[derive(Clone, PartialEq, Eq)]
pub struct EnrollmentRecord {
    pub band_uuid: String,
    /// Opaque credential presented to the control plane for this band.
    pub credential: String,
    pub device_name: Option<String>,
}

impl std::fmt::Debug for EnrollmentRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrollmentRecord")
            .field("band_uuid", &self.band_uuid)
            .field("credential", &"<redacted>")
            .field("device_name", &self.device_name)
            .finish()
    }
}

/// Result of an anonymous band creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandCreated {
    pub band_uuid: String,
    pub admin_token: String,
}

/// Outcome of joining a band with an enrollment token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum EnrollmentResult {
    Enrolled { band: Band },
    /// The band requires SSO before the device is admitted.
    MfaRequired { sso_url: String },
}

/// Freshly generated WireGuard key pair, base64 encoded.
#[derive(Clone)]
pub struct WireguardKeys {
    pub private_key: String,
    pub public_key: String,
}

impl std::fmt::Debug for WireguardKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireguardKeys")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Enrollment side of a published snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrollmentSummary {
    pub enrolled: bool,
    pub active_band: Option<Band>,
    pub device_name: Option<String>,
    pub bands: Vec<Band>,
    pub terms_agreed: bool,
    pub pending_mfa_url: Option<String>,
}

// ============================================================================
// Configuration document
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    #[serde(default)]
    pub nat_type: i64,
    #[serde(default)]
    pub listen_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigPeer {
    pub name: String,
    pub private_ip: String,
    pub wireguard_pubkey: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigLink {
    pub name: String,
    pub url: String,
}

/// Band topology issued by the control plane. Replaced wholesale on refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    #[serde(default, rename = "etag", skip_serializing_if = "Option::is_none")]
    pub validation_token: Option<String>,
    pub interface: InterfaceConfig,
    #[serde(default)]
    pub peers: Vec<ConfigPeer>,
    #[serde(default)]
    pub links: Vec<ConfigLink>,
}

// ============================================================================
// Status telemetry
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFlags {
    #[serde(default, rename = "mfa_authentication_required")]
    pub mfa_required: bool,
    #[serde(default, rename = "mfa_authentication_url")]
    pub mfa_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPeer {
    pub iface_addr: String,
    #[serde(default)]
    pub endpoint_ip: String,
    #[serde(default)]
    pub endpoint_port: u16,
    #[serde(default, rename = "endpoint_t_heartbeated")]
    pub heartbeat_time: i64,
}

/// Live telemetry written by the tunnel engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    #[serde(default)]
    pub band_uuid: String,
    #[serde(default)]
    pub status: StatusFlags,
    #[serde(default)]
    pub peers: Vec<StatusPeer>,
}

impl StatusSnapshot {
    pub fn mfa_required(&self) -> bool {
        self.status.mfa_required
    }

    pub fn mfa_url(&self) -> &str {
        &self.status.mfa_url
    }
}

// ============================================================================
// Derived views
// ============================================================================

/// A config peer joined with its status telemetry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceView {
    pub name: String,
    pub private_ip: String,
    pub wireguard_pubkey: String,
    /// Unix seconds of the last heartbeat; 0 when never seen.
    pub heartbeat_time: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MfaState {
    pub required: bool,
    pub url: String,
}

// ============================================================================
// Tunnel session
// ============================================================================

/// Tunnel session lifecycle state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    AwaitingPermission,
    Connecting,
    Connected,
    Disconnecting,
    Failed(String),
}

impl Default for SessionState {
    fn default() -> Self {
        Self::Idle
    }
}

impl SessionState {
    /// Whether a tunnel task may be alive in this state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Connected | SessionState::Disconnecting
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::AwaitingPermission => write!(f, "Awaiting permission"),
            SessionState::Connecting => write!(f, "Connecting"),
            SessionState::Connected => write!(f, "Connected"),
            SessionState::Disconnecting => write!(f, "Disconnecting"),
            SessionState::Failed(reason) => write!(f, "Failed: {}", reason),
        }
    }
}
