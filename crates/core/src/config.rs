//! Core configuration

use mudband_common::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// State root holding enrollments, configs and preferences
    #[serde(default = "mudband_common::default_root_path")]
    pub root_dir: PathBuf,

    /// Control plane configuration
    #[serde(default)]
    pub control_plane: ControlPlaneConfig,

    /// Background refresh intervals
    #[serde(default)]
    pub poll: PollConfig,

    /// Local tunnel facts reported to the control plane
    #[serde(default)]
    pub tunnel: TunnelConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            root_dir: mudband_common::default_root_path(),
            control_plane: ControlPlaneConfig::default(),
            poll: PollConfig::default(),
            tunnel: TunnelConfig::default(),
        }
    }
}

/// Control plane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// API base URL, without trailing slash
    pub base_url: String,

    /// Per-request timeout
    pub timeout_secs: u64,

    /// User-Agent header sent with every request
    pub user_agent: String,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            base_url: mudband_common::DEFAULT_API_URL.to_string(),
            timeout_secs: 30,
            user_agent: format!("mudband/{}", mudband_common::VERSION),
        }
    }
}

/// Poll configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub config_interval_secs: u64,
    pub status_interval_secs: u64,
    pub service_check_interval_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            config_interval_secs: 60,
            status_interval_secs: 5,
            service_check_interval_secs: 1,
        }
    }
}

impl PollConfig {
    /// Shortest of the configured intervals; the poller ticks at this rate.
    pub fn tick(&self) -> Duration {
        let secs = self
            .config_interval_secs
            .min(self.status_interval_secs)
            .min(self.service_check_interval_secs)
            .max(1);
        Duration::from_secs(secs)
    }
}

/// Tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// WireGuard UDP listen port
    pub listen_port: u16,

    /// Interface addresses advertised as candidate endpoints
    pub if_addrs: Vec<String>,

    /// Kernel WireGuard interface the CLI brings up
    pub interface: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            listen_port: 51820,
            if_addrs: Vec::new(),
            interface: "mudband0".to_string(),
        }
    }
}

impl CoreConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Directory holding `band_<uuid>.json` and `conf_<uuid>.json`
    pub fn enroll_dir(&self) -> PathBuf {
        self.root_dir.join("enroll")
    }

    /// Directory holding `admin_<uuid>.json`
    pub fn admin_dir(&self) -> PathBuf {
        self.root_dir.join("admin")
    }

    /// Program state (`default_band_uuid`)
    pub fn progconf_path(&self) -> PathBuf {
        self.root_dir.join("mudband.conf")
    }

    /// User preferences
    pub fn prefs_path(&self) -> PathBuf {
        self.root_dir.join("prefs.json")
    }

    /// Status telemetry written by the tunnel engine
    pub fn status_snapshot_path(&self) -> PathBuf {
        self.root_dir.join("status_snapshot.json")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.control_plane.timeout_secs)
    }
}
