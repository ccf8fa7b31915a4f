//! User preferences
//!
//! Small JSON document next to the enrollment state: whether the user agreed
//! to the terms of service, and the SSO URL of a pending MFA challenge.

use mudband_common::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct PrefsData {
    #[serde(default)]
    user_tos_agreed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mfa_url: Option<String>,
}

/// Persisted preferences
pub struct Preferences {
    path: PathBuf,
    data: RwLock<PrefsData>,
}

impl Preferences {
    /// Open preferences at `path`; a missing or unreadable file starts empty.
    pub fn open(path: &Path) -> Self {
        let data = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("Resetting unreadable preferences {}: {}", path.display(), e);
                PrefsData::default()
            }),
            Err(_) => PrefsData::default(),
        };
        Self {
            path: path.to_path_buf(),
            data: RwLock::new(data),
        }
    }

    pub fn terms_agreed(&self) -> bool {
        self.data.read().user_tos_agreed
    }

    pub fn agree_terms(&self) -> Result<()> {
        self.update(|data| data.user_tos_agreed = true)
    }

    pub fn pending_mfa_url(&self) -> Option<String> {
        self.data.read().mfa_url.clone()
    }

    pub fn set_pending_mfa_url(&self, url: &str) -> Result<()> {
        debug!("Recording pending MFA challenge");
        self.update(|data| data.mfa_url = Some(url.to_string()))
    }

    /// Forget the pending MFA challenge.
    pub fn reset_mfa(&self) -> Result<()> {
        self.update(|data| data.mfa_url = None)
    }

    fn update(&self, apply: impl FnOnce(&mut PrefsData)) -> Result<()> {
        let mut guard = self.data.write();
        let mut next = guard.clone();
        apply(&mut next);
        if next == *guard {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_vec_pretty(&next)?)?;
        *guard = next;
        Ok(())
    }
}
