//! Enrollment manager
//!
//! Owns band membership: anonymous band creation, joining with an enrollment
//! token, switching the active band and unenrolling. Every mutation runs under
//! one writer lock and is applied through the native core port only after the
//! control plane accepted it, so a failed call never leaves partial identity
//! state behind.

use crate::control::{ControlPlane, EnrollRequest};
use crate::port::{check, NativeCorePort};
use crate::sync::ChangeSignal;
use mudband_common::{
    Band, BandCreated, EnrollmentPhase, EnrollmentRecord, EnrollmentResult, EnrollmentSummary,
    Error, Result,
};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Control plane statuses that still let an unenroll proceed locally.
const UNENROLL_FORCE_STATUSES: [i64; 2] = [505, 506];

#[derive(Deserialize)]
struct EnrollReply {
    status: i64,
    #[serde(default, alias = "message")]
    msg: Option<String>,
    #[serde(default)]
    sso_url: Option<String>,
    #[serde(default)]
    band: Option<EnrolledBand>,
}

#[derive(Deserialize)]
struct EnrolledBand {
    uuid: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    opt_public: bool,
}

#[derive(Deserialize)]
struct UnenrollReply {
    status: i64,
    #[serde(default, alias = "message")]
    msg: Option<String>,
}

/// Band membership lifecycle
pub struct EnrollmentManager {
    port: Arc<dyn NativeCorePort>,
    control: Arc<dyn ControlPlane>,
    signal: ChangeSignal,
    version: AtomicU64,
    writer: Mutex<()>,
}

impl EnrollmentManager {
    pub fn new(
        port: Arc<dyn NativeCorePort>,
        control: Arc<dyn ControlPlane>,
        signal: ChangeSignal,
    ) -> Self {
        Self {
            port,
            control,
            signal,
            version: AtomicU64::new(0),
            writer: Mutex::new(()),
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn is_enrolled(&self) -> bool {
        self.port.is_enrolled()
    }

    /// Bumped on every membership change.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Known bands. Only the active band reports its public flag.
    pub fn list_bands(&self) -> Vec<Band> {
        let active = self.port.active_band_uuid();
        let active_public = self.port.is_band_public();

        self.port
            .band_uuids()
            .into_iter()
            .filter_map(|uuid| {
                let name = self.port.band_name_by_uuid(&uuid)?;
                let is_public = active.as_deref() == Some(uuid.as_str()) && active_public;
                Some(Band {
                    uuid,
                    name,
                    is_public,
                })
            })
            .collect()
    }

    pub fn active_band(&self) -> Option<Band> {
        let uuid = self.port.active_band_uuid()?;
        if !self.port.is_enrolled() {
            return None;
        }
        Some(Band {
            name: self
                .port
                .active_band_name()
                .or_else(|| self.port.band_name_by_uuid(&uuid))
                .unwrap_or_default(),
            is_public: self.port.is_band_public(),
            uuid,
        })
    }

    /// The active enrollment, if any.
    pub fn active_record(&self) -> Option<EnrollmentRecord> {
        if !self.port.is_enrolled() {
            return None;
        }
        Some(EnrollmentRecord {
            band_uuid: self.port.active_band_uuid()?,
            credential: self.port.band_jwt()?,
            device_name: self.port.active_device_name(),
        })
    }

    pub fn summary(&self, terms_agreed: bool, pending_mfa_url: Option<String>) -> EnrollmentSummary {
        let record = self.active_record();
        let active_band = record.as_ref().and_then(|_| self.active_band());
        EnrollmentSummary {
            enrolled: active_band.is_some(),
            device_name: record.and_then(|record| record.device_name),
            active_band,
            bands: self.list_bands(),
            terms_agreed,
            pending_mfa_url,
        }
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Create an anonymous band. Local state is untouched.
    pub async fn create_band(&self, name: &str, description: &str) -> Result<BandCreated> {
        let created = self.control.create_anonymous_band(name, description).await?;
        info!(band_uuid = %created.band_uuid, "Band created");
        Ok(created)
    }

    /// Join a band with a single-use enrollment token.
    pub async fn join_existing_band(
        &self,
        enrollment_token: &str,
        device_name: &str,
        secret: Option<&str>,
    ) -> Result<EnrollmentResult> {
        let _writer = self.writer.lock().await;
        self.join_locked(enrollment_token, device_name, secret).await
    }

    /// Create a band, keep its admin credential, and enroll this device.
    ///
    /// Phases run strictly in order and stop at the first failure. Nothing is
    /// rolled back: a band created in phase one stays on the server and is
    /// only adopted locally once the join succeeds.
    pub async fn create_anonymous_band_and_enroll(
        &self,
        name: &str,
        description: &str,
        device_name: &str,
    ) -> Result<EnrollmentResult> {
        let _writer = self.writer.lock().await;

        let created = self
            .control
            .create_anonymous_band(name, description)
            .await
            .map_err(|e| e.in_phase(EnrollmentPhase::CreateBand))?;
        info!(band_uuid = %created.band_uuid, "Band created");

        if !self
            .port
            .save_band_admin(&created.band_uuid, &created.admin_token)
        {
            return Err(Error::Auth("failed to save band admin credential".into())
                .in_phase(EnrollmentPhase::SaveAdmin));
        }

        let token = self
            .control
            .create_enrollment_token(&created.admin_token)
            .await
            .map_err(|e| e.in_phase(EnrollmentPhase::IssueToken))?;

        self.join_locked(&token, device_name, None)
            .await
            .map_err(|e| e.in_phase(EnrollmentPhase::Join))
    }

    /// Make `band_uuid` the active band.
    pub async fn change_active_enrollment(&self, band_uuid: &str) -> Result<()> {
        let _writer = self.writer.lock().await;
        self.ensure_known(band_uuid)?;

        self.port.change_enrollment(band_uuid);
        if self.port.active_band_uuid().as_deref() != Some(band_uuid) {
            return Err(Error::State(format!("could not activate band {}", band_uuid)));
        }

        info!(band_uuid = %band_uuid, "Active enrollment changed");
        self.changed();
        Ok(())
    }

    /// Leave `band_uuid`. Unenrolling the active band leaves no band active;
    /// any other band is removed without touching the selection.
    pub async fn unenroll(&self, band_uuid: &str) -> Result<()> {
        let _writer = self.writer.lock().await;
        self.ensure_known(band_uuid)?;

        let credential = self
            .port
            .band_jwt_by_uuid(band_uuid)
            .ok_or_else(|| Error::Auth(format!("no credential stored for band {}", band_uuid)))?;
        let body = self.control.unenroll(&credential).await?;

        let reply: UnenrollReply = serde_json::from_str(&body)
            .map_err(|e| Error::Parse(format!("unenroll reply: {}", e)))?;
        if reply.status != 200 {
            if !UNENROLL_FORCE_STATUSES.contains(&reply.status) {
                return Err(Error::Protocol {
                    status: reply.status,
                    message: reply.msg.unwrap_or_default(),
                });
            }
            warn!(status = reply.status, "Band already gone remotely, removing local enrollment");
        }
        check(
            self.port.parse_unenrollment_response_for(band_uuid, &body),
            "unenroll response",
        )?;

        info!(band_uuid = %band_uuid, "Unenrolled");
        self.changed();
        Ok(())
    }

    async fn join_locked(
        &self,
        enrollment_token: &str,
        device_name: &str,
        secret: Option<&str>,
    ) -> Result<EnrollmentResult> {
        let keys = self
            .port
            .create_wireguard_keys()
            .ok_or_else(|| Error::Auth("failed to generate WireGuard keys".into()))?;

        let request = EnrollRequest {
            token: enrollment_token.to_string(),
            name: device_name.to_string(),
            wireguard_pubkey: keys.public_key.clone(),
            secret: secret.filter(|s| !s.is_empty()).map(str::to_string),
        };
        let body = self.control.enroll(&request).await?;

        let reply: EnrollReply = serde_json::from_str(&body)
            .map_err(|e| Error::Parse(format!("enroll reply: {}", e)))?;
        match reply.status {
            200 => {}
            301 => {
                let sso_url = reply
                    .sso_url
                    .filter(|url| !url.is_empty())
                    .ok_or_else(|| Error::Parse("MFA enroll reply lacks sso_url".into()))?;
                info!("Band requires SSO before enrollment completes");
                return Ok(EnrollmentResult::MfaRequired { sso_url });
            }
            status => {
                return Err(Error::Protocol {
                    status,
                    message: reply.msg.unwrap_or_default(),
                });
            }
        }

        let enrolled = reply
            .band
            .ok_or_else(|| Error::Parse("enroll reply lacks band".into()))?;
        check(
            self.port
                .parse_enrollment_response(&keys.private_key, &body),
            "enroll response",
        )?;

        info!(band_uuid = %enrolled.uuid, device = %device_name, "Device enrolled");
        self.changed();
        Ok(EnrollmentResult::Enrolled {
            band: Band {
                uuid: enrolled.uuid,
                name: enrolled.name,
                is_public: enrolled.opt_public,
            },
        })
    }

    fn ensure_known(&self, band_uuid: &str) -> Result<()> {
        if self.port.band_uuids().iter().any(|uuid| uuid == band_uuid) {
            Ok(())
        } else {
            Err(Error::State(format!("band {} is not enrolled", band_uuid)))
        }
    }

    fn changed(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
        self.signal.notify();
    }
}
