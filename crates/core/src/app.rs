//! Core facade
//!
//! Wires the port, control plane and managers together once at startup and
//! sequences the cross-component flows front-ends trigger: a membership change
//! resets the session, reloads the reconciled state and republishes.

use crate::config::CoreConfig;
use crate::control::ControlPlane;
use crate::enrollment::EnrollmentManager;
use crate::platform::VpnPlatform;
use crate::poller::Poller;
use crate::port::NativeCorePort;
use crate::prefs::Preferences;
use crate::reconcile::Reconciler;
use crate::session::SessionController;
use crate::sync::{ChangeSignal, Snapshot, StateSynchronizer};
use mudband_common::{EnrollmentResult, Error, Result, SessionState};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

/// The Mud.band client core
pub struct Core {
    config: CoreConfig,
    port: Arc<dyn NativeCorePort>,
    prefs: Arc<Preferences>,
    enrollment: Arc<EnrollmentManager>,
    reconciler: Arc<Reconciler>,
    session: Arc<SessionController>,
    sync: Arc<StateSynchronizer>,
    signal: ChangeSignal,
    config_stale: Arc<Notify>,
}

impl Core {
    /// Initialise the port and build the managers.
    pub async fn open(
        config: CoreConfig,
        port: Arc<dyn NativeCorePort>,
        control: Arc<dyn ControlPlane>,
        platform: Arc<dyn VpnPlatform>,
    ) -> Result<Self> {
        let code = port.init(&config.root_dir);
        if code != 0 {
            return Err(Error::State(format!(
                "native core init failed for {} (code {})",
                config.root_dir.display(),
                code
            )));
        }

        let signal = ChangeSignal::new();
        let config_stale = Arc::new(Notify::new());
        let prefs = Arc::new(Preferences::open(&config.prefs_path()));

        let enrollment = Arc::new(EnrollmentManager::new(
            port.clone(),
            control.clone(),
            signal.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            port.clone(),
            control,
            prefs.clone(),
            signal.clone(),
        ));
        reconciler.load_cached();

        let session = Arc::new(SessionController::new(
            port.clone(),
            platform,
            enrollment.clone(),
            reconciler.clone(),
            signal.clone(),
            config_stale.clone(),
        )?);
        let sync = Arc::new(StateSynchronizer::new(
            enrollment.clone(),
            reconciler.clone(),
            session.clone(),
            prefs.clone(),
        ));

        info!(
            root = %config.root_dir.display(),
            enrolled = enrollment.is_enrolled(),
            "Core opened"
        );

        Ok(Self {
            config,
            port,
            prefs,
            enrollment,
            reconciler,
            session,
            sync,
            signal,
            config_stale,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn port(&self) -> &Arc<dyn NativeCorePort> {
        &self.port
    }

    pub fn enrollment(&self) -> &Arc<EnrollmentManager> {
        &self.enrollment
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn session(&self) -> &Arc<SessionController> {
        &self.session
    }

    pub fn synchronizer(&self) -> &Arc<StateSynchronizer> {
        &self.sync
    }

    pub fn prefs(&self) -> &Arc<Preferences> {
        &self.prefs
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.sync.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.sync.subscribe()
    }

    /// Spawn the task that republishes on every component change.
    pub fn spawn_synchronizer(&self) -> tokio::task::JoinHandle<()> {
        let sync = self.sync.clone();
        tokio::spawn(sync.run(self.signal.subscribe()))
    }

    /// Background poller for this core.
    pub fn poller(&self) -> Poller {
        Poller::new(
            self.enrollment.clone(),
            self.reconciler.clone(),
            self.session.clone(),
            self.sync.clone(),
            self.config_stale.clone(),
            self.config.poll.clone(),
        )
    }

    // ========================================================================
    // Enrollment
    // ========================================================================

    /// Create an anonymous band and enroll this device in it.
    ///
    /// Once the device is enrolled the result is returned even if the
    /// follow-up refresh fails; a pending MFA challenge then shows up in the
    /// published snapshot.
    pub async fn create_band_and_enroll(
        &self,
        name: &str,
        description: &str,
        device_name: &str,
    ) -> Result<EnrollmentResult> {
        let result = self
            .enrollment
            .create_anonymous_band_and_enroll(name, description, device_name)
            .await?;
        self.after_enrollment(&result).await;
        Ok(result)
    }

    pub async fn join_band(
        &self,
        enrollment_token: &str,
        device_name: &str,
        secret: Option<&str>,
    ) -> Result<EnrollmentResult> {
        let result = self
            .enrollment
            .join_existing_band(enrollment_token, device_name, secret)
            .await?;
        self.after_enrollment(&result).await;
        Ok(result)
    }

    /// Switch the active band.
    ///
    /// The switch is committed before the follow-up refresh; a refresh error
    /// is still returned.
    pub async fn change_active_enrollment(&self, band_uuid: &str) -> Result<()> {
        self.enrollment.change_active_enrollment(band_uuid).await?;
        self.after_membership_change().await
    }

    pub async fn unenroll(&self, band_uuid: &str) -> Result<()> {
        let was_active = self.port.active_band_uuid().as_deref() == Some(band_uuid);
        if was_active {
            self.session.reset().await?;
        }
        self.enrollment.unenroll(band_uuid).await?;
        if was_active {
            self.reconciler.clear();
        }
        self.sync.publish();
        Ok(())
    }

    async fn after_enrollment(&self, result: &EnrollmentResult) {
        match result {
            EnrollmentResult::Enrolled { band } => {
                if let Err(e) = self.after_membership_change().await {
                    debug!(band_uuid = %band.uuid, "Enrollment kept despite: {}", e);
                }
            }
            EnrollmentResult::MfaRequired { .. } => {
                self.sync.publish();
            }
        }
    }

    async fn after_membership_change(&self) -> Result<()> {
        self.session.reset().await?;
        self.reconciler.clear();
        self.reconciler.load_cached();

        let refreshed = self.reconciler.refresh().await;
        if let Err(e) = &refreshed {
            warn!("Refresh after membership change failed: {}", e);
        }
        self.sync.publish();
        refreshed
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Refresh config and status now.
    pub async fn refresh(&self) -> Result<()> {
        let result = self.reconciler.refresh().await;
        self.sync.publish();
        result
    }

    // ========================================================================
    // Session
    // ========================================================================

    pub fn connect(&self) -> Result<SessionState> {
        let result = self.session.connect();
        self.sync.publish();
        result
    }

    pub fn on_permission_result(&self, granted: bool) -> Result<SessionState> {
        let result = self.session.on_permission_result(granted);
        self.sync.publish();
        result
    }

    pub async fn disconnect(&self) -> Result<SessionState> {
        let result = self.session.disconnect().await;
        self.sync.publish();
        result
    }

    // ========================================================================
    // Preferences
    // ========================================================================

    pub fn agree_terms(&self) -> Result<()> {
        self.prefs.agree_terms()?;
        self.sync.publish();
        Ok(())
    }

    /// Forget a pending MFA challenge, e.g. after the user finished SSO.
    pub fn reset_mfa(&self) -> Result<()> {
        self.prefs.reset_mfa()?;
        self.sync.publish();
        Ok(())
    }
}
