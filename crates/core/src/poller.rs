//! Background refresh loop
//!
//! Periodically reconciles local state with the control plane and the OS:
//! config and status are refreshed together, the session is checked against
//! the service registry, and the snapshot is republished.

use crate::config::PollConfig;
use crate::enrollment::EnrollmentManager;
use crate::reconcile::Reconciler;
use crate::session::SessionController;
use crate::sync::StateSynchronizer;
use mudband_common::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Poller driving periodic refreshes
pub struct Poller {
    enrollment: Arc<EnrollmentManager>,
    reconciler: Arc<Reconciler>,
    session: Arc<SessionController>,
    sync: Arc<StateSynchronizer>,
    config_stale: Arc<Notify>,
    poll: PollConfig,
}

impl Poller {
    pub fn new(
        enrollment: Arc<EnrollmentManager>,
        reconciler: Arc<Reconciler>,
        session: Arc<SessionController>,
        sync: Arc<StateSynchronizer>,
        config_stale: Arc<Notify>,
        poll: PollConfig,
    ) -> Self {
        Self {
            enrollment,
            reconciler,
            session,
            sync,
            config_stale,
            poll,
        }
    }

    /// Run until `shutdown` flips to true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Poller started");

        let mut last_config: Option<Instant> = None;
        let mut last_status: Option<Instant> = None;
        let mut force_config = true;

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.poll_once(&mut last_config, &mut last_status, force_config)
                .await;
            force_config = false;

            tokio::select! {
                _ = tokio::time::sleep(self.poll.tick()) => {}
                _ = self.config_stale.notified() => {
                    debug!("Config refresh requested by tunnel");
                    force_config = true;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Poller stopped");
    }

    async fn poll_once(
        &self,
        last_config: &mut Option<Instant>,
        last_status: &mut Option<Instant>,
        force_config: bool,
    ) {
        if self.enrollment.is_enrolled() {
            let now = Instant::now();
            let config_due = force_config
                || due(*last_config, now, Duration::from_secs(self.poll.config_interval_secs));
            let status_due =
                due(*last_status, now, Duration::from_secs(self.poll.status_interval_secs));

            if config_due {
                *last_config = Some(now);
            }
            if status_due {
                *last_status = Some(now);
            }

            let token = self.reconciler.validation_token();
            let (config, status) = tokio::join!(
                async {
                    if config_due {
                        Some(self.reconciler.refresh_config(token.as_deref()).await)
                    } else {
                        None
                    }
                },
                async {
                    if status_due {
                        Some(self.reconciler.refresh_status().await)
                    } else {
                        None
                    }
                }
            );

            match config {
                Some(Err(Error::MfaRequired { .. })) => {
                    info!("Band requires MFA; waiting for the user to complete it");
                }
                Some(Err(e)) => warn!("Config refresh failed: {}", e),
                _ => {}
            }
            if let Some(Err(e)) = status {
                warn!("Status refresh failed: {}", e);
            }
        }

        if self.session.reconcile_with_os().await {
            info!("Session corrected from OS service registry");
        }
        self.sync.publish();
    }
}

fn due(last: Option<Instant>, now: Instant, interval: Duration) -> bool {
    last.map_or(true, |last| now.duration_since(last) >= interval)
}
