//! State synchronizer
//!
//! Projects enrollment, reconciliation and session state into one
//! [`Snapshot`] and publishes it on a `tokio::sync::watch` channel. Components
//! bump a shared [`ChangeSignal`] whenever they change; [`StateSynchronizer::run`]
//! turns those bumps into publications.
//!
//! Publications are monotonic: every component version in a published
//! snapshot is greater than or equal to the one before it.

use crate::enrollment::EnrollmentManager;
use crate::prefs::Preferences;
use crate::reconcile::Reconciler;
use crate::session::SessionController;
use mudband_common::{ConfigLink, DeviceView, EnrollmentSummary, MfaState, SessionState};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Change notification shared by the components.
#[derive(Clone)]
pub struct ChangeSignal {
    tx: Arc<watch::Sender<u64>>,
}

impl ChangeSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    pub fn notify(&self) {
        self.tx.send_modify(|n| *n = n.wrapping_add(1));
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

impl Default for ChangeSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-component versions captured in a snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Versions {
    pub enrollment: u64,
    pub config: u64,
    pub session: u64,
}

impl Versions {
    /// Whether every component is at least as new as in `other`.
    pub fn dominates(&self, other: &Versions) -> bool {
        self.enrollment >= other.enrollment
            && self.config >= other.config
            && self.session >= other.session
    }
}

/// Everything a front-end renders
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    /// Publication counter, increases by one per published snapshot.
    pub version: u64,
    pub versions: Versions,
    pub enrollment: EnrollmentSummary,
    pub devices: Vec<DeviceView>,
    pub links: Vec<ConfigLink>,
    pub mfa: MfaState,
    pub session: SessionState,
}

impl Snapshot {
    fn same_content(&self, other: &Snapshot) -> bool {
        self.enrollment == other.enrollment
            && self.devices == other.devices
            && self.links == other.links
            && self.mfa == other.mfa
            && self.session == other.session
    }
}

/// Publishes [`Snapshot`]s
pub struct StateSynchronizer {
    enrollment: Arc<EnrollmentManager>,
    reconciler: Arc<Reconciler>,
    session: Arc<SessionController>,
    prefs: Arc<Preferences>,
    tx: watch::Sender<Arc<Snapshot>>,
    publish_lock: Mutex<()>,
}

impl StateSynchronizer {
    pub fn new(
        enrollment: Arc<EnrollmentManager>,
        reconciler: Arc<Reconciler>,
        session: Arc<SessionController>,
        prefs: Arc<Preferences>,
    ) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(Snapshot::default()));
        let sync = Self {
            enrollment,
            reconciler,
            session,
            prefs,
            tx,
            publish_lock: Mutex::new(()),
        };
        sync.publish();
        sync
    }

    /// Project current upstream state without publishing it.
    pub fn snapshot(&self) -> Snapshot {
        // Versions are read before the data they cover, so the data is
        // never older than the versions it is labelled with.
        let enrollment_version = self.enrollment.version();
        let session_version = self.session.version();
        let view = self.reconciler.view();

        Snapshot {
            version: 0,
            versions: Versions {
                enrollment: enrollment_version,
                config: view.version,
                session: session_version,
            },
            enrollment: self
                .enrollment
                .summary(self.prefs.terms_agreed(), self.prefs.pending_mfa_url()),
            devices: view.devices.as_ref().clone(),
            links: view
                .config
                .as_ref()
                .map(|config| config.links.clone())
                .unwrap_or_default(),
            mfa: view.mfa_state(),
            session: self.session.state(),
        }
    }

    /// Latest published snapshot
    pub fn current(&self) -> Arc<Snapshot> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.tx.subscribe()
    }

    /// Recompute and publish if anything changed.
    ///
    /// A projection that raced behind an already published one is dropped.
    pub fn publish(&self) -> Arc<Snapshot> {
        let _guard = self.publish_lock.lock();
        let previous = self.current();
        let mut next = self.snapshot();

        if !next.versions.dominates(&previous.versions) {
            debug!(
                previous = ?previous.versions,
                next = ?next.versions,
                "Dropping stale projection"
            );
            return previous;
        }
        if previous.version > 0 && next.versions == previous.versions && next.same_content(&previous) {
            trace!("Snapshot unchanged");
            return previous;
        }

        next.version = previous.version + 1;
        let next = Arc::new(next);
        self.tx.send_replace(next.clone());
        debug!(version = next.version, session = %next.session, "Snapshot published");
        next
    }

    /// Republish on every change signal until the signal is dropped.
    pub async fn run(self: Arc<Self>, mut changes: watch::Receiver<u64>) {
        while changes.changed().await.is_ok() {
            self.publish();
        }
    }
}
