//! Tunnel session controller
//!
//! Drives the [`SessionState`] machine: connect is gated on an active
//! enrollment and a clear MFA state, permission comes from the
//! [`VpnPlatform`], and the native tunnel loop runs on a dedicated blocking
//! task that reports readiness and fatal errors back through
//! generation-tagged events. Stopping is cooperative: `tunnel_fini` asks the
//! loop to return and [`SessionController::disconnect`] waits for it.

use crate::enrollment::EnrollmentManager;
use crate::platform::{PermissionRequest, VpnPlatform};
use crate::port::{LoopEvent, NativeCorePort};
use crate::reconcile::Reconciler;
use crate::sync::ChangeSignal;
use mudband_common::{Error, Result, SessionState};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Inputs to the session state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ConnectRequested,
    PermissionGranted,
    PermissionDenied,
    TunnelReady,
    TunnelFailed(String),
    DisconnectRequested,
    TunnelStopped,
    Fatal(String),
    /// The OS service registry no longer lists the tunnel process.
    ServiceLost,
    /// Active band changed.
    Reset,
}

/// Next state for `event`, or `None` when the event does not apply.
pub fn transition(state: &SessionState, event: &SessionEvent) -> Option<SessionState> {
    use SessionEvent as E;
    use SessionState as S;

    match (state, event) {
        (S::Idle | S::Failed(_), E::ConnectRequested) => Some(S::AwaitingPermission),
        (S::AwaitingPermission, E::PermissionGranted) => Some(S::Connecting),
        (S::AwaitingPermission, E::PermissionDenied) => Some(S::Idle),
        (S::Connecting, E::TunnelReady) => Some(S::Connected),
        (S::Connecting, E::TunnelFailed(reason)) => Some(S::Failed(reason.clone())),
        (S::Connecting | S::Connected, E::DisconnectRequested) => Some(S::Disconnecting),
        (S::Idle | S::AwaitingPermission | S::Failed(_), E::DisconnectRequested) => Some(S::Idle),
        (S::Disconnecting, E::TunnelStopped) => Some(S::Idle),
        (_, E::Fatal(reason)) => Some(S::Failed(reason.clone())),
        (S::Connected, E::ServiceLost) => Some(S::Idle),
        (_, E::Reset) => Some(S::Idle),
        _ => None,
    }
}

struct Inner {
    state: SessionState,
    /// Identifies the current tunnel task; events from older tasks are dropped.
    generation: u64,
    stop: Arc<AtomicBool>,
    tunnel: Option<JoinHandle<()>>,
}

/// Tunnel session controller
pub struct SessionController {
    port: Arc<dyn NativeCorePort>,
    platform: Arc<dyn VpnPlatform>,
    enrollment: Arc<EnrollmentManager>,
    reconciler: Arc<Reconciler>,
    signal: ChangeSignal,
    config_stale: Arc<Notify>,
    runtime: Handle,
    inner: Mutex<Inner>,
    version: AtomicU64,
    lifecycle: tokio::sync::Mutex<()>,
}

impl SessionController {
    /// Must be called from within a Tokio runtime.
    pub fn new(
        port: Arc<dyn NativeCorePort>,
        platform: Arc<dyn VpnPlatform>,
        enrollment: Arc<EnrollmentManager>,
        reconciler: Arc<Reconciler>,
        signal: ChangeSignal,
        config_stale: Arc<Notify>,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|_| Error::State("session controller needs a Tokio runtime".into()))?;
        Ok(Self {
            port,
            platform,
            enrollment,
            reconciler,
            signal,
            config_stale,
            runtime,
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                generation: 0,
                stop: Arc::new(AtomicBool::new(false)),
                tunnel: None,
            }),
            version: AtomicU64::new(0),
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state.clone()
    }

    /// Human readable status line
    pub fn status_string(&self) -> String {
        self.state().to_string()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Request a tunnel session.
    ///
    /// Fails with `State` when no band is enrolled and with `MfaRequired`
    /// while an MFA challenge is outstanding; the session stays as it was.
    pub fn connect(self: &Arc<Self>) -> Result<SessionState> {
        if !self.enrollment.is_enrolled() {
            return Err(Error::State("no active band enrollment".into()));
        }
        let mfa = self.reconciler.mfa_state();
        if mfa.required {
            info!("Connect blocked until MFA completes");
            return Err(Error::MfaRequired { url: mfa.url });
        }

        {
            let mut inner = self.inner.lock();
            match &inner.state {
                SessionState::AwaitingPermission
                | SessionState::Connecting
                | SessionState::Connected => return Ok(inner.state.clone()),
                SessionState::Disconnecting => {
                    return Err(Error::State("disconnect in progress".into()))
                }
                SessionState::Idle | SessionState::Failed(_) => {}
            }
            self.apply(&mut inner, SessionEvent::ConnectRequested);
        }

        match self.platform.request_permission() {
            PermissionRequest::Granted => self.on_permission_result(true),
            PermissionRequest::Denied => self.on_permission_result(false),
            PermissionRequest::Pending => Ok(SessionState::AwaitingPermission),
        }
    }

    /// Deliver the platform's answer to a permission prompt.
    pub fn on_permission_result(self: &Arc<Self>, granted: bool) -> Result<SessionState> {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::AwaitingPermission {
            debug!(state = %inner.state, "Ignoring permission answer");
            return Ok(inner.state.clone());
        }

        if !granted {
            self.apply(&mut inner, SessionEvent::PermissionDenied);
            warn!("VPN permission denied");
            return Err(Error::PermissionDenied);
        }

        self.apply(&mut inner, SessionEvent::PermissionGranted);
        inner.generation += 1;
        let generation = inner.generation;
        let stop = Arc::new(AtomicBool::new(false));
        inner.stop = stop.clone();
        let previous = inner.tunnel.take();

        let controller = Arc::clone(self);
        inner.tunnel = Some(self.runtime.spawn_blocking(move || {
            controller.run_tunnel(generation, stop, previous)
        }));
        Ok(SessionState::Connecting)
    }

    /// Stop the tunnel and wait for the loop to exit. Idempotent.
    pub async fn disconnect(&self) -> Result<SessionState> {
        let _lifecycle = self.lifecycle.lock().await;

        let (tunnel, stop, running) = {
            let mut inner = self.inner.lock();
            let running = matches!(inner.state, SessionState::Connecting | SessionState::Connected);
            self.apply(&mut inner, SessionEvent::DisconnectRequested);
            (inner.tunnel.take(), inner.stop.clone(), running)
        };

        if running {
            stop.store(true, Ordering::SeqCst);
            self.port.tunnel_fini();
        }
        if let Some(tunnel) = tunnel {
            if let Err(e) = tunnel.await {
                warn!("Tunnel task ended abnormally: {}", e);
            }
        }

        let mut inner = self.inner.lock();
        if running {
            self.apply(&mut inner, SessionEvent::TunnelStopped);
            info!("Tunnel stopped");
        }
        Ok(inner.state.clone())
    }

    /// Return to Idle after the active band changed.
    pub async fn reset(&self) -> Result<SessionState> {
        self.disconnect().await?;
        let mut inner = self.inner.lock();
        self.apply(&mut inner, SessionEvent::Reset);
        Ok(inner.state.clone())
    }

    /// Correct a Connected state whose OS service has disappeared. The tunnel
    /// loop has exited by the time Idle is reported.
    ///
    /// Returns whether the state was changed.
    pub async fn reconcile_with_os(&self) -> bool {
        let _lifecycle = self.lifecycle.lock().await;

        let tunnel = {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Connected || self.platform.is_service_running() {
                return false;
            }
            warn!("Tunnel service no longer running, resetting session");
            inner.stop.store(true, Ordering::SeqCst);
            inner.tunnel.take()
        };

        self.port.tunnel_fini();
        if let Some(tunnel) = tunnel {
            if let Err(e) = tunnel.await {
                warn!("Tunnel task ended abnormally: {}", e);
            }
        }

        let mut inner = self.inner.lock();
        self.apply(&mut inner, SessionEvent::ServiceLost);
        true
    }

    // ========================================================================
    // Tunnel task
    // ========================================================================

    fn run_tunnel(&self, generation: u64, stop: Arc<AtomicBool>, previous: Option<JoinHandle<()>>) {
        // A loop stopped in the background must be gone before the port is
        // initialised again.
        if let Some(previous) = previous {
            if let Err(e) = self.runtime.block_on(previous) {
                warn!("Previous tunnel task ended abnormally: {}", e);
            }
        }
        if stop.load(Ordering::SeqCst) {
            return;
        }

        let fd = match self.platform.establish() {
            Ok(fd) => fd,
            Err(e) => {
                self.task_event(generation, SessionEvent::TunnelFailed(format!("tunnel device: {}", e)));
                return;
            }
        };

        let code = self.port.tunnel_init(fd);
        if code != 0 {
            self.port.tunnel_fini();
            self.task_event(
                generation,
                SessionEvent::TunnelFailed(format!("tunnel init returned {}", code)),
            );
            return;
        }
        if stop.load(Ordering::SeqCst) {
            self.port.tunnel_fini();
            return;
        }
        self.task_event(generation, SessionEvent::TunnelReady);
        info!("Tunnel loop started");

        let aborted = loop {
            match LoopEvent::from_code(self.port.tunnel_loop()) {
                LoopEvent::Idle => {}
                LoopEvent::ConfigStale => {
                    debug!("Tunnel reports stale config");
                    self.config_stale.notify_one();
                }
                LoopEvent::Aborted(code) => {
                    break (!stop.load(Ordering::SeqCst)).then_some(code);
                }
            }
            if stop.load(Ordering::SeqCst) {
                break None;
            }
        };

        match aborted {
            None => debug!("Tunnel loop exited"),
            Some(code) => {
                self.port.tunnel_fini();
                let reason = if LoopEvent::is_fatal_code(code) {
                    format!("fatal tunnel error (code {})", code)
                } else {
                    format!("tunnel loop ended unexpectedly (code {})", code)
                };
                error!(code, "Tunnel loop aborted");
                self.task_event(generation, SessionEvent::Fatal(reason));
            }
        }
    }

    fn task_event(&self, generation: u64, event: SessionEvent) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            debug!(?event, "Dropping event from a previous tunnel task");
            return;
        }
        if transition(&inner.state, &event).is_none() {
            debug!(?event, state = %inner.state, "Event does not apply");
            return;
        }
        self.apply(&mut inner, event);
    }

    fn apply(&self, inner: &mut Inner, event: SessionEvent) {
        let next = match transition(&inner.state, &event) {
            Some(next) => next,
            None => return,
        };
        if next == inner.state {
            return;
        }
        info!(from = %inner.state, to = %next, "Session state changed");
        inner.state = next;
        self.version.fetch_add(1, Ordering::SeqCst);
        self.signal.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_path() {
        let mut state = SessionState::Idle;
        for (event, expected) in [
            (SessionEvent::ConnectRequested, SessionState::AwaitingPermission),
            (SessionEvent::PermissionGranted, SessionState::Connecting),
            (SessionEvent::TunnelReady, SessionState::Connected),
            (SessionEvent::DisconnectRequested, SessionState::Disconnecting),
            (SessionEvent::TunnelStopped, SessionState::Idle),
        ] {
            state = transition(&state, &event).unwrap();
            assert_eq!(state, expected);
        }
    }

    #[test]
    fn test_denied_and_failed_paths() {
        assert_eq!(
            transition(&SessionState::AwaitingPermission, &SessionEvent::PermissionDenied),
            Some(SessionState::Idle)
        );
        assert_eq!(
            transition(&SessionState::Connecting, &SessionEvent::TunnelFailed("init".into())),
            Some(SessionState::Failed("init".into()))
        );
        assert_eq!(
            transition(&SessionState::Connected, &SessionEvent::Fatal("loop".into())),
            Some(SessionState::Failed("loop".into()))
        );
        assert_eq!(
            transition(&SessionState::Failed("loop".into()), &SessionEvent::ConnectRequested),
            Some(SessionState::AwaitingPermission)
        );
    }

    #[test]
    fn test_rejected_events() {
        assert_eq!(transition(&SessionState::Idle, &SessionEvent::TunnelReady), None);
        assert_eq!(transition(&SessionState::Connected, &SessionEvent::ConnectRequested), None);
        assert_eq!(transition(&SessionState::Idle, &SessionEvent::ServiceLost), None);
        assert_eq!(
            transition(&SessionState::Disconnecting, &SessionEvent::TunnelReady),
            None
        );
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        assert_eq!(
            transition(&SessionState::Idle, &SessionEvent::DisconnectRequested),
            Some(SessionState::Idle)
        );
    }
}
