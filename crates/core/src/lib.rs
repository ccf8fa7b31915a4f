//! Mud.band Client Core
//!
//! Band enrollment, config/status reconciliation and the tunnel session state
//! machine, shared by every Mud.band front-end. Platform specifics enter only
//! through [`NativeCorePort`], [`ControlPlane`] and [`VpnPlatform`].

pub mod app;
pub mod config;
pub mod control;
pub mod enrollment;
pub mod kernel;
pub mod local;
pub mod platform;
pub mod poller;
pub mod port;
pub mod prefs;
pub mod reconcile;
pub mod session;
pub mod sync;

pub use app::Core;
pub use config::CoreConfig;
pub use control::{ControlPlane, HttpControlPlane};
pub use enrollment::EnrollmentManager;
pub use kernel::KernelEngine;
pub use local::{LocalCorePort, TunnelEngine};
pub use platform::{HeadlessPlatform, PermissionRequest, VpnPlatform};
pub use poller::Poller;
pub use port::{LoopEvent, NativeCorePort};
pub use prefs::Preferences;
pub use reconcile::{ConfigRefresh, Reconciler, StatusRefresh};
pub use session::SessionController;
pub use sync::{Snapshot, StateSynchronizer};
