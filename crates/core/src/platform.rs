//! OS VPN integration
//!
//! Each front-end supplies a [`VpnPlatform`] wrapping its VPN service API:
//! the permission prompt, opening the tunnel device, and asking the OS service
//! registry whether the tunnel process is still alive.

use mudband_common::Result;

/// Answer to a permission request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionRequest {
    /// Permission was already held or granted synchronously.
    Granted,
    Denied,
    /// A prompt is showing; the answer arrives through
    /// [`SessionController::on_permission_result`](crate::session::SessionController::on_permission_result).
    Pending,
}

/// Platform VPN service
pub trait VpnPlatform: Send + Sync {
    fn request_permission(&self) -> PermissionRequest;

    /// Open the tunnel device and return its file descriptor.
    fn establish(&self) -> Result<i32>;

    /// Whether the OS still runs the tunnel service.
    fn is_service_running(&self) -> bool;
}

/// Platform for hosts where the tunnel runs inside this process and no
/// permission prompt exists (desktop service, CLI).
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessPlatform;

impl HeadlessPlatform {
    /// Descriptor telling the engine to open its own device.
    pub const ENGINE_OWNED_FD: i32 = -1;
}

impl VpnPlatform for HeadlessPlatform {
    fn request_permission(&self) -> PermissionRequest {
        PermissionRequest::Granted
    }

    fn establish(&self) -> Result<i32> {
        Ok(Self::ENGINE_OWNED_FD)
    }

    fn is_service_running(&self) -> bool {
        true
    }
}
