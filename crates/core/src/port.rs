//! Native core port
//!
//! The capability surface every platform binding exposes to the core. Mobile
//! builds wrap foreign-function calls, the desktop build wraps its service
//! process; each supplies one adapter implementing [`NativeCorePort`] and the
//! managers receive it as an `Arc<dyn NativeCorePort>` at construction.
//!
//! Operations keep the native status-code convention (`0` is success) so that
//! adapters stay thin; [`check`] lifts a code into a typed error.

use mudband_common::{Error, Result, WireguardKeys};
use std::path::Path;

/// Operations the core depends on.
///
/// Every method is synchronous and may touch disk; callers on an async
/// runtime keep calls short or move them to a blocking task. `tunnel_loop`
/// runs one engine iteration, may block while waiting for packets, and must
/// only run on a dedicated blocking task.
pub trait NativeCorePort: Send + Sync {
    /// One-time setup of the state root.
    fn init(&self, root_dir: &Path) -> i32;

    fn is_enrolled(&self) -> bool;
    fn is_band_public(&self) -> bool;
    fn band_uuids(&self) -> Vec<String>;
    fn band_name_by_uuid(&self, uuid: &str) -> Option<String>;

    /// Switch the active band.
    fn change_enrollment(&self, uuid: &str);

    fn parse_enrollment_response(&self, private_key: &str, body: &str) -> i32;
    fn parse_config_response(&self, validation_token: Option<&str>, body: &str) -> i32;
    fn parse_unenrollment_response(&self, body: &str) -> i32;

    /// Apply an unenrollment reply to `uuid`. The active band only changes
    /// when it is the one removed.
    fn parse_unenrollment_response_for(&self, uuid: &str, body: &str) -> i32;

    fn band_config_etag(&self) -> Option<String>;
    fn band_config_string(&self) -> Option<String>;
    fn status_snapshot_string(&self) -> Option<String>;

    fn save_band_admin(&self, uuid: &str, token: &str) -> bool;
    fn band_admin(&self) -> Option<String>;

    fn create_wireguard_keys(&self) -> Option<WireguardKeys>;
    fn listen_port(&self) -> u16;
    fn if_addrs(&self) -> Vec<String>;
    fn stun_nat_type(&self) -> i32;
    fn stun_mapped_addr(&self) -> Option<String>;

    fn tunnel_init(&self, fd: i32) -> i32;
    fn tunnel_loop(&self) -> i32;
    fn tunnel_fini(&self);

    // Active band facts.
    fn active_band_uuid(&self) -> Option<String>;
    fn band_jwt(&self) -> Option<String>;
    fn band_jwt_by_uuid(&self, uuid: &str) -> Option<String>;
    fn active_band_name(&self) -> Option<String>;
    fn active_device_name(&self) -> Option<String>;
    fn active_private_ip(&self) -> Option<String>;
}

/// Lift a native status code into a `Result`.
pub fn check(code: i32, operation: &str) -> Result<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(Error::Parse(format!("{} rejected by native core (code {})", operation, code)))
    }
}

/// One return from `tunnel_loop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEvent {
    /// Nothing happened; call again.
    Idle,
    /// The engine saw a topology change; fetch config now.
    ConfigStale,
    /// The loop ended. After `tunnel_fini` this is the normal exit path.
    Aborted(i32),
}

impl LoopEvent {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => LoopEvent::Idle,
            1 => LoopEvent::ConfigStale,
            other => LoopEvent::Aborted(other),
        }
    }

    /// Codes in this range mean the engine hit an unrecoverable error.
    pub fn is_fatal_code(code: i32) -> bool {
        (101..=500).contains(&code)
    }
}
