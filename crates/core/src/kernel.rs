//! Kernel WireGuard engine
//!
//! [`TunnelEngine`] for Linux hosts with the in-kernel WireGuard module. The
//! band config is rendered as `wg setconf` input and the interface is managed
//! with `ip`. Packets never pass through this process, so the loop only waits
//! for a stop request and watches for the interface disappearing.

use crate::local::{TunnelEngine, CODE_IO, CODE_MALFORMED, CODE_OK};
use crate::platform::HeadlessPlatform;
use parking_lot::{Condvar, Mutex};
use serde::Deserialize;
use std::fmt::Write as _;
use std::io::Write as _;
use std::net::Ipv4Addr;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Loop code after `fini`.
pub const CODE_STOPPED: i32 = 101;

/// Loop code when the interface vanished under a running tunnel.
pub const CODE_DEVICE_LOST: i32 = 102;

const KEEPALIVE_SECS: u16 = 25;

#[derive(Debug, Deserialize)]
struct EngineDocument {
    wireguard_privkey: String,
    interface: EngineInterface,
    #[serde(default)]
    peers: Vec<EnginePeer>,
}

#[derive(Debug, Deserialize)]
struct EngineInterface {
    private_ip: Ipv4Addr,
    #[serde(default = "default_mask")]
    private_mask: Ipv4Addr,
    #[serde(default)]
    listen_port: u16,
    #[serde(default)]
    mtu: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct EnginePeer {
    wireguard_pubkey: String,
    private_ip: Ipv4Addr,
    #[serde(default)]
    device_addresses: Vec<DeviceAddress>,
}

#[derive(Debug, Deserialize)]
struct DeviceAddress {
    address: Ipv4Addr,
    port: u16,
    #[serde(default, rename = "type")]
    kind: String,
}

fn default_mask() -> Ipv4Addr {
    Ipv4Addr::new(255, 255, 255, 0)
}

impl EngineDocument {
    fn parse(config: &str) -> Option<Self> {
        match serde_json::from_str::<Self>(config) {
            Ok(document) if !document.wireguard_privkey.is_empty() => Some(document),
            Ok(_) => {
                warn!("Band has no WireGuard private key");
                None
            }
            Err(e) => {
                warn!("Unusable config for kernel WireGuard: {}", e);
                None
            }
        }
    }

    /// Interface address in CIDR form.
    fn address(&self) -> String {
        let prefix = u32::from(self.interface.private_mask).count_ones();
        format!("{}/{}", self.interface.private_ip, prefix)
    }

    /// `wg setconf` input. Relay ("proxy") addresses need the userspace
    /// engine and are skipped.
    fn setconf(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "[Interface]");
        let _ = writeln!(out, "PrivateKey = {}", self.wireguard_privkey);
        if self.interface.listen_port != 0 {
            let _ = writeln!(out, "ListenPort = {}", self.interface.listen_port);
        }

        for peer in &self.peers {
            let _ = writeln!(out);
            let _ = writeln!(out, "[Peer]");
            let _ = writeln!(out, "PublicKey = {}", peer.wireguard_pubkey);
            let _ = writeln!(out, "AllowedIPs = {}/32", peer.private_ip);
            if let Some(direct) = peer.device_addresses.iter().find(|a| a.kind != "proxy") {
                let _ = writeln!(out, "Endpoint = {}:{}", direct.address, direct.port);
            }
            let _ = writeln!(out, "PersistentKeepalive = {}", KEEPALIVE_SECS);
        }
        out
    }
}

/// Kernel WireGuard engine bound to one interface name
pub struct KernelEngine {
    interface: String,
    poll_interval: Duration,
    stopped: Mutex<bool>,
    wake: Condvar,
    up: AtomicBool,
}

impl KernelEngine {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            poll_interval: Duration::from_secs(1),
            stopped: Mutex::new(false),
            wake: Condvar::new(),
            up: AtomicBool::new(false),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Whether the interface currently exists.
    pub fn is_up(&self) -> bool {
        Command::new("ip")
            .args(["link", "show", "dev", &self.interface])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    /// Delete the interface, whichever process created it. A tunnel loop
    /// running elsewhere ends with [`CODE_DEVICE_LOST`].
    pub fn tear_down(&self) -> bool {
        if !self.is_up() {
            return false;
        }
        match run("ip", &["link", "delete", "dev", &self.interface], None) {
            Ok(()) => {
                info!(interface = %self.interface, "WireGuard interface removed");
                true
            }
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }

    fn bring_up(&self, document: &EngineDocument) -> std::result::Result<(), String> {
        let name = self.interface.as_str();
        if self.is_up() {
            debug!(interface = %name, "Replacing leftover interface");
            run("ip", &["link", "delete", "dev", name], None)?;
        }

        run("ip", &["link", "add", "dev", name, "type", "wireguard"], None)?;
        run("wg", &["setconf", name, "/dev/stdin"], Some(&document.setconf()))?;
        run("ip", &["address", "add", &document.address(), "dev", name], None)?;
        if let Some(mtu) = document.interface.mtu.filter(|mtu| *mtu > 0) {
            run("ip", &["link", "set", "mtu", &mtu.to_string(), "dev", name], None)?;
        }
        run("ip", &["link", "set", "up", "dev", name], None)
    }
}

impl TunnelEngine for KernelEngine {
    fn init(&self, fd: i32, config: &str) -> i32 {
        if fd != HeadlessPlatform::ENGINE_OWNED_FD {
            debug!(fd, "Ignoring tunnel descriptor; the kernel owns the device");
        }
        let document = match EngineDocument::parse(config) {
            Some(document) => document,
            None => return CODE_MALFORMED,
        };
        *self.stopped.lock() = false;

        match self.bring_up(&document) {
            Ok(()) => {
                self.up.store(true, Ordering::SeqCst);
                info!(
                    interface = %self.interface,
                    address = %document.address(),
                    peers = document.peers.len(),
                    "WireGuard interface up"
                );
                CODE_OK
            }
            Err(e) => {
                warn!("Failed to bring up {}: {}", self.interface, e);
                let _ = run("ip", &["link", "delete", "dev", &self.interface], None);
                CODE_IO
            }
        }
    }

    fn run_once(&self) -> i32 {
        {
            let mut stopped = self.stopped.lock();
            if !*stopped {
                self.wake.wait_for(&mut stopped, self.poll_interval);
            }
            if *stopped {
                return CODE_STOPPED;
            }
        }

        if !self.is_up() {
            warn!(interface = %self.interface, "WireGuard interface disappeared");
            self.up.store(false, Ordering::SeqCst);
            return CODE_DEVICE_LOST;
        }
        CODE_OK
    }

    fn fini(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
        if self.up.swap(false, Ordering::SeqCst) {
            if let Err(e) = run("ip", &["link", "delete", "dev", &self.interface], None) {
                debug!("{}", e);
            }
        }
    }

    fn reload(&self, config: &str) -> i32 {
        if !self.up.load(Ordering::SeqCst) {
            return CODE_OK;
        }
        let document = match EngineDocument::parse(config) {
            Some(document) => document,
            None => return CODE_MALFORMED,
        };
        match run(
            "wg",
            &["syncconf", &self.interface, "/dev/stdin"],
            Some(&document.setconf()),
        ) {
            Ok(()) => {
                debug!(peers = document.peers.len(), "WireGuard peers synced");
                CODE_OK
            }
            Err(e) => {
                warn!("{}", e);
                CODE_IO
            }
        }
    }
}

/// Run a command, feeding `input` on stdin. Keys only ever travel this way.
fn run(program: &str, args: &[&str], input: Option<&str>) -> std::result::Result<(), String> {
    debug!(program, ?args, "Running");
    let mut child = Command::new(program)
        .args(args)
        .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("{}: {}", program, e))?;

    if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
        stdin
            .write_all(input.as_bytes())
            .map_err(|e| format!("{}: {}", program, e))?;
    }

    let output = child
        .wait_with_output()
        .map_err(|e| format!("{}: {}", program, e))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(format!(
            "{} {} failed: {}",
            program,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn document() -> String {
        json!({
            "wireguard_privkey": "cHJpdmF0ZQ==",
            "interface": {
                "private_ip": "100.64.0.1",
                "private_mask": "255.255.252.0",
                "listen_port": 51820,
                "mtu": 1420
            },
            "peers": [
                {
                    "wireguard_pubkey": "peer1",
                    "private_ip": "100.64.0.2",
                    "device_addresses": [
                        {"address": "198.51.100.1", "port": 40000, "type": "proxy"},
                        {"address": "203.0.113.7", "port": 51820, "type": "direct"}
                    ]
                },
                {"wireguard_pubkey": "peer2", "private_ip": "100.64.0.3", "device_addresses": []}
            ]
        })
        .to_string()
    }

    #[test]
    fn test_setconf_rendering() {
        let document = EngineDocument::parse(&document()).unwrap();
        assert_eq!(document.address(), "100.64.0.1/22");

        let setconf = document.setconf();
        assert!(setconf.starts_with("[Interface]\nPrivateKey = cHJpdmF0ZQ==\nListenPort = 51820\n"));
        assert_eq!(setconf.matches("[Peer]").count(), 2);
        assert!(setconf.contains("PublicKey = peer1\nAllowedIPs = 100.64.0.2/32\nEndpoint = 203.0.113.7:51820\n"));
        assert!(!setconf.contains("198.51.100.1"));
        assert!(setconf.contains("PublicKey = peer2\nAllowedIPs = 100.64.0.3/32\nPersistentKeepalive = 25\n"));
    }

    #[test]
    fn test_default_mask_is_slash_24() {
        let document = EngineDocument::parse(
            &json!({
                "wireguard_privkey": "k",
                "interface": {"private_ip": "100.64.0.9"}
            })
            .to_string(),
        )
        .unwrap();
        assert_eq!(document.address(), "100.64.0.9/24");
        assert!(!document.setconf().contains("ListenPort"));
    }

    #[test]
    fn test_unusable_documents_are_rejected() {
        let engine = KernelEngine::new("mudband-test0");
        assert_eq!(engine.init(-1, "{not json"), CODE_MALFORMED);

        let keyless = json!({"wireguard_privkey": "", "interface": {"private_ip": "100.64.0.1"}});
        assert_eq!(engine.init(-1, &keyless.to_string()), CODE_MALFORMED);

        let bad_ip = json!({"wireguard_privkey": "k", "interface": {"private_ip": "nope"}});
        assert_eq!(engine.init(-1, &bad_ip.to_string()), CODE_MALFORMED);
    }

    #[test]
    fn test_loop_returns_stopped_after_fini() {
        let engine = KernelEngine::new("mudband-test0");
        engine.fini();
        assert_eq!(engine.run_once(), CODE_STOPPED);
        assert_eq!(engine.reload(&document()), CODE_OK);
    }
}
