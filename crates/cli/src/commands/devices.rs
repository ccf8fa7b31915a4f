//! Device and Link Commands

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;

use crate::output::{format_heartbeat, print_list, OutputFormat, TableDisplay};
use mudband_common::{ConfigLink, DeviceView};
use mudband_core::Core;

/// Device display wrapper for serialization
#[derive(Serialize)]
pub struct DeviceDisplay {
    pub name: String,
    pub private_ip: String,
    pub wireguard_pubkey: String,
    pub heartbeat_time: i64,
    pub last_seen: String,
}

impl From<&DeviceView> for DeviceDisplay {
    fn from(device: &DeviceView) -> Self {
        Self {
            name: device.name.clone(),
            private_ip: device.private_ip.clone(),
            wireguard_pubkey: device.wireguard_pubkey.clone(),
            heartbeat_time: device.heartbeat_time,
            last_seen: format_heartbeat(device.heartbeat_time, Utc::now()),
        }
    }
}

impl TableDisplay for DeviceDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Name", "Private IP", "Public Key", "Last Seen"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.private_ip.clone(),
            self.wireguard_pubkey.clone(),
            self.last_seen.clone(),
        ]
    }
}

impl TableDisplay for ConfigLink {
    fn headers() -> Vec<&'static str> {
        vec!["Name", "URL"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.name.clone(), self.url.clone()]
    }
}

/// List devices of the active band
pub fn devices(core: &Core, format: OutputFormat) -> Result<()> {
    let snapshot = core.snapshot();
    let devices: Vec<DeviceDisplay> = snapshot.devices.iter().map(DeviceDisplay::from).collect();
    print_list(&devices, format, "No devices in the active band.");
    Ok(())
}

/// List links published by the active band
pub fn links(core: &Core, format: OutputFormat) -> Result<()> {
    let snapshot = core.snapshot();
    print_list(&snapshot.links, format, "No links published.");
    Ok(())
}
