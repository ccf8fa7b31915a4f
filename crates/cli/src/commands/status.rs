//! Status, Refresh and Watch Commands

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tokio::sync::watch;

use crate::output::{print_item, print_success, print_warning, OutputFormat, TableDisplay};
use mudband_common::{Error, SessionState};
use mudband_core::{Core, Snapshot};

/// Status display wrapper for serialization
#[derive(Serialize)]
pub struct StatusDisplay {
    pub enrolled: bool,
    pub band: String,
    pub band_uuid: String,
    pub device: String,
    pub session: SessionState,
    pub devices: usize,
    pub mfa_required: bool,
    pub mfa_url: Option<String>,
    pub terms_agreed: bool,
}

impl From<&Snapshot> for StatusDisplay {
    fn from(snapshot: &Snapshot) -> Self {
        let band = snapshot.enrollment.active_band.as_ref();
        let mfa_url = if snapshot.mfa.required {
            Some(snapshot.mfa.url.clone())
        } else {
            snapshot.enrollment.pending_mfa_url.clone()
        };

        Self {
            enrolled: snapshot.enrollment.enrolled,
            band: band.map(|b| b.name.clone()).unwrap_or_default(),
            band_uuid: band.map(|b| b.uuid.clone()).unwrap_or_default(),
            device: snapshot.enrollment.device_name.clone().unwrap_or_default(),
            session: snapshot.session.clone(),
            devices: snapshot.devices.len(),
            mfa_required: snapshot.mfa.required,
            mfa_url,
            terms_agreed: snapshot.enrollment.terms_agreed,
        }
    }
}

impl TableDisplay for StatusDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Band", "UUID", "Device", "Session", "Devices", "MFA"]
    }

    fn row(&self) -> Vec<String> {
        if !self.enrolled {
            return vec![
                "(not enrolled)".to_string(),
                String::new(),
                String::new(),
                self.session.to_string(),
                "0".to_string(),
                String::new(),
            ];
        }

        vec![
            self.band.clone(),
            self.band_uuid.clone(),
            self.device.clone(),
            session_label(&self.session),
            self.devices.to_string(),
            match (&self.mfa_url, self.mfa_required) {
                (Some(url), _) => format!("required: {}", url),
                (None, true) => "required".to_string(),
                (None, false) => "-".to_string(),
            },
        ]
    }
}

pub(crate) fn session_label(state: &SessionState) -> String {
    let label = state.to_string();
    match state {
        SessionState::Connected => label.green().to_string(),
        SessionState::Failed(_) => label.red().to_string(),
        SessionState::Idle => label,
        _ => label.yellow().to_string(),
    }
}

/// Show the current snapshot
pub fn status(core: &Core, format: OutputFormat) -> Result<()> {
    let snapshot = core.snapshot();
    print_item(&StatusDisplay::from(snapshot.as_ref()), format);
    if !snapshot.enrollment.terms_agreed {
        print_warning("Terms of service not accepted; run `mudband tos --agree`.");
    }
    Ok(())
}

/// Fetch config and status now
pub async fn refresh(core: &Core) -> Result<()> {
    match core.refresh().await {
        Ok(()) => {
            print_success("Band state refreshed");
            Ok(())
        }
        Err(Error::MfaRequired { url }) => {
            print_warning(&format!("Band requires MFA; complete it at {}", url));
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[derive(Args)]
pub struct WatchArgs {
    /// Print every published snapshot as JSON lines
    #[arg(long)]
    pub json: bool,
}

/// Run the poller and print snapshots until interrupted
pub async fn watch(args: WatchArgs, core: &Core) -> Result<()> {
    let sync = core.spawn_synchronizer();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = core.poller();
    let mut snapshots = core.subscribe();

    let poll = async move { poller.run(shutdown_rx).await };
    tokio::pin!(poll);

    let mut last = 0;
    loop {
        tokio::select! {
            _ = &mut poll => break,
            _ = tokio::signal::ctrl_c() => {
                let _ = shutdown_tx.send(true);
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                if snapshot.version == last {
                    continue;
                }
                last = snapshot.version;
                if args.json {
                    println!("{}", serde_json::to_string(snapshot.as_ref())?);
                } else {
                    render_line(&snapshot);
                }
            }
        }
    }

    sync.abort();
    Ok(())
}

fn render_line(snapshot: &Snapshot) {
    let status = StatusDisplay::from(snapshot);
    let band = if status.enrolled {
        status.band.bold().to_string()
    } else {
        "(not enrolled)".dimmed().to_string()
    };
    let mfa = match &status.mfa_url {
        Some(url) => format!(" mfa={}", url),
        None => String::new(),
    };
    println!(
        "[{}] {} session={} devices={}{}",
        snapshot.version,
        band,
        session_label(&status.session),
        status.devices,
        mfa
    );
}
