//! Band Commands

use anyhow::{bail, Result};
use clap::Subcommand;
use serde::Serialize;

use crate::output::{print_info, print_list, print_success, print_warning, OutputFormat, TableDisplay};
use mudband_common::{Band, EnrollmentResult, Error};
use mudband_core::{Core, NativeCorePort};

#[derive(Subcommand)]
pub enum BandCommands {
    /// Create an anonymous band and enroll this device in it
    Create {
        /// Band name
        name: String,

        /// Band description
        #[arg(short, long, default_value = "")]
        description: String,

        /// Name this device registers under
        #[arg(long)]
        device: Option<String>,
    },

    /// Join an existing band with an enrollment token
    Join {
        /// Enrollment token
        token: String,

        /// Name this device registers under
        #[arg(long)]
        device: Option<String>,

        /// Enrollment secret, for bands that require one
        #[arg(long, env = "MUDBAND_ENROLLMENT_SECRET")]
        secret: Option<String>,
    },

    /// Leave a band
    Leave {
        /// Band UUID
        uuid: String,
    },

    /// List enrolled bands
    List,

    /// Make a band the active one
    Use {
        /// Band UUID
        uuid: String,
    },
}

/// Band display wrapper for serialization
#[derive(Serialize)]
pub struct BandDisplay {
    pub uuid: String,
    pub name: String,
    pub public: bool,
    pub active: bool,
}

impl BandDisplay {
    fn new(band: Band, active: Option<&str>) -> Self {
        Self {
            active: active == Some(band.uuid.as_str()),
            uuid: band.uuid,
            name: band.name,
            public: band.is_public,
        }
    }
}

impl TableDisplay for BandDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["", "UUID", "Name", "Public"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            if self.active { "*".to_string() } else { String::new() },
            self.uuid.clone(),
            self.name.clone(),
            if self.public { "yes".to_string() } else { "no".to_string() },
        ]
    }
}

pub async fn execute(cmd: BandCommands, core: &Core, format: OutputFormat) -> Result<()> {
    match cmd {
        BandCommands::Create {
            name,
            description,
            device,
        } => {
            ensure_terms(core)?;
            let device = device_name(device);
            let result = core
                .create_band_and_enroll(&name, &description, &device)
                .await;
            report_enrollment(core, result)?;
        }

        BandCommands::Join {
            token,
            device,
            secret,
        } => {
            ensure_terms(core)?;
            let device = device_name(device);
            let result = core.join_band(&token, &device, secret.as_deref()).await;
            report_enrollment(core, result)?;
        }

        BandCommands::Leave { uuid } => {
            core.unenroll(&uuid).await?;
            print_success(&format!("Left band {}", uuid));
        }

        BandCommands::List => {
            let active = core.port().active_band_uuid();
            let bands: Vec<BandDisplay> = core
                .enrollment()
                .list_bands()
                .into_iter()
                .map(|band| BandDisplay::new(band, active.as_deref()))
                .collect();
            print_list(&bands, format, "No bands enrolled.");
        }

        BandCommands::Use { uuid } => {
            match core.change_active_enrollment(&uuid).await {
                Ok(()) => {}
                Err(e) if core.port().active_band_uuid().as_deref() == Some(uuid.as_str()) => {
                    print_warning(&format!("Switched, but refresh failed: {}", e));
                }
                Err(e) => return Err(e.into()),
            }
            print_success(&format!("Active band is now {}", uuid));
        }
    }

    Ok(())
}

fn ensure_terms(core: &Core) -> Result<()> {
    if !core.prefs().terms_agreed() {
        bail!("Terms of service not accepted yet; run `mudband tos --agree` first");
    }
    Ok(())
}

fn device_name(device: Option<String>) -> String {
    device
        .filter(|name| !name.trim().is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "mudband-device".to_string())
}

fn report_enrollment(core: &Core, result: mudband_common::Result<EnrollmentResult>) -> Result<()> {
    match result {
        Ok(EnrollmentResult::Enrolled { band }) => {
            print_success(&format!("Enrolled in band {} ({})", band.name, band.uuid));
            if let Some(url) = core.snapshot().enrollment.pending_mfa_url.clone() {
                print_warning(&format!("Band requires MFA before it can be used; complete it at {}", url));
            } else if core.reconciler().config().is_none() {
                print_warning("Band configuration not fetched yet; run `mudband refresh` later.");
            }
            Ok(())
        }
        Ok(EnrollmentResult::MfaRequired { sso_url }) => {
            print_info("This band requires single sign-on before the device is admitted.");
            print_info(&format!("Open {} and then run the command again.", sso_url));
            Ok(())
        }
        Err(Error::Enrollment { phase, source }) => {
            bail!("Enrollment failed during {}: {}", phase, source)
        }
        Err(e) => Err(e.into()),
    }
}
