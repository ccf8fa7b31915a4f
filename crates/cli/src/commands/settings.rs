//! Terms of Service and MFA Commands

use anyhow::Result;
use clap::{Args, Subcommand};

use crate::output::{print_message, print_success, OutputFormat};
use mudband_core::Core;

const TERMS_URL: &str = "https://mud.band/policies/terms";
const PRIVACY_URL: &str = "https://mud.band/policies/privacy";

#[derive(Args)]
pub struct TosArgs {
    /// Accept the terms of service
    #[arg(long)]
    pub agree: bool,
}

#[derive(Subcommand)]
pub enum MfaCommands {
    /// Forget a pending MFA challenge after completing single sign-on
    Reset,
}

pub fn tos(args: TosArgs, core: &Core, format: OutputFormat) -> Result<()> {
    if args.agree {
        core.agree_terms()?;
        print_success("Terms of service accepted");
        return Ok(());
    }

    if core.prefs().terms_agreed() {
        print_message("Terms of service already accepted.", format);
    } else {
        print_message(
            &format!(
                "Review {} and {}, then run `mudband tos --agree`.",
                TERMS_URL, PRIVACY_URL
            ),
            format,
        );
    }
    Ok(())
}

pub async fn mfa(cmd: MfaCommands, core: &Core) -> Result<()> {
    match cmd {
        MfaCommands::Reset => {
            core.reset_mfa()?;
            if let Err(e) = core.refresh().await {
                tracing::warn!("Refresh after MFA reset failed: {}", e);
            }
            print_success("MFA state reset");
        }
    }
    Ok(())
}
