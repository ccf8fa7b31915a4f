//! Up and Down Commands

use anyhow::Result;
use clap::Args;
use tokio::sync::watch;

use super::status::session_label;
use crate::output::{print_info, print_success, print_warning};
use mudband_common::{Error, SessionState};
use mudband_core::{Core, KernelEngine};

#[derive(Args)]
pub struct UpArgs {
    /// Print every published snapshot as JSON lines
    #[arg(long)]
    pub json: bool,
}

/// Connect to the active band and stay connected until interrupted.
pub async fn up(args: UpArgs, core: &Core) -> Result<()> {
    match core.connect() {
        Ok(state) => tracing::debug!(%state, "Connect requested"),
        Err(Error::MfaRequired { url }) => {
            print_warning(&format!("Band requires MFA; complete it at {}", url));
            return Ok(());
        }
        Err(Error::State(message)) => {
            print_warning(&format!("Cannot connect: {}", message));
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }

    let sync = core.spawn_synchronizer();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = core.poller();
    let mut snapshots = core.subscribe();

    let poll = async move { poller.run(shutdown_rx).await };
    tokio::pin!(poll);

    let mut last = core.session().state();
    if !args.json {
        println!("session={}", session_label(&last));
    }
    let mut interrupted = false;
    loop {
        tokio::select! {
            _ = &mut poll => break,
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                let _ = shutdown_tx.send(true);
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                if snapshot.session == last {
                    continue;
                }
                last = snapshot.session.clone();
                if args.json {
                    println!("{}", serde_json::to_string(snapshot.as_ref())?);
                } else {
                    println!("session={}", session_label(&last));
                }
                if !last.is_active() && last != SessionState::AwaitingPermission {
                    let _ = shutdown_tx.send(true);
                }
            }
        }
    }

    let state = core.disconnect().await?;
    sync.abort();

    match last {
        SessionState::Failed(reason) => print_warning(&format!("Tunnel stopped: {}", reason)),
        _ if interrupted => print_success(&format!("Disconnected ({})", state)),
        _ => print_info(&format!("Session ended ({})", state)),
    }
    Ok(())
}

/// Remove the band interface, ending a tunnel held by another `up`.
pub async fn down(core: &Core) -> Result<()> {
    let engine = KernelEngine::new(core.config().tunnel.interface.clone());
    let removed = engine.tear_down();
    core.disconnect().await?;

    if removed {
        print_success(&format!("Interface {} is down", engine.interface()));
    } else {
        print_info(&format!("Interface {} is not up", engine.interface()));
    }
    Ok(())
}
