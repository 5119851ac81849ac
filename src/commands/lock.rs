//! `converge lock status|force-unlock`

use anyhow::{Context as AnyhowContext, Result};
use chrono::Utc;
use dialoguer::Confirm;

use crate::Context;
use crate::cli::LockCommand;
use crate::commands::lock_manager;
use crate::ui;

pub fn run(ctx: &Context, cmd: LockCommand) -> Result<()> {
    match cmd {
        LockCommand::Status => status(ctx),
        LockCommand::ForceUnlock { owner, yes } => force_unlock(ctx, &owner, yes),
    }
}

fn status(ctx: &Context) -> Result<()> {
    let locks = lock_manager(ctx);
    let status = locks.status()?;

    if status.is_unlocked() {
        ui::success("State is not locked");
        return Ok(());
    }

    let now = Utc::now();
    ui::header("State lock");
    if let Some(record) = &status.exclusive {
        ui::print_lock("exclusive", record, record.is_stale(now, locks.staleness()));
    }
    for record in &status.shared {
        ui::print_lock("shared", record, record.is_stale(now, locks.staleness()));
    }
    Ok(())
}

fn force_unlock(ctx: &Context, owner: &str, yes: bool) -> Result<()> {
    if !yes {
        ui::warn(&format!(
            "Only remove the lock if no converge run by {owner} is still active."
        ));
        let confirmed = Confirm::new()
            .with_prompt("Remove the lock?")
            .default(false)
            .interact()
            .context("Could not read confirmation (use --yes when not running in a terminal)")?;
        if !confirmed {
            return Ok(());
        }
    }

    if lock_manager(ctx).force_unlock(owner)? {
        ui::success(&format!("Removed the state lock held by {owner}"));
    } else {
        ui::info(&format!("{owner} does not hold the state lock"));
    }
    Ok(())
}
