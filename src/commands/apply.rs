//! `converge apply`
//!
//! Plans under a shared lock, shows the plan, asks for confirmation, then
//! applies exactly that plan. If another run changed the state in between,
//! the apply is refused instead of acting on an outdated plan.

use anyhow::{Context as AnyhowContext, Result, bail};
use dialoguer::Confirm;
use reconcile::{ApplyReport, CancelToken, Engine, EngineOptions, FailurePolicy, Plan, PlanMode};

use crate::Context;
use crate::cli::ApplyArgs;
use crate::commands::{load_definitions, open_engine};
use crate::progress::ApplyProgress;
use crate::ui;

pub fn run(ctx: &Context, args: ApplyArgs) -> Result<()> {
    let engine = configure(open_engine(ctx)?, &args);

    let plan = match &args.plan {
        Some(path) => {
            Plan::load(path).with_context(|| format!("Could not load plan {}", path.display()))?
        }
        None => {
            let model = load_definitions(&args.dir)?;
            let mode = if args.destroy {
                PlanMode::Destroy
            } else {
                PlanMode::Normal
            };
            engine.plan(&model, mode)?
        }
    };

    ui::print_plan(&plan);
    if plan.is_empty() {
        return Ok(());
    }

    if !args.yes && !confirm_proceed(plan.mode)? {
        ui::warn("Apply cancelled");
        return Ok(());
    }
    println!();

    cancel_on_interrupt(&engine);
    let mut progress = ApplyProgress::new(ctx.quiet);
    let report = engine.apply_plan(plan, &mut progress)?;
    ui::print_report(&report);

    check_report(&report)
}

/// Ctrl-C stops scheduling; running actions finish and are recorded. A
/// second Ctrl-C exits immediately.
fn cancel_on_interrupt(engine: &Engine) {
    let token = engine.cancel_token();
    let installed = ctrlc::set_handler(move || {
        if interrupt(&token) {
            ui::error("Interrupted again, exiting without waiting for running actions");
            std::process::exit(130);
        }
    });
    if let Err(e) = installed {
        log::warn!("Could not install Ctrl-C handler: {e}");
    }
}

/// Returns true when the apply was already cancelled.
fn interrupt(token: &CancelToken) -> bool {
    if token.is_cancelled() {
        return true;
    }
    ui::warn("Interrupted; waiting for running actions to finish (Ctrl-C again to exit)");
    token.cancel();
    false
}

fn check_report(report: &ApplyReport) -> Result<()> {
    if report.is_success() {
        return Ok(());
    }
    let summary = report.summary();
    if summary.failed > 0 {
        bail!("{} actions failed", summary.failed);
    }
    bail!("{} actions did not run", summary.skipped)
}

fn configure(engine: Engine, args: &ApplyArgs) -> Engine {
    let mut options: EngineOptions = engine.options().clone();
    if let Some(jobs) = args.jobs {
        options.workers = jobs.max(1);
    }
    if args.keep_going {
        options.failure_policy = FailurePolicy::ContinueIndependent;
    }
    if args.refresh {
        options.refresh = true;
    }
    engine.with_options(options)
}

/// Confirm with user
fn confirm_proceed(mode: PlanMode) -> Result<bool> {
    let (prompt, default) = match mode {
        PlanMode::Normal => ("Apply these changes?", true),
        PlanMode::Destroy => ("Destroy every resource listed above?", false),
    };

    let confirmed = Confirm::new()
        .with_prompt(prompt)
        .default(default)
        .interact()
        .context("Could not read confirmation (use --yes when not running in a terminal)")?;

    Ok(confirmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconcile::{ActionKind, ActionReport, Outcome, SkipReason};
    use std::time::Duration;

    fn action(outcome: Outcome) -> ActionReport {
        ActionReport {
            index: 0,
            key: "app.web".parse().unwrap(),
            kind: ActionKind::Create,
            replacement: false,
            outcome,
            attempts: 0,
            duration: Duration::ZERO,
        }
    }

    #[test]
    fn test_interrupt_cancels_then_escalates() {
        let token = CancelToken::new();
        assert!(!interrupt(&token));
        assert!(token.is_cancelled());
        assert!(interrupt(&token));
    }

    #[test]
    fn test_skipped_actions_fail_the_apply() {
        let cancelled = ApplyReport {
            actions: vec![action(Outcome::Skipped {
                reason: SkipReason::Cancelled,
            })],
            duration: Duration::ZERO,
        };
        let err = check_report(&cancelled).unwrap_err();
        assert_eq!(err.to_string(), "1 actions did not run");

        let succeeded = ApplyReport {
            actions: vec![action(Outcome::Succeeded {
                provider_called: true,
            })],
            duration: Duration::ZERO,
        };
        assert!(check_report(&succeeded).is_ok());
    }
}
