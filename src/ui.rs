use colored::{ColoredString, Colorize};
use reconcile::{
    ActionKind, ApplyReport, DriftWarning, LockRecord, Outcome, Plan, PlanAction, RefreshReport,
};

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a section header
pub fn section(title: &str) {
    println!();
    println!("{}", title.cyan().bold());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

// ============================================================================
// Plans and reports
// ============================================================================

fn symbol(action: &PlanAction) -> ColoredString {
    if action.replacement {
        return "±".magenta().bold();
    }
    match action.kind {
        ActionKind::Create => "+".green().bold(),
        ActionKind::Update => "~".yellow().bold(),
        ActionKind::Delete => "-".red().bold(),
        ActionKind::NoOp => " ".normal(),
    }
}

/// One line per plan action, e.g. `+ network.vpc1 (not yet created)`.
pub fn action_line(action: &PlanAction) -> String {
    let verb = if action.replacement {
        format!("{}, replacement", action.kind)
    } else {
        action.kind.to_string()
    };
    format!(
        "  {} {} {}",
        symbol(action),
        action.key.to_string().bold(),
        format!("({verb}: {})", action.reason).dimmed()
    )
}

pub fn print_plan(plan: &Plan) {
    if plan.is_empty() {
        success("No changes. Infrastructure matches the configuration.");
        return;
    }

    header("Plan");
    for action in plan.changes() {
        println!("{}", action_line(action));
    }

    let summary = plan.summary();
    println!();
    println!(
        "  {} {} to create, {} to update, {} to replace, {} to delete",
        "Plan:".bold(),
        summary.create.to_string().green(),
        summary.update.to_string().yellow(),
        summary.replace.to_string().magenta(),
        summary.delete.to_string().red(),
    );
}

pub fn print_report(report: &ApplyReport) {
    let summary = report.summary();

    let failures: Vec<_> = report.failures().collect();
    if !failures.is_empty() {
        section("Failed");
        for action in failures {
            if let Outcome::Failed {
                error,
                tainted,
                ..
            } = &action.outcome
            {
                let note = if *tainted { " (tainted)" } else { "" };
                println!(
                    "  {} {} {}{}",
                    "✗".red(),
                    format!("{} {}", action.kind, action.key).bold(),
                    error,
                    note.yellow()
                );
            }
        }
    }

    let skipped: Vec<_> = report
        .actions
        .iter()
        .filter(|a| a.outcome.is_skipped())
        .collect();
    if !skipped.is_empty() {
        section("Skipped");
        for action in skipped {
            if let Outcome::Skipped { reason } = &action.outcome {
                dim(&format!("{} {}: {reason}", action.kind, action.key));
            }
        }
    }

    println!();
    if report.is_success() {
        println!("  {} Apply complete!", "✓".green().bold());
    } else {
        println!("  {} Apply finished with errors", "⚠".yellow().bold());
    }
    if summary.succeeded > 0 {
        println!("    • {} actions succeeded", summary.succeeded);
    }
    if summary.skipped > 0 {
        println!("    • {} actions skipped", summary.skipped);
    }
    if summary.failed > 0 {
        println!("    • {} {} failed", summary.failed, "actions".red());
    }
    dim(&format!("finished in {:.1}s", report.duration.as_secs_f64()));
}

fn drift_line(warning: &DriftWarning) -> String {
    if warning.changed.is_empty() {
        format!("{} ({})", warning.key, warning.kind)
    } else {
        format!(
            "{} ({}: {})",
            warning.key,
            warning.kind,
            warning.changed.join(", ")
        )
    }
}

pub fn print_refresh(report: &RefreshReport) {
    if !report.drift.is_empty() {
        section("Drift");
        for warning in &report.drift {
            warn(&drift_line(warning));
        }
    }
    if !report.errors.is_empty() {
        section("Unreadable");
        for (key, e) in &report.errors {
            error(&format!("{key}: {e}"));
        }
    }

    println!();
    if report.has_drift() {
        info(&format!(
            "{} of {} resources drifted; the next apply will repair them",
            report.drift.len(),
            report.checked
        ));
    } else {
        success(&format!("{} resources match their stored state", report.checked));
    }
}

pub fn print_lock(label: &str, record: &LockRecord, stale: bool) {
    let age = chrono::Utc::now() - record.heartbeat_at;
    let status = if stale {
        "stale".yellow().to_string()
    } else {
        "live".green().to_string()
    };
    println!("  {} {} [{status}]", label.bold(), record.owner_id);
    kv("acquired", &record.acquired_at.to_rfc3339());
    kv("last heartbeat", &format!("{}s ago", age.num_seconds()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconcile::{ChangeReason, ResourceKey};

    fn action(kind: ActionKind, replacement: bool) -> PlanAction {
        PlanAction {
            index: 0,
            kind,
            key: ResourceKey::new("network", "vpc1"),
            reason: ChangeReason::New,
            replacement,
            old: None,
            new: None,
            new_hash: None,
            provider_id: None,
            dependencies: Vec::new(),
            depends_on: Vec::new(),
        }
    }

    #[test]
    fn test_action_line_names_key_and_reason() {
        colored::control::set_override(false);
        assert_eq!(
            action_line(&action(ActionKind::Create, false)),
            "  + network.vpc1 (create: not yet created)"
        );
        assert_eq!(
            action_line(&action(ActionKind::Delete, true)),
            "  ± network.vpc1 (delete, replacement: not yet created)"
        );
    }

    #[test]
    fn test_drift_line_lists_changed_attributes() {
        let warning = DriftWarning {
            key: ResourceKey::new("subnet", "sub1"),
            kind: reconcile::DriftKind::Changed,
            changed: vec!["cidr".to_string()],
        };
        assert_eq!(drift_line(&warning), "subnet.sub1 (changed: cidr)");
    }
}
