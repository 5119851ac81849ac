//! Apply progress bar

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use reconcile::{ActionKind, ActionReport, ApplyReport, Outcome, PlanAction, ProgressCallback};

/// Progress bar over the changing actions of a plan.
pub struct ApplyProgress {
    bar: ProgressBar,
    running: Vec<String>,
}

impl ApplyProgress {
    pub fn new(quiet: bool) -> Self {
        let bar = if quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(0)
        };
        if let Ok(style) =
            ProgressStyle::default_bar().template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(style.progress_chars("=>-"));
        }
        Self {
            bar,
            running: Vec::new(),
        }
    }

    fn update_message(&self) {
        match self.running.as_slice() {
            [] => self.bar.set_message(""),
            [only] => self.bar.set_message(only.clone()),
            [first, rest @ ..] => self
                .bar
                .set_message(format!("{first} (+{} more)", rest.len())),
        }
    }
}

impl ProgressCallback for ApplyProgress {
    fn on_apply_start(&mut self, total: usize) {
        self.bar.set_length(total as u64);
    }

    fn on_action_start(&mut self, action: &PlanAction) {
        self.running.push(format!("{} {}", action.kind, action.key));
        self.update_message();
    }

    fn on_action_complete(&mut self, report: &ActionReport) {
        if report.kind == ActionKind::NoOp {
            let length = self.bar.length().unwrap_or(0);
            self.bar.set_length(length.saturating_sub(1));
            return;
        }

        let label = format!("{} {}", report.kind, report.key);
        self.running.retain(|r| r != &label);
        self.update_message();
        self.bar.inc(1);

        match &report.outcome {
            Outcome::Succeeded { .. } => {
                self.bar
                    .suspend(|| println!("  {} {label}", "✓".green()));
            }
            Outcome::Failed { error, .. } => {
                self.bar
                    .suspend(|| println!("  {} {label}: {error}", "✗".red()));
            }
            Outcome::Skipped { .. } => {}
        }
    }

    fn on_apply_complete(&mut self, _report: &ApplyReport) {
        self.bar.finish_and_clear();
    }
}
