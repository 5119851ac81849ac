//! `converge plan`

use anyhow::{Context as AnyhowContext, Result};
use reconcile::PlanMode;

use crate::Context;
use crate::cli::PlanArgs;
use crate::commands::{load_definitions, open_engine};
use crate::ui;

pub fn run(ctx: &Context, args: PlanArgs) -> Result<()> {
    let model = load_definitions(&args.dir)?;
    let mut engine = open_engine(ctx)?;
    if args.refresh {
        let options = reconcile::EngineOptions {
            refresh: true,
            ..engine.options().clone()
        };
        engine = engine.with_options(options);
    }

    let mode = if args.destroy {
        PlanMode::Destroy
    } else {
        PlanMode::Normal
    };
    let plan = engine.plan(&model, mode)?;

    if args.json {
        println!("{}", plan.to_json().context("Could not serialize plan")?);
    } else {
        ui::print_plan(&plan);
    }

    if let Some(out) = &args.out {
        plan.save(out)
            .with_context(|| format!("Could not save plan to {}", out.display()))?;
        if !args.json && !ctx.quiet {
            println!();
            ui::info(&format!(
                "Saved plan to {}. Run `converge apply --plan {}` to apply it.",
                out.display(),
                out.display()
            ));
        }
    }
    Ok(())
}
