//! `converge refresh`

use anyhow::Result;

use crate::Context;
use crate::commands::open_engine;
use crate::ui;

pub fn run(ctx: &Context) -> Result<()> {
    let engine = open_engine(ctx)?;
    let report = engine.refresh()?;
    if !ctx.quiet || report.has_drift() {
        ui::print_refresh(&report);
    }
    Ok(())
}
