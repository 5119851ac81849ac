//! `converge state list|show`

use anyhow::{Context as AnyhowContext, Result, bail};
use colored::Colorize;
use reconcile::{ResourceKey, StateRecord};

use crate::Context;
use crate::cli::StateCommand;
use crate::commands::open_state;
use crate::ui;

pub fn run(ctx: &Context, cmd: StateCommand) -> Result<()> {
    match cmd {
        StateCommand::List => list(ctx),
        StateCommand::Show { key } => show(ctx, &key),
    }
}

fn flags(record: &StateRecord) -> String {
    let mut flags = Vec::new();
    if record.tainted {
        flags.push("tainted".red().to_string());
    }
    if let Some(drift) = record.drift {
        flags.push(format!("drift: {drift}").yellow().to_string());
    }
    if !record.deposed.is_empty() {
        flags.push(format!("{} deposed", record.deposed.len()).yellow().to_string());
    }
    if flags.is_empty() {
        String::new()
    } else {
        format!(" [{}]", flags.join(", "))
    }
}

fn list(ctx: &Context) -> Result<()> {
    let state = open_state(ctx)?.snapshot();

    if state.resources.is_empty() {
        ui::info("No resources in state");
        return Ok(());
    }

    ui::header(&format!("State (serial {})", state.serial));
    for (key, record) in &state.resources {
        println!(
            "  {} {}{}",
            key.to_string().bold(),
            record.provider_id.dimmed(),
            flags(record)
        );
    }
    Ok(())
}

fn show(ctx: &Context, key: &str) -> Result<()> {
    let key: ResourceKey = key.parse()?;
    let state = open_state(ctx)?.snapshot();
    let Some(record) = state.get(&key) else {
        bail!("{key} is not in state");
    };

    ui::header(&key.to_string());
    ui::kv("provider id", &record.provider_id);
    ui::kv("updated", &record.updated_at.to_rfc3339());
    if !record.dependencies.is_empty() {
        let deps: Vec<String> = record.dependencies.iter().map(ToString::to_string).collect();
        ui::kv("depends on", &deps.join(", "));
    }
    if !record.deposed.is_empty() {
        let ids: Vec<&str> = record.deposed.iter().map(|d| d.provider_id.as_str()).collect();
        ui::kv("deposed", &ids.join(", "));
    }
    let status = flags(record);
    if !status.is_empty() {
        ui::kv("status", status.trim());
    }

    ui::section("Attributes");
    let attributes =
        serde_json::to_string_pretty(&record.attributes).context("Could not format attributes")?;
    for line in attributes.lines() {
        println!("  {line}");
    }
    Ok(())
}
