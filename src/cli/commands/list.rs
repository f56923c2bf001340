//! List command - show cached entries

use crate::cli::args::OutputFormat;
use crate::error::TreeCacheResult;
use crate::store::{format_bytes, Cache, EntrySummary, Tier};
use crate::ui::{self, UiContext};
use console::style;
use std::process::ExitCode;

/// Execute the list command
pub async fn execute(
    cache: &Cache,
    cache_type: Option<&str>,
    tier: Option<Tier>,
    format: OutputFormat,
) -> TreeCacheResult<ExitCode> {
    let tier = tier.unwrap_or_else(|| cache.topology().primary_tier());
    let mut entries = cache.list(tier, cache_type).await?;
    entries.sort_by(|a, b| b.last_access.cmp(&a.last_access).then_with(|| a.id.cmp(&b.id)));

    if entries.is_empty() {
        match format {
            OutputFormat::Json => println!("[]"),
            OutputFormat::Plain => {}
            OutputFormat::Table => {
                let ctx = UiContext::detect();
                ui::step_info(&ctx, &format!("No entries in the {} tier", tier));
            }
        }
        return Ok(ExitCode::SUCCESS);
    }

    match format {
        OutputFormat::Table => print_table(&entries),
        OutputFormat::Json => print_json(&entries)?,
        OutputFormat::Plain => print_plain(&entries),
    }

    Ok(ExitCode::SUCCESS)
}

fn print_table(entries: &[EntrySummary]) {
    println!(
        "{:<48} {:>10} {:<17} {:<7} {:<20}",
        style("ENTRY").bold(),
        style("SIZE").bold(),
        style("LAST ACCESS").bold(),
        style("IN USE").bold(),
        style("PRODUCED BY").bold()
    );
    println!("{}", "-".repeat(106));

    for entry in entries {
        let last_access = entry
            .last_access
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        let in_use = if entry.in_use {
            style("yes").yellow()
        } else {
            style("no").dim()
        };
        let producer = entry
            .metadata
            .as_ref()
            .map(|m| match m.job.job_id {
                Some(ref job) => format!("{} (job {})", m.host, job),
                None => m.host.clone(),
            })
            .unwrap_or_else(|| "unknown".to_string());

        println!(
            "{:<48} {:>10} {:<17} {:<7} {:<20}",
            entry.id.to_string(),
            format_bytes(entry.archive_bytes),
            last_access,
            in_use,
            producer
        );
    }

    let total: u64 = entries.iter().map(|e| e.archive_bytes).sum();
    println!();
    println!(
        "{} entr{}, {}",
        entries.len(),
        if entries.len() == 1 { "y" } else { "ies" },
        format_bytes(total)
    );
}

fn print_json(entries: &[EntrySummary]) -> TreeCacheResult<()> {
    let json = serde_json::to_string_pretty(entries)?;
    println!("{}", json);
    Ok(())
}

fn print_plain(entries: &[EntrySummary]) {
    for entry in entries {
        println!("{}", entry.id);
    }
}
