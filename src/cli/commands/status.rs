//! Status command - topology and tier usage

use crate::cli::args::OutputFormat;
use crate::error::TreeCacheResult;
use crate::store::{format_bytes, Cache, CacheSizeStatus, StatusReport};
use crate::ui::{self, UiContext};
use console::style;
use std::process::ExitCode;

/// Execute the status command
pub async fn execute(cache: &Cache, format: OutputFormat) -> TreeCacheResult<ExitCode> {
    let report = cache.status().await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Plain => print_plain(&report),
        OutputFormat::Table => print_table(&report),
    }
    Ok(ExitCode::SUCCESS)
}

fn print_table(report: &StatusReport) {
    let ctx = UiContext::detect();
    println!("{}", style("Treecache Status").bold().cyan());
    ui::key_value(&ctx, "Host", &report.host);
    ui::key_value(&ctx, "Role", report.role);
    ui::key_value(&ctx, "Topology", &report.topology);
    ui::key_value_status(
        &ctx,
        "Fast host",
        if report.fast_host { "yes" } else { "no" },
        report.fast_host,
    );

    for tier in &report.tiers {
        ui::section(&format!("{} tier", capitalize(&tier.tier.to_string())));
        ui::key_value(&ctx, "Root", &tier.root.display().to_string());
        ui::key_value(&ctx, "Entries", &tier.entries.to_string());

        let usage = match tier.limit_bytes {
            Some(limit) => format!(
                "{} / {} ({:.0}%)",
                format_bytes(tier.bytes),
                format_bytes(limit),
                tier.percent
            ),
            None => format!("{} (no ceiling)", format_bytes(tier.bytes)),
        };
        ui::key_value_status(&ctx, "Usage", &usage, tier.status == CacheSizeStatus::Ok);

        if tier.leftovers > 0 {
            ui::key_value_status(
                &ctx,
                "Orphaned temporaries",
                &tier.leftovers.to_string(),
                false,
            );
        }
    }
}

fn print_plain(report: &StatusReport) {
    println!("host={}", report.host);
    println!("role={}", report.role);
    println!("fast_host={}", report.fast_host);
    for tier in &report.tiers {
        println!("{}.root={}", tier.tier, tier.root.display());
        println!("{}.entries={}", tier.tier, tier.entries);
        println!("{}.bytes={}", tier.tier, tier.bytes);
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
