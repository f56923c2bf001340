//! Cleanup command - evict entries and reclaim orphaned temporaries

use crate::cli::operation::CleanupOverrides;
use crate::error::TreeCacheResult;
use crate::store::{format_bytes, Cache};
use crate::ui::{self, UiContext};
use std::process::ExitCode;

/// Execute the cleanup command
pub async fn execute(cache: &Cache, overrides: CleanupOverrides) -> TreeCacheResult<ExitCode> {
    let ctx = UiContext::detect();
    let tier = overrides
        .tier
        .unwrap_or_else(|| cache.topology().primary_tier());

    let mut request = cache.default_cleanup_request();
    request.cache_type = overrides.cache_type;
    if let Some(max_size) = overrides.max_size_bytes {
        request.max_size_bytes = max_size;
    }
    if overrides.max_age.is_some() {
        request.max_age = overrides.max_age;
    }

    let report = cache.cleanup(tier, request).await?;

    ui::step_ok(
        &ctx,
        &format!(
            "Removed {} entr{} from the {} tier, freed {}",
            report.removed.len(),
            if report.removed.len() == 1 { "y" } else { "ies" },
            tier,
            format_bytes(report.freed_bytes)
        ),
    );
    if !report.skipped_locked.is_empty() {
        ui::step_warn(
            &ctx,
            &format!(
                "Skipped {} entr{} in use; they will be retried on the next pass",
                report.skipped_locked.len(),
                if report.skipped_locked.len() == 1 { "y" } else { "ies" }
            ),
        );
    }
    if !report.broken_locks.is_empty() {
        ui::step_warn(
            &ctx,
            &format!(
                "Broke {} stale lock(s) held by hung jobs",
                report.broken_locks.len()
            ),
        );
    }
    if report.reclaimed_partials > 0 {
        ui::step_info(
            &ctx,
            &format!(
                "Reclaimed {} orphaned temporary file(s)",
                report.reclaimed_partials
            ),
        );
    }
    ui::step_info(
        &ctx,
        &format!("{} remaining", format_bytes(report.remaining_bytes)),
    );
    Ok(ExitCode::SUCCESS)
}
