//! Put command - publish a tree to the cache

use crate::error::TreeCacheResult;
use crate::store::{format_bytes, Cache, EntryId, PutOutcome};
use crate::ui::{TaskSpinner, UiContext};
use std::path::Path;
use std::process::ExitCode;

/// Execute the put command
pub async fn execute(cache: &Cache, id: &EntryId, source: &Path) -> TreeCacheResult<ExitCode> {
    let ctx = UiContext::detect();
    let mut spinner = TaskSpinner::new(&ctx);
    spinner.start(&format!("Archiving {} as {}", source.display(), id));

    let outcome = match cache.put(id, source).await {
        Ok(outcome) => outcome,
        Err(e) => {
            spinner.clear();
            return Err(e);
        }
    };

    match outcome {
        PutOutcome::Published { archive_bytes } => {
            spinner.stop(&format!("Published {} ({})", id, format_bytes(archive_bytes)))
        }
        PutOutcome::AlreadyPresent => spinner.stop(&format!("{} is already cached", id)),
        PutOutcome::LocalOnly { archive_bytes } => spinner.stop_warn(&format!(
            "Shared store unreachable, kept {} locally ({})",
            id,
            format_bytes(archive_bytes)
        )),
    }
    Ok(ExitCode::SUCCESS)
}
