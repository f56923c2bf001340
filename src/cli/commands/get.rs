//! Get command - restore a cached tree

use crate::error::TreeCacheResult;
use crate::store::{Cache, EntryId, GetOutcome};
use crate::ui::{TaskSpinner, UiContext};
use std::path::Path;
use std::process::ExitCode;

/// Exit status reported for a cache miss
pub const MISS_EXIT: u8 = 2;

/// Execute the get command
pub async fn execute(cache: &Cache, id: &EntryId, dest: &Path) -> TreeCacheResult<ExitCode> {
    let ctx = UiContext::detect();
    let mut spinner = TaskSpinner::new(&ctx);
    spinner.start(&format!("Restoring {}", id));

    match cache.get(id, dest).await {
        Ok(GetOutcome::Hit { tier }) => {
            spinner.stop(&format!(
                "Restored {} from {} tier into {}",
                id,
                tier,
                dest.display()
            ));
            Ok(ExitCode::SUCCESS)
        }
        Ok(GetOutcome::Miss) => {
            spinner.stop_warn(&format!("Cache miss for {}", id));
            Ok(ExitCode::from(MISS_EXIT))
        }
        Err(e) if e.is_miss_equivalent() => {
            spinner.stop_warn(&format!("Cached {} is unusable, treating as miss: {}", id, e));
            Ok(ExitCode::from(MISS_EXIT))
        }
        Err(e) => {
            spinner.clear();
            Err(e)
        }
    }
}
