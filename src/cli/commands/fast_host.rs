//! Host capability probe for job routing

use crate::error::TreeCacheResult;
use crate::store::Cache;
use std::process::ExitCode;

/// Print `true` or `false`; the exit status mirrors the answer
pub async fn execute(cache: &Cache) -> TreeCacheResult<ExitCode> {
    let fast = cache.is_fast_host();
    println!("{}", fast);
    Ok(if fast {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
