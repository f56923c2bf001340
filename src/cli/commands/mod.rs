//! CLI command implementations

pub mod cleanup;
pub mod fast_host;
pub mod get;
pub mod list;
pub mod put;
pub mod status;

pub use cleanup::execute as cleanup;
pub use fast_host::execute as fast_host;
pub use get::execute as get;
pub use list::execute as list;
pub use put::execute as put;
pub use status::execute as status;

use crate::cli::operation::Operation;
use crate::error::TreeCacheResult;
use crate::store::Cache;
use std::process::ExitCode;

/// Run a validated operation against the cache
pub async fn dispatch(cache: &Cache, operation: Operation) -> TreeCacheResult<ExitCode> {
    match operation {
        Operation::Get { id, dest } => get(cache, &id, &dest).await,
        Operation::Put { id, source } => put(cache, &id, &source).await,
        Operation::Cleanup(overrides) => cleanup(cache, overrides).await,
        Operation::List {
            cache_type,
            tier,
            format,
        } => list(cache, cache_type.as_deref(), tier, format).await,
        Operation::Status { format } => status(cache, format).await,
        Operation::IsFastHost => fast_host(cache).await,
    }
}
