//! Terminal output for treecache commands
//!
//! Progress narration goes to stderr so that machine-readable output on
//! stdout (`list --format json`, `is-fast-host`) stays clean. Spinners and
//! colours are only used in an interactive terminal outside CI.

mod context;
mod output;
mod progress;

pub use context::UiContext;
pub use output::{key_value, key_value_status, section, step_info, step_ok, step_warn};
pub use progress::TaskSpinner;
