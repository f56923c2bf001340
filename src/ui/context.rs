//! UI context for detecting interactive vs CI environments

use std::io::IsTerminal;

/// UI context that determines output behavior
#[derive(Debug, Clone)]
pub struct UiContext {
    /// Whether running in an interactive terminal
    interactive: bool,
}

impl UiContext {
    /// Detect the current environment
    pub fn detect() -> Self {
        Self {
            interactive: Self::detect_interactive(|name| std::env::var_os(name).is_some()),
        }
    }

    /// Create a non-interactive context (for testing or explicit CI mode)
    pub fn non_interactive() -> Self {
        Self { interactive: false }
    }

    /// Check if we're in an interactive terminal
    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    /// Check if we should use fancy output (spinners, colors)
    pub fn use_fancy_output(&self) -> bool {
        self.interactive
    }

    fn detect_interactive(is_set: impl Fn(&str) -> bool) -> bool {
        if !std::io::stderr().is_terminal() {
            return false;
        }
        !is_ci(is_set)
    }
}

/// Whether any common CI environment marker is set
fn is_ci(is_set: impl Fn(&str) -> bool) -> bool {
    const CI_VARS: [&str; 6] = [
        "CI",
        "GITLAB_CI",
        "GITHUB_ACTIONS",
        "JENKINS_URL",
        "BUILDKITE",
        "TF_BUILD",
    ];
    CI_VARS.iter().any(|var| is_set(var))
}
