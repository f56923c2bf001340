//! Host and CI job identity, plus the fast-host capability probe
//!
//! Identity is recorded in lock side records and entry metadata so a
//! stuck lock or a suspicious archive can be traced back to the job that
//! produced it.

use crate::config::schema::HostConfig;
use crate::store::topology::StorageTopology;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Name of this host as reported by the OS
pub fn hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

/// CI job that the current process belongs to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobIdentity {
    /// CI job id (`CI_JOB_ID`)
    pub job_id: Option<String>,
    /// CI pipeline id (`CI_PIPELINE_ID`)
    pub pipeline_id: Option<String>,
    /// Project path (`CI_PROJECT_PATH`)
    pub project: Option<String>,
}

impl JobIdentity {
    /// Read identity from GitLab CI environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());
        Self {
            job_id: get("CI_JOB_ID"),
            pipeline_id: get("CI_PIPELINE_ID"),
            project: get("CI_PROJECT_PATH"),
        }
    }
}

/// Decide whether this host should receive expensive jobs
///
/// Consumed by the external scheduler; the cache core never calls it.
pub fn is_fast_host(config: &HostConfig, topology: &StorageTopology) -> bool {
    let name = hostname();
    let short = name.split('.').next().unwrap_or(&name);

    if config
        .fast_hosts
        .iter()
        .any(|h| h.eq_ignore_ascii_case(&name) || h.eq_ignore_ascii_case(short))
    {
        debug!("{} is listed in host.fast_hosts", name);
        return true;
    }

    if config.coordinator_is_fast && topology.is_coordinator() {
        debug!("{} serves the shared store locally", name);
        return true;
    }

    if config.min_cpus > 0 {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        debug!("{} has {} CPUs (threshold {})", name, cpus, config.min_cpus);
        return cpus >= config.min_cpus;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;

    #[test]
    fn job_identity_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("CI_JOB_ID", "4242"),
            ("CI_PIPELINE_ID", "99"),
            ("CI_PROJECT_PATH", ""),
        ]
        .into_iter()
        .collect();

        let id = JobIdentity::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(id.job_id.as_deref(), Some("4242"));
        assert_eq!(id.pipeline_id.as_deref(), Some("99"));
        assert_eq!(id.project, None);
    }

    #[test]
    #[serial_test::serial]
    fn job_identity_from_env() {
        std::env::set_var("CI_JOB_ID", "555");
        std::env::remove_var("CI_PIPELINE_ID");
        let id = JobIdentity::from_env();
        std::env::remove_var("CI_JOB_ID");

        assert_eq!(id.job_id.as_deref(), Some("555"));
        assert_eq!(id.pipeline_id, None);
    }

    #[test]
    fn hostname_not_empty() {
        assert!(!hostname().is_empty());
    }

    #[test]
    fn listed_host_is_fast() {
        let config = HostConfig {
            fast_hosts: vec![hostname()],
            min_cpus: 0,
            coordinator_is_fast: false,
        };
        let topology = StorageTopology::LocalOnly {
            local: PathBuf::from("/tmp"),
        };
        assert!(is_fast_host(&config, &topology));
    }

    #[test]
    fn coordinator_is_fast_by_default() {
        let topology = StorageTopology::Coordinator {
            root: PathBuf::from("/tmp"),
        };
        assert!(is_fast_host(&HostConfig::default(), &topology));

        let client = StorageTopology::LocalOnly {
            local: PathBuf::from("/tmp"),
        };
        assert!(!is_fast_host(&HostConfig::default(), &client));
    }

    #[test]
    fn cpu_threshold() {
        let topology = StorageTopology::LocalOnly {
            local: PathBuf::from("/tmp"),
        };
        let config = HostConfig {
            fast_hosts: vec![],
            min_cpus: 1,
            coordinator_is_fast: false,
        };
        assert!(is_fast_host(&config, &topology));

        let config = HostConfig {
            min_cpus: usize::MAX,
            ..config
        };
        assert!(!is_fast_host(&config, &topology));
    }
}
