//! Integration tests for treecache

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    /// Shared store, local accelerator and scratch space in one temp dir
    struct Env {
        dir: TempDir,
    }

    impl Env {
        fn new() -> Self {
            let env = Self {
                dir: TempDir::new().unwrap(),
            };
            fs::create_dir_all(env.shared()).unwrap();
            fs::create_dir_all(env.local()).unwrap();
            env
        }

        fn shared(&self) -> PathBuf {
            self.dir.path().join("shared")
        }

        fn local(&self) -> PathBuf {
            self.dir.path().join("local")
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }

        fn config(&self) -> PathBuf {
            self.path("config.toml")
        }

        fn treecache(&self) -> Command {
            let mut cmd = cargo_bin_cmd!("treecache");
            cmd.env("TREECACHE_CONFIG", self.config())
                .env("TREECACHE_SHARED_ROOT", self.shared())
                .env("TREECACHE_LOCAL_ROOT", self.local())
                .env("XDG_STATE_HOME", self.path("state"))
                .env_remove("RUST_LOG");
            cmd
        }

        fn source_with_files(&self, count: usize) -> PathBuf {
            let src = self.path("src");
            fs::create_dir_all(src.join("sub")).unwrap();
            for i in 0..count {
                let dir = if i < 3 { src.clone() } else { src.join("sub") };
                fs::write(dir.join(format!("f{}.dat", i)), format!("payload {}", i)).unwrap();
            }
            src
        }
    }

    fn files_under(root: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = walk(root)
            .into_iter()
            .map(|p| p.strip_prefix(root).unwrap().to_path_buf())
            .collect();
        files.sort();
        files
    }

    fn walk(dir: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                out.extend(walk(&path));
            } else {
                out.push(path);
            }
        }
        out
    }

    #[test]
    fn help_displays() {
        cargo_bin_cmd!("treecache")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("shared CI artifact cache"));
    }

    #[test]
    fn version_displays() {
        cargo_bin_cmd!("treecache")
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("treecache"));
    }

    #[test]
    fn put_then_get_restores_identical_files() {
        let env = Env::new();
        let src = env.source_with_files(5);
        let dest = env.path("dest");
        fs::create_dir_all(&dest).unwrap();

        env.treecache()
            .args(["put", "haf", "abc123"])
            .arg(&src)
            .assert()
            .success()
            .stderr(predicate::str::contains("Published haf/abc123"));

        env.treecache()
            .args(["get", "haf", "abc123"])
            .arg(&dest)
            .assert()
            .success();

        let restored = files_under(&dest);
        assert_eq!(restored, files_under(&src));
        assert_eq!(restored.len(), 5);
        for rel in restored {
            assert_eq!(fs::read(dest.join(&rel)).unwrap(), fs::read(src.join(&rel)).unwrap());
        }

        let journal = fs::read_to_string(env.path("state/treecache/events.log")).unwrap();
        assert!(journal.contains("put.published"));
    }

    #[test]
    fn miss_exits_2_and_leaves_dest_empty() {
        let env = Env::new();
        let dest = env.path("dest");
        fs::create_dir_all(&dest).unwrap();

        env.treecache()
            .args(["get", "haf", "missing-key"])
            .arg(&dest)
            .assert()
            .code(2)
            .stderr(predicate::str::contains("Cache miss"));

        assert_eq!(fs::read_dir(&dest).unwrap().count(), 0);
    }

    #[test]
    fn second_put_is_skipped() {
        let env = Env::new();
        let src = env.source_with_files(2);

        env.treecache().args(["put", "build", "k1"]).arg(&src).assert().success();
        env.treecache()
            .args(["put", "build", "k1"])
            .arg(&src)
            .assert()
            .success()
            .stderr(predicate::str::contains("already cached"));
    }

    #[test]
    fn stale_lock_does_not_block_put() {
        let env = Env::new();
        let src = env.source_with_files(1);
        let lock = env.shared().join("build").join("k2.lock");
        fs::create_dir_all(lock.parent().unwrap()).unwrap();
        fs::File::create(&lock)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(15 * 60))
            .unwrap();

        env.treecache()
            .args(["put", "build", "k2"])
            .arg(&src)
            .timeout(Duration::from_secs(60))
            .assert()
            .success();

        let age = SystemTime::now()
            .duration_since(fs::metadata(&lock).unwrap().modified().unwrap())
            .unwrap_or_default();
        assert!(age < Duration::from_secs(60));
    }

    #[test]
    fn cleanup_max_age_zero_empties_store() {
        let env = Env::new();
        let src = env.source_with_files(1);
        for key in ["a", "b", "c"] {
            env.treecache().args(["put", "build", key]).arg(&src).assert().success();
        }

        env.treecache()
            .args(["list", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::contains("build/a").and(predicate::str::contains("build/c")));

        env.treecache()
            .args(["cleanup", "--max-age-secs", "0"])
            .assert()
            .success()
            .stderr(predicate::str::contains("Removed 3 entries"));

        env.treecache()
            .args(["list", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::diff("[]\n"));
    }

    #[test]
    fn background_cleanup_uses_explicit_config() {
        let env = Env::new();
        let src = env.source_with_files(2);
        let custom = env.path("custom.toml");
        fs::write(
            &custom,
            "[eviction]\nmax_size_bytes = 1\nbackground = \"process\"\n",
        )
        .unwrap();

        env.treecache()
            .arg("--config")
            .arg(&custom)
            .args(["put", "build", "big"])
            .arg(&src)
            .assert()
            .success();

        // The detached child only evicts if it loaded the same ceiling
        let archive = env.shared().join("build").join("big.tar.zst");
        for _ in 0..200 {
            if !archive.exists() {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(!archive.exists());
    }

    #[test]
    fn list_json_includes_metadata() {
        let env = Env::new();
        let src = env.source_with_files(2);
        env.treecache().args(["put", "haf", "k9"]).arg(&src).assert().success();

        let output = env
            .treecache()
            .args(["list", "--format", "json"])
            .output()
            .unwrap();
        assert!(output.status.success());

        let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(parsed[0]["id"]["key"], "k9");
        assert_eq!(parsed[0]["metadata"]["payload"], "postgres");
    }

    #[test]
    fn status_json_reports_role() {
        let env = Env::new();
        env.treecache()
            .args(["status", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"role\": \"client\""));
    }

    #[test]
    fn invalid_key_is_rejected() {
        let env = Env::new();
        env.treecache()
            .args(["get", "haf", "../escape", "/tmp/unused"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid cache key"));
    }

    #[test]
    fn missing_source_fails() {
        let env = Env::new();
        env.treecache()
            .args(["put", "haf", "k"])
            .arg(env.path("does-not-exist"))
            .assert()
            .failure()
            .stderr(predicate::str::contains("Source directory not found"));
    }

    #[test]
    fn is_fast_host_reflects_config() {
        let env = Env::new();
        env.treecache()
            .arg("is-fast-host")
            .assert()
            .code(1)
            .stdout(predicate::str::diff("false\n"));

        fs::write(
            env.config(),
            format!(
                "[host]\nfast_hosts = [\"{}\"]\n",
                treecache::host::hostname()
            ),
        )
        .unwrap();
        env.treecache()
            .arg("is-fast-host")
            .assert()
            .success()
            .stdout(predicate::str::diff("true\n"));
    }

    #[test]
    fn invalid_config_is_reported() {
        let env = Env::new();
        fs::write(env.config(), "[eviction]\ntrigger_percent = 150\n").unwrap();
        env.treecache()
            .arg("status")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }
}
