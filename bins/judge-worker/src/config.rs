// Worker and sandbox configuration
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::verdict::Phase;

/// Which queue backend the worker talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    Memory,
}

impl StoreBackend {
    fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "redis" => Some(StoreBackend::Redis),
            "memory" => Some(StoreBackend::Memory),
            _ => None,
        }
    }
}

/// Process-level settings, read from the environment.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub pool_size: usize,
    pub poll_interval: Duration,
    pub stale_after: Duration,
    pub reclaim_interval: Duration,
    pub drain_enabled: bool,
    pub drain_batch: usize,
    pub health_addr: SocketAddr,
    pub store_backend: StoreBackend,
    pub sandbox_config_path: PathBuf,
    pub json_logs: bool,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        let pool_size = env_or("WORKER_POOL_SIZE", 3usize);
        if pool_size == 0 {
            bail!("WORKER_POOL_SIZE must be at least 1");
        }

        let backend_raw = env::var("STORE_BACKEND").unwrap_or_else(|_| "redis".to_string());
        let store_backend = StoreBackend::parse(&backend_raw)
            .with_context(|| format!("Invalid STORE_BACKEND '{}' (expected redis or memory)", backend_raw))?;

        let health_raw = env::var("HEALTH_ADDR").unwrap_or_else(|_| "0.0.0.0:9090".to_string());
        let health_addr = health_raw
            .parse()
            .with_context(|| format!("Invalid HEALTH_ADDR '{}'", health_raw))?;

        Ok(Self {
            pool_size,
            poll_interval: Duration::from_millis(env_or("POLL_INTERVAL_MS", 3000)),
            stale_after: Duration::from_secs(env_or("STALE_AFTER_SECS", 600)),
            reclaim_interval: Duration::from_secs(env_or("RECLAIM_INTERVAL_SECS", 300)),
            drain_enabled: env_or("DRAIN_ENABLED", true),
            drain_batch: env_or("DRAIN_BATCH", 100usize).max(1),
            health_addr,
            store_backend,
            sandbox_config_path: env::var("SANDBOX_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("config/sandbox.json")),
            json_logs: env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        })
    }
}

/// Limits for one sandbox container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerLimits {
    pub image: String,
    pub pids_limit: i64,
    pub nofile: i64,
}

/// Everything the executor needs to provision sandboxes.
///
/// Loaded from `config/sandbox.json` when present. Missing fields fall back
/// to the defaults below, so a partial file only overrides what it names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub build: ContainerLimits,
    pub judge: ContainerLimits,
    pub cpuset: String,
    /// Added to the job's memory limit for the container's own processes.
    pub memory_overhead_mb: u64,
    pub max_memory_mb: u64,
    pub fsize_bytes: i64,
    pub stack_bytes: i64,
    pub guest_uid: u32,
    pub guest_gid: u32,
    pub stdout_max_bytes: usize,
    pub stderr_max_bytes: usize,
    /// Added on top of the job's time limit for the whole watchdog exec.
    pub exec_grace_ms: u64,
    pub chown_timeout_secs: u64,
    pub stop_timeout_secs: i64,
    pub work_dir: String,
    pub watchdog_path: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            build: ContainerLimits {
                image: "checker-lang-gcc".to_string(),
                pids_limit: 256,
                nofile: 768,
            },
            judge: ContainerLimits {
                image: "binary-runner".to_string(),
                pids_limit: 64,
                nofile: 128,
            },
            cpuset: "0".to_string(),
            memory_overhead_mb: 32,
            max_memory_mb: 1024,
            fsize_bytes: 10 * 1024 * 1024,
            stack_bytes: 8 * 1024 * 1024,
            guest_uid: 1002,
            guest_gid: 1002,
            stdout_max_bytes: 2 * 1024,
            stderr_max_bytes: 2 * 1024,
            exec_grace_ms: 5000,
            chown_timeout_secs: 30,
            stop_timeout_secs: 120,
            work_dir: "/home/guest".to_string(),
            watchdog_path: "/home/watchdog".to_string(),
        }
    }
}

impl Default for ContainerLimits {
    fn default() -> Self {
        SandboxConfig::default().judge
    }
}

impl SandboxConfig {
    /// Load sandbox settings from a JSON file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Sandbox config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))
    }

    /// Load from `path`, or use the built-in defaults if the file is absent.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn limits(&self, phase: Phase) -> &ContainerLimits {
        match phase {
            Phase::Build => &self.build,
            Phase::Judge => &self.judge,
        }
    }

    /// Container memory for a job: its limit plus overhead, capped.
    pub fn memory_bytes(&self, memory_mb: u64) -> i64 {
        let mb = memory_mb
            .saturating_add(self.memory_overhead_mb)
            .min(self.max_memory_mb);
        i64::try_from(mb.saturating_mul(1024 * 1024)).unwrap_or(i64::MAX)
    }

    /// Upper bound for one watchdog exec.
    pub fn exec_timeout(&self, time_ms: u64) -> Duration {
        Duration::from_millis(time_ms.saturating_add(self.exec_grace_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_memory_is_capped() {
        let config = SandboxConfig::default();
        assert_eq!(config.memory_bytes(256), (256 + 32) * 1024 * 1024);
        assert_eq!(config.memory_bytes(4096), 1024 * 1024 * 1024);
    }

    #[test]
    fn test_exec_timeout_adds_grace() {
        let config = SandboxConfig::default();
        assert_eq!(config.exec_timeout(2000), Duration::from_millis(7000));
    }

    #[test]
    fn test_huge_limits_saturate() {
        let config = SandboxConfig::default();
        assert_eq!(config.memory_bytes(u64::MAX), 1024 * 1024 * 1024);
        assert_eq!(config.exec_timeout(u64::MAX), Duration::from_millis(u64::MAX));

        let config = SandboxConfig {
            max_memory_mb: u64::MAX,
            ..SandboxConfig::default()
        };
        assert_eq!(config.memory_bytes(u64::MAX), i64::MAX);
    }

    #[test]
    fn test_phase_limits() {
        let config = SandboxConfig::default();
        assert_eq!(config.limits(Phase::Build).pids_limit, 256);
        assert_eq!(config.limits(Phase::Judge).pids_limit, 64);
        assert_eq!(config.limits(Phase::Build).image, "checker-lang-gcc");
        assert_eq!(config.limits(Phase::Judge).nofile, 128);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"cpuset": "1", "judge": {{"image": "runner:test"}}}}"#).unwrap();

        let config = SandboxConfig::load(file.path()).unwrap();
        assert_eq!(config.cpuset, "1");
        assert_eq!(config.judge.image, "runner:test");
        assert_eq!(config.judge.pids_limit, 64);
        assert_eq!(config.build, SandboxConfig::default().build);
        assert_eq!(config.guest_uid, 1002);
    }

    #[test]
    fn test_missing_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = SandboxConfig::load_or_default(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, SandboxConfig::default());
        assert!(SandboxConfig::load(&dir.path().join("absent.json")).is_err());
    }

    #[test]
    fn test_store_backend_parse() {
        assert_eq!(StoreBackend::parse("Redis"), Some(StoreBackend::Redis));
        assert_eq!(StoreBackend::parse("memory"), Some(StoreBackend::Memory));
        assert_eq!(StoreBackend::parse("postgres"), None);
    }
}
