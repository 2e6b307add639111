/// Container Runtime - the narrow seam between the executor and a container engine
///
/// **Responsibility:**
/// Provision volumes and containers, copy files in, run commands, tear down.
///
/// **What it does NOT do:**
/// - Decide verdicts (verdict.rs)
/// - Know about jobs, tasks, or the watchdog protocol (executor.rs)
///
/// Production uses `DockerRuntime` (docker.rs). Tests script a fake
/// implementation so the executor's lifecycle can be exercised without a
/// daemon.
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Resource limits and image for one sandbox container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub volume: String,
    /// Mount point of the volume, also the working directory.
    pub work_dir: String,
    pub cpuset: String,
    pub memory_bytes: i64,
    pub pids_limit: i64,
    pub nofile: i64,
    pub fsize_bytes: i64,
    pub stack_bytes: i64,
    pub stop_timeout_secs: i64,
}

/// One command to run inside a started container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub cmd: Vec<String>,
    /// Written to the process's stdin, which is then closed. `None` leaves
    /// stdin detached.
    pub stdin: Option<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub env: Vec<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// `None` if the runtime could not report an exit code.
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum ExecError {
    /// The command outlived its timeout. `partial` holds whatever output was
    /// collected before giving up.
    #[error("command timed out after {timeout:?}")]
    TimedOut { timeout: Duration, partial: ExecOutput },

    #[error("command cancelled by shutdown")]
    Cancelled { partial: ExecOutput },

    #[error(transparent)]
    Runtime(#[from] anyhow::Error),
}

impl ExecError {
    /// Output captured before a timeout or cancellation cut the command short.
    pub fn partial(&self) -> Option<&ExecOutput> {
        match self {
            ExecError::TimedOut { partial, .. } | ExecError::Cancelled { partial } => Some(partial),
            ExecError::Runtime(_) => None,
        }
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn image_exists(&self, image: &str) -> anyhow::Result<bool>;

    async fn create_volume(&self, name: &str) -> anyhow::Result<()>;

    /// Remove a volume. Removing a volume that does not exist is not an error.
    async fn remove_volume(&self, name: &str) -> anyhow::Result<()>;

    /// Create a container and return its id. The container is not started.
    async fn create_container(&self, spec: &ContainerSpec) -> anyhow::Result<String>;

    async fn start_container(&self, id: &str) -> anyhow::Result<()>;

    /// Copy a host file or directory into `dest` inside the container.
    /// A directory's contents land directly under `dest`.
    async fn copy_into(&self, id: &str, host_path: &Path, dest: &str) -> anyhow::Result<()>;

    /// Run a command and wait for it. Must return promptly once `cancel`
    /// fires or `req.timeout` elapses.
    async fn exec(
        &self,
        id: &str,
        req: &ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, ExecError>;

    async fn kill_container(&self, id: &str) -> anyhow::Result<()>;

    /// Force-remove a container and its anonymous volumes.
    async fn remove_container(&self, id: &str) -> anyhow::Result<()>;
}
