/// Sandbox Executor - Job Lifecycle in Containers
///
/// **Responsibility:**
/// Run one job end to end: provision a volume, build in one container,
/// judge in another, and hand back every task log.
///
/// **Lifecycle:**
/// 1. Create volume `job-<uuid>`, mounted at the work dir of both containers
/// 2. Build container: stage test files and the submission, `chown` once,
///    then run each build task through the watchdog
/// 3. Judge container: run each judge task through the watchdog, compare
///    output with the expected files
/// 4. Kill and remove both containers, remove the volume
///
/// **Failure Rules:**
/// - The first internal error stops the phase; the failing task gets an IE
///   sentinel log and the error comes back with every log gathered so far
/// - The judge phase only runs when the build phase had no internal error
/// - Verdicts (CE, WA, TLE, ...) are not errors; they are recorded and the
///   phase carries on
/// - Containers and the volume are released on every path, including
///   cancellation and panics (drop guard)
use anyhow::{anyhow, bail, Context, Result};
use judge_common::{JobDetail, RequestLog, TaskLog, TestCase};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::metrics;
use crate::runtime::{ContainerRuntime, ContainerSpec, ExecRequest};
use crate::verdict::{self, Expected, Phase};
use crate::watchdog::{self, WatchdogRequest};

/// An execution that hit an internal error. `partial` holds every task log
/// produced before the failure, including the IE sentinel.
#[derive(Debug)]
pub struct ExecutionFailure {
    pub partial: RequestLog,
    pub error: anyhow::Error,
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "execution failed after {} task(s): {:#}", self.partial.task_count(), self.error)
    }
}

impl std::error::Error for ExecutionFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.error.as_ref())
    }
}

enum Resource {
    Volume(String),
    Container(String),
}

/// Releases a volume or container exactly once.
///
/// `release` is the normal path. If the guard is dropped without it (the job
/// future was cancelled or panicked), cleanup is spawned onto the runtime.
struct SandboxGuard {
    runtime: Arc<dyn ContainerRuntime>,
    resource: Option<Resource>,
}

impl SandboxGuard {
    fn volume(runtime: Arc<dyn ContainerRuntime>, name: String) -> Self {
        Self {
            runtime,
            resource: Some(Resource::Volume(name)),
        }
    }

    fn container(runtime: Arc<dyn ContainerRuntime>, name: String) -> Self {
        Self {
            runtime,
            resource: Some(Resource::Container(name)),
        }
    }

    async fn release(mut self) {
        if let Some(resource) = self.resource.take() {
            cleanup(self.runtime.clone(), resource).await;
        }
    }
}

impl Drop for SandboxGuard {
    fn drop(&mut self) {
        let Some(resource) = self.resource.take() else {
            return;
        };
        let runtime = self.runtime.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(cleanup(runtime, resource));
            }
            Err(_) => warn!("No runtime available to clean up sandbox resource"),
        }
    }
}

async fn cleanup(runtime: Arc<dyn ContainerRuntime>, resource: Resource) {
    match resource {
        Resource::Container(name) => {
            if let Err(e) = runtime.kill_container(&name).await {
                // Usually the container never started or already exited
                debug!(container = %name, error = %e, "Kill before removal failed");
            }
            if let Err(e) = runtime.remove_container(&name).await {
                warn!(container = %name, error = %e, "Failed to remove container");
            }
        }
        Resource::Volume(name) => {
            if let Err(e) = runtime.remove_volume(&name).await {
                warn!(volume = %name, error = %e, "Failed to remove volume");
            }
        }
    }
}

/// Race a container operation against shutdown.
async fn cancellable<T>(cancel: &CancellationToken, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => bail!("cancelled by shutdown"),
        res = fut => res,
    }
}

struct PhaseRun {
    logs: Vec<TaskLog>,
    error: Option<anyhow::Error>,
}

/// A task that could not produce a verdict. `artifacts` points at whatever
/// output was flushed to the result dir before giving up.
struct TaskError {
    error: anyhow::Error,
    artifacts: Option<(PathBuf, PathBuf)>,
}

impl From<anyhow::Error> for TaskError {
    fn from(error: anyhow::Error) -> Self {
        Self { error, artifacts: None }
    }
}

impl PhaseRun {
    fn failed(logs: Vec<TaskLog>, error: anyhow::Error) -> Self {
        Self {
            logs,
            error: Some(error),
        }
    }
}

pub struct SandboxExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    config: Arc<SandboxConfig>,
}

impl SandboxExecutor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: Arc<SandboxConfig>) -> Self {
        Self { runtime, config }
    }

    /// Make sure both sandbox images are present before taking any job.
    pub async fn check_images(&self) -> Result<()> {
        for phase in [Phase::Build, Phase::Judge] {
            let image = &self.config.limits(phase).image;
            if !self.runtime.image_exists(image).await? {
                bail!("{} image '{}' not found", phase, image);
            }
            info!(phase = %phase, image = %image, "Sandbox image available");
        }
        Ok(())
    }

    #[instrument(skip(self, detail, cancel))]
    pub async fn execute(
        &self,
        job_id: i64,
        detail: &JobDetail,
        cancel: &CancellationToken,
    ) -> Result<RequestLog, ExecutionFailure> {
        let volume = format!("job-{}", Uuid::new_v4());
        let volume_guard = SandboxGuard::volume(self.runtime.clone(), volume.clone());

        if let Err(error) = cancellable(cancel, self.runtime.create_volume(&volume)).await {
            volume_guard.release().await;
            return Err(ExecutionFailure {
                partial: RequestLog::default(),
                error,
            });
        }
        debug!(volume = %volume, "Volume created");

        let build = self.run_phase(Phase::Build, detail, &volume, cancel).await;
        let (judge_logs, error) = match build.error {
            Some(error) => (Vec::new(), Some(error)),
            None => {
                let judge = self.run_phase(Phase::Judge, detail, &volume, cancel).await;
                (judge.logs, judge.error)
            }
        };

        volume_guard.release().await;

        let log = RequestLog::from_task_logs(build.logs, judge_logs);
        match error {
            None => {
                info!(
                    result = %log.result_id,
                    time_ms = log.time_ms,
                    memory_kb = log.memory_kb,
                    tasks = log.task_count(),
                    "Execution completed"
                );
                Ok(log)
            }
            Some(error) => {
                warn!(tasks = log.task_count(), error = %format!("{:#}", error), "Execution failed");
                Err(ExecutionFailure { partial: log, error })
            }
        }
    }

    async fn run_phase(&self, phase: Phase, detail: &JobDetail, volume: &str, cancel: &CancellationToken) -> PhaseRun {
        let limits = self.config.limits(phase);
        let spec = ContainerSpec {
            name: format!("{}-{}", phase, Uuid::new_v4()),
            image: limits.image.clone(),
            volume: volume.to_string(),
            work_dir: self.config.work_dir.clone(),
            cpuset: self.config.cpuset.clone(),
            memory_bytes: self.config.memory_bytes(detail.memory_mb),
            pids_limit: limits.pids_limit,
            nofile: limits.nofile,
            fsize_bytes: self.config.fsize_bytes,
            stack_bytes: self.config.stack_bytes,
            stop_timeout_secs: self.config.stop_timeout_secs,
        };
        // Guarded by name before creation, so a create cut short by shutdown
        // still gets cleaned up.
        let guard = SandboxGuard::container(self.runtime.clone(), spec.name.clone());

        let run = match self.prepare(phase, &spec, detail, cancel).await {
            Ok(container_id) => self.run_tasks(phase, &container_id, detail, cancel).await,
            Err(e) => PhaseRun::failed(Vec::new(), e.context(format!("{} container setup failed", phase))),
        };

        guard.release().await;
        run
    }

    /// Create and start the phase container. The build container also gets
    /// the test files and the submission staged into the work dir.
    async fn prepare(&self, phase: Phase, spec: &ContainerSpec, detail: &JobDetail, cancel: &CancellationToken) -> Result<String> {
        let id = cancellable(cancel, self.runtime.create_container(spec)).await?;
        cancellable(cancel, self.runtime.start_container(&id)).await?;
        debug!(phase = %phase, container = %spec.name, image = %spec.image, "Container started");

        if phase == Phase::Build {
            self.stage_files(&id, detail, cancel).await?;
        }
        Ok(id)
    }

    async fn stage_files(&self, id: &str, detail: &JobDetail, cancel: &CancellationToken) -> Result<()> {
        let dest = format!("{}/", self.config.work_dir);
        for test_file in &detail.test_files {
            let path = Path::new(&detail.resource_dir).join(test_file);
            cancellable(cancel, self.runtime.copy_into(id, &path, &dest)).await?;
        }
        cancellable(cancel, self.runtime.copy_into(id, Path::new(&detail.file_dir), &dest)).await?;

        let chown = ExecRequest {
            cmd: vec!["chown".to_string(), "-R".to_string(), "guest:guest".to_string(), dest.clone()],
            stdin: None,
            working_dir: None,
            user: Some("root".to_string()),
            env: Vec::new(),
            timeout: Duration::from_secs(self.config.chown_timeout_secs),
        };
        let output = self.runtime.exec(id, &chown, cancel).await?;
        if output.exit_code != Some(0) {
            bail!(
                "failed to change ownership of {}, exit code {:?}, stderr: {}",
                dest,
                output.exit_code,
                output.stderr
            );
        }
        debug!(files = detail.test_files.len() + 1, "Files staged");
        Ok(())
    }

    async fn run_tasks(&self, phase: Phase, container_id: &str, detail: &JobDetail, cancel: &CancellationToken) -> PhaseRun {
        let tasks = match phase {
            Phase::Build => &detail.build_tasks,
            Phase::Judge => &detail.judge_tasks,
        };

        let mut logs = Vec::with_capacity(tasks.len());
        for task in tasks {
            match self.run_task(phase, container_id, detail, task, cancel).await {
                Ok(log) => {
                    debug!(
                        phase = %phase,
                        test_case_id = task.id,
                        result = %log.result_id,
                        time_ms = log.time_ms,
                        exit_code = log.exit_code,
                        "Task finished"
                    );
                    metrics::record_task_verdict(phase.as_str(), log.result_id.as_str());
                    logs.push(log);
                }
                Err(TaskError { error, artifacts }) => {
                    let mut sentinel = TaskLog::internal_error(task.id);
                    if let Some((stdout_path, stderr_path)) = artifacts {
                        sentinel.stdout_path = stdout_path.to_string_lossy().into_owned();
                        sentinel.stderr_path = stderr_path.to_string_lossy().into_owned();
                    }
                    logs.push(sentinel);
                    metrics::record_task_verdict(phase.as_str(), "IE");
                    return PhaseRun::failed(logs, error.context(format!("{} task {} failed", phase, task.id)));
                }
            }
        }
        PhaseRun { logs, error: None }
    }

    async fn run_task(
        &self,
        phase: Phase,
        container_id: &str,
        detail: &JobDetail,
        task: &TestCase,
        cancel: &CancellationToken,
    ) -> Result<TaskLog, TaskError> {
        let stdin = read_resource(detail, task.stdin()).await?.unwrap_or_default();
        let expected = match phase {
            Phase::Build => Expected::default(),
            Phase::Judge => Expected {
                stdout: read_resource(detail, task.expected_stdout()).await?,
                stderr: read_resource(detail, task.expected_stderr()).await?,
            },
        };

        let request = WatchdogRequest::new(&task.command, stdin, detail.time_ms, detail.memory_mb, &self.config);
        let exec = ExecRequest {
            cmd: vec![self.config.watchdog_path.clone()],
            stdin: Some(serde_json::to_string(&request).context("failed to encode watchdog request")?),
            working_dir: Some(self.config.work_dir.clone()),
            // The watchdog drops to the guest uid itself
            user: Some("root".to_string()),
            env: Vec::new(),
            timeout: self.config.exec_timeout(detail.time_ms),
        };

        let output = match self.runtime.exec(container_id, &exec, cancel).await {
            Ok(output) => output,
            Err(e) => {
                // Flush what the command printed before it was cut short
                let artifacts = match e.partial() {
                    Some(partial) => match write_artifacts(detail, phase, task.id, &partial.stdout, &partial.stderr).await {
                        Ok(paths) => Some(paths),
                        Err(write_err) => {
                            warn!(test_case_id = task.id, error = %format!("{:#}", write_err), "Failed to flush partial output");
                            None
                        }
                    },
                    None => None,
                };
                return Err(TaskError {
                    error: e.into(),
                    artifacts,
                });
            }
        };
        let response = watchdog::parse_response(output.exit_code, &output.stdout, &output.stderr)?;

        let (stdout_path, stderr_path) = write_artifacts(detail, phase, task.id, &response.stdout, &response.stderr).await?;

        let Some(exit_code) = response.exit_code else {
            return Err(TaskError {
                error: anyhow!("watchdog terminated abnormally, stderr: {}", response.stderr),
                artifacts: Some((stdout_path, stderr_path)),
            });
        };

        let result_id = verdict::classify(phase, task, &response, exit_code, &expected);
        Ok(TaskLog {
            test_case_id: task.id,
            result_id,
            time_ms: response.time_ms,
            memory_kb: response.memory_kb,
            exit_code,
            stdout_path: stdout_path.to_string_lossy().into_owned(),
            stderr_path: stderr_path.to_string_lossy().into_owned(),
        })
    }
}

/// Read a file relative to the job's resource directory.
async fn read_resource(detail: &JobDetail, relative: Option<&str>) -> Result<Option<String>> {
    let Some(relative) = relative else {
        return Ok(None);
    };
    let path = Path::new(&detail.resource_dir).join(relative);
    let bytes = tokio::fs::read(&path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}

/// Persist a task's captured output as `{phase}_{id}_{stdout|stderr}.txt`.
async fn write_artifacts(
    detail: &JobDetail,
    phase: Phase,
    task_id: i64,
    stdout: &str,
    stderr: &str,
) -> Result<(PathBuf, PathBuf)> {
    let dir = Path::new(&detail.result_dir);
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create result directory {}", dir.display()))?;

    let stdout_path = dir.join(format!("{}_{}_stdout.txt", phase, task_id));
    let stderr_path = dir.join(format!("{}_{}_stderr.txt", phase, task_id));
    tokio::fs::write(&stdout_path, stdout)
        .await
        .with_context(|| format!("failed to write {}", stdout_path.display()))?;
    tokio::fs::write(&stderr_path, stderr)
        .await
        .with_context(|| format!("failed to write {}", stderr_path.display()))?;
    Ok((stdout_path, stderr_path))
}
