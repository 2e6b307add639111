// Docker implementation of ContainerRuntime using Bollard
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, UploadToContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{HostConfig, ResourcesUlimits};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use futures_util::stream::StreamExt;
use hyper::body::Bytes;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::runtime::{ContainerRuntime, ContainerSpec, ExecError, ExecOutput, ExecRequest};

pub struct DockerRuntime {
    docker: Docker,
}

fn is_not_found(err: &BollardError) -> bool {
    matches!(err, BollardError::DockerResponseServerError { status_code: 404, .. })
}

fn ulimit(name: &str, value: i64) -> ResourcesUlimits {
    ResourcesUlimits {
        name: Some(name.to_string()),
        soft: Some(value),
        hard: Some(value),
    }
}

/// Pack a host file or directory into an in-memory tar archive. Directory
/// contents are stored relative to the directory itself.
fn build_archive(host_path: &Path) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    if host_path.is_dir() {
        builder
            .append_dir_all(".", host_path)
            .with_context(|| format!("Failed to archive {}", host_path.display()))?;
    } else {
        let name = host_path
            .file_name()
            .with_context(|| format!("No file name in {}", host_path.display()))?;
        builder
            .append_path_with_name(host_path, name)
            .with_context(|| format!("Failed to archive {}", host_path.display()))?;
    }
    builder.into_inner().context("Failed to finish tar archive")
}

enum ExecOutcome {
    Finished(Result<()>),
    TimedOut,
    Cancelled,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to inspect image {}", image)),
        }
    }

    async fn create_volume(&self, name: &str) -> Result<()> {
        self.docker
            .create_volume(CreateVolumeOptions {
                name: name.to_string(),
                ..Default::default()
            })
            .await
            .with_context(|| format!("Failed to create volume {}", name))?;
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        match self
            .docker
            .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove volume {}", name)),
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 3600".to_string()]),
            user: Some("root".to_string()),
            working_dir: Some(spec.work_dir.clone()),
            network_disabled: Some(true), // SECURITY: No network access
            stop_timeout: Some(spec.stop_timeout_secs),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{}:{}", spec.volume, spec.work_dir)]),
                network_mode: Some("none".to_string()),
                cpuset_cpus: Some(spec.cpuset.clone()),
                memory: Some(spec.memory_bytes),
                // Equal to memory: no swap
                memory_swap: Some(spec.memory_bytes),
                pids_limit: Some(spec.pids_limit),
                ulimits: Some(vec![
                    ulimit("nofile", spec.nofile),
                    ulimit("nproc", spec.pids_limit),
                    ulimit("fsize", spec.fsize_bytes),
                    ulimit("stack", spec.stack_bytes),
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .with_context(|| format!("Failed to create container {} from {}", spec.name, spec.image))?;

        for warning in &response.warnings {
            warn!(container = %spec.name, "Docker warning: {}", warning);
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .with_context(|| format!("Failed to start container {}", id))
    }

    async fn copy_into(&self, id: &str, host_path: &Path, dest: &str) -> Result<()> {
        let path = host_path.to_path_buf();
        let archive = tokio::task::spawn_blocking(move || build_archive(&path))
            .await
            .context("Archive task panicked")??;

        self.docker
            .upload_to_container(
                id,
                Some(UploadToContainerOptions {
                    path: dest.to_string(),
                    ..Default::default()
                }),
                Bytes::from(archive),
            )
            .await
            .with_context(|| format!("Failed to copy {} into container {}", host_path.display(), id))
    }

    async fn exec(&self, id: &str, req: &ExecRequest, cancel: &CancellationToken) -> Result<ExecOutput, ExecError> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(req.cmd.clone()),
                    attach_stdin: Some(req.stdin.is_some()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: req.working_dir.clone(),
                    user: req.user.clone(),
                    env: Some(req.env.clone()),
                    ..Default::default()
                },
            )
            .await
            .context("Failed to create exec")?;

        let mut partial = ExecOutput::default();

        let outcome = {
            let collect = async {
                let started = self
                    .docker
                    .start_exec(
                        &exec.id,
                        Some(StartExecOptions {
                            detach: false,
                            ..Default::default()
                        }),
                    )
                    .await
                    .context("Failed to start exec")?;

                let StartExecResults::Attached { mut output, mut input } = started else {
                    bail!("Exec started detached");
                };

                if let Some(stdin) = &req.stdin {
                    input.write_all(stdin.as_bytes()).await.context("Failed to write exec stdin")?;
                }
                // Close stdin so the process sees EOF
                input.shutdown().await.ok();

                while let Some(msg) = output.next().await {
                    match msg.context("Failed to read exec output")? {
                        LogOutput::StdOut { message } => {
                            partial.stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        LogOutput::StdErr { message } => {
                            partial.stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        _ => {}
                    }
                }
                Ok::<(), anyhow::Error>(())
            };

            tokio::select! {
                res = collect => ExecOutcome::Finished(res),
                _ = tokio::time::sleep(req.timeout) => ExecOutcome::TimedOut,
                _ = cancel.cancelled() => ExecOutcome::Cancelled,
            }
        };

        match outcome {
            ExecOutcome::Finished(res) => res?,
            ExecOutcome::TimedOut => {
                debug!(container = %id, timeout_ms = req.timeout.as_millis() as u64, "Exec timed out");
                return Err(ExecError::TimedOut {
                    timeout: req.timeout,
                    partial,
                });
            }
            ExecOutcome::Cancelled => return Err(ExecError::Cancelled { partial }),
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .context("Failed to inspect exec")?;
        partial.exit_code = inspect.exit_code;
        Ok(partial)
    }

    async fn kill_container(&self, id: &str) -> Result<()> {
        self.docker
            .kill_container(id, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
            .with_context(|| format!("Failed to kill container {}", id))
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        match self
            .docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove container {}", id)),
        }
    }
}
