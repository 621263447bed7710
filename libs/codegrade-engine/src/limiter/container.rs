//! Container backend - one Docker container per launch
//!
//! The private scope is bind-mounted at `/sandbox`. The container gets no
//! network, a read-only root filesystem with a small `/tmp` tmpfs, no
//! capabilities, a pids ceiling and a hard memory ceiling with swap
//! disabled. CPU time is bounded by `RLIMIT_CPU` through a ulimit; wall
//! time, cancellation and the output cap are enforced from the host.

use super::{decode, Launch, OutputBudget, ResourceLimiter};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    InspectContainerOptions, KillContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, ResourcesUlimits};
use bollard::Docker;
use codegrade_common::types::{ExecutionResult, Limits, ResourceUsage, TerminationReason};
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const GUEST_WORKDIR: &str = "/sandbox";
const TMPFS_OPTIONS: &str = "rw,noexec,nosuid,size=64m";
/// Exit status of a process killed by SIGXCPU
const EXIT_SIGXCPU: i64 = 128 + 24;
const WAIT_GRACE: Duration = Duration::from_secs(5);

/// Container cleanup guard - guarantees container removal on drop
struct ContainerGuard<'a> {
    docker: &'a Docker,
    container_id: String,
}

impl<'a> ContainerGuard<'a> {
    fn new(docker: &'a Docker, container_id: String) -> Self {
        Self {
            docker,
            container_id,
        }
    }
}

impl<'a> Drop for ContainerGuard<'a> {
    fn drop(&mut self) {
        // Drop cannot await; removal is force so a running container goes too
        let container_id = self.container_id.clone();
        let docker = self.docker.clone();

        tokio::spawn(async move {
            let remove_options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };

            if let Err(e) = docker
                .remove_container(&container_id, Some(remove_options))
                .await
            {
                warn!(container_id = %container_id, error = %e, "Failed to clean up container");
            }
        });
    }
}

pub struct ContainerLimiter {
    docker: Docker,
}

impl ContainerLimiter {
    pub fn new() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        Ok(Self { docker })
    }

    /// Ensure Docker image is available (pull if needed)
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image, "Image cache hit");
            return Ok(());
        }

        warn!(image, "Image cache miss, pulling");

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.context("Failed to pull Docker image")?;
        }

        info!(image, "Image pulled");
        Ok(())
    }

    fn container_config(launch: &Launch<'_>, image: &str) -> Config<String> {
        let limits = launch.limits;
        let cpu_secs = limits.cpu_time_ms.div_ceil(1000) as i64 + 1;

        Config {
            image: Some(image.to_string()),
            cmd: Some(launch.argv.to_vec()),
            entrypoint: Some(vec![]),
            working_dir: Some(GUEST_WORKDIR.to_string()),
            env: Some(
                launch
                    .env
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .chain(std::iter::once(format!("HOME={}", GUEST_WORKDIR)))
                    .collect(),
            ),
            attach_stdin: Some(launch.stdin.is_some()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(launch.stdin.is_some()),
            stdin_once: Some(launch.stdin.is_some()),
            tty: Some(false),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                binds: Some(vec![format!(
                    "{}:{}:rw",
                    launch.workdir.display(),
                    GUEST_WORKDIR
                )]),
                memory: Some(limits.memory_bytes as i64),
                memory_swap: Some(limits.memory_bytes as i64),
                pids_limit: Some(limits.max_processes as i64),
                nano_cpus: Some(1_000_000_000),
                network_mode: Some("none".to_string()),
                readonly_rootfs: Some(true),
                tmpfs: Some(HashMap::from([(
                    "/tmp".to_string(),
                    TMPFS_OPTIONS.to_string(),
                )])),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                ulimits: Some(vec![
                    ResourcesUlimits {
                        name: Some("cpu".to_string()),
                        soft: Some(cpu_secs),
                        hard: Some(cpu_secs + 1),
                    },
                    ResourcesUlimits {
                        name: Some("fsize".to_string()),
                        soft: Some(limits.max_file_bytes as i64),
                        hard: Some(limits.max_file_bytes as i64),
                    },
                    ResourcesUlimits {
                        name: Some("core".to_string()),
                        soft: Some(0),
                        hard: Some(0),
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn kill(&self, container_id: &str) {
        if let Err(e) = self
            .docker
            .kill_container(container_id, None::<KillContainerOptions<String>>)
            .await
        {
            debug!(container_id, error = %e, "Kill failed (container may already be gone)");
        }
    }
}

#[async_trait]
impl ResourceLimiter for ContainerLimiter {
    fn guest_workdir(&self, _scope: &Path) -> PathBuf {
        PathBuf::from(GUEST_WORKDIR)
    }

    #[tracing::instrument(skip(self, launch, cancel), fields(image = launch.image.unwrap_or("")))]
    async fn run_bounded(
        &self,
        launch: Launch<'_>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let Some(image) = launch.image else {
            bail!("Language profile has no container image");
        };
        let limits: Limits = *launch.limits;

        self.ensure_image(image)
            .await
            .with_context(|| format!("Failed to ensure Docker image '{}' is available", image))?;

        let container_name = format!("codegrade-{}", uuid::Uuid::new_v4());
        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };
        let container = self
            .docker
            .create_container(Some(create_options), Self::container_config(&launch, image))
            .await
            .context("Failed to create Docker container")?;

        let container_id = container.id.clone();
        let _guard = ContainerGuard::new(&self.docker, container_id.clone());

        // Attach before start so no early output is lost
        let AttachContainerResults { mut output, mut input } = self
            .docker
            .attach_container(
                &container_id,
                Some(AttachContainerOptions::<String> {
                    stdin: Some(launch.stdin.is_some()),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(true),
                    detach_keys: None,
                }),
            )
            .await
            .context("Failed to attach to Docker container")?;

        let started = Instant::now();
        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start Docker container")?;

        let stdin_task = launch.stdin.map(|payload| {
            let payload = payload.to_vec();
            tokio::spawn(async move {
                let _ = input.write_all(&payload).await;
                let _ = input.shutdown().await;
            })
        });

        let budget = OutputBudget::new(limits.max_output_bytes);
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut breach: Option<TerminationReason> = None;

        let wall = tokio::time::sleep(limits.wall_time());
        tokio::pin!(wall);

        loop {
            tokio::select! {
                chunk = output.next() => match chunk {
                    Some(Ok(LogOutput::StdOut { message })) => {
                        let take = budget.admit(message.len());
                        stdout.extend_from_slice(&message[..take]);
                    }
                    Some(Ok(LogOutput::StdErr { message })) => {
                        let take = budget.admit(message.len());
                        stderr.extend_from_slice(&message[..take]);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(container_id = %container_id, error = %e, "Error reading container output");
                        break;
                    }
                    None => break,
                },
                _ = &mut wall => {
                    breach = Some(TerminationReason::TimedOut);
                }
                _ = cancel.cancelled() => {
                    breach = Some(TerminationReason::KilledByScheduler);
                }
            }
            if budget.is_exceeded() && breach.is_none() {
                breach = Some(TerminationReason::OutputExceeded);
            }
            if breach.is_some() {
                self.kill(&container_id).await;
                break;
            }
        }
        if let Some(task) = stdin_task {
            task.abort();
        }

        // A non-zero exit surfaces as Err from the wait stream; either way it stopped
        let mut wait_stream = self.docker.wait_container(
            &container_id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );
        if tokio::time::timeout(WAIT_GRACE, wait_stream.next())
            .await
            .is_err()
        {
            warn!(container_id = %container_id, "Container did not stop in time, killing");
            self.kill(&container_id).await;
        }
        let wall_time = started.elapsed();

        let inspect = self
            .docker
            .inspect_container(&container_id, None::<InspectContainerOptions>)
            .await
            .context("Failed to inspect Docker container")?;
        let state = inspect.state.unwrap_or_default();
        let oom_killed = state.oom_killed.unwrap_or(false);
        let raw_exit = state.exit_code;

        let (exit_code, signal) = match raw_exit {
            Some(code) if code > 128 && breach.is_none() => (None, Some((code - 128) as i32)),
            Some(code) if breach.is_none() => (Some(code as i32), None),
            _ => (None, Some(libc::SIGKILL)),
        };

        let termination = match breach {
            Some(reason) => reason,
            None if oom_killed => TerminationReason::MemoryExceeded,
            None if raw_exit == Some(EXIT_SIGXCPU) => TerminationReason::TimedOut,
            None if signal.is_some() => TerminationReason::Crashed,
            None => TerminationReason::Normal,
        };

        debug!(
            container_id = %container_id,
            exit_code = ?raw_exit,
            oom_killed,
            termination = %termination,
            wall_ms = wall_time.as_millis() as u64,
            "Container finished"
        );

        Ok(ExecutionResult {
            exit_code,
            signal,
            stdout: decode(&stdout),
            stderr: decode(&stderr),
            stdout_lossy: std::str::from_utf8(&stdout).is_err(),
            usage: ResourceUsage {
                cpu_time_ms: None,
                peak_memory_bytes: None,
                wall_time_ms: wall_time.as_millis() as u64,
            },
            termination,
            output_truncated: budget.is_exceeded(),
        })
    }
}
