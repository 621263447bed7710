/// Resource Limiter - one bounded process launch
///
/// **Contract:**
/// Run an argument vector inside a private scope with CPU, wall-clock,
/// memory, output and process-count ceilings, and report what happened.
///
/// **Error boundary:**
/// A non-zero exit or a limit breach is a successfully observed
/// `ExecutionResult`. `Err` means the limiter itself could not do its job
/// (scope unusable, launch impossible, container daemon gone).
///
/// Two backends implement the trait:
/// - `ProcessLimiter`: local process, rlimits, private namespaces, /proc monitor
/// - `ContainerLimiter`: one Docker container per launch
pub mod container;
mod jail;
pub mod process;

use anyhow::Result;
use async_trait::async_trait;
use codegrade_common::config::{BackendKind, EngineSettings};
use codegrade_common::types::{ExecutionResult, Limits};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub use container::ContainerLimiter;
pub use process::ProcessLimiter;

/// Everything needed for one bounded launch
#[derive(Debug, Clone, Copy)]
pub struct Launch<'a> {
    pub argv: &'a [String],
    /// Private scope on the host
    pub workdir: &'a Path,
    pub env: &'a BTreeMap<String, String>,
    pub limits: &'a Limits,
    /// `None` closes stdin immediately
    pub stdin: Option<&'a [u8]>,
    pub image: Option<&'a str>,
}

#[async_trait]
pub trait ResourceLimiter: Send + Sync {
    /// Where the program sees its private scope
    fn guest_workdir(&self, scope: &Path) -> PathBuf;

    async fn run_bounded(
        &self,
        launch: Launch<'_>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult>;
}

/// Build the limiter selected by the engine settings
pub fn from_settings(settings: &EngineSettings) -> Result<Arc<dyn ResourceLimiter>> {
    match settings.backend {
        BackendKind::Process => Ok(Arc::new(ProcessLimiter::new(settings.network_isolation)?)),
        BackendKind::Container => Ok(Arc::new(ContainerLimiter::new()?)),
    }
}

/// Combined stdout + stderr byte budget shared by both capture streams
pub(crate) struct OutputBudget {
    limit: u64,
    used: AtomicU64,
    exceeded: AtomicBool,
    notify: Notify,
}

impl OutputBudget {
    pub(crate) fn new(limit: u64) -> Arc<Self> {
        Arc::new(Self {
            limit,
            used: AtomicU64::new(0),
            exceeded: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    /// Charge `len` bytes; returns how many of them may be kept
    pub(crate) fn admit(&self, len: usize) -> usize {
        let len = len as u64;
        let before = self.used.fetch_add(len, Ordering::SeqCst);
        let room = self.limit.saturating_sub(before);
        if len > room {
            self.trip();
            room as usize
        } else {
            len as usize
        }
    }

    pub(crate) fn is_exceeded(&self) -> bool {
        self.exceeded.load(Ordering::SeqCst)
    }

    /// Resolves once the budget has been overrun
    pub(crate) async fn exceeded(&self) {
        if self.is_exceeded() {
            return;
        }
        self.notify.notified().await;
    }

    fn trip(&self) {
        if !self.exceeded.swap(true, Ordering::SeqCst) {
            self.notify.notify_one();
        }
    }
}

/// Read a pipe until EOF or until the shared budget runs out
pub(crate) async fn capture<R>(mut reader: R, budget: Arc<OutputBudget>) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let take = budget.admit(n);
                kept.extend_from_slice(&buf[..take]);
                if budget.is_exceeded() {
                    break;
                }
            }
        }
    }
    kept
}

pub(crate) fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted limiter for exercising the layers above without real processes

    use super::*;
    use codegrade_common::types::{ResourceUsage, TerminationReason};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    /// Behavior of one scripted launch
    #[derive(Debug, Clone)]
    pub struct Scripted {
        pub stdout: String,
        pub stderr: String,
        pub exit_code: i32,
        pub termination: TerminationReason,
        pub runtime: Duration,
    }

    impl Scripted {
        pub fn prints(stdout: &str) -> Self {
            Self {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_code: 0,
                termination: TerminationReason::Normal,
                runtime: Duration::from_millis(1),
            }
        }

        pub fn exits(code: i32, stderr: &str) -> Self {
            Self {
                exit_code: code,
                stderr: stderr.to_string(),
                ..Self::prints("")
            }
        }

        pub fn breaches(termination: TerminationReason) -> Self {
            Self {
                exit_code: 137,
                termination,
                ..Self::prints("")
            }
        }

        pub fn runs_for(mut self, runtime: Duration) -> Self {
            self.runtime = runtime;
            self
        }
    }

    /// Observed launch, for assertions
    #[derive(Debug, Clone)]
    pub struct Recorded {
        pub argv: Vec<String>,
        pub stdin: Option<String>,
        pub limits: Limits,
    }

    type Script = dyn Fn(&Launch<'_>) -> Scripted + Send + Sync;

    pub struct ScriptedLimiter {
        script: Box<Script>,
        launches: Mutex<Vec<Recorded>>,
        running: AtomicUsize,
        peak_running: AtomicUsize,
    }

    impl ScriptedLimiter {
        pub fn new<F>(script: F) -> Self
        where
            F: Fn(&Launch<'_>) -> Scripted + Send + Sync + 'static,
        {
            Self {
                script: Box::new(script),
                launches: Mutex::new(Vec::new()),
                running: AtomicUsize::new(0),
                peak_running: AtomicUsize::new(0),
            }
        }

        pub fn launches(&self) -> Vec<Recorded> {
            self.launches.lock().unwrap().clone()
        }

        pub fn peak_running(&self) -> usize {
            self.peak_running.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ResourceLimiter for ScriptedLimiter {
        fn guest_workdir(&self, scope: &Path) -> PathBuf {
            scope.to_path_buf()
        }

        async fn run_bounded(
            &self,
            launch: Launch<'_>,
            cancel: &CancellationToken,
        ) -> Result<ExecutionResult> {
            let scripted = (self.script)(&launch);
            self.launches.lock().unwrap().push(Recorded {
                argv: launch.argv.to_vec(),
                stdin: launch.stdin.map(decode),
                limits: *launch.limits,
            });

            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_running.fetch_max(now, Ordering::SeqCst);

            let started = Instant::now();
            let wall = launch.limits.wall_time();
            let termination = tokio::select! {
                _ = tokio::time::sleep(scripted.runtime.min(wall)) => {
                    if scripted.runtime > wall {
                        TerminationReason::TimedOut
                    } else {
                        scripted.termination
                    }
                }
                _ = cancel.cancelled() => TerminationReason::KilledByScheduler,
            };
            self.running.fetch_sub(1, Ordering::SeqCst);

            let finished = termination == scripted.termination;
            Ok(ExecutionResult {
                exit_code: Some(if finished { scripted.exit_code } else { 137 }),
                signal: if finished { None } else { Some(9) },
                stdout: if finished { scripted.stdout } else { String::new() },
                stderr: if finished { scripted.stderr } else { String::new() },
                stdout_lossy: false,
                usage: ResourceUsage {
                    cpu_time_ms: Some(1),
                    peak_memory_bytes: Some(1024),
                    wall_time_ms: started.elapsed().as_millis() as u64,
                },
                termination,
                output_truncated: termination == TerminationReason::OutputExceeded,
            })
        }
    }
}
