/// Sandbox Executor - one isolated compile-and-run
///
/// Every call gets a fresh private scope (temporary directory) holding only
/// the submitted source and, after compilation, its artifacts. Scopes are
/// `TempDir`s owned by the call, so they are removed on every exit path,
/// including limiter faults and cancellation of the calling future.
use crate::error::GradingError;
use crate::limiter::{Launch, ResourceLimiter};
use crate::registry::{LanguageProfile, LanguageRegistry};
use anyhow::{Context, Result};
use codegrade_common::types::{ExecutionResult, Limits, TerminationReason};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const SCOPE_PREFIX: &str = "codegrade-";

/// Per-submission execution context: cancellation plus the grading deadline
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub cancel: CancellationToken,
    pub deadline: Option<Instant>,
}

impl RunContext {
    pub fn new(cancel: CancellationToken, deadline: Option<Instant>) -> Self {
        Self { cancel, deadline }
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Limits have millisecond granularity; less than one left is nothing left
    pub fn budget_exhausted(&self) -> bool {
        self.remaining()
            .is_some_and(|left| left < Duration::from_millis(1))
    }

    /// Limits with the wall clock cut down to what the deadline still allows
    pub fn clamp(&self, limits: Limits) -> Limits {
        match self.remaining() {
            Some(left) => limits.clamp_wall_time(left),
            None => limits,
        }
    }
}

/// A submission compiled once, ready to run against many inputs
pub struct PreparedProgram {
    profile: Arc<LanguageProfile>,
    build: Option<TempDir>,
    compile_failure: Option<ExecutionResult>,
}

impl PreparedProgram {
    pub fn profile(&self) -> &LanguageProfile {
        &self.profile
    }

    pub fn compile_failure(&self) -> Option<&ExecutionResult> {
        self.compile_failure.as_ref()
    }
}

pub struct SandboxExecutor {
    registry: Arc<LanguageRegistry>,
    limiter: Arc<dyn ResourceLimiter>,
    scratch_dir: Option<PathBuf>,
}

impl SandboxExecutor {
    pub fn new(registry: Arc<LanguageRegistry>, limiter: Arc<dyn ResourceLimiter>) -> Self {
        Self {
            registry,
            limiter,
            scratch_dir: None,
        }
    }

    /// Create scopes under `dir` instead of the system temp directory
    pub fn with_scratch_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.scratch_dir = dir;
        self
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    /// Compile (if the language needs it) and run `source` once.
    ///
    /// `limits` of `None` runs with the profile defaults.
    #[tracing::instrument(skip(self, source, stdin, limits, ctx), fields(language = %language))]
    pub async fn execute(
        &self,
        source: &str,
        language: &str,
        stdin: &[u8],
        limits: Option<Limits>,
        ctx: &RunContext,
    ) -> Result<ExecutionResult, GradingError> {
        let profile = self.registry.resolve(language)?;
        let scope = self.scope()?;
        materialize(scope.path(), &profile, source).await?;

        if let Some(failure) = self.compile(&profile, scope.path(), ctx).await? {
            return Ok(failure);
        }

        let limits = limits.unwrap_or(profile.limits);
        let result = self.run(&profile, scope.path(), stdin, limits, ctx).await?;
        Ok(result)
    }

    /// Compile once into a build scope kept alive by the returned program
    #[tracing::instrument(skip(self, source, ctx), fields(language = %language))]
    pub async fn prepare(
        &self,
        source: &str,
        language: &str,
        ctx: &RunContext,
    ) -> Result<PreparedProgram, GradingError> {
        let profile = self.registry.resolve(language)?;
        let build = self.scope()?;
        materialize(build.path(), &profile, source).await?;

        let compile_failure = self.compile(&profile, build.path(), ctx).await?;
        let build = if compile_failure.is_some() {
            None
        } else {
            Some(build)
        };

        Ok(PreparedProgram {
            profile,
            build,
            compile_failure,
        })
    }

    /// Run a prepared program in a fresh scope seeded with the build artifacts
    pub async fn run_prepared(
        &self,
        program: &PreparedProgram,
        stdin: &[u8],
        limits: Limits,
        ctx: &RunContext,
    ) -> Result<ExecutionResult, GradingError> {
        if let Some(failure) = &program.compile_failure {
            return Ok(failure.clone());
        }
        let build = program
            .build
            .as_ref()
            .context("Prepared program has no build scope")?;

        let scope = self.scope()?;
        let (from, to) = (build.path().to_path_buf(), scope.path().to_path_buf());
        tokio::task::spawn_blocking(move || copy_tree(&from, &to))
            .await
            .context("Artifact copy task failed")?
            .context("Failed to copy build artifacts into case scope")?;

        let result = self
            .run(&program.profile, scope.path(), stdin, limits, ctx)
            .await?;
        Ok(result)
    }

    fn scope(&self) -> Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(SCOPE_PREFIX);
        let scope = match &self.scratch_dir {
            Some(dir) => builder.tempdir_in(dir),
            None => builder.tempdir(),
        };
        scope.context("Failed to create sandbox scope")
    }

    /// `Some` when compilation did not produce a runnable program
    async fn compile(
        &self,
        profile: &LanguageProfile,
        scope: &Path,
        ctx: &RunContext,
    ) -> Result<Option<ExecutionResult>> {
        let Some(template) = &profile.compile else {
            return Ok(None);
        };

        let guest = self.limiter.guest_workdir(scope);
        let argv = profile.expand(template, &guest);
        let limits = ctx.clamp(profile.compile_limits());
        let launch = Launch {
            argv: &argv,
            workdir: scope,
            env: &profile.env,
            limits: &limits,
            stdin: None,
            image: profile.image.as_deref(),
        };

        let mut result = self.limiter.run_bounded(launch, &ctx.cancel).await?;
        if result.succeeded() {
            return Ok(None);
        }

        match result.termination {
            TerminationReason::KilledByScheduler => {}
            // The submission ran out of grading time, not the compiler
            TerminationReason::TimedOut if ctx.budget_exhausted() => {}
            _ => {
                debug!(
                    language = %profile.name,
                    exit_code = ?result.exit_code,
                    termination = %result.termination,
                    "Compilation failed"
                );
                result.termination = TerminationReason::CompileFailed;
            }
        }
        Ok(Some(result))
    }

    async fn run(
        &self,
        profile: &LanguageProfile,
        scope: &Path,
        stdin: &[u8],
        limits: Limits,
        ctx: &RunContext,
    ) -> Result<ExecutionResult> {
        let guest = self.limiter.guest_workdir(scope);
        let argv = profile.expand(&profile.run, &guest);
        let limits = ctx.clamp(limits);
        let launch = Launch {
            argv: &argv,
            workdir: scope,
            env: &profile.env,
            limits: &limits,
            stdin: Some(stdin),
            image: profile.image.as_deref(),
        };

        self.limiter.run_bounded(launch, &ctx.cancel).await
    }
}

async fn materialize(scope: &Path, profile: &LanguageProfile, source: &str) -> Result<()> {
    let path = scope.join(&profile.source_file);
    tokio::fs::write(&path, source)
        .await
        .with_context(|| format!("Failed to write source to {}", path.display()))
}

/// Copy regular files and directories; symlinks are not followed
fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = to.join(entry.file_name());
        if file_type.is_dir() {
            fs::create_dir(&target)?;
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
