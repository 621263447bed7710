/// Test Harness - per-case grading
///
/// **Core Responsibility:**
/// Run a submission once per test case, in order, and classify each run.
///
/// **Classification precedence (first match wins):**
/// 1. Compile failure → CompileError
/// 2. Timed out → TimedOut
/// 3. Memory / output / process ceiling → ResourceExceeded
/// 4. Crash or non-zero exit → RuntimeError
/// 5. Output differs under the exercise policy → WrongOutput
/// 6. Otherwise → Passed
///
/// The verdicts are a lazy stream: nothing runs until it is polled, the
/// caller may stop polling after any verdict (fail-fast), and calling
/// `grade` again starts over from the first case.
use crate::compare::outputs_match;
use crate::error::GradingError;
use crate::sandbox::{RunContext, SandboxExecutor};
use codegrade_common::types::{
    CaseVerdict, ComparisonPolicy, Exercise, ExecutionResult, Limits, Outcome, Submission,
    TerminationReason, TestCase,
};
use futures_util::Stream;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct GradeOptions {
    /// Compile once and copy the artifacts into each case scope
    pub compile_once: bool,
    /// Overall grading deadline spanning every case
    pub deadline: Option<Instant>,
    pub cancel: CancellationToken,
}

#[derive(Clone)]
pub struct TestHarness {
    executor: Arc<SandboxExecutor>,
}

impl TestHarness {
    pub fn new(executor: Arc<SandboxExecutor>) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &SandboxExecutor {
        &self.executor
    }

    /// Grade `submission` against every case of `exercise`, in order.
    ///
    /// Yields `Err(Cancelled)` once the submission is withdrawn and
    /// `Err(Internal)` if the sandbox infrastructure fails; both end the stream.
    pub fn grade<'a>(
        &'a self,
        submission: &'a Submission,
        exercise: &'a Exercise,
        options: GradeOptions,
    ) -> impl Stream<Item = Result<CaseVerdict, GradingError>> + Send + 'a {
        async_stream::try_stream! {
            let ctx = RunContext::new(options.cancel, options.deadline);
            let profile = self.executor.registry().resolve(&submission.language)?;

            let prepared = if options.compile_once {
                Some(
                    self.executor
                        .prepare(&submission.source_code, &submission.language, &ctx)
                        .await?,
                )
            } else {
                None
            };

            for case in &exercise.test_cases {
                if ctx.cancel.is_cancelled() {
                    Err::<(), _>(GradingError::Cancelled)?;
                }

                if ctx.budget_exhausted() {
                    debug!(case_id = case.id, "Grading deadline spent, case not started");
                    yield CaseVerdict {
                        case_id: case.id,
                        hidden: case.hidden,
                        outcome: Outcome::TimedOut,
                        execution: None,
                    };
                    continue;
                }

                let limits = case_limits(profile.limits, exercise, case);
                let stdin = case.input.as_bytes();
                let result = match &prepared {
                    Some(program) => self.executor.run_prepared(program, stdin, limits, &ctx).await?,
                    None => {
                        self.executor
                            .execute(
                                &submission.source_code,
                                &submission.language,
                                stdin,
                                Some(limits),
                                &ctx,
                            )
                            .await?
                    }
                };

                if result.termination == TerminationReason::KilledByScheduler {
                    Err::<(), _>(GradingError::Cancelled)?;
                }

                let outcome = classify(&result, &case.expected_output, exercise.comparison);
                debug!(
                    submission_id = %submission.id,
                    case_id = case.id,
                    outcome = %outcome,
                    termination = %result.termination,
                    wall_ms = result.usage.wall_time_ms,
                    "Case graded"
                );

                yield CaseVerdict {
                    case_id: case.id,
                    hidden: case.hidden,
                    outcome,
                    execution: Some(result),
                };
            }
        }
    }
}

/// Profile defaults, then exercise overrides, then case overrides
pub fn case_limits(defaults: Limits, exercise: &Exercise, case: &TestCase) -> Limits {
    let mut limits = defaults;
    if let Some(overrides) = &exercise.limits {
        limits = limits.with_overrides(overrides);
    }
    if let Some(overrides) = &case.limits {
        limits = limits.with_overrides(overrides);
    }
    limits
}

pub fn classify(result: &ExecutionResult, expected: &str, policy: ComparisonPolicy) -> Outcome {
    match result.termination {
        TerminationReason::CompileFailed => Outcome::CompileError,
        TerminationReason::TimedOut => Outcome::TimedOut,
        TerminationReason::MemoryExceeded
        | TerminationReason::OutputExceeded
        | TerminationReason::ProcessLimitExceeded => Outcome::ResourceExceeded,
        TerminationReason::Crashed => Outcome::RuntimeError,
        // Withdrawn runs never reach classification
        TerminationReason::KilledByScheduler => Outcome::InternalError,
        TerminationReason::Normal => {
            if result.exit_code != Some(0) || result.signal.is_some() {
                Outcome::RuntimeError
            } else if result.stdout_lossy {
                // Expected text is valid UTF-8, so no raw byte stream that isn't can equal it
                Outcome::WrongOutput
            } else if outputs_match(&result.stdout, expected, policy) {
                Outcome::Passed
            } else {
                Outcome::WrongOutput
            }
        }
    }
}
