use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Resource ceilings for a single sandboxed process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub cpu_time_ms: u64,
    pub wall_time_ms: u64,
    pub memory_bytes: u64,
    /// Combined stdout + stderr budget
    pub max_output_bytes: u64,
    /// Largest file the program may write inside its scope
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    /// Processes and threads alive at once, root included
    pub max_processes: u32,
}

fn default_max_file_bytes() -> u64 {
    64 * 1024 * 1024
}

impl Limits {
    pub fn cpu_time(&self) -> Duration {
        Duration::from_millis(self.cpu_time_ms)
    }

    pub fn wall_time(&self) -> Duration {
        Duration::from_millis(self.wall_time_ms)
    }

    /// Layer optional overrides on top of these limits
    pub fn with_overrides(mut self, overrides: &LimitOverrides) -> Self {
        if let Some(v) = overrides.cpu_time_ms {
            self.cpu_time_ms = v;
        }
        if let Some(v) = overrides.wall_time_ms {
            self.wall_time_ms = v;
        }
        if let Some(v) = overrides.memory_bytes {
            self.memory_bytes = v;
        }
        if let Some(v) = overrides.max_output_bytes {
            self.max_output_bytes = v;
        }
        if let Some(v) = overrides.max_file_bytes {
            self.max_file_bytes = v;
        }
        if let Some(v) = overrides.max_processes {
            self.max_processes = v;
        }
        self
    }

    /// Clamp the wall-clock ceiling to what is left of a grading budget
    /// Partial milliseconds round up so the ceiling never lands before the deadline.
    pub fn clamp_wall_time(mut self, remaining: Duration) -> Self {
        let remaining_ms = remaining.as_micros().div_ceil(1000).min(u64::MAX as u128) as u64;
        self.wall_time_ms = self.wall_time_ms.min(remaining_ms);
        self
    }
}

/// Partial limits supplied by an exercise or a single test case
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitOverrides {
    pub cpu_time_ms: Option<u64>,
    pub wall_time_ms: Option<u64>,
    pub memory_bytes: Option<u64>,
    pub max_output_bytes: Option<u64>,
    pub max_file_bytes: Option<u64>,
    pub max_processes: Option<u32>,
}

/// How captured stdout is compared against the expected output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonPolicy {
    /// Byte-for-byte equality
    Exact,
    /// Insensitive to trailing, repeated and line-ending whitespace
    #[serde(alias = "whitespace_normalized")]
    Whitespace,
}

/// Whether grading stops at the first failing case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportMode {
    #[default]
    Full,
    FailFast,
}

impl FromStr for ReportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" | "full-report" => Ok(ReportMode::Full),
            "fail-fast" | "failfast" | "fail_fast" => Ok(ReportMode::FailFast),
            other => Err(format!("Unknown report mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: u32,
    pub input: String,
    pub expected_output: String,
    /// Hidden cases never surface their input, expected value or captured output
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub limits: Option<LimitOverrides>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exercise {
    pub id: String,
    pub test_cases: Vec<TestCase>,
    pub comparison: ComparisonPolicy,
    #[serde(default)]
    pub limits: Option<LimitOverrides>,
    #[serde(default)]
    pub report_mode: Option<ReportMode>,
    #[serde(default)]
    pub grading_deadline_ms: Option<u64>,
}

impl Exercise {
    /// First test case id that appears more than once, if any
    pub fn duplicate_case_id(&self) -> Option<u32> {
        let mut seen = HashSet::new();
        self.test_cases
            .iter()
            .map(|case| case.id)
            .find(|id| !seen.insert(*id))
    }
}

/// Learner-authored code to grade. Read-only once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: Uuid,
    pub exercise_id: String,
    pub language: String,
    pub source_code: String,
    /// Opaque attribution token, never used for sandbox behavior
    pub submitter: String,
}

impl Submission {
    pub fn new(
        exercise_id: impl Into<String>,
        language: impl Into<String>,
        source_code: impl Into<String>,
        submitter: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            exercise_id: exercise_id.into(),
            language: language.into(),
            source_code: source_code.into(),
            submitter: submitter.into(),
        }
    }
}

/// Why a sandboxed process stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Normal,
    TimedOut,
    MemoryExceeded,
    OutputExceeded,
    ProcessLimitExceeded,
    /// Killed by a signal the limiter did not send
    Crashed,
    KilledByScheduler,
    CompileFailed,
}

impl TerminationReason {
    pub fn is_resource_breach(&self) -> bool {
        matches!(
            self,
            TerminationReason::MemoryExceeded
                | TerminationReason::OutputExceeded
                | TerminationReason::ProcessLimitExceeded
        )
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminationReason::Normal => "normal",
            TerminationReason::TimedOut => "timed-out",
            TerminationReason::MemoryExceeded => "memory-exceeded",
            TerminationReason::OutputExceeded => "output-exceeded",
            TerminationReason::ProcessLimitExceeded => "process-limit-exceeded",
            TerminationReason::Crashed => "crashed",
            TerminationReason::KilledByScheduler => "killed-by-scheduler",
            TerminationReason::CompileFailed => "compile-failed",
        };
        write!(f, "{}", s)
    }
}

/// Resources a process actually consumed.
/// CPU and memory are `None` when the backend cannot observe them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_time_ms: Option<u64>,
    pub peak_memory_bytes: Option<u64>,
    pub wall_time_ms: u64,
}

/// Raw observation of one bounded process run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Raw stdout was not valid UTF-8, so `stdout` is a lossy decoding
    #[serde(default)]
    pub stdout_lossy: bool,
    pub usage: ResourceUsage,
    pub termination: TerminationReason,
    /// Capture stopped at the output cap
    pub output_truncated: bool,
}

impl ExecutionResult {
    /// Exited on its own with status 0
    pub fn succeeded(&self) -> bool {
        self.termination == TerminationReason::Normal && self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    WrongOutput,
    RuntimeError,
    CompileError,
    TimedOut,
    ResourceExceeded,
    InternalError,
}

impl Outcome {
    pub fn is_passed(&self) -> bool {
        *self == Outcome::Passed
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Passed => "passed",
            Outcome::WrongOutput => "wrong_output",
            Outcome::RuntimeError => "runtime_error",
            Outcome::CompileError => "compile_error",
            Outcome::TimedOut => "timed_out",
            Outcome::ResourceExceeded => "resource_exceeded",
            Outcome::InternalError => "internal_error",
        };
        write!(f, "{}", s)
    }
}

/// Verdict for one test case, with the run that produced it.
/// `execution` is `None` when the case was never started (grading budget spent).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseVerdict {
    pub case_id: u32,
    pub hidden: bool,
    pub outcome: Outcome,
    pub execution: Option<ExecutionResult>,
}

/// Learner-visible text for a non-hidden case
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub input: String,
    pub expected_output: String,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseReport {
    pub case_id: u32,
    pub outcome: Outcome,
    pub termination: Option<TerminationReason>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub usage: Option<ResourceUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<Diagnostics>,
}

/// Terminal grading artifact handed back to the platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionVerdict {
    pub submission_id: Uuid,
    pub exercise_id: String,
    pub language: String,
    pub outcome: Outcome,
    pub score: f64,
    pub passed: usize,
    pub total: usize,
    pub first_failing_case: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_output: Option<String>,
    pub cases: Vec<CaseReport>,
}
