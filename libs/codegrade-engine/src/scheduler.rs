/// Execution Scheduler - bounded admission for submissions
///
/// **Core Responsibility:**
/// Accept submissions, hold them in a bounded FIFO queue and grade them on
/// a fixed pool of workers, one submission per worker at a time.
///
/// **Guarantees:**
/// - At most `workers` submissions are graded concurrently
/// - Submissions are dequeued in arrival order
/// - Each submission gets one grading deadline spanning all of its cases
/// - A submission cancelled while queued never launches a sandbox
/// - A submission cancelled while running has its sandbox killed at once
use crate::aggregator::ResultAggregator;
use crate::catalog::ExerciseCatalog;
use crate::error::GradingError;
use crate::harness::{GradeOptions, TestHarness};
use crate::limiter::ResourceLimiter;
use crate::registry::LanguageRegistry;
use crate::sandbox::SandboxExecutor;
use anyhow::anyhow;
use codegrade_common::config::EngineSettings;
use codegrade_common::types::{Exercise, ReportMode, Submission, SubmissionVerdict};
use futures_util::StreamExt;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

type Reply = Result<SubmissionVerdict, GradingError>;

struct Job {
    submission: Submission,
    exercise: Arc<Exercise>,
    cancel: CancellationToken,
    reply: oneshot::Sender<Reply>,
    enqueued_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub workers: usize,
    /// Submissions currently being graded
    pub active: usize,
    /// Submissions waiting for a worker
    pub queued: usize,
}

/// State shared by the scheduler front and its workers
struct Shared {
    harness: TestHarness,
    aggregator: ResultAggregator,
    settings: EngineSettings,
    active: AtomicUsize,
    queued: AtomicUsize,
    closed: CancellationToken,
}

impl Shared {
    async fn grade(
        &self,
        submission: &Submission,
        exercise: &Exercise,
        options: GradeOptions,
        report_mode: ReportMode,
    ) -> Reply {
        let stream = self.harness.grade(submission, exercise, options);
        futures_util::pin_mut!(stream);

        let mut verdicts = Vec::with_capacity(exercise.test_cases.len());
        while let Some(verdict) = stream.next().await {
            let verdict = verdict?;
            let failed = !verdict.outcome.is_passed();
            verdicts.push(verdict);
            if failed && report_mode == ReportMode::FailFast {
                break;
            }
        }

        Ok(self.aggregator.aggregate(submission, exercise, &verdicts))
    }
}

/// Holds one slot of the active counter for as long as it lives
struct ActiveSlot<'a>(&'a AtomicUsize);

impl<'a> ActiveSlot<'a> {
    fn acquire(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Caller's side of one queued or running submission.
///
/// Dropping the handle before the verdict arrives cancels the submission.
pub struct SubmissionHandle {
    id: Uuid,
    cancel: CancellationToken,
    reply: oneshot::Receiver<Reply>,
    guard: DropGuard,
}

impl SubmissionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Withdraw the submission; a running sandbox is killed
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn verdict(self) -> Reply {
        let SubmissionHandle { reply, guard, .. } = self;
        let result = reply.await;
        guard.disarm();
        match result {
            Ok(reply) => reply,
            Err(_) => Err(GradingError::Internal(anyhow!(
                "Worker stopped before delivering a verdict"
            ))),
        }
    }
}

pub struct ExecutionScheduler {
    shared: Arc<Shared>,
    registry: Arc<LanguageRegistry>,
    catalog: Arc<dyn ExerciseCatalog>,
    sender: mpsc::Sender<Job>,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ExecutionScheduler {
    /// Spawn the worker pool. Must be called inside a Tokio runtime.
    pub fn start(
        settings: EngineSettings,
        registry: Arc<LanguageRegistry>,
        catalog: Arc<dyn ExerciseCatalog>,
        limiter: Arc<dyn ResourceLimiter>,
    ) -> Self {
        let workers = settings.workers.max(1);
        let (sender, receiver) = mpsc::channel(settings.queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let executor = SandboxExecutor::new(registry.clone(), limiter)
            .with_scratch_dir(settings.scratch_dir.clone());
        let shared = Arc::new(Shared {
            harness: TestHarness::new(Arc::new(executor)),
            aggregator: ResultAggregator::new(settings.diagnostic_bytes),
            settings,
            active: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            closed: CancellationToken::new(),
        });

        let handles = (0..workers)
            .map(|worker_id| tokio::spawn(worker_loop(worker_id, shared.clone(), receiver.clone())))
            .collect();

        info!(
            workers,
            queue_capacity = shared.settings.queue_capacity,
            grading_deadline_ms = shared.settings.grading_deadline_ms,
            report_mode = ?shared.settings.report_mode,
            compile_once = shared.settings.compile_once,
            "Execution scheduler started"
        );

        Self {
            shared,
            registry,
            catalog,
            sender,
            receiver,
            workers: Mutex::new(handles),
        }
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.shared.settings
    }

    /// Validate and enqueue a submission.
    ///
    /// Requests that can never be graded fail here, before any sandbox
    /// exists. Waiting for queue space is the only point that blocks.
    #[instrument(skip(self, submission), fields(submission_id = %submission.id, language = %submission.language))]
    pub async fn submit(&self, submission: Submission) -> Result<SubmissionHandle, GradingError> {
        if self.shared.closed.is_cancelled() {
            return Err(GradingError::QueueClosed);
        }

        self.registry.resolve(&submission.language)?;
        let exercise = self
            .catalog
            .exercise(&submission.exercise_id)
            .ok_or_else(|| GradingError::ExerciseNotFound(submission.exercise_id.clone()))?;

        let limit = self.shared.settings.max_source_bytes;
        if submission.source_code.len() > limit {
            return Err(GradingError::SourceTooLarge {
                size: submission.source_code.len(),
                limit,
            });
        }
        if exercise.test_cases.is_empty() {
            return Err(GradingError::EmptyExercise(exercise.id.clone()));
        }
        if let Some(case) = exercise.duplicate_case_id() {
            return Err(GradingError::DuplicateCase {
                exercise: exercise.id.clone(),
                case,
            });
        }

        let permit = tokio::select! {
            biased;
            _ = self.shared.closed.cancelled() => return Err(GradingError::QueueClosed),
            permit = self.sender.reserve() => permit.map_err(|_| GradingError::QueueClosed)?,
        };

        let id = submission.id;
        let cancel = CancellationToken::new();
        let (reply_tx, reply_rx) = oneshot::channel();

        self.shared.queued.fetch_add(1, Ordering::SeqCst);
        permit.send(Job {
            submission,
            exercise,
            cancel: cancel.clone(),
            reply: reply_tx,
            enqueued_at: Instant::now(),
        });
        debug!("Submission queued");

        Ok(SubmissionHandle {
            id,
            guard: cancel.clone().drop_guard(),
            cancel,
            reply: reply_rx,
        })
    }

    /// Submit and wait for the verdict
    pub async fn grade(&self, submission: Submission) -> Reply {
        self.submit(submission).await?.verdict().await
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            workers: self.shared.settings.workers.max(1),
            active: self.shared.active.load(Ordering::SeqCst),
            queued: self.shared.queued.load(Ordering::SeqCst),
        }
    }

    /// Stop accepting work, fail whatever is still queued and wait for
    /// running submissions to finish.
    pub async fn shutdown(&self) {
        self.shared.closed.cancel();

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Worker task failed");
            }
        }

        let mut receiver = self.receiver.lock().await;
        receiver.close();
        while let Ok(job) = receiver.try_recv() {
            self.shared.queued.fetch_sub(1, Ordering::SeqCst);
            let _ = job.reply.send(Err(GradingError::QueueClosed));
        }
        info!("Execution scheduler stopped");
    }
}

#[instrument(skip(shared, receiver))]
async fn worker_loop(
    worker_id: usize,
    shared: Arc<Shared>,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
) {
    loop {
        let job = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                biased;
                _ = shared.closed.cancelled() => None,
                job = receiver.recv() => job,
            }
        };
        let Some(job) = job else {
            break;
        };
        shared.queued.fetch_sub(1, Ordering::SeqCst);
        process(&shared, job).await;
    }
    debug!("Worker exiting");
}

async fn process(shared: &Arc<Shared>, job: Job) {
    let Job {
        submission,
        exercise,
        cancel,
        reply,
        enqueued_at,
    } = job;
    let submission_id = submission.id;

    if cancel.is_cancelled() {
        debug!(submission_id = %submission_id, "Submission withdrawn while queued");
        let _ = reply.send(Err(GradingError::Cancelled));
        return;
    }

    let slot = ActiveSlot::acquire(&shared.active);
    let settings = &shared.settings;
    let deadline_ms = exercise
        .grading_deadline_ms
        .unwrap_or(settings.grading_deadline_ms);
    let report_mode = exercise.report_mode.unwrap_or(settings.report_mode);
    let options = GradeOptions {
        compile_once: settings.compile_once,
        deadline: Some(Instant::now() + Duration::from_millis(deadline_ms)),
        cancel,
    };

    info!(
        submission_id = %submission_id,
        exercise_id = %exercise.id,
        language = %submission.language,
        test_cases = exercise.test_cases.len(),
        queued_ms = enqueued_at.elapsed().as_millis() as u64,
        "Grading submission"
    );
    let started = Instant::now();

    // Grade on a separate task so a panic fails one submission, not the worker
    let task = {
        let shared = shared.clone();
        tokio::spawn(async move {
            shared
                .grade(&submission, &exercise, options, report_mode)
                .await
        })
    };
    let result = match task.await {
        Ok(result) => result,
        Err(e) => Err(GradingError::Internal(anyhow!("Grading task failed: {}", e))),
    };

    match &result {
        Ok(verdict) => info!(
            submission_id = %submission_id,
            outcome = %verdict.outcome,
            passed = verdict.passed,
            total = verdict.total,
            grading_ms = started.elapsed().as_millis() as u64,
            "Grading completed"
        ),
        Err(GradingError::Cancelled) => warn!(submission_id = %submission_id, "Submission cancelled"),
        Err(e) => error!(submission_id = %submission_id, error = %e, "Grading failed"),
    }

    drop(slot);
    let _ = reply.send(result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::limiter::testing::{Scripted, ScriptedLimiter};
    use crate::limiter::Launch;
    use codegrade_common::types::Outcome;

    const LANGUAGES: &str = r#"{
        "languages": [
            {
                "name": "script",
                "source_file": "main.script",
                "run": ["/opt/interp", "{source}"],
                "limits": {"cpu_time_ms": 1000, "wall_time_ms": 2000, "memory_bytes": 67108864,
                           "max_output_bytes": 4096, "max_processes": 4}
            }
        ]
    }"#;

    const EXERCISES: &str = r#"{
        "exercises": [
            {
                "id": "echo",
                "comparison": "whitespace",
                "test_cases": [
                    {"id": 1, "input": "alpha\n", "expected_output": "alpha\n"},
                    {"id": 2, "input": "beta\n", "expected_output": "beta\n", "hidden": true},
                    {"id": 3, "input": "gamma\n", "expected_output": "gamma\n"}
                ]
            },
            {
                "id": "strict",
                "comparison": "exact",
                "report_mode": "fail-fast",
                "test_cases": [
                    {"id": 1, "input": "a", "expected_output": "a"},
                    {"id": 2, "input": "b", "expected_output": "wrong"},
                    {"id": 3, "input": "c", "expected_output": "c"}
                ]
            },
            {
                "id": "slow",
                "comparison": "exact",
                "grading_deadline_ms": 150,
                "test_cases": [
                    {"id": 1, "input": "loop", "expected_output": ""},
                    {"id": 2, "input": "a", "expected_output": "a"},
                    {"id": 3, "input": "b", "expected_output": "b"}
                ]
            },
            {
                "id": "hang",
                "comparison": "exact",
                "limits": {"wall_time_ms": 60000},
                "test_cases": [
                    {"id": 1, "input": "loop", "expected_output": ""}
                ]
            },
            {"id": "first", "comparison": "exact", "test_cases": [{"id": 1, "input": "first", "expected_output": "first"}]},
            {"id": "second", "comparison": "exact", "test_cases": [{"id": 1, "input": "second", "expected_output": "second"}]},
            {"id": "third", "comparison": "exact", "test_cases": [{"id": 1, "input": "third", "expected_output": "third"}]},
            {"id": "empty", "comparison": "exact", "test_cases": []}
        ]
    }"#;

    /// Inserted directly so it skips the catalog's own checks
    const TWINS: &str = r#"{
        "id": "twins",
        "comparison": "exact",
        "test_cases": [
            {"id": 1, "input": "HIDDEN_IN", "expected_output": "HIDDEN_OUT", "hidden": true},
            {"id": 1, "input": "a", "expected_output": "b"}
        ]
    }"#;

    /// Echoes stdin, after a short pause; "loop" never finishes
    fn echo(launch: &Launch<'_>) -> Scripted {
        let input = launch
            .stdin
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .unwrap_or_default();
        if input == "loop" {
            Scripted::prints("").runs_for(Duration::from_secs(600))
        } else {
            Scripted::prints(&input).runs_for(Duration::from_millis(30))
        }
    }

    fn scheduler(workers: usize, limiter: Arc<ScriptedLimiter>) -> ExecutionScheduler {
        let settings = EngineSettings {
            workers,
            queue_capacity: 16,
            ..Default::default()
        };
        let registry = Arc::new(LanguageRegistry::from_json(LANGUAGES).unwrap());
        let mut catalog = InMemoryCatalog::from_json(EXERCISES).unwrap();
        catalog.insert(serde_json::from_str(TWINS).unwrap());
        ExecutionScheduler::start(settings, registry, Arc::new(catalog), limiter)
    }

    fn submission(exercise: &str) -> Submission {
        Submission::new(exercise, "script", "print(input())", "learner")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_never_exceeds_pool() {
        let limiter = Arc::new(ScriptedLimiter::new(echo));
        let scheduler = scheduler(2, limiter.clone());

        let mut handles = Vec::new();
        for _ in 0..6 {
            handles.push(scheduler.submit(submission("echo")).await.unwrap());
        }
        for handle in handles {
            assert_eq!(handle.verdict().await.unwrap().outcome, Outcome::Passed);
        }

        assert!(limiter.peak_running() <= 2);
        assert_eq!(limiter.launches().len(), 18);
    }

    #[tokio::test]
    async fn test_submissions_are_served_fifo() {
        let limiter = Arc::new(ScriptedLimiter::new(echo));
        let scheduler = scheduler(1, limiter.clone());

        let mut handles = Vec::new();
        for exercise in ["first", "second", "third"] {
            handles.push(scheduler.submit(submission(exercise)).await.unwrap());
        }
        for handle in handles {
            handle.verdict().await.unwrap();
        }

        let order: Vec<String> = limiter
            .launches()
            .into_iter()
            .filter_map(|l| l.stdin)
            .collect();
        assert_eq!(order, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_cancelled_queued_submission_never_launches() {
        let limiter = Arc::new(ScriptedLimiter::new(echo));
        let scheduler = scheduler(1, limiter.clone());

        let running = scheduler.submit(submission("first")).await.unwrap();
        let queued = scheduler.submit(submission("second")).await.unwrap();
        queued.cancel();

        assert_eq!(running.verdict().await.unwrap().outcome, Outcome::Passed);
        assert!(matches!(queued.verdict().await, Err(GradingError::Cancelled)));

        let inputs: Vec<String> = limiter.launches().into_iter().filter_map(|l| l.stdin).collect();
        assert_eq!(inputs, vec!["first"]);
    }

    #[tokio::test]
    async fn test_cancel_kills_running_sandbox() {
        let limiter = Arc::new(ScriptedLimiter::new(echo));
        let scheduler = scheduler(1, limiter.clone());
        let started = Instant::now();

        let handle = scheduler.submit(submission("hang")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();

        assert!(matches!(handle.verdict().await, Err(GradingError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(scheduler.stats().active, 0);
    }

    #[tokio::test]
    async fn test_dropping_handle_cancels_submission() {
        let limiter = Arc::new(ScriptedLimiter::new(echo));
        let scheduler = scheduler(1, limiter.clone());

        let handle = scheduler.submit(submission("hang")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(handle);

        // The worker is free again once the hung sandbox was killed
        let verdict = tokio::time::timeout(Duration::from_secs(5), scheduler.grade(submission("first")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(verdict.outcome, Outcome::Passed);
    }

    #[tokio::test]
    async fn test_deadline_marks_remaining_cases_timed_out() {
        let limiter = Arc::new(ScriptedLimiter::new(echo));
        let scheduler = scheduler(1, limiter.clone());

        let verdict = scheduler.grade(submission("slow")).await.unwrap();

        assert_eq!(verdict.outcome, Outcome::TimedOut);
        assert_eq!(verdict.cases.len(), 3);
        assert!(verdict.cases.iter().all(|c| c.outcome == Outcome::TimedOut));
        assert_eq!(verdict.first_failing_case, Some(1));
        assert_eq!(limiter.launches().len(), 1);
    }

    #[tokio::test]
    async fn test_fail_fast_stops_after_first_failure() {
        let limiter = Arc::new(ScriptedLimiter::new(echo));
        let scheduler = scheduler(1, limiter.clone());

        let verdict = scheduler.grade(submission("strict")).await.unwrap();

        assert_eq!(verdict.outcome, Outcome::WrongOutput);
        assert_eq!(verdict.cases.len(), 2);
        assert_eq!(verdict.first_failing_case, Some(2));
        assert_eq!(verdict.total, 3);
        assert_eq!(limiter.launches().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_requests_fail_before_any_sandbox() {
        let limiter = Arc::new(ScriptedLimiter::new(echo));
        let scheduler = scheduler(1, limiter.clone());

        let mut unknown_language = submission("echo");
        unknown_language.language = "brainfuck".to_string();
        assert!(matches!(
            scheduler.submit(unknown_language).await,
            Err(GradingError::UnsupportedLanguage(_))
        ));
        assert!(matches!(
            scheduler.submit(submission("nope")).await,
            Err(GradingError::ExerciseNotFound(_))
        ));
        assert!(matches!(
            scheduler.submit(submission("empty")).await,
            Err(GradingError::EmptyExercise(_))
        ));
        assert!(matches!(
            scheduler.submit(submission("twins")).await,
            Err(GradingError::DuplicateCase { case: 1, .. })
        ));

        let mut huge = submission("echo");
        huge.source_code = "x".repeat(2 * 1024 * 1024);
        assert!(matches!(
            scheduler.submit(huge).await,
            Err(GradingError::SourceTooLarge { .. })
        ));

        assert!(limiter.launches().is_empty());
        assert_eq!(scheduler.stats().queued, 0);
    }

    #[tokio::test]
    async fn test_hidden_case_content_is_redacted() {
        let limiter = Arc::new(ScriptedLimiter::new(echo));
        let scheduler = scheduler(1, limiter);

        let verdict = scheduler.grade(submission("echo")).await.unwrap();

        assert_eq!(verdict.outcome, Outcome::Passed);
        assert!(verdict.cases[0].diagnostics.is_some());
        assert!(verdict.cases[1].diagnostics.is_none());
        let json = serde_json::to_string(&verdict).unwrap();
        assert!(!json.contains("beta"));
    }

    #[tokio::test]
    async fn test_regrading_is_deterministic() {
        let limiter = Arc::new(ScriptedLimiter::new(echo));
        let scheduler = scheduler(2, limiter);
        let sub = submission("strict");

        let first = scheduler.grade(sub.clone()).await.unwrap();
        let second = scheduler.grade(sub).await.unwrap();

        // Resource usage is measured, not derived, so it is left out
        let shape = |v: &SubmissionVerdict| {
            (
                v.outcome,
                v.score,
                v.first_failing_case,
                v.cases
                    .iter()
                    .map(|c| (c.case_id, c.outcome, c.exit_code, c.diagnostics.clone()))
                    .collect::<Vec<_>>(),
            )
        };
        assert_eq!(shape(&first), shape(&second));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_submissions() {
        let limiter = Arc::new(ScriptedLimiter::new(echo));
        let scheduler = scheduler(1, limiter);

        scheduler.grade(submission("first")).await.unwrap();
        scheduler.shutdown().await;

        assert!(matches!(
            scheduler.submit(submission("first")).await,
            Err(GradingError::QueueClosed)
        ));
        let stats = scheduler.stats();
        assert_eq!((stats.active, stats.queued), (0, 0));
    }
}
