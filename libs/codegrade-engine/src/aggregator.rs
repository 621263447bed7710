/// Result Aggregator - per-case verdicts to the submission verdict
///
/// **Scoring Rules:**
/// - score = passed cases / test cases in the exercise
/// - outcome = Passed only if every case passed, otherwise the outcome of
///   the first non-passing case, whose id becomes `first_failing_case`
///
/// **Disclosure Rules:**
/// Hidden cases surface outcome, termination and resource usage only. Their
/// input, expected output and captured streams never reach the verdict.
use codegrade_common::types::{
    CaseReport, CaseVerdict, Diagnostics, Exercise, Outcome, Submission, SubmissionVerdict,
    TestCase,
};

const TRUNCATION_MARKER: &str = "\n...[truncated]";

#[derive(Debug, Clone, Copy)]
pub struct ResultAggregator {
    diagnostic_bytes: usize,
}

impl ResultAggregator {
    /// `diagnostic_bytes` caps each diagnostic text field
    pub fn new(diagnostic_bytes: usize) -> Self {
        Self { diagnostic_bytes }
    }

    pub fn aggregate(
        &self,
        submission: &Submission,
        exercise: &Exercise,
        verdicts: &[CaseVerdict],
    ) -> SubmissionVerdict {
        let total = exercise.test_cases.len();
        let passed = verdicts.iter().filter(|v| v.outcome.is_passed()).count();
        let first_failure = verdicts.iter().find(|v| !v.outcome.is_passed());

        let outcome = match first_failure {
            Some(verdict) => verdict.outcome,
            None if verdicts.len() == total => Outcome::Passed,
            // Fewer verdicts than cases without a failure means grading stopped early
            None => Outcome::InternalError,
        };

        let score = if total == 0 {
            0.0
        } else {
            passed as f64 / total as f64
        };

        let compile_output = verdicts
            .iter()
            .find(|v| v.outcome == Outcome::CompileError)
            .and_then(|v| v.execution.as_ref())
            .map(|run| {
                let text = if run.stderr.is_empty() {
                    &run.stdout
                } else {
                    &run.stderr
                };
                self.truncate(text)
            });

        // Verdicts arrive in case order, one per case, so they pair by position
        let cases = verdicts
            .iter()
            .enumerate()
            .map(|(index, verdict)| self.report(exercise.test_cases.get(index), verdict))
            .collect();

        SubmissionVerdict {
            submission_id: submission.id,
            exercise_id: exercise.id.clone(),
            language: submission.language.clone(),
            outcome,
            score,
            passed,
            total,
            first_failing_case: first_failure.map(|v| v.case_id),
            compile_output,
            cases,
        }
    }

    fn report(&self, case: Option<&TestCase>, verdict: &CaseVerdict) -> CaseReport {
        let run = verdict.execution.as_ref();
        let case = case.filter(|c| c.id == verdict.case_id);

        let diagnostics = match case {
            Some(case) if !verdict.hidden && !case.hidden => Some(Diagnostics {
                input: self.truncate(&case.input),
                expected_output: self.truncate(&case.expected_output),
                stdout: run.map(|r| self.truncate(&r.stdout)).unwrap_or_default(),
                stderr: run.map(|r| self.truncate(&r.stderr)).unwrap_or_default(),
            }),
            _ => None,
        };

        CaseReport {
            case_id: verdict.case_id,
            outcome: verdict.outcome,
            termination: run.map(|r| r.termination),
            exit_code: run.and_then(|r| r.exit_code),
            signal: run.and_then(|r| r.signal),
            usage: run.map(|r| r.usage),
            diagnostics,
        }
    }

    fn truncate(&self, text: &str) -> String {
        if text.len() <= self.diagnostic_bytes {
            return text.to_string();
        }
        let mut end = self.diagnostic_bytes;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}{}", &text[..end], TRUNCATION_MARKER)
    }
}
