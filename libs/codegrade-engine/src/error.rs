use thiserror::Error;

/// Failures that stop a submission from being graded.
///
/// Program failures (non-zero exit, limit breaches, wrong output) are not
/// errors: they are recorded as `Outcome`s in the verdict. Only `Internal`
/// means the sandbox infrastructure itself broke.
#[derive(Error, Debug)]
pub enum GradingError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("Exercise not found: {0}")]
    ExerciseNotFound(String),
    #[error("Source code exceeds maximum size of {limit} bytes ({size} bytes submitted)")]
    SourceTooLarge { size: usize, limit: usize },
    #[error("Exercise '{0}' has no test cases")]
    EmptyExercise(String),
    #[error("Test case id {case} appears twice in exercise '{exercise}'")]
    DuplicateCase { exercise: String, case: u32 },
    #[error("Execution queue is closed")]
    QueueClosed,
    #[error("Submission was cancelled")]
    Cancelled,
    #[error("Internal grading failure: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl GradingError {
    pub fn is_internal(&self) -> bool {
        matches!(self, GradingError::Internal(_))
    }
}
