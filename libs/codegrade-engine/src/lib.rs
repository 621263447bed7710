//! Code execution engine: runs untrusted learner code against exercise
//! test cases in isolated, resource-bounded sandboxes and produces a
//! deterministic verdict.
//!
//! Leaf first: `registry` → `limiter` → `sandbox` → `harness` →
//! `scheduler`, with `aggregator` turning case verdicts into the result
//! handed back to the platform.

pub mod aggregator;
pub mod catalog;
pub mod compare;
pub mod error;
pub mod harness;
pub mod limiter;
pub mod registry;
pub mod sandbox;
pub mod scheduler;


pub use aggregator::ResultAggregator;
pub use catalog::{ExerciseCatalog, InMemoryCatalog};
pub use error::GradingError;
pub use harness::{GradeOptions, TestHarness};
pub use limiter::{ContainerLimiter, ProcessLimiter, ResourceLimiter};
pub use registry::{LanguageProfile, LanguageRegistry};
pub use sandbox::{RunContext, SandboxExecutor};
pub use scheduler::{ExecutionScheduler, SchedulerStats, SubmissionHandle};
