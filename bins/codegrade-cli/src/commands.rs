// CLI commands for local grading and configuration checks
use anyhow::{bail, Context, Result};
use codegrade_common::config::{BackendKind, EngineSettings};
use codegrade_common::types::{Outcome, ReportMode, Submission};
use codegrade_engine::catalog::ExerciseCatalog;
use codegrade_engine::{limiter, ExecutionScheduler, InMemoryCatalog, LanguageRegistry};
use std::fs;
use std::path::Path;
use std::sync::Arc;

pub struct GradeArgs<'a> {
    pub languages: &'a Path,
    pub exercises: &'a Path,
    pub exercise_id: &'a str,
    pub language: &'a str,
    pub source: &'a Path,
    pub report: Option<ReportMode>,
    pub compile_once: bool,
    pub backend: Option<BackendKind>,
}

/// Grade one source file and print the verdict as JSON.
/// Returns whether every case passed.
pub async fn grade(args: GradeArgs<'_>) -> Result<bool> {
    let registry = LanguageRegistry::load(args.languages)?;
    let mut catalog = InMemoryCatalog::load(args.exercises)?;

    let source_code = fs::read_to_string(args.source)
        .with_context(|| format!("Failed to read {}", args.source.display()))?;

    if let Some(mode) = args.report {
        let Some(exercise) = catalog.exercise(args.exercise_id) else {
            bail!("Exercise '{}' not found in {}", args.exercise_id, args.exercises.display());
        };
        let mut exercise = (*exercise).clone();
        exercise.report_mode = Some(mode);
        catalog.insert(exercise);
    }

    let mut settings = EngineSettings::from_env()?;
    settings.workers = 1;
    settings.compile_once |= args.compile_once;
    if let Some(backend) = args.backend {
        settings.backend = backend;
    }

    let limiter = limiter::from_settings(&settings)?;
    let scheduler = ExecutionScheduler::start(
        settings,
        Arc::new(registry),
        Arc::new(catalog),
        limiter,
    );

    let submission = Submission::new(args.exercise_id, args.language, source_code, "cli");
    let verdict = scheduler.grade(submission).await;
    scheduler.shutdown().await;
    let verdict = verdict?;

    println!("{}", serde_json::to_string_pretty(&verdict)?);
    eprintln!(
        "{}: {}/{} passed (score {:.2})",
        verdict.outcome, verdict.passed, verdict.total, verdict.score
    );

    Ok(verdict.outcome == Outcome::Passed)
}

pub fn list_languages(languages: &Path) -> Result<()> {
    let registry = LanguageRegistry::load(languages)?;

    println!("{:<12} {:<10} {:<9} IMAGE", "LANGUAGE", "VERSION", "COMPILED");
    for name in registry.list_languages() {
        let profile = registry.resolve(&name)?;
        println!(
            "{:<12} {:<10} {:<9} {}",
            name,
            if profile.version.is_empty() { "-" } else { profile.version.as_str() },
            if profile.compile.is_some() { "yes" } else { "no" },
            profile.image.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

/// Problems in an exercise file that loading alone does not catch
pub fn exercise_problems(catalog: &InMemoryCatalog) -> Vec<String> {
    let mut problems = Vec::new();
    for id in catalog.ids() {
        let Some(exercise) = catalog.exercise(&id) else {
            continue;
        };
        if exercise.test_cases.is_empty() {
            problems.push(format!("{}: no test cases", id));
        }
        if let Some(case) = exercise.duplicate_case_id() {
            problems.push(format!("{}: duplicate test case id {}", id, case));
        }
    }
    problems
}

pub fn validate(languages: &Path, exercises: &Path) -> Result<()> {
    let registry = LanguageRegistry::load(languages)?;
    println!(
        "✓ {}: {} languages ({})",
        languages.display(),
        registry.list_languages().len(),
        registry.list_languages().join(", ")
    );

    let catalog = InMemoryCatalog::load(exercises)?;
    let problems = exercise_problems(&catalog);
    if !problems.is_empty() {
        for problem in &problems {
            eprintln!("✗ {}", problem);
        }
        bail!("{} problem(s) in {}", problems.len(), exercises.display());
    }
    println!("✓ {}: {} exercises", exercises.display(), catalog.len());
    Ok(())
}
