// Exercise catalog seam
// The platform owns exercises; the engine only reads them while grading

use anyhow::{bail, Context, Result};
use codegrade_common::types::Exercise;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

pub trait ExerciseCatalog: Send + Sync {
    fn exercise(&self, id: &str) -> Option<Arc<Exercise>>;
}

#[derive(Debug, Deserialize)]
struct ExercisesJson {
    exercises: Vec<Exercise>,
}

/// Catalog held in memory, loaded from exercises.json
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    exercises: HashMap<String, Arc<Exercise>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("Exercise file not found: {}", path.display());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_json(&content).with_context(|| format!("Failed to load {}", path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let parsed: ExercisesJson =
            serde_json::from_str(content).context("Failed to parse exercises.json")?;

        let mut catalog = Self::new();
        for exercise in parsed.exercises {
            let id = exercise.id.clone();
            if let Some(case) = exercise.duplicate_case_id() {
                bail!("Test case id {} appears twice in exercise '{}'", case, id);
            }
            if catalog.insert(exercise).is_some() {
                bail!("Duplicate exercise id '{}'", id);
            }
        }
        Ok(catalog)
    }

    /// Add or replace an exercise, returning the previous one
    pub fn insert(&mut self, exercise: Exercise) -> Option<Arc<Exercise>> {
        self.exercises
            .insert(exercise.id.clone(), Arc::new(exercise))
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.exercises.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.exercises.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exercises.is_empty()
    }
}

impl ExerciseCatalog for InMemoryCatalog {
    fn exercise(&self, id: &str) -> Option<Arc<Exercise>> {
        self.exercises.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codegrade_common::types::ComparisonPolicy;

    const EXERCISES: &str = r#"{
        "exercises": [
            {
                "id": "hello",
                "comparison": "exact",
                "test_cases": [
                    {"id": 1, "input": "", "expected_output": "Hello, World!\n"}
                ]
            },
            {
                "id": "sum",
                "comparison": "whitespace",
                "report_mode": "fail-fast",
                "limits": {"wall_time_ms": 1000},
                "test_cases": [
                    {"id": 1, "input": "1 2\n", "expected_output": "3\n"},
                    {"id": 2, "input": "5 5\n", "expected_output": "10\n", "hidden": true}
                ]
            }
        ]
    }"#;

    #[test]
    fn test_lookup_by_id() {
        let catalog = InMemoryCatalog::from_json(EXERCISES).unwrap();

        let sum = catalog.exercise("sum").unwrap();
        assert_eq!(sum.comparison, ComparisonPolicy::Whitespace);
        assert!(sum.test_cases[1].hidden);
        assert_eq!(catalog.ids(), vec!["hello", "sum"]);
        assert!(catalog.exercise("missing").is_none());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let dup = EXERCISES.replace("\"id\": \"sum\"", "\"id\": \"hello\"");
        assert!(InMemoryCatalog::from_json(&dup).is_err());
    }

    #[test]
    fn test_duplicate_case_ids_rejected() {
        let dup = EXERCISES.replace(
            r#"{"id": 2, "input": "5 5\n""#,
            r#"{"id": 1, "input": "5 5\n""#,
        );
        assert_ne!(dup, EXERCISES);

        let err = InMemoryCatalog::from_json(&dup).unwrap_err();
        assert!(err.to_string().contains("appears twice"));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(InMemoryCatalog::load(Path::new("does/not/exist.json")).is_err());
    }
}
