// Language profile registry
// Immutable after load; injected wherever profiles are needed

use crate::error::GradingError;
use anyhow::{bail, Context, Result};
use codegrade_common::types::Limits;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;

const SLOT_SOURCE: &str = "{source}";
const SLOT_EXECUTABLE: &str = "{executable}";
const SLOT_WORKDIR: &str = "{workdir}";

fn default_executable() -> String {
    "main".to_string()
}

/// Toolchain invocation for one language.
///
/// `compile` and `run` are argument vectors. The slots `{source}`,
/// `{executable}` and `{workdir}` are substituted inside individual
/// arguments; nothing is ever handed to a shell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageProfile {
    pub name: String,
    #[serde(default)]
    pub version: String,
    /// Container image, required by the container backend only
    #[serde(default)]
    pub image: Option<String>,
    pub source_file: String,
    #[serde(default = "default_executable")]
    pub executable: String,
    #[serde(default)]
    pub compile: Option<Vec<String>>,
    pub run: Vec<String>,
    /// Environment allowlist handed to the program
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub limits: Limits,
    #[serde(default)]
    pub compile_limits: Option<Limits>,
}

impl LanguageProfile {
    pub fn compile_limits(&self) -> Limits {
        self.compile_limits.unwrap_or(self.limits)
    }

    /// Fill the template slots for a scope seen by the program at `workdir`
    pub fn expand(&self, template: &[String], workdir: &Path) -> Vec<String> {
        let workdir_str = workdir.to_string_lossy();
        let source = workdir.join(&self.source_file);
        let executable = workdir.join(&self.executable);
        let source = source.to_string_lossy();
        let executable = executable.to_string_lossy();

        template
            .iter()
            .map(|arg| {
                arg.replace(SLOT_SOURCE, &source)
                    .replace(SLOT_EXECUTABLE, &executable)
                    .replace(SLOT_WORKDIR, &workdir_str)
            })
            .collect()
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("Language profile has an empty name");
        }
        for (field, value) in [("source_file", &self.source_file), ("executable", &self.executable)] {
            if value.is_empty() || value.contains('/') || value == "." || value == ".." {
                bail!("{}: {} must be a plain file name, got '{}'", self.name, field, value);
            }
        }
        if self.run.is_empty() {
            bail!("{}: run command is empty", self.name);
        }
        if matches!(&self.compile, Some(cmd) if cmd.is_empty()) {
            bail!("{}: compile command is empty", self.name);
        }
        let templates = self.compile.iter().chain(std::iter::once(&self.run));
        for template in templates {
            for arg in template {
                check_slots(&self.name, arg)?;
            }
        }
        for limits in std::iter::once(&self.limits).chain(self.compile_limits.iter()) {
            if limits.wall_time_ms == 0 || limits.cpu_time_ms == 0 {
                bail!("{}: time limits must be positive", self.name);
            }
            if limits.memory_bytes == 0 || limits.max_processes == 0 {
                bail!("{}: memory and process limits must be positive", self.name);
            }
        }
        Ok(())
    }
}

/// Reject `{...}` slots that nothing would substitute
fn check_slots(language: &str, arg: &str) -> Result<()> {
    let mut rest = arg;
    while let Some(start) = rest.find('{') {
        let tail = &rest[start..];
        let Some(end) = tail.find('}') else { break };
        let slot = &tail[..=end];
        if ![SLOT_SOURCE, SLOT_EXECUTABLE, SLOT_WORKDIR].contains(&slot) {
            bail!("{}: unknown template slot {} in '{}'", language, slot, arg);
        }
        rest = &tail[end + 1..];
    }
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageProfile>,
}

/// Registry of configured language profiles, keyed by lowercase identifier
#[derive(Debug, Clone, Default)]
pub struct LanguageRegistry {
    profiles: HashMap<String, Arc<LanguageProfile>>,
}

impl LanguageRegistry {
    /// Load profiles from languages.json
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        Self::from_json(&content)
            .with_context(|| format!("Failed to load {}", config_path.display()))
    }

    /// Load with default path (config/languages.json)
    pub fn load_default() -> Result<Self> {
        Self::load(Path::new("config/languages.json"))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let languages: LanguagesJson =
            serde_json::from_str(content).context("Failed to parse languages.json")?;
        Self::from_profiles(languages.languages)
    }

    pub fn from_profiles(profiles: impl IntoIterator<Item = LanguageProfile>) -> Result<Self> {
        let mut registry = HashMap::new();
        for profile in profiles {
            profile.validate()?;
            let key = profile.name.to_lowercase();
            if registry.insert(key, Arc::new(profile)).is_some() {
                bail!("Duplicate language profile");
            }
        }
        if registry.is_empty() {
            bail!("No languages configured");
        }
        Ok(Self { profiles: registry })
    }

    /// Look up the profile for a language identifier
    pub fn resolve(&self, language: &str) -> Result<Arc<LanguageProfile>, GradingError> {
        self.profiles
            .get(&language.to_lowercase())
            .cloned()
            .ok_or_else(|| GradingError::UnsupportedLanguage(language.to_string()))
    }

    /// List all supported languages, sorted
    pub fn list_languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn profiles(&self) -> impl Iterator<Item = &LanguageProfile> {
        self.profiles.values().map(|p| p.as_ref())
    }
}
