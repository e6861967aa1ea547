//! Shared data model of the grading core.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checker::CheckerResult;
use crate::outcome::ExpectedOutcome;
use crate::sandbox::RunLog;

/// A 40-char hex SHA-1 string identifying file content.
pub type Digest = String;

/// A source program handed to the compilation step.
///
/// Non-owning: the author's source stays on disk wherever it lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeItem {
    /// Path to the source file
    pub path: PathBuf,
    /// Explicit language tag; inferred from the extension when absent
    pub language: Option<String>,
    /// Extra compilation flags appended to the language template
    pub compilation_flags: Vec<String>,
    /// Explicitly declared dependencies (headers, modules) beyond the
    /// language's auto-injected ones
    pub dependencies: Vec<PathBuf>,
}

impl CodeItem {
    /// Code item for a bare source path with no extra flags.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            language: None,
            compilation_flags: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_language(mut self, tag: impl Into<String>) -> Self {
        self.language = Some(tag.into());
        self
    }

    pub fn with_flags(mut self, flags: impl IntoIterator<Item = String>) -> Self {
        self.compilation_flags.extend(flags);
        self
    }
}

/// Stack limit for a sandboxed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackLimit {
    /// Raise to the hard limit
    Hard,
    /// Explicit cap in bytes
    Bytes(u64),
}

impl Default for StackLimit {
    fn default() -> Self {
        StackLimit::Hard
    }
}

/// Resource limits as declared by the problem manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    /// CPU time limit in milliseconds
    pub time_ms: u64,
    /// Memory limit in megabytes
    pub memory_mb: u64,
    /// Output limit in kilobytes, per stdout stream
    pub output_kb: u64,
    /// Stack limit
    #[serde(default)]
    pub stack: StackLimit,
    /// Whether limits are evaluated under doubled time (slow-solution runs)
    #[serde(default)]
    pub is_double_tl: bool,
    /// Profile tag for reporting
    #[serde(default)]
    pub profile: Option<String>,
}

impl Limits {
    pub fn new(time_ms: u64, memory_mb: u64, output_kb: u64) -> Self {
        Self {
            time_ms,
            memory_mb,
            output_kb,
            stack: StackLimit::Hard,
            is_double_tl: false,
            profile: None,
        }
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb * 1024 * 1024
    }

    pub fn output_bytes(&self) -> u64 {
        self.output_kb * 1024
    }
}

/// Per-language modifier inside a limits profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct LimitsModifier {
    /// Replacement time limit in milliseconds
    pub time: Option<u64>,
    /// Multiplier applied to the effective time limit
    pub time_multiplier: Option<f64>,
    /// Replacement memory limit in megabytes
    pub memory: Option<u64>,
}

/// A `.limits/<profile>.yml` document: a global modifier plus per-language
/// overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct LimitsProfile {
    /// Replacement time limit in milliseconds
    pub time: Option<u64>,
    /// Multiplier applied to the effective time limit
    pub time_multiplier: Option<f64>,
    /// Replacement memory limit in megabytes
    pub memory: Option<u64>,
    /// Per-language modifiers, keyed by language name
    #[serde(default)]
    pub languages: HashMap<String, LimitsModifier>,
}

impl LimitsProfile {
    /// Parse a profile from YAML. Unknown fields fail parsing.
    pub fn from_yaml(text: &str) -> crate::Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Apply this profile to base limits for the given language.
    ///
    /// Per-language fields win over global ones; multipliers compose onto
    /// whichever time limit survived the replacement step.
    pub fn apply(&self, base: &Limits, language: &str) -> Limits {
        let lang = self.languages.get(language);
        let mut out = base.clone();

        if let Some(time) = lang.and_then(|m| m.time).or(self.time) {
            out.time_ms = time;
        }
        if let Some(mult) = lang
            .and_then(|m| m.time_multiplier)
            .or(self.time_multiplier)
        {
            out.time_ms = (out.time_ms as f64 * mult).round() as u64;
        }
        if let Some(memory) = lang.and_then(|m| m.memory).or(self.memory) {
            out.memory_mb = memory;
        }
        out
    }
}

/// Input/answer file pair for one testcase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestcaseIO {
    /// Path to the input file
    pub input: PathBuf,
    /// Path to the expected output, when pre-generated
    pub answer: Option<PathBuf>,
}

impl TestcaseIO {
    pub fn new(input: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            answer: None,
        }
    }

    pub fn with_answer(mut self, answer: impl Into<PathBuf>) -> Self {
        self.answer = Some(answer.into());
        self
    }
}

/// A solution together with its declared expectation.
#[derive(Debug, Clone)]
pub struct Solution {
    pub code: CodeItem,
    pub expected: ExpectedOutcome,
    /// Declared score, informational only
    pub score: Option<f64>,
    /// Run this solution under doubled time limits
    pub double_tl: bool,
}

impl Solution {
    pub fn new(code: CodeItem, expected: ExpectedOutcome) -> Self {
        Self {
            code,
            expected,
            score: None,
            double_tl: false,
        }
    }
}

/// Task kind routing execution through the plain sandbox or the
/// communication coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Batch,
    Communication,
}

/// Everything recorded about one solution run against one testcase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    /// The testcase that was run
    pub testcase: TestcaseIO,
    /// Solution process log
    pub solution_log: RunLog,
    /// Interactor process log, for communication tasks
    pub interactor_log: Option<RunLog>,
    /// Checker classification
    pub result: CheckerResult,
    /// Directory holding stdout/stderr/runlog.json for this run
    pub run_dir: PathBuf,
    /// Wall-clock evaluation window, for reporting
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl Evaluation {
    /// Persist `eval.json` into the evaluation's run directory.
    pub async fn persist(&self) -> crate::Result<()> {
        let path = self.run_dir.join("eval.json");
        let body = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| crate::Error::io(path, e))
    }
}

/// Resolve a file extension, lowercased, for language inference.
pub(crate) fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}
