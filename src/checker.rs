//! Checker: classify solution output into an outcome.
//!
//! Checkers follow the testlib convention: a compiled program invoked as
//! `checker <input> <solution_output> <expected_answer>` whose exit code
//! carries the verdict and whose stderr carries a diagnostic message. A
//! built-in word-compare checker backs BATCH tasks that declare none.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::compile::{CompileOutcome, compile};
use crate::error::{Error, Result};
use crate::languages::{Language, TemplateVars};
use crate::outcome::Outcome;
use crate::runtime::Runtime;
use crate::sandbox::{ExitStatusKind, RunLog, Sandbox, SandboxParams, StreamSink, Workdir};
use crate::types::{CodeItem, Digest, TestcaseIO};

/// Diagnostic message byte budget, applied everywhere messages flow.
pub const MESSAGE_BUDGET_BYTES: usize = 1024;

/// Wall cap for one checker invocation.
const CHECKER_WALL_MS: u64 = 60_000;
const CHECKER_MEMORY_MB: u64 = 1024;

/// Built-in word-compare checker: whitespace-tokenized exact equality.
const BUILTIN_CHECKER_SOURCE: &str = r#"#include <cstdlib>
#include <fstream>
#include <iostream>
#include <string>
#include <vector>

static std::vector<std::string> tokens(const char *path) {
    std::ifstream in(path);
    if (!in) {
        std::cerr << "cannot open " << path << "\n";
        std::exit(3);
    }
    std::vector<std::string> out;
    std::string tok;
    while (in >> tok) out.push_back(tok);
    return out;
}

int main(int argc, char **argv) {
    if (argc < 4) {
        std::cerr << "usage: checker <input> <output> <answer>\n";
        return 3;
    }
    std::vector<std::string> got = tokens(argv[2]);
    std::vector<std::string> want = tokens(argv[3]);
    if (got.size() != want.size()) {
        std::cerr << "expected " << want.size() << " tokens, got " << got.size() << "\n";
        return 1;
    }
    for (std::size_t i = 0; i < got.size(); i++) {
        if (got[i] != want[i]) {
            std::cerr << "token " << (i + 1) << " differs: expected '" << want[i]
                      << "', got '" << got[i] << "'\n";
            return 1;
        }
    }
    std::cerr << "ok " << got.size() << " tokens\n";
    return 0;
}
"#;

/// What checks solution output for a task.
#[derive(Debug, Clone)]
pub enum CheckerSpec {
    /// Built-in word-compare, compiled once per process
    Builtin,
    /// Author-provided checker program
    Custom(CodeItem),
}

/// A checker ready to run, or the reason it never will.
#[derive(Debug, Clone)]
pub enum PreparedChecker {
    Ready {
        artifact: Digest,
        language: Language,
    },
    /// The checker itself failed to compile; every evaluation under it is
    /// a judge failure
    Failed { log: String },
}

/// Classification of one output, plus diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckerResult {
    pub outcome: Outcome,
    /// Diagnostic message, truncated to the byte budget
    pub message: String,
    /// Original outcome before a soft-TLE promotion
    pub no_tle_outcome: Option<Outcome>,
    pub sanitizer_warnings: Vec<String>,
}

impl CheckerResult {
    pub fn of(outcome: Outcome, message: impl Into<String>) -> Self {
        Self {
            outcome,
            message: truncate_message(&message.into()),
            no_tle_outcome: None,
            sanitizer_warnings: Vec::new(),
        }
    }
}

/// Compile (or fetch) the checker for a task.
pub async fn prepare(rt: &Runtime, spec: &CheckerSpec) -> Result<PreparedChecker> {
    match spec {
        CheckerSpec::Custom(item) => prepare_item(rt, item).await,
        CheckerSpec::Builtin => rt
            .builtin_checker
            .get_or_try_init(|| async {
                let dir = tempfile::Builder::new()
                    .prefix("rbx-builtin-checker-")
                    .tempdir()
                    .map_err(|e| Error::io("rbx-builtin-checker", e))?;
                let source = dir.path().join("checker.cpp");
                tokio::fs::write(&source, BUILTIN_CHECKER_SOURCE)
                    .await
                    .map_err(|e| Error::io(&source, e))?;
                prepare_item(rt, &CodeItem::new(&source)).await
            })
            .await
            .cloned(),
    }
}

async fn prepare_item(rt: &Runtime, item: &CodeItem) -> Result<PreparedChecker> {
    let language = rt.resolve_language(item)?.clone();
    match compile(rt, item).await? {
        CompileOutcome::Success { artifact, .. } => Ok(PreparedChecker::Ready {
            artifact,
            language,
        }),
        CompileOutcome::Failure { log } => {
            tracing::warn!(checker = %item.path.display(), "Checker failed to compile");
            Ok(PreparedChecker::Failed { log })
        }
    }
}

/// Outcome forced by the solution's run log before any checker runs.
pub fn pre_output_outcome(log: &RunLog) -> Option<Outcome> {
    match log.status {
        ExitStatusKind::Ok => None,
        ExitStatusKind::Timeout | ExitStatusKind::WallTimeout => {
            Some(Outcome::TimeLimitExceeded)
        }
        ExitStatusKind::MemoryLimit => Some(Outcome::MemoryLimitExceeded),
        ExitStatusKind::OutputLimit => Some(Outcome::OutputLimitExceeded),
        ExitStatusKind::IdlenessLimit => Some(Outcome::IdlenessLimitExceeded),
        ExitStatusKind::Signal => Some(Outcome::RuntimeError),
        ExitStatusKind::Terminated | ExitStatusKind::InternalError => {
            Some(Outcome::InternalError)
        }
    }
}

/// Full checker flow for one batch evaluation: pre-output check, then the
/// checker program.
pub async fn evaluate(
    rt: &Runtime,
    prepared: &PreparedChecker,
    testcase: &TestcaseIO,
    output_path: &Path,
    solution_log: &RunLog,
) -> Result<CheckerResult> {
    let sanitizer_warnings: Vec<String> = solution_log
        .warnings
        .iter()
        .filter(|w| w.contains("sanitizer"))
        .cloned()
        .collect();

    if let Some(outcome) = pre_output_outcome(solution_log) {
        let message = format!(
            "solution finished with status {:?} (exit code {})",
            solution_log.status, solution_log.exit_code
        );
        let mut result = CheckerResult::of(outcome, message);
        result.sanitizer_warnings = sanitizer_warnings;
        return Ok(result);
    }

    let mut result = match prepared {
        PreparedChecker::Failed { log } => {
            CheckerResult::of(Outcome::JudgeFailed, format!("checker did not compile:\n{log}"))
        }
        PreparedChecker::Ready { artifact, language } => {
            // Checkers that know the answer generation themselves accept
            // the input in the answer slot.
            let answer = testcase.answer.as_deref().unwrap_or(&testcase.input);
            run_checker(rt, artifact, language, &testcase.input, output_path, answer).await?
        }
    };
    result.sanitizer_warnings = sanitizer_warnings;
    Ok(result)
}

/// Invoke the checker program and map its exit code.
pub async fn run_checker(
    rt: &Runtime,
    artifact: &Digest,
    language: &Language,
    input: &Path,
    output: &Path,
    answer: &Path,
) -> Result<CheckerResult> {
    let workdir = Workdir::create()?;
    // Copied, not symlinked: the chmod below must not reach the store
    // entry behind a link.
    workdir
        .install_copy_from_store(rt.store(), artifact, &language.file_mapping.executable)
        .await?;
    workdir
        .mark_executable(&language.file_mapping.executable)
        .await?;

    let vars = TemplateVars {
        compilable: &language.file_mapping.compilable,
        executable: &language.file_mapping.executable,
        compilation_flags: &[],
        memory_limit_mb: CHECKER_MEMORY_MB,
    };
    let mut argv = vars.substitute(&language.run);
    argv.push(absolute(input)?);
    argv.push(absolute(output)?);
    argv.push(absolute(answer)?);

    let capture_dir = tempfile::Builder::new()
        .prefix("rbx-checker-")
        .tempdir()
        .map_err(|e| Error::io("rbx-checker", e))?;
    let stderr_path = capture_dir.path().join("stderr");
    let stdout_path = capture_dir.path().join("stdout");

    let params = SandboxParams {
        wall_time_limit_ms: CHECKER_WALL_MS,
        memory_limit_bytes: Some(CHECKER_MEMORY_MB * 1024 * 1024),
        wall_breach_is_time_limit: true,
        stdout: StreamSink::File(stdout_path.clone()),
        stderr: StreamSink::File(stderr_path.clone()),
        max_processes: 4,
        ..SandboxParams::default()
    };

    let sandbox = Sandbox::new(rt.cancellation());
    let run = sandbox.run_in(&workdir, &argv, params).await?;

    // testlib writes its message to stderr; fall back to stdout
    let mut message = tokio::fs::read_to_string(&stderr_path)
        .await
        .unwrap_or_default();
    if message.trim().is_empty() {
        message = tokio::fs::read_to_string(&stdout_path)
            .await
            .unwrap_or_default();
    }

    let outcome = match run.status {
        ExitStatusKind::Ok => Outcome::Accepted,
        ExitStatusKind::Signal => outcome_from_checker_exit(run.exit_code),
        // A checker that cannot finish within its own limits is a broken
        // judge, not a broken solution
        _ => Outcome::JudgeFailed,
    };

    Ok(CheckerResult::of(outcome, message))
}

/// testlib exit-code convention: 0 accepted, 1 and 2 wrong answer (WA and
/// PE), 3 judge failure, anything else an internal error.
pub fn outcome_from_checker_exit(code: i32) -> Outcome {
    match code {
        0 => Outcome::Accepted,
        1 | 2 => Outcome::WrongAnswer,
        3 => Outcome::JudgeFailed,
        _ => Outcome::InternalError,
    }
}

/// Truncate a diagnostic to the byte budget and escape control characters
/// for safe display. Newlines and tabs survive.
pub fn truncate_message(message: &str) -> String {
    let mut cut = message.len().min(MESSAGE_BUDGET_BYTES);
    while cut > 0 && !message.is_char_boundary(cut) {
        cut -= 1;
    }
    let truncated = &message[..cut];

    let mut out = String::with_capacity(truncated.len());
    for c in truncated.chars() {
        if c == '\n' || c == '\t' || !c.is_control() {
            out.push(c);
        } else {
            out.extend(c.escape_default());
        }
    }
    out
}

fn absolute(path: &Path) -> Result<String> {
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| Error::io(path, e))?
            .join(path)
    };
    Ok(abs.display().to_string())
}
