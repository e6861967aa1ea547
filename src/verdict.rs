//! Verdict engine: per-solution orchestration, soft-TLE promotion,
//! aggregation and expectation matching.
//!
//! One call grades one solution against a testcase list: compile, run each
//! testcase in declared order (through the sandbox or the communication
//! coordinator), classify with the checker, fold the outcomes through the
//! lattice. Judge failures and internal errors are terminal; everything
//! else keeps the suite going.

use serde::{Deserialize, Serialize};

use crate::checker::{self, CheckerResult, CheckerSpec, PreparedChecker};
use crate::compile::{CompileOutcome, compile};
use crate::error::Result;
use crate::execute::{run_communication_testcase, run_testcase};
use crate::outcome::{ExpectedOutcome, Outcome};
use crate::runtime::Runtime;
use crate::sandbox::RunLog;
use crate::types::{CodeItem, Evaluation, Limits, Solution, TaskType, TestcaseIO};

/// How the report compares against the solution's declared expectation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExpectationStatus {
    /// Aggregated outcome is admissible
    Ok,
    /// Verdicts outside the declared expectation
    UnexpectedVerdicts,
    /// Scoring-mode mismatch; informational, scoring lives upstream
    UnexpectedScore,
}

/// Task-level grading configuration.
#[derive(Debug, Clone)]
pub struct GradingTask {
    pub task_type: TaskType,
    /// Explicit checker; BATCH tasks fall back to the built-in
    /// word-compare when absent
    pub checker: Option<CheckerSpec>,
    /// Communication tasks only
    pub interactor: Option<CodeItem>,
    /// Limits for the interactor; defaults to the solution limits with
    /// doubled time (the interactor also waits on its peer)
    pub interactor_limits: Option<Limits>,
    pub capture_trace: bool,
}

impl GradingTask {
    pub fn batch() -> Self {
        Self {
            task_type: TaskType::Batch,
            checker: None,
            interactor: None,
            interactor_limits: None,
            capture_trace: false,
        }
    }

    pub fn batch_with_checker(item: CodeItem) -> Self {
        Self {
            checker: Some(CheckerSpec::Custom(item)),
            ..Self::batch()
        }
    }

    pub fn communication(interactor: CodeItem) -> Self {
        Self {
            task_type: TaskType::Communication,
            checker: None,
            interactor: Some(interactor),
            interactor_limits: None,
            capture_trace: true,
        }
    }
}

/// Final report for one solution.
#[derive(Debug)]
pub struct SolutionOutcomeReport {
    pub outcome: Outcome,
    pub expected: ExpectedOutcome,
    pub status: ExpectationStatus,
    pub evaluations: Vec<Evaluation>,
    pub warnings: Vec<String>,
    /// Present when compilation ran (or failed)
    pub compile_log: Option<String>,
}

/// Promote a clean-but-slow run: the wall or CPU clock reached the limit
/// yet the process exited normally and the checker classified the output.
/// The original outcome survives in `no_tle_outcome`.
pub fn soft_tle_promote(result: &mut CheckerResult, log: &RunLog) {
    if log.is_clean()
        && log.time_limit_flagged
        && matches!(result.outcome, Outcome::Accepted | Outcome::WrongAnswer)
    {
        result.no_tle_outcome = Some(result.outcome);
        result.outcome = Outcome::TimeLimitExceeded;
    }
}

/// Worst outcome across a set of evaluations.
pub fn aggregate<'a>(evaluations: impl IntoIterator<Item = &'a Evaluation>) -> Outcome {
    Outcome::worst_of(evaluations.into_iter().map(|e| e.result.outcome))
}

/// Grade one solution against every testcase, streaming evaluations
/// through `on_evaluation` as they land.
pub async fn run_solution(
    rt: &Runtime,
    task: &GradingTask,
    solution: &Solution,
    testcases: &[TestcaseIO],
    limits: &Limits,
    mut on_evaluation: impl FnMut(&Evaluation),
) -> Result<SolutionOutcomeReport> {
    let compiled = compile(rt, &solution.code).await?;
    let (artifact, compile_log) = match compiled {
        CompileOutcome::Success { artifact, log, .. } => (artifact, log),
        CompileOutcome::Failure { log } => {
            tracing::info!(
                solution = %solution.code.path.display(),
                "Solution failed to compile"
            );
            return Ok(finish_report(
                Outcome::CompilationError,
                solution,
                Vec::new(),
                Some(log),
            ));
        }
    };
    let language = rt.resolve_language(&solution.code)?.clone();

    let mut limits = limits.clone();
    if solution.double_tl {
        limits.is_double_tl = true;
    }

    let mut evaluations: Vec<Evaluation> = Vec::with_capacity(testcases.len());

    match task.task_type {
        TaskType::Batch => {
            let spec = task.checker.clone().unwrap_or(CheckerSpec::Builtin);
            let prepared = checker::prepare(rt, &spec).await?;

            for testcase in testcases {
                let evaluation = match batch_case(
                    rt, &artifact, &language, &prepared, testcase, &limits,
                )
                .await
                {
                    Ok(evaluation) => evaluation,
                    Err(e) if e.is_internal() => internal_evaluation(rt, testcase, &e).await,
                    Err(e) => return Err(e),
                };
                let _ = evaluation.persist().await;
                on_evaluation(&evaluation);
                let terminal = evaluation.result.outcome.is_terminal();
                evaluations.push(evaluation);
                if terminal {
                    break;
                }
            }
        }
        TaskType::Communication => {
            let interactor_item = task.interactor.as_ref().ok_or_else(|| {
                crate::Error::Config("communication task declares no interactor".into())
            })?;
            let interactor_language = rt.resolve_language(interactor_item)?.clone();
            let interactor_artifact = match compile(rt, interactor_item).await? {
                CompileOutcome::Success { artifact, .. } => artifact,
                CompileOutcome::Failure { log } => {
                    return Ok(finish_report(
                        Outcome::JudgeFailed,
                        solution,
                        Vec::new(),
                        Some(log),
                    ));
                }
            };
            let interactor_limits = task.interactor_limits.clone().unwrap_or_else(|| {
                let mut l = limits.clone();
                l.time_ms *= 2;
                l
            });
            let legacy_checker = match &task.checker {
                Some(spec) => Some(checker::prepare(rt, spec).await?),
                None => None,
            };

            for testcase in testcases {
                let evaluation = match communication_case(
                    rt,
                    &artifact,
                    &language,
                    &interactor_artifact,
                    &interactor_language,
                    legacy_checker.as_ref(),
                    testcase,
                    &limits,
                    &interactor_limits,
                    task.capture_trace,
                )
                .await
                {
                    Ok(evaluation) => evaluation,
                    Err(e) if e.is_internal() => internal_evaluation(rt, testcase, &e).await,
                    Err(e) => return Err(e),
                };
                let _ = evaluation.persist().await;
                on_evaluation(&evaluation);
                let terminal = evaluation.result.outcome.is_terminal();
                evaluations.push(evaluation);
                if terminal {
                    break;
                }
            }
        }
    }

    let outcome = aggregate(&evaluations);
    Ok(finish_report(outcome, solution, evaluations, Some(compile_log)))
}

/// One batch evaluation: run, classify, promote.
async fn batch_case(
    rt: &Runtime,
    artifact: &str,
    language: &crate::languages::Language,
    prepared: &PreparedChecker,
    testcase: &TestcaseIO,
    limits: &Limits,
) -> Result<Evaluation> {
    let started_at = chrono::Utc::now();
    let artifact = artifact.to_string();
    let (log, run_dir) = run_testcase(rt, &artifact, language, testcase, limits).await?;
    let output = run_dir.join("stdout");

    let mut result = checker::evaluate(rt, prepared, testcase, &output, &log).await?;
    soft_tle_promote(&mut result, &log);

    Ok(Evaluation {
        testcase: testcase.clone(),
        solution_log: log,
        interactor_log: None,
        result,
        run_dir,
        started_at,
        finished_at: chrono::Utc::now(),
    })
}

/// One communication evaluation: coordinator run, optional legacy checker,
/// promote.
#[allow(clippy::too_many_arguments)]
async fn communication_case(
    rt: &Runtime,
    artifact: &str,
    language: &crate::languages::Language,
    interactor_artifact: &str,
    interactor_language: &crate::languages::Language,
    legacy_checker: Option<&PreparedChecker>,
    testcase: &TestcaseIO,
    limits: &Limits,
    interactor_limits: &Limits,
    capture_trace: bool,
) -> Result<Evaluation> {
    let started_at = chrono::Utc::now();
    let artifact = artifact.to_string();
    let interactor_artifact = interactor_artifact.to_string();
    let (comm, run_dir) = run_communication_testcase(
        rt,
        &artifact,
        language,
        &interactor_artifact,
        interactor_language,
        testcase,
        limits,
        interactor_limits,
        capture_trace,
    )
    .await?;

    let mut result = CheckerResult::of(comm.verdict, comm.message.clone());
    if comm.defer_to_checker {
        if let (Some(prepared), Some(answer)) = (legacy_checker, &testcase.answer) {
            result =
                final_communication_check(rt, prepared, testcase, &run_dir.join("tout"), answer)
                    .await?;
        }
    }
    soft_tle_promote(&mut result, &comm.solution);

    Ok(Evaluation {
        testcase: testcase.clone(),
        solution_log: comm.solution,
        interactor_log: Some(comm.interactor),
        result,
        run_dir,
        started_at,
        finished_at: chrono::Utc::now(),
    })
}

/// A sandbox bookkeeping failure becomes an INTERNAL_ERROR evaluation and
/// ends the solution, without crashing the suite.
async fn internal_evaluation(
    rt: &Runtime,
    testcase: &TestcaseIO,
    error: &crate::Error,
) -> Evaluation {
    tracing::error!(
        input = %testcase.input.display(),
        error = %error,
        "Internal error while evaluating testcase"
    );
    let run_dir = rt
        .new_run_dir()
        .await
        .unwrap_or_else(|_| rt.runs_root().to_path_buf());
    let now = chrono::Utc::now();
    Evaluation {
        testcase: testcase.clone(),
        solution_log: RunLog::internal_error(error.to_string()),
        interactor_log: None,
        result: CheckerResult::of(Outcome::InternalError, error.to_string()),
        run_dir,
        started_at: now,
        finished_at: now,
    }
}

/// Legacy interactor-with-checker mode: both processes were clean, the
/// checker classifies the interactor's transcript against the answer.
async fn final_communication_check(
    rt: &Runtime,
    prepared: &PreparedChecker,
    testcase: &TestcaseIO,
    tout: &std::path::Path,
    answer: &std::path::Path,
) -> Result<CheckerResult> {
    match prepared {
        PreparedChecker::Failed { log } => Ok(CheckerResult::of(
            Outcome::JudgeFailed,
            format!("checker did not compile:\n{log}"),
        )),
        PreparedChecker::Ready { artifact, language } => {
            checker::run_checker(rt, artifact, language, &testcase.input, tout, answer).await
        }
    }
}

fn finish_report(
    outcome: Outcome,
    solution: &Solution,
    evaluations: Vec<Evaluation>,
    compile_log: Option<String>,
) -> SolutionOutcomeReport {
    let status = if solution.expected.matches(outcome) {
        ExpectationStatus::Ok
    } else {
        ExpectationStatus::UnexpectedVerdicts
    };

    let mut warnings = Vec::new();
    if solution.double_tl && solution.expected.is_tle_shaped() && outcome == Outcome::Accepted
    {
        warnings.push(
            "solution passed within 2x the time limit; it may actually be correct"
                .to_string(),
        );
    }

    tracing::info!(
        solution = %solution.code.path.display(),
        outcome = %outcome,
        ?status,
        "Solution graded"
    );

    SolutionOutcomeReport {
        outcome,
        expected: solution.expected,
        status,
        evaluations,
        warnings,
        compile_log,
    }
}
