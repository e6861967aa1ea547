//! Execution step: materialize an artifact and run one testcase.
//!
//! Every evaluation gets a run directory under the runtime's `runs/` root
//! holding the captured streams, the serialized run log and, for
//! communication tasks, the interaction trace. The sandbox workdir itself
//! is ephemeral; only these artifacts survive.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::interact::{CommunicationRequest, CommunicationResult, Coordinator};
use crate::languages::{Language, TemplateVars};
use crate::runtime::Runtime;
use crate::sandbox::{ExtraFile, RunLog, Sandbox, SandboxParams, StdinSource, StreamSink};
use crate::types::{Digest, Limits, TestcaseIO};

/// Limits with the runtime's global time multiplier applied.
pub fn effective_limits(rt: &Runtime, limits: &Limits) -> Limits {
    let mut out = limits.clone();
    let multiplier = rt.time_multiplier();
    if multiplier != 1.0 {
        out.time_ms = ((out.time_ms as f64) * multiplier).round() as u64;
    }
    out
}

/// Derive sandbox parameters for a solution run.
fn solution_params(language: &Language, limits: &Limits) -> SandboxParams {
    let mut params = SandboxParams::from_limits(limits);
    if limits.is_double_tl {
        params = params.with_doubled_time();
    }
    params.max_processes = language.sandbox.max_processes;
    params
}

/// Resolve the run argv for an artifact under a language.
fn run_argv(language: &Language, limits: &Limits) -> Vec<String> {
    let vars = TemplateVars {
        compilable: &language.file_mapping.compilable,
        executable: &language.file_mapping.executable,
        compilation_flags: &[],
        memory_limit_mb: limits.memory_mb,
    };
    vars.substitute(&language.run)
}

/// Stage an artifact next to the run directory so the sandbox can link it
/// under the language's executable name.
async fn stage_artifact(
    rt: &Runtime,
    artifact: &Digest,
    run_dir: &Path,
    name: &str,
) -> Result<PathBuf> {
    let staged = run_dir.join(name);
    rt.store().get_to_path(artifact, &staged).await?;
    Ok(staged)
}

/// Run one artifact against one batch testcase.
///
/// Returns the run log and the run directory; the captured solution output
/// is `<run_dir>/stdout`.
pub async fn run_testcase(
    rt: &Runtime,
    artifact: &Digest,
    language: &Language,
    testcase: &TestcaseIO,
    limits: &Limits,
) -> Result<(RunLog, PathBuf)> {
    let limits = effective_limits(rt, limits);
    let run_dir = rt.new_run_dir().await?;

    let staged = stage_artifact(rt, artifact, &run_dir, ".exe").await?;
    let input = canonical(&testcase.input)?;

    let mut params = solution_params(language, &limits);
    // A private copy, not a link: the 0755 chmod must land on the run's
    // own file, never through a symlink onto the store entry.
    params.extra_files = vec![
        ExtraFile::copy(&language.file_mapping.executable, &staged).executable(),
    ];
    params.stdin = StdinSource::File(input);
    params.stdout = StreamSink::File(run_dir.join("stdout"));
    params.stderr = StreamSink::File(run_dir.join("stderr"));

    let argv = run_argv(language, &limits);
    let sandbox = Sandbox::new(rt.cancellation());
    let log = sandbox.run(&argv, params).await?;
    log.persist(&run_dir).await?;

    Ok((log, run_dir))
}

/// Run a communication testcase: solution against interactor through the
/// coordinator.
#[allow(clippy::too_many_arguments)]
pub async fn run_communication_testcase(
    rt: &Runtime,
    solution_artifact: &Digest,
    solution_language: &Language,
    interactor_artifact: &Digest,
    interactor_language: &Language,
    testcase: &TestcaseIO,
    limits: &Limits,
    interactor_limits: &Limits,
    capture_trace: bool,
) -> Result<(CommunicationResult, PathBuf)> {
    let limits = effective_limits(rt, limits);
    let run_dir = rt.new_run_dir().await?;

    let solution_staged = stage_artifact(rt, solution_artifact, &run_dir, ".exe").await?;
    let interactor_staged =
        stage_artifact(rt, interactor_artifact, &run_dir, ".interactor").await?;

    // Private copies for both children: the executable chmod must not
    // write through a symlink onto the store entries.
    let mut sol_params = solution_params(solution_language, &limits);
    sol_params.extra_files = vec![ExtraFile::copy(
        &solution_language.file_mapping.executable,
        &solution_staged,
    )
    .executable()];
    sol_params.stderr = StreamSink::File(run_dir.join("stderr"));

    let mut int_params =
        SandboxParams::from_limits(&effective_limits(rt, interactor_limits));
    int_params.max_processes = interactor_language.sandbox.max_processes;
    int_params.extra_files = vec![ExtraFile::copy(
        &interactor_language.file_mapping.executable,
        &interactor_staged,
    )
    .executable()];
    int_params.stderr = StreamSink::File(run_dir.join("interactor.stderr"));

    let request = CommunicationRequest {
        solution_argv: run_argv(solution_language, &limits),
        solution_params: sol_params,
        interactor_argv: run_argv(interactor_language, interactor_limits),
        interactor_params: int_params,
        input: canonical(&testcase.input)?,
        tout: run_dir.join("tout"),
        trace: capture_trace.then(|| run_dir.join("interaction.pio")),
    };

    let coordinator = Coordinator::new(rt.cancellation());
    let result = coordinator.run(request).await?;

    result.solution.persist(&run_dir).await?;
    let interactor_log_path = run_dir.join("interactor.runlog.json");
    tokio::fs::write(
        &interactor_log_path,
        serde_json::to_vec_pretty(&result.interactor)?,
    )
    .await
    .map_err(|e| Error::io(&interactor_log_path, e))?;

    Ok((result, run_dir))
}

/// Children run from their own workdirs; every path handed to them must be
/// absolute.
fn canonical(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()
            .map_err(|e| Error::io(path, e))?
            .join(path))
    }
}
