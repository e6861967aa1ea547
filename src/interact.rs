//! Two-process coordinator for communication tasks.
//!
//! The solution and the interactor run as independent sandboxed children
//! connected by a crossed pair of anonymous pipes: interactor stdout feeds
//! solution stdin and vice versa. The coordinator records which process
//! exited first (ties break to the interactor), cascades termination to the
//! survivor under bounded waits, and merges both run logs into a verdict
//! under a strict priority order. An optional interaction trace tees both
//! directions to a `.pio` file with side labels.

use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio_util::sync::CancellationToken;

use crate::checker::truncate_message;
use crate::error::{Error, Result};
use crate::outcome::Outcome;
use crate::sandbox::{ExitStatusKind, RunLog, Sandbox, SandboxParams, StdinSource, StreamSink};

/// Extra wall time the survivor gets after its peer exits.
pub const CASCADE_WAIT_SLACK_MS: u64 = 1000;

/// Which child's hang-up arrived first. Ties resolve to the interactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirstExit {
    Solution,
    Interactor,
}

/// Everything needed to run one communication testcase.
#[derive(Debug)]
pub struct CommunicationRequest {
    pub solution_argv: Vec<String>,
    /// Sandbox parameters for the solution; stdin/stdout are replaced by
    /// the pipe ends
    pub solution_params: SandboxParams,
    /// Interactor command; `<input> <tout>` arguments are appended
    pub interactor_argv: Vec<String>,
    pub interactor_params: SandboxParams,
    /// Absolute path to the testcase input
    pub input: PathBuf,
    /// Absolute path to the interactor's transcript-output file (testlib's
    /// tout). Always a scratch file, never the answer: interactors write
    /// through this argument
    pub tout: PathBuf,
    /// Tee both pipe directions to this `.pio` file
    pub trace: Option<PathBuf>,
}

/// Merged result of one communication run.
#[derive(Debug)]
pub struct CommunicationResult {
    pub solution: RunLog,
    pub interactor: RunLog,
    pub first_exit: FirstExit,
    pub verdict: Outcome,
    /// Interactor diagnostic, truncated
    pub message: String,
    /// Both sides were clean; a declared checker still gets the last word
    pub defer_to_checker: bool,
}

/// Coordinator bound to a cancellation source.
#[derive(Debug, Clone)]
pub struct Coordinator {
    cancel: CancellationToken,
}

impl Coordinator {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Run solution and interactor against each other.
    pub async fn run(&self, mut request: CommunicationRequest) -> Result<CommunicationResult> {
        let interactor_stderr = request.interactor_params.stderr.capture_path();
        let solution_wall_ms = request.solution_params.wall_time_limit_ms;
        let interactor_wall_ms = request.interactor_params.wall_time_limit_ms;

        let mut tee_tasks = Vec::new();
        if let Some(trace_path) = &request.trace {
            // Trace mode: the coordinator sits in the middle of both
            // directions, copying bytes and logging whole lines. Four
            // pipes, two per direction, with a tee task in each gap.
            let trace_file = tokio::fs::File::create(trace_path)
                .await
                .map_err(|e| Error::io(trace_path.clone(), e))?;
            let trace = Arc::new(tokio::sync::Mutex::new(trace_file));

            // interactor stdout -> tee '>' -> solution stdin
            let (from_interactor, interactor_stdout) = make_pipe()?;
            let (solution_stdin, to_solution) = make_pipe()?;
            // solution stdout -> tee '<' -> interactor stdin
            let (from_solution, solution_stdout) = make_pipe()?;
            let (interactor_stdin, to_interactor) = make_pipe()?;

            tee_tasks.push(tokio::spawn(tee_stream(
                from_interactor,
                to_solution,
                Arc::clone(&trace),
                '>',
            )));
            tee_tasks.push(tokio::spawn(tee_stream(
                from_solution,
                to_interactor,
                Arc::clone(&trace),
                '<',
            )));

            request.solution_params.stdin = StdinSource::Fd(solution_stdin);
            request.solution_params.stdout = StreamSink::Fd(solution_stdout);
            request.interactor_params.stdin = StdinSource::Fd(interactor_stdin);
            request.interactor_params.stdout = StreamSink::Fd(interactor_stdout);
        } else {
            // Direct mode: a crossed pair of anonymous pipes.
            // Pipe A: interactor stdout -> solution stdin
            // Pipe B: solution stdout -> interactor stdin
            let (solution_stdin, interactor_stdout) = make_pipe()?;
            let (interactor_stdin, solution_stdout) = make_pipe()?;

            request.solution_params.stdin = StdinSource::Fd(solution_stdin);
            request.solution_params.stdout = StreamSink::Fd(solution_stdout);
            request.interactor_params.stdin = StdinSource::Fd(interactor_stdin);
            request.interactor_params.stdout = StreamSink::Fd(interactor_stdout);
        }

        // Make sure the tout file exists before the interactor opens it
        if tokio::fs::metadata(&request.tout).await.is_err() {
            tokio::fs::write(&request.tout, b"")
                .await
                .map_err(|e| Error::io(request.tout.clone(), e))?;
        }

        let mut interactor_argv = request.interactor_argv.clone();
        interactor_argv.push(request.input.display().to_string());
        interactor_argv.push(request.tout.display().to_string());

        let solution_token = self.cancel.child_token();
        let interactor_token = self.cancel.child_token();
        let solution_sandbox = Sandbox::new(solution_token.clone());
        let interactor_sandbox = Sandbox::new(interactor_token.clone());

        let solution_fut =
            solution_sandbox.run(&request.solution_argv, request.solution_params);
        let interactor_fut = interactor_sandbox.run(&interactor_argv, request.interactor_params);
        tokio::pin!(solution_fut);
        tokio::pin!(interactor_fut);

        // First hang-up decides the cascade. Biased select resolves
        // simultaneous exits to "interactor first".
        let (first_exit, solution_log, interactor_log) = tokio::select! {
            biased;
            interactor_log = &mut interactor_fut => {
                let interactor_log = interactor_log?;
                // Wait for the solution, but not forever
                let cap = Duration::from_millis(solution_wall_ms + CASCADE_WAIT_SLACK_MS);
                let solution_log = match tokio::time::timeout(cap, &mut solution_fut).await {
                    Ok(log) => log?,
                    Err(_) => {
                        solution_token.cancel();
                        let mut log = (&mut solution_fut).await?;
                        reclassify_cascade_kill(&mut log);
                        log
                    }
                };
                (FirstExit::Interactor, solution_log, interactor_log)
            }
            solution_log = &mut solution_fut => {
                let solution_log = solution_log?;
                let interactor_log = if solution_log.is_clean() {
                    let cap =
                        Duration::from_millis(interactor_wall_ms + CASCADE_WAIT_SLACK_MS);
                    match tokio::time::timeout(cap, &mut interactor_fut).await {
                        Ok(log) => log?,
                        Err(_) => {
                            interactor_token.cancel();
                            (&mut interactor_fut).await?
                        }
                    }
                } else {
                    // Solution died badly: SIGTERM the interactor, with the
                    // sandbox escalating to SIGKILL after its grace period
                    interactor_token.cancel();
                    (&mut interactor_fut).await?
                };
                (FirstExit::Solution, solution_log, interactor_log)
            }
        };

        for task in tee_tasks {
            let _ = task
                .await
                .map_err(|e| Error::Sandbox(anyhow!("tee task panicked: {e}")))?;
        }

        if self.cancel.is_cancelled() {
            return Ok(CommunicationResult {
                solution: solution_log,
                interactor: interactor_log,
                first_exit,
                verdict: Outcome::InternalError,
                message: "evaluation cancelled".to_string(),
                defer_to_checker: false,
            });
        }

        let message = match &interactor_stderr {
            Some(path) => tokio::fs::read_to_string(path)
                .await
                .map(|s| truncate_message(&s))
                .unwrap_or_default(),
            None => String::new(),
        };

        let (verdict, defer_to_checker) =
            merge_verdict(&solution_log, &interactor_log, first_exit);

        tracing::debug!(
            ?first_exit,
            ?verdict,
            solution_status = ?solution_log.status,
            interactor_status = ?interactor_log.status,
            "Communication run finished"
        );

        Ok(CommunicationResult {
            solution: solution_log,
            interactor: interactor_log,
            first_exit,
            verdict,
            message,
            defer_to_checker,
        })
    }
}

/// A solution killed because it overstayed the cascade cap is a wall-time
/// breach, not a user cancellation.
fn reclassify_cascade_kill(log: &mut RunLog) {
    if log.status == ExitStatusKind::Terminated {
        log.status = ExitStatusKind::WallTimeout;
        log.metadata.insert(
            "cascade".to_string(),
            "killed after interactor exit".to_string(),
        );
    }
}

/// Verdict priority, first match wins:
/// interactor crash, solution resource limits, interactor WA, interactor
/// fail, interactor partial-OK, solution runtime error, both clean.
fn merge_verdict(
    solution: &RunLog,
    interactor: &RunLog,
    first_exit: FirstExit,
) -> (Outcome, bool) {
    // 1. Interactor crashed: killed by a signal other than the cascade's
    // SIGTERM or a SIGPIPE from the solution side, a non-testlib exit
    // code, or a monitoring failure.
    if interactor_crashed(interactor) {
        return (Outcome::JudgeFailed, false);
    }

    // 2. Solution resource limits.
    match solution.status {
        ExitStatusKind::Timeout | ExitStatusKind::WallTimeout => {
            return (Outcome::TimeLimitExceeded, false);
        }
        ExitStatusKind::MemoryLimit => return (Outcome::MemoryLimitExceeded, false),
        ExitStatusKind::OutputLimit => return (Outcome::OutputLimitExceeded, false),
        ExitStatusKind::IdlenessLimit => return (Outcome::IdlenessLimitExceeded, false),
        ExitStatusKind::InternalError => return (Outcome::InternalError, false),
        _ => {}
    }

    // 3-5. Testlib interactor exit codes: 1/2 are WA and PE, 3 is fail,
    // 4 is partial-OK pending the checker.
    let interactor_code = if interactor.is_clean() {
        0
    } else {
        interactor.exit_code
    };
    match interactor_code {
        1 | 2 => return (Outcome::WrongAnswer, false),
        3 => return (Outcome::JudgeFailed, false),
        4 => return (Outcome::Accepted, true),
        _ => {}
    }

    // 6. Solution failed on its own while the interactor had no complaint.
    if solution.status == ExitStatusKind::Signal && first_exit == FirstExit::Solution {
        return (Outcome::RuntimeError, false);
    }

    // 7. Both clean.
    (Outcome::Accepted, true)
}

fn interactor_crashed(interactor: &RunLog) -> bool {
    match interactor.status {
        ExitStatusKind::Ok => false,
        // Cascade-terminated interactors are expected collateral
        ExitStatusKind::Terminated => false,
        ExitStatusKind::Signal => {
            if interactor.exit_code >= 128 {
                let signal = interactor.exit_code - 128;
                // SIGTERM from the cascade, SIGPIPE from a dead solution
                signal != 15 && signal != 13
            } else {
                // Raw exit codes within the testlib range are verdicts
                !matches!(interactor.exit_code, 1 | 2 | 3 | 4)
            }
        }
        ExitStatusKind::InternalError => true,
        // An interactor breaching its own limits cannot be trusted
        _ => true,
    }
}

/// Anonymous pipe with both ends close-on-exec: a child only keeps the end
/// dup'ed onto its stdio, so a sibling spawn cannot leak the other side
/// and defeat hang-up detection.
fn make_pipe() -> Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
        .map_err(|e| Error::Sandbox(anyhow!("pipe creation failed: {e}")))
}

/// Copy one pipe direction while appending labeled lines to the trace.
async fn tee_stream(
    from: OwnedFd,
    to: OwnedFd,
    trace: Arc<tokio::sync::Mutex<tokio::fs::File>>,
    label: char,
) -> std::io::Result<()> {
    let mut reader = pipe::Receiver::from_owned_fd(from)?;
    let mut writer = pipe::Sender::from_owned_fd(to)?;

    let mut buf = [0u8; 8192];
    let mut line: Vec<u8> = Vec::new();
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => return Err(e),
        };
        // Forward first so a slow trace disk cannot stall the protocol
        // more than necessary; a closed peer just ends the tee.
        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        for &byte in &buf[..n] {
            if byte == b'\n' {
                write_trace_line(&trace, label, &line).await?;
                line.clear();
            } else {
                line.push(byte);
            }
        }
    }
    if !line.is_empty() {
        write_trace_line(&trace, label, &line).await?;
    }
    Ok(())
}

async fn write_trace_line(
    trace: &Arc<tokio::sync::Mutex<tokio::fs::File>>,
    label: char,
    line: &[u8],
) -> std::io::Result<()> {
    let mut file = trace.lock().await;
    let mut entry = Vec::with_capacity(line.len() + 3);
    entry.push(label as u8);
    entry.push(b' ');
    entry.extend_from_slice(line);
    entry.push(b'\n');
    file.write_all(&entry).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".into(), "-c".into(), script.into()]
    }

    fn request(
        solution: &str,
        interactor: &str,
        dir: &std::path::Path,
    ) -> CommunicationRequest {
        let input = dir.join("input.txt");
        std::fs::write(&input, "7\n").unwrap();
        CommunicationRequest {
            solution_argv: sh(solution),
            solution_params: SandboxParams {
                wall_time_limit_ms: 10_000,
                idleness_wall_floor_ms: 60_000,
                ..SandboxParams::default()
            },
            interactor_argv: sh(interactor),
            interactor_params: SandboxParams {
                wall_time_limit_ms: 10_000,
                idleness_wall_floor_ms: 60_000,
                ..SandboxParams::default()
            },
            input,
            tout: dir.join("tout"),
            trace: None,
        }
    }

    fn coordinator() -> Coordinator {
        Coordinator::new(CancellationToken::new())
    }

    #[tokio::test]
    async fn interactor_wa_wins_over_clean_solution() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(
            "printf '? 5\\n'; cat > /dev/null",
            "read line; exit 1",
            dir.path(),
        );
        let result = coordinator().run(req).await.unwrap();
        assert_eq!(result.verdict, Outcome::WrongAnswer);
        assert_eq!(result.first_exit, FirstExit::Interactor);
    }

    #[tokio::test]
    async fn clean_protocol_is_accepted_and_deferred() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(
            "printf '42\\n'; cat > /dev/null",
            "read line; [ \"$line\" = 42 ] && exit 0 || exit 1",
            dir.path(),
        );
        let result = coordinator().run(req).await.unwrap();
        assert_eq!(result.verdict, Outcome::Accepted);
        assert!(result.defer_to_checker);
    }

    #[tokio::test]
    async fn non_testlib_interactor_exit_is_judge_failure() {
        let dir = tempfile::tempdir().unwrap();
        let req = request("cat > /dev/null", "exit 9", dir.path());
        let result = coordinator().run(req).await.unwrap();
        assert_eq!(result.verdict, Outcome::JudgeFailed);
    }

    #[tokio::test]
    async fn interactor_fail_code_is_judge_failure() {
        let dir = tempfile::tempdir().unwrap();
        let req = request("cat > /dev/null", "exit 3", dir.path());
        let result = coordinator().run(req).await.unwrap();
        assert_eq!(result.verdict, Outcome::JudgeFailed);
    }

    #[tokio::test]
    async fn solution_crash_is_runtime_error() {
        let dir = tempfile::tempdir().unwrap();
        let req = request("exit 5", "cat > /dev/null; exit 0", dir.path());
        let result = coordinator().run(req).await.unwrap();
        assert_eq!(result.verdict, Outcome::RuntimeError);
        assert_eq!(result.first_exit, FirstExit::Solution);
    }

    #[tokio::test]
    async fn solution_wall_breach_is_tle() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request("sleep 30", "cat > /dev/null; exit 0", dir.path());
        req.solution_params.wall_time_limit_ms = 300;
        let result = coordinator().run(req).await.unwrap();
        assert_eq!(result.verdict, Outcome::TimeLimitExceeded);
    }

    #[tokio::test]
    async fn interactor_gets_input_and_tout_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request("cat > /dev/null", "exit 0", dir.path());
        // `sh -c 'script'` consumes the next argument as $0; name it so
        // $1 is the input path and $2 the tout path
        req.interactor_argv = vec![
            "/bin/sh".into(),
            "-c".into(),
            "[ -r \"$1\" ] && [ -w \"$2\" ] && { echo transcript > \"$2\"; exit 0; } || exit 3"
                .into(),
            "interactor".into(),
        ];
        let result = coordinator().run(req).await.unwrap();
        assert_eq!(result.verdict, Outcome::Accepted);
        // The interactor wrote through its tout argument
        assert_eq!(
            std::fs::read_to_string(dir.path().join("tout")).unwrap(),
            "transcript\n"
        );
    }

    #[tokio::test]
    async fn trace_records_both_directions_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let trace_path = dir.path().join("interaction.pio");
        let mut req = request(
            "printf 'ping\\n'; read reply; printf 'pong\\n'; cat > /dev/null",
            "read a; printf 'echo\\n'; read b; exit 0",
            dir.path(),
        );
        req.trace = Some(trace_path.clone());

        let result = coordinator().run(req).await.unwrap();
        assert_eq!(result.verdict, Outcome::Accepted);

        let trace = std::fs::read_to_string(&trace_path).unwrap();
        let lines: Vec<&str> = trace.lines().collect();
        assert_eq!(lines, vec!["< ping", "> echo", "< pong"]);
    }

    #[tokio::test]
    async fn wa_trace_preserves_the_last_exchange() {
        let dir = tempfile::tempdir().unwrap();
        let trace_path = dir.path().join("interaction.pio");
        let mut req = request(
            "printf '? 5\\n'; cat > /dev/null",
            "read line; [ \"$line\" = '? 7' ] || exit 1",
            dir.path(),
        );
        req.trace = Some(trace_path.clone());

        let result = coordinator().run(req).await.unwrap();
        assert_eq!(result.verdict, Outcome::WrongAnswer);

        let trace = std::fs::read_to_string(&trace_path).unwrap();
        assert!(trace.lines().any(|l| l == "< ? 5"));
    }

    #[tokio::test]
    async fn interactor_stderr_becomes_the_message() {
        let dir = tempfile::tempdir().unwrap();
        let stderr_path = dir.path().join("interactor.stderr");
        let mut req = request(
            "cat > /dev/null",
            "echo 'wrong query format' >&2; exit 1",
            dir.path(),
        );
        req.interactor_params.stderr = StreamSink::File(stderr_path);

        let result = coordinator().run(req).await.unwrap();
        assert_eq!(result.verdict, Outcome::WrongAnswer);
        assert!(result.message.contains("wrong query format"));
    }
}
