//! Compilation step: dependency closure, cache consult, sandboxed build.
//!
//! The composite cache key covers the source digest, every dependency
//! digest, the fully-resolved command sequence and the extra flags, so any
//! change anywhere forces a rebuild. Cache hits reuse the stored compile
//! log verbatim and never spawn a compiler.

use chrono::Utc;

use crate::depcache::{CacheKey, CacheRecord};
use crate::error::{Error, Result};
use crate::languages::TemplateVars;
use crate::runtime::Runtime;
use crate::sandbox::{ExitStatusKind, Sandbox, SandboxParams, StreamSink, Workdir};
use crate::types::{CodeItem, Digest};

/// Memory granted to compilers, in megabytes.
const COMPILE_MEMORY_MB: u64 = 1024;

/// Compile log size cap.
const COMPILE_LOG_CAP_BYTES: usize = 64 * 1024;

/// Result of the compilation step. Failures carry their log; they are
/// verdicts, not errors.
#[derive(Debug, Clone)]
pub enum CompileOutcome {
    Success {
        artifact: Digest,
        log: String,
        /// Served from the dependency cache without spawning a compiler
        cached: bool,
    },
    Failure {
        log: String,
    },
}

impl CompileOutcome {
    pub fn artifact(&self) -> Option<&Digest> {
        match self {
            CompileOutcome::Success { artifact, .. } => Some(artifact),
            CompileOutcome::Failure { .. } => None,
        }
    }

    pub fn log(&self) -> &str {
        match self {
            CompileOutcome::Success { log, .. } => log,
            CompileOutcome::Failure { log } => log,
        }
    }
}

/// One resolved dependency: its logical name inside the workdir and its
/// store digest.
#[derive(Debug, Clone)]
struct ResolvedDep {
    logical: String,
    digest: Digest,
}

/// Compile a code item, consulting the dependency cache first.
pub async fn compile(rt: &Runtime, item: &CodeItem) -> Result<CompileOutcome> {
    let language = rt.resolve_language(item)?.clone();

    if !item.path.is_file() {
        return Err(Error::InvalidInput(format!(
            "source file not found: {}",
            item.path.display()
        )));
    }

    let source_digest = rt.store().put_from_path(&item.path).await?;
    let deps = resolve_dependencies(rt, item, &language.injected_deps).await?;

    let vars = TemplateVars {
        compilable: &language.file_mapping.compilable,
        executable: &language.file_mapping.executable,
        compilation_flags: &item.compilation_flags,
        memory_limit_mb: COMPILE_MEMORY_MB,
    };
    let commands: Vec<Vec<String>> = language
        .compile
        .iter()
        .map(|template| vars.substitute(template))
        .collect();

    // Interpreted setups with no compile sequence: the source is the
    // artifact.
    if commands.is_empty() {
        return Ok(CompileOutcome::Success {
            artifact: source_digest,
            log: String::new(),
            cached: false,
        });
    }

    let key = CacheKey::new(
        source_digest.clone(),
        deps.iter().map(|d| d.digest.clone()).collect(),
        commands.clone(),
        item.compilation_flags.clone(),
    );
    let key_id = key.id();

    // Serialize concurrent builds of the same key: the loser re-checks and
    // finds the winner's record.
    let _guard = rt.dep_cache().lock_key(&key_id).await;

    if let Some(record) = rt.dep_cache().lookup(&key_id, rt.store()).await? {
        tracing::debug!(
            source = %item.path.display(),
            artifact = %record.artifact_digest,
            "Compilation cache hit"
        );
        return Ok(CompileOutcome::Success {
            artifact: record.artifact_digest,
            log: record.compile_log,
            cached: true,
        });
    }

    tracing::info!(source = %item.path.display(), language = %language.name, "Compiling");

    let workdir = Workdir::create()?;
    workdir
        .install_from_store(rt.store(), &source_digest, &language.file_mapping.compilable)
        .await?;
    for dep in &deps {
        workdir
            .install_from_store(rt.store(), &dep.digest, &dep.logical)
            .await?;
    }

    let logs_dir = tempfile::Builder::new()
        .prefix("rbx-compile-log-")
        .tempdir()
        .map_err(|e| Error::io("rbx-compile-log", e))?;

    let sandbox = Sandbox::new(rt.cancellation());
    let mut log = String::new();
    let mut last_run = None;

    for (index, argv) in commands.iter().enumerate() {
        let stdout_path = logs_dir.path().join(format!("stdout.{index}"));
        let stderr_path = logs_dir.path().join(format!("stderr.{index}"));
        let params = SandboxParams {
            memory_limit_bytes: Some(COMPILE_MEMORY_MB * 1024 * 1024),
            stdout: StreamSink::File(stdout_path.clone()),
            stderr: StreamSink::File(stderr_path.clone()),
            ..SandboxParams::for_compilation()
        };

        let run = sandbox.run_in(&workdir, argv, params).await?;

        log.push_str(&format!("$ {}\n", argv.join(" ")));
        append_capped(&mut log, &tokio::fs::read_to_string(&stdout_path).await.unwrap_or_default());
        append_capped(&mut log, &tokio::fs::read_to_string(&stderr_path).await.unwrap_or_default());

        let status = run.status;
        last_run = Some(run);

        match status {
            ExitStatusKind::Ok => {}
            ExitStatusKind::Terminated => {
                log.push_str("compilation cancelled\n");
                return Ok(CompileOutcome::Failure { log });
            }
            _ => {
                tracing::info!(
                    source = %item.path.display(),
                    ?status,
                    "Compilation failed"
                );
                return Ok(CompileOutcome::Failure { log });
            }
        }
    }

    let executable = workdir.path().join(&language.file_mapping.executable);
    if !executable.is_file() {
        log.push_str("compiler produced no executable\n");
        return Ok(CompileOutcome::Failure { log });
    }
    let artifact = rt.store().put_from_path(&executable).await?;

    let record = CacheRecord {
        artifact_digest: artifact.clone(),
        compile_log: log.clone(),
        sandbox_meta: last_run
            .map(|run| serde_json::to_string(&run))
            .transpose()?
            .unwrap_or_else(|| "{}".to_string()),
        stored_at: Utc::now(),
    };
    rt.dep_cache().put(&key_id, &record).await?;

    Ok(CompileOutcome::Success {
        artifact,
        log,
        cached: false,
    })
}

/// Collect the dependency closure: explicitly declared files plus the
/// language's injected headers when they sit next to the source.
async fn resolve_dependencies(
    rt: &Runtime,
    item: &CodeItem,
    injected: &[String],
) -> Result<Vec<ResolvedDep>> {
    let mut deps = Vec::new();

    for path in &item.dependencies {
        if !path.is_file() {
            return Err(Error::InvalidInput(format!(
                "declared dependency not found: {}",
                path.display()
            )));
        }
        let logical = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::InvalidInput(format!("unusable dependency name: {}", path.display()))
            })?
            .to_string();
        let digest = rt.store().put_from_path(path).await?;
        deps.push(ResolvedDep { logical, digest });
    }

    let source_dir = item.path.parent().unwrap_or_else(|| std::path::Path::new("."));
    for name in injected {
        let candidate = source_dir.join(name);
        if candidate.is_file() {
            let digest = rt.store().put_from_path(&candidate).await?;
            deps.push(ResolvedDep {
                logical: name.clone(),
                digest,
            });
        }
    }

    Ok(deps)
}

fn append_capped(log: &mut String, chunk: &str) {
    let remaining = COMPILE_LOG_CAP_BYTES.saturating_sub(log.len());
    if remaining == 0 {
        return;
    }
    if chunk.len() <= remaining {
        log.push_str(chunk);
    } else {
        let mut cut = remaining;
        while cut > 0 && !chunk.is_char_boundary(cut) {
            cut -= 1;
        }
        log.push_str(&chunk[..cut]);
        log.push_str("\n[log truncated]\n");
    }
}
