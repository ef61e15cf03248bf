// src/executor.rs
//
// =============================================================================
// XTB-FORGE: XTB EXECUTOR (v 0.1)
// =============================================================================
//
// Runs one computation start-to-finish: spawns xTB in an isolated scratch
// directory, enforces a hard wall-clock timeout, drives the Parser Cascade
// and Quality Assessor on success, and hands the result to the Logging
// Emitter. No shell is ever invoked — argv is built as a vector exactly per
// spec §6, the way the teacher's external process driver resolves and
// spawns binaries directly.

use crate::config::Config;
use crate::core::{entity_id_from_job_id, ConvergenceStatus, Job, ParsedResult};
use crate::emitter::LoggingEmitter;
use crate::error::{OrchestratorError, Result};
use crate::filestore::FileStore;
use crate::parser::{ParseContext, ParserCascade};
use crate::quality::{self, RollingSample};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;

/// Bounded tail kept from stderr for Convergence-failure `error_message`s
/// (spec §7: "bounded, ~2 KB"). The *last* bytes are kept: the most recent
/// lines are the most diagnostic for a crash.
const STDERR_TAIL_BYTES: usize = 2048;

/// Grace period between SIGTERM and SIGKILL on timeout/cancel (spec §5).
const KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);

pub struct XtbExecutor {
    config: Arc<Config>,
    filestore: Arc<FileStore>,
    cascade: ParserCascade,
    sample: Mutex<RollingSample>,
    emitter: Arc<LoggingEmitter>,
    xtb_binary: PathBuf,
}

/// Resolved at construction so a misconfigured environment fails fast
/// rather than opaquely mid-run on the first submission (spec §4.5
/// supplement).
fn resolve_xtb_binary(configured: &Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = configured {
        return Ok(path.clone());
    }
    which("xtb").ok_or_else(|| {
        OrchestratorError::Config("XTB_PATH not set and `xtb` not found on PATH".to_string())
    })
}

fn which(binary: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).find_map(|dir| {
        let candidate = dir.join(binary);
        candidate.is_file().then_some(candidate)
    })
}

impl XtbExecutor {
    pub fn new(config: Arc<Config>, filestore: Arc<FileStore>, emitter: Arc<LoggingEmitter>) -> Result<Self> {
        let xtb_binary = resolve_xtb_binary(&config.xtb_path)?;
        Ok(Self {
            config,
            filestore,
            cascade: ParserCascade::new(),
            sample: Mutex::new(RollingSample::new(256)),
            emitter,
            xtb_binary,
        })
    }

    /// Runs the full algorithm of spec §4.5 for one admitted job, writing
    /// terminal metadata and (on success) `results.json` via FileStore as
    /// side effects. Never returns an `Err` that the caller needs to act
    /// on beyond logging — every failure path already transitions the job
    /// to `FAILED` with a populated `error_message` before returning.
    pub async fn run(&self, job_id: &str) {
        let job = match self.filestore.read_metadata(job_id).await {
            Ok(j) => j,
            Err(e) => {
                log::error!("job {job_id}: failed to read metadata to execute: {e}");
                return;
            }
        };

        if job.cancel_requested {
            self.finalize_failure(job_id, &OrchestratorError::Cancel.as_job_message()).await;
            return;
        }

        let work_dir = self.config.work_dir.join(job_id);
        if let Err(e) = tokio::fs::create_dir_all(&work_dir).await {
            self.finalize_failure(job_id, &OrchestratorError::Filesystem(e).as_job_message()).await;
            return;
        }

        let xyz_name = format!("{}.xyz", sanitize_filename(&job.molecule_name));
        let xyz_path = work_dir.join(&xyz_name);
        if let Err(e) = tokio::fs::write(&xyz_path, &job.xyz_content).await {
            self.finalize_failure(job_id, &OrchestratorError::Filesystem(e).as_job_message()).await;
            return;
        }

        let args = self.build_args(&job, &xyz_name);
        let timeout = Duration::from_secs(self.config.xtb_timeout_secs);

        let t0 = std::time::Instant::now();
        let spawn_result = Command::new(&self.xtb_binary)
            .args(&args)
            .current_dir(&work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match spawn_result {
            Ok(c) => c,
            Err(e) => {
                self.finalize_failure(job_id, &OrchestratorError::Filesystem(e).as_job_message()).await;
                return;
            }
        };

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let wait_fut = async {
            let mut stdout_buf = Vec::new();
            let mut stderr_buf = Vec::new();
            let (stdout_res, stderr_res, status_res) = tokio::join!(
                async {
                    if let Some(p) = stdout_pipe.as_mut() {
                        tokio::io::AsyncReadExt::read_to_end(p, &mut stdout_buf).await.ok();
                    }
                },
                async {
                    if let Some(p) = stderr_pipe.as_mut() {
                        tokio::io::AsyncReadExt::read_to_end(p, &mut stderr_buf).await.ok();
                    }
                },
                child.wait(),
            );
            let _ = (stdout_res, stderr_res);
            status_res.map(|status| (status, stdout_buf, stderr_buf))
        };

        match tokio::time::timeout(timeout, wait_fut).await {
            Err(_elapsed) => {
                self.kill_process_group(&mut child).await;
                let message = OrchestratorError::Timeout { secs: self.config.xtb_timeout_secs }.as_job_message();
                self.finalize_failure(job_id, &message).await;
            }
            Ok(Err(e)) => {
                self.finalize_failure(job_id, &OrchestratorError::Filesystem(e).as_job_message()).await;
            }
            Ok(Ok((status, stdout_bytes, stderr_bytes))) => {
                let execution_time = t0.elapsed().as_secs_f64();
                let stdout = String::from_utf8_lossy(&stdout_bytes).into_owned();
                let stderr = String::from_utf8_lossy(&stderr_bytes).into_owned();

                // Re-check cancellation: a cancel may have arrived while
                // xtb was running and finished naturally before the kill
                // signal reached it.
                if let Ok(latest) = self.filestore.read_metadata(job_id).await {
                    if latest.cancel_requested {
                        self.finalize_failure(job_id, &OrchestratorError::Cancel.as_job_message()).await;
                        return;
                    }
                }

                let code = status.code();
                let exit_ok = matches!(code, Some(0) | Some(1));

                if !exit_ok {
                    let tail = tail_bytes(&stderr, STDERR_TAIL_BYTES);
                    let message = OrchestratorError::Convergence { exit_code: code, stderr_tail: tail }.as_job_message();
                    self.finalize_failure(job_id, &message).await;
                    return;
                }

                self.handle_output(job_id, &job, &stdout, &stderr, &work_dir, execution_time).await;
            }
        }
    }

    async fn handle_output(
        &self,
        job_id: &str,
        job: &Job,
        stdout: &str,
        stderr: &str,
        work_dir: &Path,
        execution_time: f64,
    ) {
        let ctx = ParseContext { stdout, stderr, work_dir };
        let parsed = match self.cascade.parse(&ctx).await {
            Ok(p) => p,
            Err(_) => {
                self.finalize_failure(job_id, &OrchestratorError::Parse.as_job_message()).await;
                return;
            }
        };

        if !parsed.has_energy() {
            self.finalize_failure(job_id, &OrchestratorError::Parse.as_job_message()).await;
            return;
        }

        if let Err(e) = self.filestore.save_results(job_id, &parsed).await {
            self.finalize_failure(job_id, &e.as_job_message()).await;
            return;
        }

        if let Err(e) = self
            .filestore
            .update_metadata(job_id, |j| j.complete(parsed.clone()))
            .await
        {
            log::error!("job {job_id}: failed to write COMPLETED metadata: {e}");
            return;
        }

        let entity_id = entity_id_from_job_id(job_id);
        let mut sample = self.sample.lock().await;
        let assessment = quality::assess(&parsed, &mut sample, "calculations", entity_id);
        drop(sample);

        self.emitter.emit_all(job, &parsed, &assessment, execution_time).await;
    }

    async fn finalize_failure(&self, job_id: &str, message: &str) {
        let result = self
            .filestore
            .update_metadata(job_id, |j| j.fail(message))
            .await;
        if let Err(e) = result {
            log::error!("job {job_id}: failed to write FAILED metadata: {e}");
        }
    }

    /// SIGTERM, then SIGKILL after a grace period, mirroring the teacher's
    /// terminate-then-confirm shutdown pattern. No session/process-group is
    /// established for the child (xTB spawns no children of its own in
    /// normal operation), so terminating the direct child is sufficient.
    async fn kill_process_group(&self, child: &mut tokio::process::Child) {
        send_sigterm(child.id());
        let grace = tokio::time::sleep(KILL_GRACE_PERIOD);
        tokio::select! {
            _ = child.wait() => {}
            _ = grace => {
                let _ = child.kill().await;
                let _ = child.wait().await;
            }
        }
    }

    fn build_args(&self, job: &Job, xyz_name: &str) -> Vec<String> {
        vec![
            xyz_name.to_string(),
            "--opt".to_string(),
            job.optimization_level.as_xtb_arg().to_string(),
            "--json".to_string(),
            "--chrg".to_string(),
            job.charge.to_string(),
            "--uhf".to_string(),
            (job.multiplicity.saturating_sub(1)).to_string(),
        ]
    }
}

/// Best-effort SIGTERM to the child before the SIGKILL grace period elapses.
/// `Child::kill` (direct kill) is the fallback on platforms without signals.
#[cfg(unix)]
fn send_sigterm(pid: Option<u32>) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    if let Some(pid) = pid {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: Option<u32>) {}

fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "molecule".to_string()
    } else {
        cleaned
    }
}

/// Keeps the *last* `max_bytes` of `s`, at a UTF-8-safe boundary.
fn tail_bytes(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let start = s.len() - max_bytes;
    let mut boundary = start;
    while boundary < s.len() && !s.is_char_boundary(boundary) {
        boundary += 1;
    }
    s[boundary..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_filename_replaces_unsafe_chars() {
        assert_eq!(sanitize_filename("2,4-dichlorophenol"), "2_4-dichlorophenol");
        assert_eq!(sanitize_filename(""), "molecule");
    }

    #[test]
    fn tail_bytes_keeps_the_end() {
        let s = "a".repeat(10) + "END";
        let tail = tail_bytes(&s, 5);
        assert_eq!(tail, "aaEND");
    }

    #[test]
    fn tail_bytes_passthrough_when_short() {
        assert_eq!(tail_bytes("short", 2048), "short");
    }

    #[test]
    fn which_finds_binary_on_path_or_returns_none() {
        // `ls` is expected to exist in virtually every CI/dev environment;
        // this exercises the real PATH-scan logic rather than mocking it.
        assert!(which("ls").is_some() || which("ls.exe").is_some());
        assert!(which("definitely-not-a-real-binary-xyz").is_none());
    }
}
