//! The per-job engine driver: owns one UCI engine child process from spawn
//! to reap, translating the UCI protocol script into a stream of updates.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cluster_core::record::{JobStatus, LimitType};
use cluster_core::{parse_line, Fields, ParsedLine};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// A level-triggered, cooperative cancellation flag shared between a
/// scheduler and the driver task running a job.
#[derive(Clone, Debug)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a fresh, not-yet-cancelled token.
    pub fn new() -> CancelToken {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for CancelToken {
    fn default() -> CancelToken {
        CancelToken::new()
    }
}

/// The parameters of a single analysis job, as the driver needs them.
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Job id, used only for error-message formatting.
    pub id: String,
    /// FEN position to analyse.
    pub fen: String,
    /// `go` limit kind.
    pub limit_type: LimitType,
    /// `go` limit value.
    pub limit_value: i64,
    /// Requested MultiPV line count (coerced to at least 1).
    pub multipv: u32,
}

/// An update produced by a running driver.
#[derive(Debug, Clone)]
pub enum DriverUpdate {
    /// An intermediate progress update (engine is still thinking).
    Running {
        /// The merged fields for the PV this update concerns.
        fields: Fields,
        /// Raw engine line to append to the job log.
        log_line: Option<String>,
    },
    /// The final update for this job. Exactly one of these is ever sent.
    Terminal {
        /// FINISHED, ERROR, or CANCELLED.
        status: JobStatus,
        /// Final merged fields (bestmove + multipv=1 snapshot fields on
        /// success, empty on error).
        fields: Fields,
        /// Raw engine line / error description to append to the job log.
        log_line: Option<String>,
    },
}

/// Failures of the UCI protocol script. Each maps to exactly one terminal
/// ERROR update.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine binary could not be spawned.
    #[error("failed to spawn engine process: {0}")]
    Spawn(#[source] std::io::Error),
    /// EOF before `uciok`.
    #[error("engine closed stdout before sending uciok")]
    EofBeforeUciOk,
    /// EOF before `readyok`.
    #[error("engine closed stdout before sending readyok")]
    EofBeforeReadyOk,
    /// EOF before a `bestmove` line.
    #[error("engine closed stdout before sending bestmove")]
    EofBeforeBestMove,
    /// A write to the engine's stdin failed.
    #[error("failed to write to engine stdin: {0}")]
    Write(#[source] std::io::Error),
    /// A read from the engine's stdout failed.
    #[error("failed to read from engine stdout: {0}")]
    Read(#[source] std::io::Error),
    /// The engine's stdin/stdout pipes were not available after spawn.
    #[error("engine process has no stdin/stdout pipe")]
    MissingPipe,
}

/// Run one job to completion against the engine at `engine_path`, sending
/// [`DriverUpdate`]s to `updates` as they occur. Guarantees the child process
/// is killed and reaped on every exit path, and that exactly one
/// [`DriverUpdate::Terminal`] is sent.
pub async fn run(
    engine_path: &str,
    threads: u32,
    job: &JobSpec,
    cancel: CancelToken,
    updates: mpsc::UnboundedSender<DriverUpdate>,
) {
    let mut child = match spawn(engine_path) {
        Ok(child) => child,
        Err(err) => {
            send_error(&updates, job, &err);
            return;
        }
    };

    let stderr_task = child
        .stderr
        .take()
        .map(|stderr| tokio::spawn(forward_stderr(stderr, updates.clone())));

    if let Err(err) = drive(&mut child, threads, job, &cancel, &updates).await {
        send_error(&updates, job, &err);
    }

    let _ = child.start_kill();
    let _ = child.wait().await;
    if let Some(task) = stderr_task {
        task.abort();
    }
}

fn spawn(engine_path: &str) -> Result<Child, EngineError> {
    Command::new(engine_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(EngineError::Spawn)
}

/// Fold the engine's stderr into the same update/log stream as stdout,
/// mirroring the reference engine's `stderr=STDOUT` merge without requiring
/// an OS-level pipe merge. Each line is forwarded as a log-only update (no
/// parsed fields); it never participates in the UCI handshake.
async fn forward_stderr(
    stderr: tokio::process::ChildStderr,
    updates: mpsc::UnboundedSender<DriverUpdate>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let _ = updates.send(DriverUpdate::Running {
            fields: Fields::new(),
            log_line: Some(line.to_string()),
        });
    }
}

fn send_error(updates: &mpsc::UnboundedSender<DriverUpdate>, job: &JobSpec, err: &EngineError) {
    let _ = updates.send(DriverUpdate::Terminal {
        status: JobStatus::Error,
        fields: Fields::new(),
        log_line: Some(format!("[job {}] Error: {err}", job.id)),
    });
}

async fn drive(
    child: &mut Child,
    threads: u32,
    job: &JobSpec,
    cancel: &CancelToken,
    updates: &mpsc::UnboundedSender<DriverUpdate>,
) -> Result<(), EngineError> {
    let mut stdin = child.stdin.take().ok_or(EngineError::MissingPipe)?;
    let stdout = child.stdout.take().ok_or(EngineError::MissingPipe)?;
    let mut lines = BufReader::new(stdout).lines();

    write_line(&mut stdin, "uci").await?;
    wait_for(&mut lines, "uciok", EngineError::EofBeforeUciOk).await?;

    if threads > 0 {
        write_line(&mut stdin, &format!("setoption name Threads value {threads}")).await?;
    }
    let multipv = job.multipv.max(1);
    write_line(&mut stdin, &format!("setoption name MultiPV value {multipv}")).await?;

    write_line(&mut stdin, "isready").await?;
    wait_for(&mut lines, "readyok", EngineError::EofBeforeReadyOk).await?;

    write_line(&mut stdin, "ucinewgame").await?;
    write_line(&mut stdin, &format!("position fen {}", job.fen)).await?;
    write_line(&mut stdin, &go_command(job.limit_type, job.limit_value)).await?;

    let mut last_by_mpv: std::collections::BTreeMap<u32, Fields> = std::collections::BTreeMap::new();
    let mut stop_sent = false;

    loop {
        if cancel.is_cancelled() && !stop_sent {
            write_line(&mut stdin, "stop").await?;
            stop_sent = true;
        }

        let line = lines
            .next_line()
            .await
            .map_err(EngineError::Read)?
            .ok_or(EngineError::EofBeforeBestMove)?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match parse_line(line) {
            ParsedLine::Info(fields) => {
                let mpv = fields
                    .get("multipv")
                    .and_then(|v| v.as_u64())
                    .map(|v| v.max(1) as u32)
                    .unwrap_or(1);
                let entry = last_by_mpv.entry(mpv).or_default();
                for (k, v) in &fields {
                    entry.insert(k.clone(), v.clone());
                }
                entry.insert("multipv".to_string(), serde_json::Value::from(mpv));

                let _ = updates.send(DriverUpdate::Running {
                    fields: entry.clone(),
                    log_line: Some(line.to_string()),
                });
            }
            ParsedLine::BestMove(mv) => {
                let status = if cancel.is_cancelled() {
                    JobStatus::Cancelled
                } else {
                    JobStatus::Finished
                };
                let mut fields = last_by_mpv.get(&1).cloned().unwrap_or_default();
                fields.insert("bestmove".to_string(), serde_json::Value::String(mv));
                fields.insert("multipv".to_string(), serde_json::Value::from(1u32));

                let _ = updates.send(DriverUpdate::Terminal {
                    status,
                    fields,
                    log_line: Some(line.to_string()),
                });
                return Ok(());
            }
            ParsedLine::Other => {}
        }
    }
}

fn go_command(limit_type: LimitType, limit_value: i64) -> String {
    match limit_type {
        LimitType::Depth => format!("go depth {limit_value}"),
        LimitType::MoveTime => format!("go movetime {limit_value}"),
        LimitType::Nodes => format!("go nodes {limit_value}"),
    }
}

async fn write_line(
    stdin: &mut tokio::process::ChildStdin,
    line: &str,
) -> Result<(), EngineError> {
    stdin
        .write_all(format!("{line}\n").as_bytes())
        .await
        .map_err(EngineError::Write)?;
    stdin.flush().await.map_err(EngineError::Write)
}

async fn wait_for(
    lines: &mut tokio::io::Lines<BufReader<tokio::process::ChildStdout>>,
    sentinel: &str,
    eof_err: EngineError,
) -> Result<(), EngineError> {
    loop {
        let line = lines.next_line().await.map_err(EngineError::Read)?;
        match line {
            Some(line) if line.trim() == sentinel => return Ok(()),
            Some(_) => continue,
            None => return Err(eof_err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn go_command_maps_limit_types() {
        assert_eq!(go_command(LimitType::Depth, 12), "go depth 12");
        assert_eq!(go_command(LimitType::MoveTime, 500), "go movetime 500");
        assert_eq!(go_command(LimitType::Nodes, 1000), "go nodes 1000");
    }

    #[test]
    fn cancel_token_is_level_triggered() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn spawn_reports_error_for_missing_binary() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let job = JobSpec {
            id: "j1".to_string(),
            fen: "startpos".to_string(),
            limit_type: LimitType::Depth,
            limit_value: 1,
            multipv: 1,
        };
        run(
            "/nonexistent/definitely-not-a-binary",
            1,
            &job,
            CancelToken::new(),
            tx,
        )
        .await;

        let update = rx.recv().await.expect("expected a terminal update");
        match update {
            DriverUpdate::Terminal { status, log_line, .. } => {
                assert_eq!(status, JobStatus::Error);
                assert!(log_line.unwrap().starts_with("[job j1] Error:"));
            }
            _ => panic!("expected Terminal update"),
        }
    }
}
