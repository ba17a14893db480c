//! Integration tests driving the [`Scheduler`] against a tiny shell-script
//! stand-in for a UCI engine, exercising the end-to-end scenarios the
//! scheduler is responsible for.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use cluster_core::record::{JobStatus, LimitType, PendingJob};
use cluster_engine::{Scheduler, SchedulerConfig};

/// Write a minimal UCI-speaking shell script to a fresh temp file and return
/// its path. The script answers `uci`/`isready` and, on `go`, emits one
/// `info` line before `bestmove e2e4`.
fn fake_engine() -> std::path::PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("fake-uci-engine-{}.sh", std::process::id()));
    let script = r#"#!/bin/sh
while IFS= read -r line; do
  case "$line" in
    uci) echo uciok ;;
    isready) echo readyok ;;
    go*)
      echo "info depth 1 seldepth 1 multipv 1 score cp 10 nodes 100 nps 1000 pv e2e4 e7e5"
      echo "bestmove e2e4"
      ;;
  esac
done
"#;
    let mut file = fs::File::create(&path).expect("create fake engine script");
    file.write_all(script.as_bytes())
        .expect("write fake engine script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
        .expect("chmod fake engine script");
    path
}

fn test_scheduler(max_jobs: usize, engine_path: &str) -> Arc<Scheduler> {
    Scheduler::new(
        SchedulerConfig {
            server_id: "test".to_string(),
            engine_path: engine_path.to_string(),
            threads: 1,
            max_jobs,
        },
        None,
    )
}

fn pending(id: &str) -> PendingJob {
    PendingJob {
        id: id.to_string(),
        opponent: String::new(),
        fen: "startpos".to_string(),
        limit_type: LimitType::Depth,
        limit_value: 1,
        multipv: 1,
    }
}

async fn wait_for_status(scheduler: &Arc<Scheduler>, job_id: &str, status: JobStatus) {
    for _ in 0..200 {
        if let Some(view) = scheduler.get_job(job_id, 50).await {
            if view.status == status.as_i64() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never reached status {:?}", status);
}

#[tokio::test]
async fn submit_and_finish() {
    let engine = fake_engine();
    let scheduler = test_scheduler(1, engine.to_str().unwrap());

    scheduler.submit(pending("j1")).await;
    wait_for_status(&scheduler, "j1", JobStatus::Finished).await;

    let view = scheduler.get_job("j1", 50).await.unwrap();
    assert!(view.finished_at_ms.is_some());
    assert_eq!(view.snapshot["bestmove"], "e2e4");
    assert!(view.log_tail.iter().any(|l| l.starts_with("info")));
    assert!(view.log_tail.iter().any(|l| l.starts_with("bestmove")));

    let _ = fs::remove_file(&engine);
}

#[tokio::test]
async fn queue_then_cancel_then_drain() {
    let engine = fake_engine();
    let scheduler = test_scheduler(1, engine.to_str().unwrap());

    scheduler.submit(pending("j1")).await;
    scheduler.submit(pending("j2")).await;

    let j2 = scheduler.get_job("j2", 0).await.unwrap();
    assert_eq!(j2.status, JobStatus::Queued.as_i64());

    scheduler.cancel("j2").await;
    let j2 = scheduler.get_job("j2", 0).await.unwrap();
    assert_eq!(j2.status, JobStatus::Cancelled.as_i64());

    wait_for_status(&scheduler, "j1", JobStatus::Finished).await;
    assert_eq!(scheduler.active_count().await, 0);

    let _ = fs::remove_file(&engine);
}
