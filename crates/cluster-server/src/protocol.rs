//! Decodes one client frame and dispatches it against a [`Scheduler`].

use std::sync::Arc;

use cluster_core::record::PendingJob;
use cluster_engine::{ClientSink, Scheduler};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `jobs_list` direct reply.
#[derive(Debug, Serialize)]
struct JobsListReply {
    #[serde(rename = "type")]
    kind: &'static str,
    server_id: String,
    jobs: Vec<cluster_core::JobView>,
}

/// `job_state` direct reply.
#[derive(Debug, Serialize)]
struct JobStateReply {
    #[serde(rename = "type")]
    kind: &'static str,
    server_id: String,
    job: Option<cluster_core::JobView>,
}

#[derive(Debug, Deserialize)]
struct JobsListRequest {
    #[serde(default = "default_true")]
    include_finished: bool,
    #[serde(default = "default_jobs_limit")]
    limit: usize,
}

fn default_true() -> bool {
    true
}

fn default_jobs_limit() -> usize {
    200
}

#[derive(Debug, Deserialize)]
struct JobGetRequest {
    #[serde(default)]
    job_id: String,
    #[serde(default = "default_log_tail")]
    log_tail: usize,
}

fn default_log_tail() -> usize {
    2000
}

#[derive(Debug, Deserialize)]
struct JobCancelRequest {
    #[serde(default)]
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct JobSubmitRequest {
    job: PendingJob,
}

/// Decode and dispatch one already-trimmed, non-empty line of client input.
/// Malformed or unknown frames are silently ignored, per the protocol's
/// drop-on-error policy.
pub async fn dispatch(scheduler: &Arc<Scheduler>, server_id: &str, line: &str, reply_to: &ClientSink) {
    let Ok(obj) = serde_json::from_str::<Value>(line) else {
        return;
    };
    let Some(msg_type) = obj.get("type").and_then(Value::as_str) else {
        return;
    };

    match msg_type {
        "ping" => {
            scheduler.broadcast_status().await;
        }
        "jobs_list" => {
            let req: JobsListRequest = serde_json::from_value(obj).unwrap_or(JobsListRequest {
                include_finished: true,
                limit: 200,
            });
            let jobs = scheduler.list_jobs(req.include_finished, req.limit).await;
            let reply = JobsListReply {
                kind: "jobs_list",
                server_id: server_id.to_string(),
                jobs,
            };
            scheduler.send_one(reply_to, &reply).await;
        }
        "job_get" => {
            let Ok(req) = serde_json::from_value::<JobGetRequest>(obj) else {
                return;
            };
            if req.job_id.is_empty() {
                return;
            }
            let log_tail = req.log_tail.clamp(0, 20_000);
            let job = scheduler.get_job(&req.job_id, log_tail).await;
            let reply = JobStateReply {
                kind: "job_state",
                server_id: server_id.to_string(),
                job,
            };
            scheduler.send_one(reply_to, &reply).await;
        }
        "job_submit_or_update" => {
            let Ok(req) = serde_json::from_value::<JobSubmitRequest>(obj) else {
                return;
            };
            let mut job = req.job;
            if job.id.is_empty() || job.fen.is_empty() {
                return;
            }
            job.multipv = job.multipv.max(1);
            scheduler.submit(job).await;
        }
        "job_cancel" => {
            let Ok(req) = serde_json::from_value::<JobCancelRequest>(obj) else {
                return;
            };
            if !req.job_id.is_empty() {
                scheduler.cancel(&req.job_id).await;
            }
        }
        _ => {}
    }
}
