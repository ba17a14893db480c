//! The scheduler: idempotent submission, bounded concurrency, cancellation,
//! and the single lock that guards the job records, the pending queue, the
//! active-job map, and the connected-client set.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use cluster_core::record::{JobStatus, PendingJob};
use cluster_core::{JobRecord, JobView, Store};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};

use crate::driver::{self, CancelToken, DriverUpdate, JobSpec};
use crate::hub::{self, ClientId, ClientSet, ClientSink};

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Static configuration the scheduler needs for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Identifies this server instance on the wire.
    pub server_id: String,
    /// Path to the UCI engine binary.
    pub engine_path: String,
    /// Threads passed to `setoption name Threads` per job (0 = don't set).
    pub threads: u32,
    /// Maximum concurrently active jobs. 0 means unlimited.
    pub max_jobs: usize,
}

/// `server_status` broadcast payload.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatusMsg {
    #[serde(rename = "type")]
    kind: &'static str,
    server_id: String,
    status: i64,
    running_jobs: usize,
    max_jobs: usize,
    threads: u32,
    logical_cores: usize,
}

/// `job_update` broadcast payload.
#[derive(Debug, Clone, Serialize)]
pub struct JobUpdateMsg {
    #[serde(rename = "type")]
    kind: &'static str,
    job_id: String,
    status: i64,
    #[serde(flatten)]
    fields: cluster_core::Fields,
    #[serde(skip_serializing_if = "Option::is_none")]
    log_line: Option<String>,
}

const WIRE_FIELD_KEYS: &[&str] = &[
    "multipv", "depth", "seldepth", "score_cp", "score_mate", "nodes", "nps", "bestmove", "pv",
];

fn wire_fields(fields: &cluster_core::Fields) -> cluster_core::Fields {
    let mut out = cluster_core::Fields::new();
    for key in WIRE_FIELD_KEYS {
        if let Some(v) = fields.get(*key) {
            out.insert((*key).to_string(), v.clone());
        }
    }
    out
}

struct SchedulerState {
    records: HashMap<String, JobRecord>,
    pending: VecDeque<PendingJob>,
    active: HashMap<String, CancelToken>,
    clients: ClientSet,
}

/// The scheduler: owns the single lock over scheduler state and drives
/// submission, cancellation, and the engine driver lifecycle.
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    store: Option<Arc<Store>>,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Construct a scheduler with no jobs known yet.
    pub fn new(config: SchedulerConfig, store: Option<Arc<Store>>) -> Arc<Scheduler> {
        Arc::new(Scheduler {
            state: Mutex::new(SchedulerState {
                records: HashMap::new(),
                pending: VecDeque::new(),
                active: HashMap::new(),
                clients: ClientSet::default(),
            }),
            store,
            config,
        })
    }

    /// Reconcile any non-terminal records left over from a previous process
    /// (the store's opinion on what was running), then rehydrate the most
    /// recent `db_load_limit` records (with their log tails) into memory.
    /// Called once at startup, before the listener accepts connections.
    pub async fn restore(self: &Arc<Self>, db_load_limit: usize) {
        let Some(store) = &self.store else { return };

        match store.reconcile_incomplete(now_ms()) {
            Ok(ids) => {
                for id in ids {
                    if let Err(err) = store.append_log(&id, now_ms(), "server restart: job aborted")
                    {
                        eprintln!("[server] store error appending restart log for {id}: {err}");
                    }
                }
            }
            Err(err) => eprintln!("[server] store error reconciling incomplete jobs: {err}"),
        }

        let recent = match store.load_recent(db_load_limit) {
            Ok(recent) => recent,
            Err(err) => {
                eprintln!("[server] store error loading recent jobs: {err}");
                return;
            }
        };

        let mut state = self.state.lock().await;
        for mut rec in recent {
            match store.fetch_log_tail(&rec.id, cluster_core::record::LOG_CAPACITY) {
                Ok(lines) => rec.log = lines.into_iter().collect(),
                Err(err) => eprintln!("[server] store error loading log for {}: {err}", rec.id),
            }
            state.records.insert(rec.id.clone(), rec);
        }
    }

    /// Register a new client connection; returns its id for later removal
    /// and the initial `server_status` it should be sent.
    pub async fn register_client(self: &Arc<Self>, sink: ClientSink) -> ClientId {
        let mut state = self.state.lock().await;
        state.clients.register(sink)
    }

    /// Remove a client on disconnect or write failure.
    pub async fn remove_client(self: &Arc<Self>, id: ClientId) {
        let mut state = self.state.lock().await;
        state.clients.remove(id);
    }

    /// Send `obj` to one client directly (a request/reply, not a broadcast).
    pub async fn send_one(self: &Arc<Self>, sink: &ClientSink, obj: &impl Serialize) {
        if hub::send_one(sink, obj).await.is_err() {
            // The caller's read loop will observe the next read failing and
            // remove the client; nothing further to do here.
        }
    }

    async fn broadcast(self: &Arc<Self>, obj: &impl Serialize) {
        let targets = {
            let state = self.state.lock().await;
            state.clients.snapshot()
        };
        let failed = hub::broadcast(&targets, obj).await;
        if !failed.is_empty() {
            let mut state = self.state.lock().await;
            for id in failed {
                state.clients.remove(id);
            }
        }
    }

    /// Build and broadcast the current `server_status`.
    pub async fn broadcast_status(self: &Arc<Self>) {
        let running = {
            let state = self.state.lock().await;
            state.active.len()
        };
        let status = if self.config.max_jobs > 0 && running >= self.config.max_jobs {
            cluster_core::ServerStatus::Degraded
        } else {
            cluster_core::ServerStatus::Online
        };
        let msg = ServerStatusMsg {
            kind: "server_status",
            server_id: self.config.server_id.clone(),
            status: status.as_i64(),
            running_jobs: running,
            max_jobs: self.config.max_jobs,
            threads: self.config.threads,
            logical_cores: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        };
        self.broadcast(&msg).await;
    }

    /// Number of currently active (driver-owned) jobs.
    pub async fn active_count(self: &Arc<Self>) -> usize {
        let state = self.state.lock().await;
        state.active.len()
    }

    /// Look up one job's external view.
    pub async fn get_job(self: &Arc<Self>, job_id: &str, log_tail: usize) -> Option<JobView> {
        let log_tail = log_tail.min(20_000);
        let mut state = self.state.lock().await;
        if let (Some(store), true) = (&self.store, log_tail > 0) {
            if let Ok(lines) = store.fetch_log_tail(job_id, log_tail) {
                if let Some(rec) = state.records.get_mut(job_id) {
                    rec.log = lines.into_iter().collect();
                }
            }
        }
        state.records.get(job_id).map(|rec| rec.to_view(log_tail))
    }

    /// List known jobs, optionally excluding terminal ones, newest first,
    /// truncated to `limit`.
    pub async fn list_jobs(self: &Arc<Self>, include_finished: bool, limit: usize) -> Vec<JobView> {
        let state = self.state.lock().await;
        let mut records: Vec<&JobRecord> = state
            .records
            .values()
            .filter(|rec| include_finished || !rec.status.is_terminal())
            .collect();
        records.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        records
            .into_iter()
            .take(limit)
            .map(|rec| rec.to_view(200))
            .collect()
    }

    /// Idempotently submit a job. A no-op if the id is already known. On a
    /// free slot the driver is spawned directly into `active`, rather than
    /// going through the pending queue, so it can never race with a
    /// concurrent `run_job` releasing that same slot.
    pub async fn submit(self: &Arc<Self>, pending: PendingJob) {
        let job_id = pending.id.clone();
        let started = {
            let mut state = self.state.lock().await;
            if state.records.contains_key(&pending.id)
                || state.active.contains_key(&pending.id)
                || state.pending.iter().any(|p| p.id == pending.id)
            {
                return;
            }

            let now = now_ms();
            let rec = JobRecord::new(&pending, now);
            state.records.insert(pending.id.clone(), rec);

            if self.config.max_jobs > 0 && state.active.len() >= self.config.max_jobs {
                state.pending.push_back(pending);
                None
            } else {
                let cancel = CancelToken::new();
                state.active.insert(pending.id.clone(), cancel.clone());
                Some((pending, cancel))
            }
        };

        match started {
            None => {
                self.apply_update(&job_id, JobStatus::Queued, Default::default(), Some("queued"))
                    .await;
            }
            Some((pending, cancel)) => {
                self.apply_update(
                    &job_id,
                    JobStatus::Pending,
                    Default::default(),
                    Some("submitted"),
                )
                .await;
                self.spawn_driver(pending, cancel);
            }
        }

        self.broadcast_status().await;
    }

    /// Cancel a job: signal its running driver, or drop it from the pending
    /// queue and mark it cancelled immediately.
    pub async fn cancel(self: &Arc<Self>, job_id: &str) {
        let removed_from_queue = {
            let mut state = self.state.lock().await;
            if let Some(cancel) = state.active.get(job_id) {
                cancel.cancel();
                false
            } else if let Some(pos) = state.pending.iter().position(|p| p.id == job_id) {
                state.pending.remove(pos);
                true
            } else {
                false
            }
        };

        if removed_from_queue {
            self.apply_update(
                job_id,
                JobStatus::Cancelled,
                Default::default(),
                Some("cancelled (queued)"),
            )
            .await;
        }
        self.broadcast_status().await;
    }

    /// Pop queued jobs into active slots while capacity allows.
    pub async fn try_start_next(self: &Arc<Self>) {
        loop {
            let started = {
                let mut state = self.state.lock().await;
                let has_slot =
                    self.config.max_jobs == 0 || state.active.len() < self.config.max_jobs;
                if !has_slot {
                    break;
                }
                let Some(pending) = state.pending.pop_front() else {
                    break;
                };
                let cancel = CancelToken::new();
                state.active.insert(pending.id.clone(), cancel.clone());
                self.spawn_driver(pending, cancel);
                true
            };
            if started {
                self.broadcast_status().await;
            }
        }
    }

    fn spawn_driver(self: &Arc<Self>, pending: PendingJob, cancel: CancelToken) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_job(pending, cancel).await;
        });
    }

    async fn run_job(self: Arc<Self>, pending: PendingJob, cancel: CancelToken) {
        let job_id = pending.id.clone();
        self.apply_update(&job_id, JobStatus::Running, Default::default(), Some("started"))
            .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let spec = JobSpec {
            id: pending.id.clone(),
            fen: pending.fen.clone(),
            limit_type: pending.limit_type,
            limit_value: pending.limit_value,
            multipv: pending.multipv,
        };
        let engine_path = self.config.engine_path.clone();
        let threads = self.config.threads;
        let driver_task = tokio::spawn(async move {
            driver::run(&engine_path, threads, &spec, cancel, tx).await;
        });

        while let Some(update) = rx.recv().await {
            match update {
                DriverUpdate::Running { fields, log_line } => {
                    self.apply_update(&job_id, JobStatus::Running, fields, log_line.as_deref())
                        .await;
                }
                DriverUpdate::Terminal {
                    status,
                    fields,
                    log_line,
                } => {
                    self.apply_update(&job_id, status, fields, log_line.as_deref())
                        .await;
                }
            }
        }

        let _ = driver_task.await;

        {
            let mut state = self.state.lock().await;
            state.active.remove(&job_id);
        }
        self.broadcast_status().await;
        self.try_start_next().await;
    }

    fn apply_update_locked(
        &self,
        state: &mut SchedulerState,
        job_id: &str,
        status: JobStatus,
        fields: cluster_core::Fields,
        log_line: Option<&str>,
    ) {
        let now = now_ms();
        if let Some(rec) = state.records.get_mut(job_id) {
            rec.transition(status, now);
            if !fields.is_empty() {
                rec.merge_parsed(&fields);
            }
            if let Some(mv) = fields.get("bestmove").and_then(|v| v.as_str()) {
                rec.bestmove = Some(mv.to_string());
            }
            if let Some(line) = log_line {
                rec.append_log(line);
            }
        }
    }

    /// Apply one driver (or scheduler-originated) update: mutate the record
    /// under the lock, then persist and broadcast after releasing it.
    async fn apply_update(
        self: &Arc<Self>,
        job_id: &str,
        status: JobStatus,
        fields: cluster_core::Fields,
        log_line: Option<&str>,
    ) {
        {
            let mut state = self.state.lock().await;
            self.apply_update_locked(&mut state, job_id, status, fields.clone(), log_line);
        }

        self.persist(job_id).await;

        let msg = JobUpdateMsg {
            kind: "job_update",
            job_id: job_id.to_string(),
            status: status.as_i64(),
            fields: wire_fields(&fields),
            log_line: log_line.map(|s| s.to_string()),
        };
        self.broadcast(&msg).await;
    }

    async fn persist(self: &Arc<Self>, job_id: &str) {
        let Some(store) = &self.store else { return };
        let (rec_snapshot, log_line) = {
            let state = self.state.lock().await;
            let Some(rec) = state.records.get(job_id) else {
                return;
            };
            (rec.clone(), rec.log.back().cloned())
        };
        if let Err(err) = store.upsert(&rec_snapshot) {
            eprintln!("[server] store error upserting job {job_id}: {err}");
        }
        if let Some(line) = log_line {
            if let Err(err) = store.append_log(job_id, now_ms(), &line) {
                eprintln!("[server] store error appending log for {job_id}: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_core::record::LimitType;
    use std::time::Duration;

    fn test_pending(id: &str) -> PendingJob {
        PendingJob {
            id: id.to_string(),
            opponent: String::new(),
            fen: "startpos".to_string(),
            limit_type: LimitType::Depth,
            limit_value: 1,
            multipv: 1,
        }
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

    #[tokio::test]
    async fn wire_fields_drops_unknown_keys() {
        let mut fields = cluster_core::Fields::new();
        fields.insert("depth".to_string(), serde_json::json!(5));
        fields.insert("totally_unknown".to_string(), serde_json::json!("x"));
        let out = wire_fields(&fields);
        assert!(out.contains_key("depth"));
        assert!(!out.contains_key("totally_unknown"));
    }

    #[tokio::test]
    async fn idempotent_submit_keeps_first_created_at() {
        let sched = test_scheduler(1, "/nonexistent/not-a-real-engine");
        sched.submit(test_pending("j1")).await;
        let first = sched.get_job("j1", 0).await.unwrap();

        sched.submit(test_pending("j1")).await;
        let second = sched.get_job("j1", 0).await.unwrap();

        assert_eq!(first.created_at_ms, second.created_at_ms);
    }

    #[tokio::test]
    async fn queued_job_cancel_reaches_cancelled_without_running() {
        // `/bin/cat` echoes stdin back but never emits "uciok", so the driver
        // for j1 sticks in Running forever and reliably occupies the only
        // slot for the duration of the test.
        let sched = test_scheduler(1, "/bin/cat");
        sched.submit(test_pending("j1")).await;
        sched.submit(test_pending("j2")).await;

        let j2 = sched.get_job("j2", 0).await.unwrap();
        assert_eq!(j2.status, JobStatus::Queued.as_i64());

        sched.cancel("j2").await;
        let j2 = sched.get_job("j2", 0).await.unwrap();
        assert_eq!(j2.status, JobStatus::Cancelled.as_i64());
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_as_terminal_error() {
        let sched = test_scheduler(1, "/nonexistent/not-a-real-engine");
        sched.submit(test_pending("j1")).await;

        for _ in 0..50 {
            let view = sched.get_job("j1", 10).await.unwrap();
            if view.status == JobStatus::Error.as_i64() {
                assert!(view.log_tail.iter().any(|l| l.contains("Error:")));
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job j1 never reached ERROR");
    }

    #[tokio::test]
    async fn unlimited_max_jobs_never_queues() {
        let sched = test_scheduler(0, "/bin/cat");
        sched.submit(test_pending("j1")).await;
        sched.submit(test_pending("j2")).await;

        let j2 = sched.get_job("j2", 0).await.unwrap();
        assert_ne!(j2.status, JobStatus::Queued.as_i64());
    }
}
