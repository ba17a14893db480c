//! The job record: the in-memory authoritative state of one analysis job.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::parser::Fields;

/// Maximum number of raw engine lines retained per job.
pub const LOG_CAPACITY: usize = 2000;

/// The limit the caller placed on the analysis (`go depth|movetime|nodes`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitType {
    /// `go depth <value>`.
    Depth,
    /// `go movetime <value>` (milliseconds).
    MoveTime,
    /// `go nodes <value>`.
    Nodes,
}

impl LimitType {
    /// The wire/storage representation.
    pub fn as_i64(self) -> i64 {
        match self {
            LimitType::Depth => 0,
            LimitType::MoveTime => 1,
            LimitType::Nodes => 2,
        }
    }

    /// Decode a wire/storage value; anything unrecognised falls back to `Depth`,
    /// matching the reference server's "else go depth 20" fallback.
    pub fn from_i64(value: i64) -> LimitType {
        match value {
            1 => LimitType::MoveTime,
            2 => LimitType::Nodes,
            _ => LimitType::Depth,
        }
    }
}

/// Job lifecycle status. Values double as the wire representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Submitted, not yet queued or started.
    Pending,
    /// Waiting for a free execution slot.
    Queued,
    /// An engine driver currently owns this job.
    Running,
    /// Completed with a `bestmove`.
    Finished,
    /// Terminated by an engine/driver error.
    Error,
    /// Cancelled before or during execution.
    Cancelled,
    /// Reserved terminal state; never emitted by the driver or scheduler.
    Stopped,
}

impl JobStatus {
    /// The wire/storage representation.
    pub fn as_i64(self) -> i64 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Queued => 1,
            JobStatus::Running => 2,
            JobStatus::Finished => 3,
            JobStatus::Error => 4,
            JobStatus::Cancelled => 5,
            JobStatus::Stopped => 6,
        }
    }

    /// Decode a wire/storage value.
    pub fn from_i64(value: i64) -> JobStatus {
        match value {
            1 => JobStatus::Queued,
            2 => JobStatus::Running,
            3 => JobStatus::Finished,
            4 => JobStatus::Error,
            5 => JobStatus::Cancelled,
            6 => JobStatus::Stopped,
            _ => JobStatus::Pending,
        }
    }

    /// Whether this status is terminal (no further transitions permitted).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Error | JobStatus::Cancelled | JobStatus::Stopped
        )
    }
}

/// Aggregate server status, derived from scheduler load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    /// No jobs have run yet / status unknown.
    Unknown,
    /// Capacity available.
    Online,
    /// Running at (or above) `max_jobs`.
    Degraded,
    /// Not accepting work.
    Offline,
}

impl ServerStatus {
    /// The wire representation.
    pub fn as_i64(self) -> i64 {
        match self {
            ServerStatus::Unknown => 0,
            ServerStatus::Online => 1,
            ServerStatus::Degraded => 2,
            ServerStatus::Offline => 3,
        }
    }
}

/// A job submission payload (no status, no timestamps).
#[derive(Debug, Clone, Deserialize)]
pub struct PendingJob {
    /// Caller-assigned unique job id.
    pub id: String,
    /// Free-form opponent/description string.
    #[serde(default)]
    pub opponent: String,
    /// FEN position string, forwarded verbatim to the engine.
    pub fen: String,
    /// `go` limit kind.
    #[serde(default = "default_limit_type", deserialize_with = "de_limit_type")]
    pub limit_type: LimitType,
    /// `go` limit value (units per `limit_type`).
    #[serde(default = "default_limit_value")]
    pub limit_value: i64,
    /// Requested MultiPV line count.
    #[serde(default = "default_multipv")]
    pub multipv: u32,
}

fn default_limit_type() -> LimitType {
    LimitType::Depth
}

fn default_limit_value() -> i64 {
    30
}

fn default_multipv() -> u32 {
    1
}

fn de_limit_type<'de, D>(deserializer: D) -> Result<LimitType, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = i64::deserialize(deserializer)?;
    Ok(LimitType::from_i64(raw))
}

/// The canonical in-memory state of one job.
#[derive(Debug, Clone)]
pub struct JobRecord {
    /// Stable job id.
    pub id: String,
    /// Free-form opponent/description string.
    pub opponent: String,
    /// FEN position string.
    pub fen: String,
    /// `go` limit kind.
    pub limit_type: LimitType,
    /// `go` limit value.
    pub limit_value: i64,
    /// Requested MultiPV line count.
    pub multipv: u32,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Creation timestamp (ms since epoch).
    pub created_at_ms: i64,
    /// Timestamp of the first RUNNING transition, if any.
    pub started_at_ms: Option<i64>,
    /// Timestamp of the first terminal transition, if any.
    pub finished_at_ms: Option<i64>,
    /// Timestamp of the most recent mutation.
    pub last_update_ms: i64,
    /// The engine's chosen move, once known.
    pub bestmove: Option<String>,
    /// Latest merged fields per MultiPV index.
    pub last_by_mpv: BTreeMap<u32, Fields>,
    /// Bounded FIFO of raw engine output lines (oldest dropped past `LOG_CAPACITY`).
    pub log: VecDeque<String>,
}

impl JobRecord {
    /// Create a fresh PENDING record from a submission.
    pub fn new(pending: &PendingJob, now_ms: i64) -> JobRecord {
        JobRecord {
            id: pending.id.clone(),
            opponent: pending.opponent.clone(),
            fen: pending.fen.clone(),
            limit_type: pending.limit_type,
            limit_value: pending.limit_value,
            multipv: pending.multipv.max(1),
            status: JobStatus::Pending,
            created_at_ms: now_ms,
            started_at_ms: None,
            finished_at_ms: None,
            last_update_ms: now_ms,
            bestmove: None,
            last_by_mpv: BTreeMap::new(),
            log: VecDeque::new(),
        }
    }

    /// Append a line to the bounded log, dropping the oldest line if at capacity.
    /// A no-op for empty lines.
    pub fn append_log(&mut self, line: &str) {
        if line.is_empty() {
            return;
        }
        if self.log.len() >= LOG_CAPACITY {
            self.log.pop_front();
        }
        self.log.push_back(line.to_string());
    }

    /// Merge parsed `info` fields into `last_by_mpv`, keyed by the `multipv`
    /// the fields themselves carry (default 1), re-stamping the `multipv` key
    /// on the merged entry so it always matches its map key.
    pub fn merge_parsed(&mut self, fields: &Fields) {
        let mpv = fields
            .get("multipv")
            .and_then(Value::as_u64)
            .map(|v| v.max(1) as u32)
            .unwrap_or(1);

        let entry = self.last_by_mpv.entry(mpv).or_default();
        for (k, v) in fields {
            entry.insert(k.clone(), v.clone());
        }
        entry.insert("multipv".to_string(), Value::from(mpv));
    }

    /// Apply a status transition, stamping `started_at_ms`/`finished_at_ms`
    /// exactly once, and bumping `last_update_ms`.
    pub fn transition(&mut self, status: JobStatus, now_ms: i64) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        if status == JobStatus::Running && self.started_at_ms.is_none() {
            self.started_at_ms = Some(now_ms);
        }
        if status.is_terminal() && self.finished_at_ms.is_none() {
            self.finished_at_ms = Some(now_ms);
        }
        self.last_update_ms = now_ms;
    }

    /// Look up the fields for a MultiPV index, tolerating the case where the
    /// index is only known as a string (e.g. rehydrated from a JSON blob
    /// whose native map lost integer-key typing before being normalised).
    pub fn mpv_fields(&self, mpv: u32) -> Option<&Fields> {
        self.last_by_mpv.get(&mpv)
    }

    /// Build the external view of this record.
    pub fn to_view(&self, log_tail: usize) -> JobView {
        let mut snapshot = self.mpv_fields(1).cloned().unwrap_or_default();
        if let Some(mv) = &self.bestmove {
            snapshot.insert("bestmove".to_string(), Value::String(mv.clone()));
        }
        if !snapshot.is_empty() {
            snapshot.insert("multipv".to_string(), Value::from(1));
        }

        let lines: Vec<Fields> = self.last_by_mpv.values().cloned().collect();

        let log_tail = self
            .log
            .iter()
            .rev()
            .take(log_tail)
            .rev()
            .cloned()
            .collect();

        JobView {
            id: self.id.clone(),
            opponent: self.opponent.clone(),
            fen: self.fen.clone(),
            limit_type: self.limit_type.as_i64(),
            limit_value: self.limit_value,
            multipv: self.multipv,
            status: self.status.as_i64(),
            created_at_ms: self.created_at_ms,
            started_at_ms: self.started_at_ms,
            finished_at_ms: self.finished_at_ms,
            last_update_ms: self.last_update_ms,
            snapshot,
            lines,
            log_tail,
        }
    }
}

/// The external (wire) view of a job record.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    /// Stable job id.
    pub id: String,
    /// Free-form opponent/description string.
    pub opponent: String,
    /// FEN position string.
    pub fen: String,
    /// `go` limit kind (wire encoding).
    pub limit_type: i64,
    /// `go` limit value.
    pub limit_value: i64,
    /// Requested MultiPV line count.
    pub multipv: u32,
    /// Lifecycle status (wire encoding).
    pub status: i64,
    /// Creation timestamp (ms since epoch).
    pub created_at_ms: i64,
    /// Timestamp of the first RUNNING transition, if any.
    pub started_at_ms: Option<i64>,
    /// Timestamp of the first terminal transition, if any.
    pub finished_at_ms: Option<i64>,
    /// Timestamp of the most recent mutation.
    pub last_update_ms: i64,
    /// Copy of the MultiPV-1 fields with `bestmove` overlaid.
    pub snapshot: Fields,
    /// All MultiPV lines, sorted by index.
    pub lines: Vec<Fields>,
    /// The requested tail of the raw log.
    pub log_tail: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending(id: &str) -> PendingJob {
        PendingJob {
            id: id.to_string(),
            opponent: String::new(),
            fen: "startpos".to_string(),
            limit_type: LimitType::Depth,
            limit_value: 10,
            multipv: 1,
        }
    }

    #[test]
    fn merge_parsed_stamps_multipv_key() {
        let mut rec = JobRecord::new(&pending("j1"), 0);
        let mut fields = Fields::new();
        fields.insert("multipv".to_string(), json!(2));
        fields.insert("depth".to_string(), json!(10));
        rec.merge_parsed(&fields);
        let entry = rec.mpv_fields(2).unwrap();
        assert_eq!(entry["multipv"], 2);
        assert_eq!(entry["depth"], 10);
    }

    #[test]
    fn merge_parsed_defaults_to_mpv_one() {
        let mut rec = JobRecord::new(&pending("j1"), 0);
        let mut fields = Fields::new();
        fields.insert("depth".to_string(), json!(5));
        rec.merge_parsed(&fields);
        assert!(rec.mpv_fields(1).is_some());
    }

    #[test]
    fn transition_is_monotonic_past_terminal() {
        let mut rec = JobRecord::new(&pending("j1"), 0);
        rec.transition(JobStatus::Running, 10);
        rec.transition(JobStatus::Finished, 20);
        assert_eq!(rec.started_at_ms, Some(10));
        assert_eq!(rec.finished_at_ms, Some(20));

        rec.transition(JobStatus::Error, 30);
        assert_eq!(rec.status, JobStatus::Finished);
        assert_eq!(rec.finished_at_ms, Some(20));
    }

    #[test]
    fn log_is_bounded() {
        let mut rec = JobRecord::new(&pending("j1"), 0);
        for i in 0..(LOG_CAPACITY + 10) {
            rec.append_log(&format!("line {i}"));
        }
        assert_eq!(rec.log.len(), LOG_CAPACITY);
        assert_eq!(rec.log.front().unwrap(), &format!("line {}", 10));
    }

    #[test]
    fn append_log_skips_empty_lines() {
        let mut rec = JobRecord::new(&pending("j1"), 0);
        rec.append_log("");
        assert!(rec.log.is_empty());
    }

    #[test]
    fn to_view_overlays_bestmove_on_snapshot() {
        let mut rec = JobRecord::new(&pending("j1"), 0);
        let mut fields = Fields::new();
        fields.insert("depth".to_string(), json!(12));
        rec.merge_parsed(&fields);
        rec.bestmove = Some("e2e4".to_string());

        let view = rec.to_view(200);
        assert_eq!(view.snapshot["bestmove"], "e2e4");
        assert_eq!(view.snapshot["multipv"], 1);
        assert_eq!(view.lines.len(), 1);
    }
}
