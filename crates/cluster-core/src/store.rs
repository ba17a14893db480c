//! Durable record store: a local SQLite database holding job rows and their
//! append-only log lines, surviving process restarts.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};

use crate::parser::Fields;
use crate::record::{JobRecord, JobStatus, LimitType};

/// Errors surfaced by the durable store. Store failures are never fatal to
/// the caller; they are logged and the in-memory view remains authoritative.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying SQLite connection returned an error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// The stored `last_by_mpv` blob could not be decoded.
    #[error("corrupt last_by_mpv blob for job {job_id}: {source}")]
    CorruptFields {
        /// The offending job id.
        job_id: String,
        /// The underlying decode error.
        source: serde_json::Error,
    },
}

/// A durable, SQLite-backed job record store opened in WAL mode.
pub struct Store {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    opponent TEXT NOT NULL,
    fen TEXT NOT NULL,
    limit_type INTEGER NOT NULL,
    limit_value INTEGER NOT NULL,
    multipv INTEGER NOT NULL,
    status INTEGER NOT NULL,
    created_at_ms INTEGER NOT NULL,
    started_at_ms INTEGER,
    finished_at_ms INTEGER,
    last_update_ms INTEGER NOT NULL,
    bestmove TEXT,
    last_by_mpv_json TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS job_logs (
    job_id TEXT NOT NULL,
    ts_ms INTEGER NOT NULL,
    line TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_job_logs_job_ts ON job_logs (job_id, ts_ms);
";

impl Store {
    /// Open (creating if absent) the SQLite database at `path`.
    pub fn open(path: &Path) -> Result<Store, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or replace the row for `record.id`.
    pub fn upsert(&self, record: &JobRecord) -> Result<(), StoreError> {
        let last_by_mpv_json = serde_json::to_string(&record.last_by_mpv)
            .expect("serializing Fields map cannot fail");
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO jobs (
                id, opponent, fen, limit_type, limit_value, multipv, status,
                created_at_ms, started_at_ms, finished_at_ms, last_update_ms,
                bestmove, last_by_mpv_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(id) DO UPDATE SET
                opponent = excluded.opponent,
                fen = excluded.fen,
                limit_type = excluded.limit_type,
                limit_value = excluded.limit_value,
                multipv = excluded.multipv,
                status = excluded.status,
                started_at_ms = excluded.started_at_ms,
                finished_at_ms = excluded.finished_at_ms,
                last_update_ms = excluded.last_update_ms,
                bestmove = excluded.bestmove,
                last_by_mpv_json = excluded.last_by_mpv_json",
            params![
                record.id,
                record.opponent,
                record.fen,
                record.limit_type.as_i64(),
                record.limit_value,
                record.multipv,
                record.status.as_i64(),
                record.created_at_ms,
                record.started_at_ms,
                record.finished_at_ms,
                record.last_update_ms,
                record.bestmove,
                last_by_mpv_json,
            ],
        )?;
        Ok(())
    }

    /// Append one log line for `job_id`. A no-op for empty lines.
    pub fn append_log(&self, job_id: &str, ts_ms: i64, line: &str) -> Result<(), StoreError> {
        if line.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO job_logs (job_id, ts_ms, line) VALUES (?1, ?2, ?3)",
            params![job_id, ts_ms, line],
        )?;
        Ok(())
    }

    /// Return the last `n` log lines for `job_id`, oldest first.
    pub fn fetch_log_tail(&self, job_id: &str, n: usize) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT line FROM job_logs WHERE job_id = ?1 ORDER BY ts_ms DESC LIMIT ?2",
        )?;
        let mut lines: Vec<String> = stmt
            .query_map(params![job_id, n as i64], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        lines.reverse();
        Ok(lines)
    }

    /// Return up to `n` most recently created records, newest first.
    pub fn load_recent(&self, n: usize) -> Result<Vec<JobRecord>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, opponent, fen, limit_type, limit_value, multipv, status,
                    created_at_ms, started_at_ms, finished_at_ms, last_update_ms,
                    bestmove, last_by_mpv_json
             FROM jobs ORDER BY created_at_ms DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![n as i64], row_to_record)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    /// Transition any non-terminal record to ERROR, stamping timestamps as
    /// needed, and return the ids that were affected. Used at startup to
    /// reconcile jobs that were in flight when the process last exited.
    pub fn reconcile_incomplete(&self, now_ms: i64) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT id FROM jobs WHERE status IN (?1, ?2, ?3)",
        )?;
        let ids: Vec<String> = stmt
            .query_map(
                params![
                    JobStatus::Pending.as_i64(),
                    JobStatus::Queued.as_i64(),
                    JobStatus::Running.as_i64()
                ],
                |row| row.get(0),
            )?
            .collect::<Result<_, _>>()?;

        for id in &ids {
            conn.execute(
                "UPDATE jobs SET
                    status = ?1,
                    finished_at_ms = COALESCE(finished_at_ms, ?2),
                    last_update_ms = ?2
                 WHERE id = ?3",
                params![JobStatus::Error.as_i64(), now_ms, id],
            )?;
        }
        Ok(ids)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<JobRecord, StoreError>> {
    let id: String = row.get(0)?;
    let last_by_mpv_json: String = row.get(12)?;

    let decoded: Result<BTreeMap<String, Fields>, _> = serde_json::from_str(&last_by_mpv_json);
    let last_by_mpv = match decoded {
        Ok(by_string_key) => {
            let mut by_u32 = BTreeMap::new();
            for (key, value) in by_string_key {
                if let Ok(mpv) = key.parse::<u32>() {
                    by_u32.insert(mpv, value);
                }
            }
            by_u32
        }
        Err(source) => {
            return Ok(Err(StoreError::CorruptFields { job_id: id, source }));
        }
    };

    Ok(Ok(JobRecord {
        id,
        opponent: row.get(1)?,
        fen: row.get(2)?,
        limit_type: LimitType::from_i64(row.get(3)?),
        limit_value: row.get(4)?,
        multipv: row.get::<_, i64>(5)? as u32,
        status: JobStatus::from_i64(row.get(6)?),
        created_at_ms: row.get(7)?,
        started_at_ms: row.get(8)?,
        finished_at_ms: row.get(9)?,
        last_update_ms: row.get(10)?,
        bestmove: row.get(11)?,
        last_by_mpv,
        log: Default::default(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::PendingJob;
    use serde_json::json;

    fn pending(id: &str) -> PendingJob {
        PendingJob {
            id: id.to_string(),
            opponent: "bench".to_string(),
            fen: "startpos".to_string(),
            limit_type: LimitType::Depth,
            limit_value: 10,
            multipv: 1,
        }
    }

    #[test]
    fn upsert_and_load_recent_roundtrips() {
        let store = Store::open(Path::new(":memory:")).unwrap();
        let mut rec = JobRecord::new(&pending("j1"), 1000);
        let mut fields = Fields::new();
        fields.insert("depth".to_string(), json!(10));
        rec.merge_parsed(&fields);
        store.upsert(&rec).unwrap();

        let loaded = store.load_recent(10).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "j1");
        assert_eq!(loaded[0].mpv_fields(1).unwrap()["depth"], 10);
    }

    #[test]
    fn append_log_and_fetch_tail_orders_ascending() {
        let store = Store::open(Path::new(":memory:")).unwrap();
        let rec = JobRecord::new(&pending("j1"), 0);
        store.upsert(&rec).unwrap();
        store.append_log("j1", 3, "third").unwrap();
        store.append_log("j1", 1, "first").unwrap();
        store.append_log("j1", 2, "second").unwrap();

        let tail = store.fetch_log_tail("j1", 10).unwrap();
        assert_eq!(tail, vec!["first", "second", "third"]);
    }

    #[test]
    fn append_log_skips_empty_lines() {
        let store = Store::open(Path::new(":memory:")).unwrap();
        let rec = JobRecord::new(&pending("j1"), 0);
        store.upsert(&rec).unwrap();
        store.append_log("j1", 1, "").unwrap();
        assert!(store.fetch_log_tail("j1", 10).unwrap().is_empty());
    }

    #[test]
    fn reconcile_incomplete_marks_error_and_returns_ids() {
        let store = Store::open(Path::new(":memory:")).unwrap();
        let mut running = JobRecord::new(&pending("running"), 0);
        running.transition(JobStatus::Running, 5);
        store.upsert(&running).unwrap();

        let mut finished = JobRecord::new(&pending("finished"), 0);
        finished.transition(JobStatus::Finished, 5);
        store.upsert(&finished).unwrap();

        let affected = store.reconcile_incomplete(99).unwrap();
        assert_eq!(affected, vec!["running".to_string()]);

        let loaded = store.load_recent(10).unwrap();
        let running = loaded.iter().find(|r| r.id == "running").unwrap();
        assert_eq!(running.status, JobStatus::Error);
        assert_eq!(running.finished_at_ms, Some(99));
    }
}
