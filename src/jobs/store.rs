// src/jobs/store.rs

//! Durable job queue
//!
//! Claiming, retiring and every other state change is a single `BEGIN
//! IMMEDIATE` transaction, so two workers can never claim the same job and
//! the sequential rule is decided against a consistent view of the table.

use super::{Job, JobId, JobKind, JobStatus, Task};
use crate::db::Database;
use crate::diff::JobResult;
use crate::error::{Error, Result};
use rusqlite::{OptionalExtension, Row, Transaction, params};
use std::sync::Arc;
use tracing::{debug, info, warn};

const JOB_COLUMNS: &str = "id, kind, src_repo, dst_repo, sources, release_number, max_keep,
     created_at, claimed_at, started_at, finished_at, status, message, result";

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Raw column values; decoding kind, status and result can fail
struct JobRow {
    id: JobId,
    kind: String,
    src_repo: Option<String>,
    dst_repo: Option<String>,
    sources: String,
    release: i64,
    max_keep: i64,
    created_at: Option<String>,
    claimed_at: Option<String>,
    started_at: Option<String>,
    finished_at: Option<String>,
    status: i64,
    message: Option<String>,
    result: Option<Vec<u8>>,
}

impl JobRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            src_repo: row.get(2)?,
            dst_repo: row.get(3)?,
            sources: row.get(4)?,
            release: row.get(5)?,
            max_keep: row.get(6)?,
            created_at: row.get(7)?,
            claimed_at: row.get(8)?,
            started_at: row.get(9)?,
            finished_at: row.get(10)?,
            status: row.get(11)?,
            message: row.get(12)?,
            result: row.get(13)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        let kind = self.kind.parse::<JobKind>().map_err(Error::ParseError)?;
        let status = JobStatus::from_code(self.status).ok_or_else(|| {
            Error::ParseError(format!("job {} has unknown status {}", self.id, self.status))
        })?;
        let result = match self.result {
            Some(bytes) if !bytes.is_empty() => match JobResult::from_bytes(&bytes) {
                Ok(result) => Some(result),
                Err(e) => {
                    warn!("Ignoring unreadable result of job {}: {}", self.id, e);
                    None
                }
            },
            _ => None,
        };

        Ok(Job {
            id: self.id,
            kind,
            src_repo: self.src_repo,
            dst_repo: self.dst_repo,
            sources: split_sources(&self.sources),
            release: self.release,
            max_keep: self.max_keep,
            created_at: self.created_at,
            claimed_at: self.claimed_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            status,
            message: self.message,
            result,
        })
    }
}

fn split_sources(sources: &str) -> Vec<String> {
    sources
        .lines()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn query_jobs(tx: &Transaction, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Job>> {
    let mut stmt = tx.prepare(sql)?;
    let rows = stmt
        .query_map(params, JobRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(JobRow::into_job).collect()
}

/// Persistent queue of jobs
#[derive(Clone)]
pub struct JobStore {
    db: Arc<Database>,
}

impl JobStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Validate and persist a new job, returning its id
    pub fn push(&self, job: Job) -> Result<JobId> {
        let task = Task::from_job(&job)?;
        if job.sources.iter().any(|s| s.contains('\n')) {
            return Err(Error::InvalidJob("sources must not contain newlines".to_string()));
        }

        let id = self.db.transaction(|tx| {
            tx.execute(
                "INSERT INTO jobs (kind, src_repo, dst_repo, sources, release_number, max_keep,
                 created_at, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    job.kind.as_str(),
                    job.src_repo,
                    job.dst_repo,
                    job.sources.join("\n"),
                    job.release,
                    job.max_keep,
                    now(),
                    JobStatus::New.code(),
                ],
            )?;
            Ok(tx.last_insert_rowid())
        })?;

        debug!("Queued job {}: {}", id, task.describe());
        Ok(id)
    }

    /// Claim the oldest eligible New job and mark it Running
    ///
    /// While a sequential job is running only parallel jobs are eligible.
    pub fn claim(&self) -> Result<Job> {
        self.db.transaction(|tx| {
            let running = query_jobs(
                tx,
                &format!("SELECT {} FROM jobs WHERE status = ?1", JOB_COLUMNS),
                [JobStatus::Running.code()],
            )?;
            let sequential_busy = running.iter().any(|j| j.kind.is_sequential());

            let queued = query_jobs(
                tx,
                &format!("SELECT {} FROM jobs WHERE status = ?1 ORDER BY id ASC", JOB_COLUMNS),
                [JobStatus::New.code()],
            )?;
            let mut job = queued
                .into_iter()
                .find(|j| !sequential_busy || !j.kind.is_sequential())
                .ok_or(Error::NoJobReady)?;

            let claimed_at = now();
            tx.execute(
                "UPDATE jobs SET status = ?1, claimed_at = ?2 WHERE id = ?3",
                params![JobStatus::Running.code(), claimed_at, job.id],
            )?;
            job.status = JobStatus::Running;
            job.claimed_at = Some(claimed_at);
            Ok(job)
        })
    }

    /// Record that the claimed job began executing
    pub fn mark_started(&self, id: JobId) -> Result<()> {
        self.db.transaction(|tx| {
            tx.execute(
                "UPDATE jobs SET started_at = ?1 WHERE id = ?2 AND status = ?3",
                params![now(), id, JobStatus::Running.code()],
            )?;
            Ok(())
        })
    }

    /// Finish a Running job: Completed without an error, Failed with one
    pub fn retire(&self, id: JobId, result: Option<&JobResult>, error: Option<&str>) -> Result<()> {
        let status = if error.is_some() {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };
        let payload = result.map(JobResult::to_bytes).transpose()?;

        let updated = self.db.transaction(|tx| {
            Ok(tx.execute(
                "UPDATE jobs SET status = ?1, finished_at = ?2, message = ?3, result = ?4
                 WHERE id = ?5 AND status = ?6",
                params![
                    status.code(),
                    now(),
                    error,
                    payload,
                    id,
                    JobStatus::Running.code()
                ],
            )?)
        })?;
        if updated == 0 {
            return Err(Error::JobNotFound(id));
        }

        debug!("Retired job {} as {}", id, status);
        Ok(())
    }

    /// Crash recovery: every Running job becomes New again
    pub fn unclaim_running(&self) -> Result<usize> {
        let count = self.db.transaction(|tx| {
            Ok(tx.execute(
                "UPDATE jobs SET status = ?1, claimed_at = NULL, started_at = NULL WHERE status = ?2",
                params![JobStatus::New.code(), JobStatus::Running.code()],
            )?)
        })?;
        if count > 0 {
            info!("Requeued {} interrupted jobs", count);
        }
        Ok(count)
    }

    pub fn get(&self, id: JobId) -> Result<Job> {
        self.db.transaction(|tx| {
            let row = tx
                .query_row(
                    &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                    [id],
                    JobRow::from_row,
                )
                .optional()?;
            row.ok_or(Error::JobNotFound(id))?.into_job()
        })
    }

    /// Cancel a job that has not been claimed yet
    pub fn cancel(&self, id: JobId) -> Result<()> {
        self.db.transaction(|tx| {
            let status: Option<i64> = tx
                .query_row("SELECT status FROM jobs WHERE id = ?1", [id], |row| row.get(0))
                .optional()?;
            match status.and_then(JobStatus::from_code) {
                None => Err(Error::JobNotFound(id)),
                Some(JobStatus::New) => {
                    tx.execute(
                        "UPDATE jobs SET status = ?1, finished_at = ?2, message = 'cancelled'
                         WHERE id = ?3",
                        params![JobStatus::Cancelled.code(), now(), id],
                    )?;
                    info!("Cancelled job {}", id);
                    Ok(())
                }
                Some(other) => Err(Error::InvalidJob(format!(
                    "job {} is {} and cannot be cancelled",
                    id, other
                ))),
            }
        })
    }

    fn list(&self, statuses: &[JobStatus]) -> Result<Vec<Job>> {
        let codes = statuses
            .iter()
            .map(|s| s.code().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        self.db.transaction(|tx| {
            query_jobs(
                tx,
                &format!(
                    "SELECT {} FROM jobs WHERE status IN ({}) ORDER BY id DESC",
                    JOB_COLUMNS, codes
                ),
                [],
            )
        })
    }

    /// Queued and running jobs, newest first
    pub fn active(&self) -> Result<Vec<Job>> {
        self.list(&[JobStatus::New, JobStatus::Running])
    }

    pub fn completed(&self) -> Result<Vec<Job>> {
        self.list(&[JobStatus::Completed])
    }

    /// Failed and cancelled jobs, newest first
    pub fn failed(&self) -> Result<Vec<Job>> {
        self.list(&[JobStatus::Failed, JobStatus::Cancelled])
    }

    fn delete(&self, statuses: &[JobStatus]) -> Result<usize> {
        let codes = statuses
            .iter()
            .map(|s| s.code().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        self.db.transaction(|tx| {
            Ok(tx.execute(
                &format!("DELETE FROM jobs WHERE status IN ({})", codes),
                [],
            )?)
        })
    }

    pub fn reset_completed(&self) -> Result<usize> {
        self.delete(&[JobStatus::Completed])
    }

    pub fn reset_failed(&self) -> Result<usize> {
        self.delete(&[JobStatus::Failed, JobStatus::Cancelled])
    }

    /// Drop queued jobs; running jobs are never touched
    pub fn reset_queued(&self) -> Result<usize> {
        self.delete(&[JobStatus::New])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{Diff, DiffKind};

    fn store() -> JobStore {
        JobStore::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    #[test]
    fn test_push_assigns_new_status() {
        let store = store();
        let id = store
            .push(Job::for_repo(JobKind::DeltaIndex, "main").with_sources(["nano", "vim"]))
            .unwrap();

        let job = store.get(id).unwrap();
        assert_eq!(job.status, JobStatus::New);
        assert!(job.created_at.is_some());
        assert!(job.claimed_at.is_none());
        assert_eq!(job.sources, vec!["nano", "vim"]);
    }

    #[test]
    fn test_push_rejects_invalid_jobs() {
        let store = store();
        assert!(matches!(
            store.push(Job::new(JobKind::Index)),
            Err(Error::InvalidJob(_))
        ));
        assert!(matches!(
            store.push(Job::between(JobKind::Sync, "main", "main")),
            Err(Error::InvalidJob(_))
        ));
        assert!(store.active().unwrap().is_empty());
    }

    #[test]
    fn test_claim_respects_sequential_rule() {
        let store = store();
        assert!(matches!(store.claim(), Err(Error::NoJobReady)));

        let first = store.push(Job::for_repo(JobKind::Index, "main")).unwrap();
        let second = store.push(Job::for_repo(JobKind::Index, "other")).unwrap();
        let parallel = store.push(Job::for_repo(JobKind::Delta, "main")).unwrap();

        assert_eq!(store.claim().unwrap().id, first);
        // The second sequential job waits; the parallel one jumps ahead
        assert_eq!(store.claim().unwrap().id, parallel);
        assert!(matches!(store.claim(), Err(Error::NoJobReady)));

        store.retire(first, None, None).unwrap();
        assert_eq!(store.claim().unwrap().id, second);
    }

    #[test]
    fn test_retire_records_outcome() {
        let store = store();
        let ok = store.push(Job::between(JobKind::Compare, "a", "b")).unwrap();
        let bad = store.push(Job::for_repo(JobKind::Check, "a")).unwrap();
        store.claim().unwrap();
        store.claim().unwrap();

        let mut diff = Diff::default();
        diff.push("nano", DiffKind::Added, Some(1), None);
        store.retire(ok, Some(&JobResult::diff(diff.clone())), None).unwrap();
        store.retire(bad, None, Some("disk on fire")).unwrap();

        let ok = store.get(ok).unwrap();
        assert_eq!(ok.status, JobStatus::Completed);
        assert!(ok.finished_at.is_some());
        assert_eq!(ok.result.unwrap().as_diff(), Some(&diff));

        let bad = store.get(bad).unwrap();
        assert_eq!(bad.status, JobStatus::Failed);
        assert_eq!(bad.message.as_deref(), Some("disk on fire"));

        assert!(matches!(store.retire(bad.id, None, None), Err(Error::JobNotFound(_))));
    }

    #[test]
    fn test_unclaim_running_after_crash() {
        let store = store();
        let id = store.push(Job::for_repo(JobKind::Rescan, "main")).unwrap();
        store.claim().unwrap();
        assert!(matches!(store.claim(), Err(Error::NoJobReady)));

        assert_eq!(store.unclaim_running().unwrap(), 1);
        let job = store.claim().unwrap();
        assert_eq!(job.id, id);
    }

    #[test]
    fn test_cancel_and_listings() {
        let store = store();
        let a = store.push(Job::for_repo(JobKind::Index, "a")).unwrap();
        let b = store.push(Job::for_repo(JobKind::Index, "b")).unwrap();
        let c = store.push(Job::for_repo(JobKind::Index, "c")).unwrap();

        store.claim().unwrap();
        assert!(matches!(store.cancel(a), Err(Error::InvalidJob(_))));
        store.cancel(c).unwrap();
        assert!(matches!(store.cancel(999), Err(Error::JobNotFound(999))));

        let active: Vec<_> = store.active().unwrap().iter().map(|j| j.id).collect();
        assert_eq!(active, vec![b, a]);
        let failed: Vec<_> = store.failed().unwrap().iter().map(|j| j.id).collect();
        assert_eq!(failed, vec![c]);

        // Queued reset never drops the running job
        assert_eq!(store.reset_queued().unwrap(), 1);
        assert_eq!(store.active().unwrap().len(), 1);
        assert_eq!(store.reset_failed().unwrap(), 1);

        store.retire(a, None, None).unwrap();
        assert_eq!(store.completed().unwrap().len(), 1);
        assert_eq!(store.reset_completed().unwrap(), 1);
        assert!(store.completed().unwrap().is_empty());
    }
}
