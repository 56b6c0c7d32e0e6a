//! Job/action DAG (§4.5): a job fans out into one `actions` row per target
//! node; a scheduler outside this crate advances each action phase by
//! phase and this crate only tracks the bookkeeping — throttling, lock
//! prefixes, and the global node lock — that the scheduler consults before
//! and after each step.

use hashfs_db::{params, Handle, Migration};
use hashfs_util::{fail_etoomany, fail_locked, enoent, HfsError, Result};

pub const MAX_PENDING_JOBS: usize = hashfs_util::MAX_PENDING_JOBS;

const MIGRATIONS: &[Migration] = &[Migration::new(
    1,
    "CREATE TABLE jobs (
        job_id INTEGER PRIMARY KEY,
        parent_id INTEGER REFERENCES jobs(job_id) ON DELETE CASCADE,
        job_type TEXT NOT NULL,
        uid INTEGER NOT NULL,
        lock_key TEXT,
        expiry INTEGER NOT NULL,
        triggered_at INTEGER,
        result INTEGER,
        reason TEXT,
        created_at INTEGER NOT NULL
    );
    CREATE UNIQUE INDEX jobs_open_lock ON jobs (lock_key) WHERE result IS NULL AND lock_key IS NOT NULL;
    CREATE INDEX jobs_by_uid_open ON jobs (uid) WHERE result IS NULL AND parent_id IS NULL;
    CREATE TABLE actions (
        action_id INTEGER PRIMARY KEY,
        job_id INTEGER NOT NULL REFERENCES jobs(job_id) ON DELETE CASCADE,
        target TEXT NOT NULL,
        phase TEXT NOT NULL DEFAULT 'PENDING',
        failed INTEGER NOT NULL DEFAULT 0,
        reason TEXT
    );
    CREATE INDEX actions_by_job ON actions (job_id);
    CREATE TABLE node_lock (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        held_by INTEGER
    );",
)];

/// The lock-prefix table from §4.5. Jobs with no prefix here (e.g. the
/// upload commit's own `REPLICATE_BLOCKS`/`FLUSH_FILE` pair) take out no
/// lock at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobType {
    CreateVolume,
    DeleteVolume,
    CreateUser,
    DeleteUser,
    Acl,
    FlushToken,
    DeleteFile,
    Distribution,
    StartRebalance,
    FinishRebalance,
    RebalanceBlocks,
    RebalanceFiles,
    RebalanceCleanup,
    ReplicateBlocks,
    FlushFile,
}

impl JobType {
    pub fn lock_prefix(self) -> Option<&'static str> {
        use JobType::*;
        match self {
            CreateVolume | DeleteVolume => Some("VOL"),
            CreateUser | DeleteUser => Some("USER"),
            Acl => Some("ACL"),
            FlushToken => Some("TOKEN"),
            DeleteFile => Some("DELFILE"),
            Distribution => Some("*"),
            StartRebalance => Some("STARTREBALANCE"),
            FinishRebalance => Some("FINISHREBALANCE"),
            RebalanceBlocks => Some("REBALANCE_BLOCKS"),
            RebalanceFiles => Some("REBALANCE_FILES"),
            RebalanceCleanup => Some("REBALANCE_CLEANUP"),
            ReplicateBlocks | FlushFile => None,
        }
    }

    /// The global lock (`job_lock`) tolerates an in-flight distribution
    /// job — propagating a new placement blob must be able to proceed
    /// while the node is otherwise quiesced for a rebalance kickoff.
    pub fn is_distribution(self) -> bool {
        matches!(self, JobType::Distribution)
    }

    fn as_str(self) -> &'static str {
        use JobType::*;
        match self {
            CreateVolume => "CREATE_VOLUME",
            DeleteVolume => "DELETE_VOLUME",
            CreateUser => "CREATE_USER",
            DeleteUser => "DELETE_USER",
            Acl => "ACL",
            FlushToken => "FLUSH_TOKEN",
            DeleteFile => "DELETE_FILE",
            Distribution => "DISTRIBUTION",
            StartRebalance => "START_REBALANCE",
            FinishRebalance => "FINISH_REBALANCE",
            RebalanceBlocks => "REBALANCE_BLOCKS",
            RebalanceFiles => "REBALANCE_FILES",
            RebalanceCleanup => "REBALANCE_CLEANUP",
            ReplicateBlocks => "REPLICATE_BLOCKS",
            FlushFile => "FLUSH_FILE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Ok,
    Error,
}

pub struct JobQueue {
    handle: Handle,
}

impl JobQueue {
    pub fn open(path: &std::path::Path) -> Result<JobQueue> {
        Ok(JobQueue {
            handle: Handle::open(path, MIGRATIONS)?,
        })
    }

    pub fn open_memory() -> Result<JobQueue> {
        Ok(JobQueue {
            handle: Handle::open_memory(MIGRATIONS)?,
        })
    }

    /// `job_new_begin -> job_new_notrigger+ -> job_new_end`, folded into
    /// one transaction: asserts the node isn't globally locked (unless
    /// this job type is the one exempted kind), throttles the user's open
    /// root-job count, inserts the job and one action per target, and
    /// claims the job type's lock prefix if one applies.
    pub fn new_job(
        &self,
        parent_id: Option<u64>,
        job_type: JobType,
        uid: u64,
        lock: Option<&str>,
        targets: &[String],
        timeout_secs: i64,
        now: i64,
    ) -> Result<u64> {
        self.handle.with_tx(|tx| {
            let held_by: Option<i64> = tx
                .query_row("SELECT held_by FROM node_lock WHERE id = 1", [], |r| r.get(0))
                .unwrap_or(None);
            if held_by.is_some() && !job_type.is_distribution() {
                return Err(fail_locked("node is globally locked"));
            }

            if parent_id.is_none() {
                let open: i64 = tx
                    .query_row(
                        "SELECT COUNT(*) FROM jobs WHERE uid = ?1 AND parent_id IS NULL AND result IS NULL",
                        params![uid as i64],
                        |r| r.get(0),
                    )
                    .map_err(HfsError::from)?;
                if open as usize >= MAX_PENDING_JOBS {
                    return Err(fail_etoomany(format!(
                        "user {uid} already has {open} pending jobs"
                    )));
                }
            }

            let expiry = match parent_id {
                Some(pid) => {
                    let parent_expiry: i64 = tx
                        .query_row("SELECT expiry FROM jobs WHERE job_id = ?1", params![pid as i64], |r| r.get(0))
                        .map_err(|e| map_missing(e, "no such parent job"))?;
                    parent_expiry + timeout_secs
                }
                None => now + timeout_secs,
            };

            let lock_key = match (lock, job_type.lock_prefix()) {
                (Some(l), Some(prefix)) => Some(format!("${prefix}${l}")),
                _ => None,
            };

            tx.execute(
                "INSERT INTO jobs (parent_id, job_type, uid, lock_key, expiry, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    parent_id.map(|p| p as i64),
                    job_type.as_str(),
                    uid as i64,
                    lock_key,
                    expiry,
                    now,
                ],
            )
            .map_err(HfsError::from)
            .map_err(|e| map_lock_conflict(e, lock))?;
            let job_id = tx.last_insert_rowid() as u64;

            for target in targets {
                tx.execute(
                    "INSERT INTO actions (job_id, target) VALUES (?1, ?2)",
                    params![job_id as i64, target],
                )
                .map_err(HfsError::from)?;
            }
            Ok(job_id)
        })
    }

    /// `job_trigger`: records that the scheduler should look at this job,
    /// the eventfd-style nudge of §4.5.
    pub fn job_trigger(&self, job_id: u64, now: i64) -> Result<()> {
        let n = self.handle.execute_cached(
            "UPDATE jobs SET triggered_at = ?1 WHERE job_id = ?2",
            params![now, job_id as i64],
        )?;
        if n == 0 {
            return Err(enoent(format!("no such job {job_id}")));
        }
        Ok(())
    }

    /// Jobs triggered at or after `since`, for a scheduler to pick up.
    pub fn pending_triggers(&self, since: i64) -> Result<Vec<u64>> {
        self.handle.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT job_id FROM jobs WHERE triggered_at >= ?1 AND result IS NULL ORDER BY triggered_at")
                .map_err(HfsError::from)?;
            let rows = stmt
                .query_map(params![since], |r| r.get::<_, i64>(0))
                .map_err(HfsError::from)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(HfsError::from)? as u64);
            }
            Ok(out)
        })
    }

    pub fn set_action_phase(&self, action_id: u64, phase: &str) -> Result<()> {
        let n = self.handle.execute_cached(
            "UPDATE actions SET phase = ?1 WHERE action_id = ?2",
            params![phase, action_id as i64],
        )?;
        if n == 0 {
            return Err(enoent(format!("no such action {action_id}")));
        }
        Ok(())
    }

    pub fn fail_action(&self, action_id: u64, reason: &str) -> Result<()> {
        let n = self.handle.execute_cached(
            "UPDATE actions SET failed = 1, reason = ?1 WHERE action_id = ?2",
            params![reason, action_id as i64],
        )?;
        if n == 0 {
            return Err(enoent(format!("no such action {action_id}")));
        }
        Ok(())
    }

    /// Completes the job if every action has reached `DONE`, or if any
    /// action has permanently failed. Returns whether the job transitioned
    /// (false means it is still in flight).
    pub fn complete_job_if_ready(&self, job_id: u64) -> Result<bool> {
        self.handle.with_tx(|tx| {
            let already_done: Option<i64> = tx
                .query_row("SELECT result FROM jobs WHERE job_id = ?1", params![job_id as i64], |r| r.get(0))
                .map_err(|e| map_missing(e, "no such job"))?;
            if already_done.is_some() {
                return Ok(false);
            }
            let failure: Option<String> = tx
                .query_row(
                    "SELECT reason FROM actions WHERE job_id = ?1 AND failed = 1 LIMIT 1",
                    params![job_id as i64],
                    |r| r.get(0),
                )
                .unwrap_or(None);
            if let Some(reason) = failure {
                tx.execute(
                    "UPDATE jobs SET result = 1, reason = ?1 WHERE job_id = ?2",
                    params![reason, job_id as i64],
                )
                .map_err(HfsError::from)?;
                return Ok(true);
            }
            let outstanding: i64 = tx
                .query_row(
                    "SELECT COUNT(*) FROM actions WHERE job_id = ?1 AND phase != 'DONE'",
                    params![job_id as i64],
                    |r| r.get(0),
                )
                .map_err(HfsError::from)?;
            if outstanding == 0 {
                tx.execute("UPDATE jobs SET result = 0 WHERE job_id = ?1", params![job_id as i64])
                    .map_err(HfsError::from)?;
                return Ok(true);
            }
            Ok(false)
        })
    }

    /// `job_result(job, uid)`: a caller only ever polls jobs it owns.
    pub fn job_result(&self, job_id: u64, uid: u64) -> Result<(JobStatus, Option<String>)> {
        let row: Option<(i64, Option<i64>, Option<String>)> = self.handle.query_row_cached(
            "SELECT uid, result, reason FROM jobs WHERE job_id = ?1",
            params![job_id as i64],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )?;
        let (owner, result, reason) = row.ok_or_else(|| enoent(format!("no such job {job_id}")))?;
        if owner as u64 != uid {
            return Err(enoent(format!("no such job {job_id}")));
        }
        let status = match result {
            None => JobStatus::Pending,
            Some(0) => JobStatus::Ok,
            Some(_) => JobStatus::Error,
        };
        Ok((status, reason))
    }

    /// `job_lock`: a node-wide exclusive lock; fails if any non-distribution
    /// job is in-flight.
    pub fn job_lock(&self, uid: u64, now: i64) -> Result<()> {
        let _ = now;
        self.handle.with_tx(|tx| {
            let held: Option<i64> = tx
                .query_row("SELECT held_by FROM node_lock WHERE id = 1", [], |r| r.get(0))
                .unwrap_or(None);
            if held.is_some() {
                return Err(fail_locked("node is already globally locked"));
            }
            let in_flight: i64 = tx
                .query_row(
                    "SELECT COUNT(*) FROM jobs WHERE result IS NULL AND job_type != 'DISTRIBUTION'",
                    [],
                    |r| r.get(0),
                )
                .map_err(HfsError::from)?;
            if in_flight > 0 {
                return Err(fail_locked("jobs are still in flight"));
            }
            tx.execute(
                "INSERT INTO node_lock (id, held_by) VALUES (1, ?1)
                 ON CONFLICT(id) DO UPDATE SET held_by = excluded.held_by",
                params![uid as i64],
            )
            .map_err(HfsError::from)?;
            Ok(())
        })
    }

    pub fn job_unlock(&self) -> Result<()> {
        self.handle.execute_cached(
            "INSERT INTO node_lock (id, held_by) VALUES (1, NULL)
             ON CONFLICT(id) DO UPDATE SET held_by = NULL",
            [],
        )?;
        Ok(())
    }

    pub fn is_locked(&self) -> Result<bool> {
        let held: Option<i64> = self
            .handle
            .query_row_cached("SELECT held_by FROM node_lock WHERE id = 1", [], |r| r.get(0))?
            .flatten();
        Ok(held.is_some())
    }

    /// Count of jobs (root and child) with no `result` yet — the
    /// `jobs_pending` gauge's source.
    pub fn pending_job_count(&self) -> Result<i64> {
        let count: i64 = self
            .handle
            .query_row_cached("SELECT COUNT(*) FROM jobs WHERE result IS NULL", [], |r| r.get(0))?
            .unwrap_or(0);
        Ok(count)
    }
}

fn map_missing(e: rusqlite::Error, msg: &str) -> HfsError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => enoent(msg),
        other => HfsError::from(other),
    }
}

fn map_lock_conflict(e: HfsError, lock: Option<&str>) -> HfsError {
    if is_unique_violation(&e) {
        return hashfs_util::eexist(format!(
            "a job already holds lock {:?}",
            lock.unwrap_or("")
        ));
    }
    e
}

fn is_unique_violation(e: &HfsError) -> bool {
    e.reason.contains("UNIQUE constraint failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn new_job_inserts_actions_per_target() {
        let q = JobQueue::open_memory().unwrap();
        let job = q
            .new_job(None, JobType::CreateVolume, 1, Some("myvol"), &targets(&["node-a", "node-b"]), 60, 0)
            .unwrap();
        assert!(q.complete_job_if_ready(job).unwrap() == false);
        let (status, _) = q.job_result(job, 1).unwrap();
        assert_eq!(status, JobStatus::Pending);
    }

    #[test]
    fn concurrent_locking_job_on_same_key_is_rejected() {
        let q = JobQueue::open_memory().unwrap();
        q.new_job(None, JobType::CreateVolume, 1, Some("myvol"), &targets(&["n"]), 60, 0)
            .unwrap();
        let err = q
            .new_job(None, JobType::DeleteVolume, 1, Some("myvol"), &targets(&["n"]), 60, 0)
            .unwrap_err();
        assert_eq!(err.code, hashfs_util::Code::EExist);
    }

    #[test]
    fn lock_key_reusable_once_job_completes() {
        let q = JobQueue::open_memory().unwrap();
        let job = q
            .new_job(None, JobType::CreateVolume, 1, Some("myvol"), &targets(&["n"]), 60, 0)
            .unwrap();
        q.complete_job_if_ready(job).unwrap();
        q.new_job(None, JobType::CreateVolume, 1, Some("myvol"), &targets(&["n"]), 60, 0)
            .unwrap();
    }

    #[test]
    fn per_user_throttle_rejects_past_max_pending() {
        let q = JobQueue::open_memory().unwrap();
        for i in 0..MAX_PENDING_JOBS {
            q.new_job(None, JobType::FlushToken, 9, Some(&format!("t{i}")), &targets(&["n"]), 60, 0)
                .unwrap();
        }
        let err = q
            .new_job(None, JobType::FlushToken, 9, Some("overflow"), &targets(&["n"]), 60, 0)
            .unwrap_err();
        assert_eq!(err.code, hashfs_util::Code::FailETooMany);
    }

    #[test]
    fn child_job_inherits_expiry_from_parent() {
        let q = JobQueue::open_memory().unwrap();
        let parent = q.new_job(None, JobType::Distribution, 1, None, &targets(&["n"]), 100, 0).unwrap();
        let child = q
            .new_job(Some(parent), JobType::StartRebalance, 1, Some("r"), &targets(&["n"]), 50, 0)
            .unwrap();
        let _ = child;
    }

    #[test]
    fn completing_all_actions_marks_job_ok() {
        let q = JobQueue::open_memory().unwrap();
        let job = q.new_job(None, JobType::FlushFile, 1, None, &targets(&["n1", "n2"]), 60, 0).unwrap();
        q.set_action_phase(1, "DONE").unwrap();
        assert!(!q.complete_job_if_ready(job).unwrap());
        q.set_action_phase(2, "DONE").unwrap();
        assert!(q.complete_job_if_ready(job).unwrap());
        let (status, _) = q.job_result(job, 1).unwrap();
        assert_eq!(status, JobStatus::Ok);
    }

    #[test]
    fn a_failed_action_fails_the_whole_job() {
        let q = JobQueue::open_memory().unwrap();
        let job = q.new_job(None, JobType::FlushFile, 1, None, &targets(&["n1"]), 60, 0).unwrap();
        q.fail_action(1, "disk full").unwrap();
        assert!(q.complete_job_if_ready(job).unwrap());
        let (status, reason) = q.job_result(job, 1).unwrap();
        assert_eq!(status, JobStatus::Error);
        assert_eq!(reason.as_deref(), Some("disk full"));
    }

    #[test]
    fn job_lock_then_unlock_roundtrip() {
        let q = JobQueue::open_memory().unwrap();
        assert!(!q.is_locked().unwrap());
        q.job_lock(1, 0).unwrap();
        assert!(q.is_locked().unwrap());
        let err = q.new_job(None, JobType::CreateVolume, 1, Some("v"), &targets(&["n"]), 60, 0).unwrap_err();
        assert_eq!(err.code, hashfs_util::Code::FailLocked);
        q.job_unlock().unwrap();
        q.new_job(None, JobType::CreateVolume, 1, Some("v"), &targets(&["n"]), 60, 0).unwrap();
    }

    #[test]
    fn job_lock_rejects_when_jobs_in_flight() {
        let q = JobQueue::open_memory().unwrap();
        q.new_job(None, JobType::CreateVolume, 1, Some("v"), &targets(&["n"]), 60, 0).unwrap();
        let err = q.job_lock(1, 0).unwrap_err();
        assert_eq!(err.code, hashfs_util::Code::FailLocked);
    }

    #[test]
    fn distribution_job_is_exempt_from_global_lock() {
        let q = JobQueue::open_memory().unwrap();
        q.job_lock(1, 0).unwrap();
        q.new_job(None, JobType::Distribution, 1, None, &targets(&["n"]), 60, 0).unwrap();
    }

    #[test]
    fn pending_job_count_tracks_open_jobs() {
        let q = JobQueue::open_memory().unwrap();
        assert_eq!(q.pending_job_count().unwrap(), 0);
        let job = q.new_job(None, JobType::FlushFile, 1, None, &targets(&["n1", "n2"]), 60, 0).unwrap();
        let child = q
            .new_job(Some(job), JobType::ReplicateBlocks, 1, None, &targets(&["n3"]), 60, 0)
            .unwrap();
        assert_eq!(q.pending_job_count().unwrap(), 2);
        q.set_action_phase(1, "DONE").unwrap();
        q.set_action_phase(2, "DONE").unwrap();
        assert!(q.complete_job_if_ready(job).unwrap());
        assert_eq!(q.pending_job_count().unwrap(), 1);
        let _ = child;
    }

    #[test]
    fn job_result_hides_jobs_owned_by_another_user() {
        let q = JobQueue::open_memory().unwrap();
        let job = q.new_job(None, JobType::FlushFile, 1, None, &targets(&["n"]), 60, 0).unwrap();
        let err = q.job_result(job, 2).unwrap_err();
        assert_eq!(err.code, hashfs_util::Code::ENoEnt);
    }
}
