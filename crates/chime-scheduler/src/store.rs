use std::sync::{Mutex, MutexGuard};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::{
    db::init_db,
    error::{Result, SchedulerError},
    types::{
        from_db_time, to_db_time, FiringOutcome, JobData, JobDefinition, JobKey, JobUpdate,
        LockRecord, ScheduledJob, TriggerClaim, TriggerDefinition, TriggerState,
    },
};

/// Durable storage for jobs, triggers and cluster locks.
///
/// Every mutating operation is atomic. Trigger transitions are
/// compare-and-swap: they return `Ok(false)` when the row is not in the
/// expected state so callers can detect lost races without an error path.
pub trait JobStore: Send + Sync {
    /// Insert a job and its trigger in one transaction.
    fn put_job(&self, job: &JobDefinition, trigger: &TriggerDefinition) -> Result<()>;

    /// Apply `update` to the job and/or trigger in one transaction.
    fn update_job(&self, key: &JobKey, update: &JobUpdate, now: DateTime<Utc>) -> Result<()>;

    /// Delete a job and its trigger in one transaction.
    fn delete_job(&self, key: &JobKey) -> Result<()>;

    fn get_job(&self, key: &JobKey) -> Result<Option<ScheduledJob>>;

    fn list_jobs(&self) -> Result<Vec<ScheduledJob>>;

    /// `waiting` triggers due at `as_of`, ordered by next fire time then (group, id).
    fn due_triggers(&self, as_of: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledJob>>;

    /// CAS `from → to`. `NotFound` when the key does not exist.
    fn transition_trigger_state(
        &self,
        key: &JobKey,
        from: TriggerState,
        to: TriggerState,
    ) -> Result<bool>;

    /// CAS `waiting → acquired`, guarded on the next fire time observed at selection.
    fn claim_trigger(
        &self,
        key: &JobKey,
        expected_next: DateTime<Utc>,
        claim: &TriggerClaim,
    ) -> Result<bool>;

    /// Move a `waiting` trigger's next fire time without firing it.
    fn advance_trigger(
        &self,
        key: &JobKey,
        expected_next: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    /// CAS `executing → waiting|error` for a firing owned by `instance_id`.
    /// `NotFound` when the job was deleted while it ran.
    fn complete_trigger(
        &self,
        key: &JobKey,
        instance_id: &str,
        outcome: &FiringOutcome,
    ) -> Result<bool>;

    /// CAS `paused → waiting` with a fresh next fire time.
    fn resume_trigger(&self, key: &JobKey, next: Option<DateTime<Utc>>) -> Result<bool>;

    /// Return every `error` trigger to `waiting`.
    fn reset_errored_triggers(&self) -> Result<usize>;

    /// Release claims held by instances whose liveness lock has expired.
    fn recover_orphaned_triggers(&self, now: DateTime<Utc>) -> Result<Vec<JobKey>>;

    /// Release every claim held by `instance_id`, live or not. Run once when
    /// an instance (re)joins, before it claims anything.
    fn recover_instance_triggers(&self, instance_id: &str) -> Result<Vec<JobKey>>;

    /// Return one `acquired`/`executing` trigger owned by `instance_id` to
    /// `waiting`, with the same recovery rules as orphan recovery.
    fn release_claim(&self, key: &JobKey, instance_id: &str) -> Result<bool>;

    /// Take `name` if it is free, expired, or already owned by `owner`.
    fn acquire_lock(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Extend a lock still held by `owner`.
    fn heartbeat_lock(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    fn release_lock(&self, name: &str, owner: &str) -> Result<bool>;

    fn get_lock(&self, name: &str) -> Result<Option<LockRecord>>;
}

/// [`JobStore`] backed by a SQLite database file.
///
/// Several processes opening the same file form a cluster: writes go
/// through `BEGIN IMMEDIATE` transactions or single statements, so SQLite's
/// database lock provides the isolation.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

const SELECT_SCHEDULED: &str = "
    SELECT j.job_group, j.job_id, j.handler, j.job_data, j.requests_recovery,
           j.created_at, j.updated_at,
           t.cron, t.state, t.next_fire_time, t.previous_fire_time, t.misfire_policy,
           t.instance_id, t.fired_at, t.last_error, t.updated_at
    FROM triggers t
    JOIN jobs j ON j.job_group = t.job_group AND j.job_id = t.job_id";

impl SqliteJobStore {
    /// Wrap an open connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open (or create) the shared database file used by the cluster.
    pub fn open(path: &str, busy_timeout: StdDuration) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        info!(%path, "job store opened");
        Self::new(conn)
    }

    /// Private in-memory database, for single-node use and tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::new(conn)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SchedulerError::Unavailable("job store connection poisoned".to_string()))
    }
}

fn trigger_exists(conn: &Connection, key: &JobKey) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM triggers WHERE job_group = ?1 AND job_id = ?2",
            params![key.group, key.id],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn not_found(key: &JobKey) -> SchedulerError {
    SchedulerError::NotFound {
        key: key.to_string(),
    }
}

fn opt_time(t: Option<DateTime<Utc>>) -> Option<String> {
    t.map(to_db_time)
}

fn encode_job_data(data: &JobData) -> Result<String> {
    serde_json::to_string(data).map_err(|e| SchedulerError::Corrupt(e.to_string()))
}

/// Return claimed triggers to `waiting`. With recovery requested the lost
/// firing becomes due again.
fn release_claims(
    tx: &rusqlite::Transaction<'_>,
    claims: Vec<(String, String, bool)>,
) -> Result<Vec<JobKey>> {
    let now = to_db_time(Utc::now());
    let mut released = Vec::with_capacity(claims.len());
    for (group, id, requests_recovery) in claims {
        let sql = if requests_recovery {
            "UPDATE triggers
             SET state = 'waiting', next_fire_time = COALESCE(fired_at, next_fire_time),
                 instance_id = NULL, fired_at = NULL, updated_at = ?1
             WHERE job_group = ?2 AND job_id = ?3"
        } else {
            "UPDATE triggers
             SET state = 'waiting', instance_id = NULL, fired_at = NULL, updated_at = ?1
             WHERE job_group = ?2 AND job_id = ?3"
        };
        tx.execute(sql, params![now, group, id])?;
        released.push(JobKey::new(group, id));
    }
    Ok(released)
}

impl JobStore for SqliteJobStore {
    fn put_job(&self, job: &JobDefinition, trigger: &TriggerDefinition) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists = tx
            .query_row(
                "SELECT 1 FROM jobs WHERE job_group = ?1 AND job_id = ?2",
                params![job.key.group, job.key.id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            return Err(SchedulerError::AlreadyExists {
                key: job.key.to_string(),
            });
        }

        tx.execute(
            "INSERT INTO jobs
             (job_group, job_id, handler, job_data, requests_recovery, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                job.key.group,
                job.key.id,
                job.handler,
                encode_job_data(&job.job_data)?,
                job.requests_recovery,
                to_db_time(job.created_at),
                to_db_time(job.updated_at),
            ],
        )?;
        tx.execute(
            "INSERT INTO triggers
             (job_group, job_id, cron, state, next_fire_time, previous_fire_time,
              misfire_policy, instance_id, fired_at, last_error, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                trigger.key.group,
                trigger.key.id,
                trigger.cron,
                trigger.state.as_str(),
                opt_time(trigger.next_fire_time),
                opt_time(trigger.previous_fire_time),
                trigger.misfire_policy.as_str(),
                trigger.instance_id,
                opt_time(trigger.fired_at),
                trigger.last_error,
                to_db_time(trigger.updated_at),
            ],
        )?;
        tx.commit()?;
        debug!(job = %job.key, "job and trigger stored");
        Ok(())
    }

    fn update_job(&self, key: &JobKey, update: &JobUpdate, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now_str = to_db_time(now);

        let n = match &update.job_data {
            Some(data) => tx.execute(
                "UPDATE jobs SET job_data = ?1, updated_at = ?2
                 WHERE job_group = ?3 AND job_id = ?4",
                params![encode_job_data(data)?, now_str, key.group, key.id],
            )?,
            None => tx.execute(
                "UPDATE jobs SET updated_at = ?1 WHERE job_group = ?2 AND job_id = ?3",
                params![now_str, key.group, key.id],
            )?,
        };
        if n == 0 {
            return Err(not_found(key));
        }

        // The state column is left alone: an in-flight firing completes
        // normally and the new next_fire_time is picked up afterwards.
        if let Some((cron, next)) = &update.schedule {
            tx.execute(
                "UPDATE triggers SET cron = ?1, next_fire_time = ?2, updated_at = ?3
                 WHERE job_group = ?4 AND job_id = ?5",
                params![cron, opt_time(*next), now_str, key.group, key.id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn delete_job(&self, key: &JobKey) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM triggers WHERE job_group = ?1 AND job_id = ?2",
            params![key.group, key.id],
        )?;
        let n = tx.execute(
            "DELETE FROM jobs WHERE job_group = ?1 AND job_id = ?2",
            params![key.group, key.id],
        )?;
        if n == 0 {
            // dropping `tx` rolls back
            return Err(not_found(key));
        }
        tx.commit()?;
        Ok(())
    }

    fn get_job(&self, key: &JobKey) -> Result<Option<ScheduledJob>> {
        let conn = self.conn()?;
        let sql = format!("{SELECT_SCHEDULED} WHERE t.job_group = ?1 AND t.job_id = ?2");
        let raw = conn
            .query_row(&sql, params![key.group, key.id], RawScheduled::from_row)
            .optional()?;
        raw.map(RawScheduled::decode).transpose()
    }

    fn list_jobs(&self) -> Result<Vec<ScheduledJob>> {
        let conn = self.conn()?;
        let sql = format!("{SELECT_SCHEDULED} ORDER BY t.job_group, t.job_id");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], RawScheduled::from_row)?;
        let jobs = collect_decoded(rows)?;
        Ok(jobs)
    }

    fn due_triggers(&self, as_of: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledJob>> {
        let conn = self.conn()?;
        // Single statement over the join: a trigger is never returned without its job.
        let sql = format!(
            "{SELECT_SCHEDULED}
             WHERE t.state = 'waiting'
               AND t.next_fire_time IS NOT NULL
               AND t.next_fire_time <= ?1
             ORDER BY t.next_fire_time, t.job_group, t.job_id
             LIMIT ?2"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(
            params![to_db_time(as_of), limit as i64],
            RawScheduled::from_row,
        )?;
        let due = collect_decoded(rows)?;
        Ok(due)
    }

    fn transition_trigger_state(
        &self,
        key: &JobKey,
        from: TriggerState,
        to: TriggerState,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE triggers SET state = ?1, updated_at = ?2
             WHERE job_group = ?3 AND job_id = ?4 AND state = ?5",
            params![
                to.as_str(),
                to_db_time(Utc::now()),
                key.group,
                key.id,
                from.as_str()
            ],
        )?;
        if n == 1 {
            return Ok(true);
        }
        if !trigger_exists(&conn, key)? {
            return Err(not_found(key));
        }
        Ok(false)
    }

    fn claim_trigger(
        &self,
        key: &JobKey,
        expected_next: DateTime<Utc>,
        claim: &TriggerClaim,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE triggers
             SET state = 'acquired', next_fire_time = ?1, instance_id = ?2,
                 fired_at = ?3, updated_at = ?4
             WHERE job_group = ?5 AND job_id = ?6
               AND state = 'waiting' AND next_fire_time = ?7",
            params![
                opt_time(claim.next_fire_time),
                claim.instance_id,
                to_db_time(claim.scheduled_fire_time),
                to_db_time(Utc::now()),
                key.group,
                key.id,
                to_db_time(expected_next),
            ],
        )?;
        Ok(n == 1)
    }

    fn advance_trigger(
        &self,
        key: &JobKey,
        expected_next: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE triggers SET next_fire_time = ?1, updated_at = ?2
             WHERE job_group = ?3 AND job_id = ?4
               AND state = 'waiting' AND next_fire_time = ?5",
            params![
                opt_time(next),
                to_db_time(Utc::now()),
                key.group,
                key.id,
                to_db_time(expected_next),
            ],
        )?;
        Ok(n == 1)
    }

    fn complete_trigger(
        &self,
        key: &JobKey,
        instance_id: &str,
        outcome: &FiringOutcome,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let (state, last_error) = match outcome {
            FiringOutcome::Succeeded => (TriggerState::Waiting, None),
            FiringOutcome::Failed(reason) => (TriggerState::Error, Some(reason.as_str())),
        };
        let n = conn.execute(
            "UPDATE triggers
             SET state = ?1, last_error = ?2, previous_fire_time = fired_at,
                 instance_id = NULL, fired_at = NULL, updated_at = ?3
             WHERE job_group = ?4 AND job_id = ?5
               AND state = 'executing' AND instance_id = ?6",
            params![
                state.as_str(),
                last_error,
                to_db_time(Utc::now()),
                key.group,
                key.id,
                instance_id,
            ],
        )?;
        if n == 1 {
            return Ok(true);
        }
        if !trigger_exists(&conn, key)? {
            return Err(not_found(key));
        }
        Ok(false)
    }

    fn resume_trigger(&self, key: &JobKey, next: Option<DateTime<Utc>>) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE triggers SET state = 'waiting', next_fire_time = ?1, updated_at = ?2
             WHERE job_group = ?3 AND job_id = ?4 AND state = 'paused'",
            params![opt_time(next), to_db_time(Utc::now()), key.group, key.id],
        )?;
        if n == 1 {
            return Ok(true);
        }
        if !trigger_exists(&conn, key)? {
            return Err(not_found(key));
        }
        Ok(false)
    }

    fn reset_errored_triggers(&self) -> Result<usize> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE triggers SET state = 'waiting', updated_at = ?1 WHERE state = 'error'",
            params![to_db_time(Utc::now())],
        )?;
        Ok(n)
    }

    fn recover_orphaned_triggers(&self, now: DateTime<Utc>) -> Result<Vec<JobKey>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let orphans: Vec<(String, String, bool)> = {
            let mut stmt = tx.prepare(
                "SELECT t.job_group, t.job_id, j.requests_recovery
                 FROM triggers t
                 JOIN jobs j ON j.job_group = t.job_group AND j.job_id = t.job_id
                 WHERE t.state IN ('acquired', 'executing')
                   AND NOT EXISTS (
                       SELECT 1 FROM locks l
                       WHERE l.name = 'instance:' || t.instance_id AND l.expires_at > ?1
                   )",
            )?;
            let rows = stmt.query_map(params![to_db_time(now)], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            let orphans = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            orphans
        };

        let recovered = release_claims(&tx, orphans)?;
        tx.commit()?;
        for key in &recovered {
            warn!(job = %key, "recovered trigger orphaned by a dead instance");
        }
        Ok(recovered)
    }

    fn recover_instance_triggers(&self, instance_id: &str) -> Result<Vec<JobKey>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let stale: Vec<(String, String, bool)> = {
            let mut stmt = tx.prepare(
                "SELECT t.job_group, t.job_id, j.requests_recovery
                 FROM triggers t
                 JOIN jobs j ON j.job_group = t.job_group AND j.job_id = t.job_id
                 WHERE t.state IN ('acquired', 'executing') AND t.instance_id = ?1",
            )?;
            let rows = stmt.query_map(params![instance_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            let stale = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            stale
        };

        let recovered = release_claims(&tx, stale)?;
        tx.commit()?;
        for key in &recovered {
            warn!(job = %key, instance = instance_id, "recovered trigger left over from an earlier run");
        }
        Ok(recovered)
    }

    fn release_claim(&self, key: &JobKey, instance_id: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let requests_recovery: Option<bool> = tx
            .query_row(
                "SELECT j.requests_recovery
                 FROM triggers t
                 JOIN jobs j ON j.job_group = t.job_group AND j.job_id = t.job_id
                 WHERE t.job_group = ?1 AND t.job_id = ?2
                   AND t.state IN ('acquired', 'executing') AND t.instance_id = ?3",
                params![key.group, key.id, instance_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(requests_recovery) = requests_recovery else {
            let exists = trigger_exists(&tx, key)?;
            drop(tx);
            return if exists { Ok(false) } else { Err(not_found(key)) };
        };
        release_claims(&tx, vec![(key.group.clone(), key.id.clone(), requests_recovery)])?;
        tx.commit()?;
        Ok(true)
    }

    fn acquire_lock(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        // One upsert statement: SQLite serialises it against every other
        // writer on the file, so two nodes cannot both see the lock as free.
        let n = conn.execute(
            "INSERT INTO locks (name, owner, acquired_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
                 acquired_at = CASE
                     WHEN locks.owner = excluded.owner AND locks.expires_at > excluded.acquired_at
                     THEN locks.acquired_at
                     ELSE excluded.acquired_at
                 END,
                 owner = excluded.owner,
                 expires_at = excluded.expires_at
             WHERE locks.owner = excluded.owner OR locks.expires_at <= excluded.acquired_at",
            params![name, owner, to_db_time(now), to_db_time(now + ttl)],
        )?;
        Ok(n == 1)
    }

    fn heartbeat_lock(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let now_str = to_db_time(now);
        let n = conn.execute(
            "UPDATE locks SET expires_at = ?1
             WHERE name = ?2 AND owner = ?3 AND expires_at > ?4",
            params![to_db_time(now + ttl), name, owner, now_str],
        )?;
        Ok(n == 1)
    }

    fn release_lock(&self, name: &str, owner: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM locks WHERE name = ?1 AND owner = ?2",
            params![name, owner],
        )?;
        Ok(n == 1)
    }

    fn get_lock(&self, name: &str) -> Result<Option<LockRecord>> {
        let conn = self.conn()?;
        let raw: Option<(String, String, String, String)> = conn
            .query_row(
                "SELECT name, owner, acquired_at, expires_at FROM locks WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        raw.map(|(name, owner, acquired_at, expires_at)| {
            Ok(LockRecord {
                acquired_at: parse_time(&acquired_at, "acquired_at")?,
                expires_at: parse_time(&expires_at, "expires_at")?,
                name,
                owner,
            })
        })
        .transpose()
    }
}

/// Columns of `SELECT_SCHEDULED`, still in their stored representation.
struct RawScheduled {
    group: String,
    id: String,
    handler: String,
    job_data: String,
    requests_recovery: bool,
    job_created_at: String,
    job_updated_at: String,
    cron: String,
    state: String,
    next_fire_time: Option<String>,
    previous_fire_time: Option<String>,
    misfire_policy: String,
    instance_id: Option<String>,
    fired_at: Option<String>,
    last_error: Option<String>,
    trigger_updated_at: String,
}

impl RawScheduled {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            group: row.get(0)?,
            id: row.get(1)?,
            handler: row.get(2)?,
            job_data: row.get(3)?,
            requests_recovery: row.get(4)?,
            job_created_at: row.get(5)?,
            job_updated_at: row.get(6)?,
            cron: row.get(7)?,
            state: row.get(8)?,
            next_fire_time: row.get(9)?,
            previous_fire_time: row.get(10)?,
            misfire_policy: row.get(11)?,
            instance_id: row.get(12)?,
            fired_at: row.get(13)?,
            last_error: row.get(14)?,
            trigger_updated_at: row.get(15)?,
        })
    }

    fn decode(self) -> Result<ScheduledJob> {
        let key = JobKey::new(self.group, self.id);
        let corrupt = |what: &str, detail: String| {
            SchedulerError::Corrupt(format!("{key}: bad {what}: {detail}"))
        };

        let job_data: JobData = serde_json::from_str(&self.job_data)
            .map_err(|e| corrupt("job_data", e.to_string()))?;
        let state: TriggerState = self.state.parse().map_err(|e| corrupt("state", e))?;
        let misfire_policy = self
            .misfire_policy
            .parse()
            .map_err(|e| corrupt("misfire_policy", e))?;

        Ok(ScheduledJob {
            job: JobDefinition {
                key: key.clone(),
                handler: self.handler,
                job_data,
                requests_recovery: self.requests_recovery,
                created_at: parse_time(&self.job_created_at, "created_at")?,
                updated_at: parse_time(&self.job_updated_at, "updated_at")?,
            },
            trigger: TriggerDefinition {
                key,
                cron: self.cron,
                state,
                next_fire_time: parse_opt_time(self.next_fire_time, "next_fire_time")?,
                previous_fire_time: parse_opt_time(self.previous_fire_time, "previous_fire_time")?,
                misfire_policy,
                instance_id: self.instance_id,
                fired_at: parse_opt_time(self.fired_at, "fired_at")?,
                last_error: self.last_error,
                updated_at: parse_time(&self.trigger_updated_at, "updated_at")?,
            },
        })
    }
}

fn parse_time(s: &str, column: &str) -> Result<DateTime<Utc>> {
    from_db_time(s).ok_or_else(|| SchedulerError::Corrupt(format!("bad {column} timestamp '{s}'")))
}

fn parse_opt_time(s: Option<String>, column: &str) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(|s| parse_time(s, column)).transpose()
}

/// Decode rows, skipping (and logging) any that cannot be decoded so a
/// single bad record does not stall the whole schedule.
fn collect_decoded(
    rows: impl Iterator<Item = rusqlite::Result<RawScheduled>>,
) -> Result<Vec<ScheduledJob>> {
    let mut out = Vec::new();
    for row in rows {
        match row?.decode() {
            Ok(job) => out.push(job),
            Err(e) => warn!("skipping undecodable trigger row: {e}"),
        }
    }
    Ok(out)
}
