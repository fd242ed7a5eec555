use std::sync::Arc;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    error::{Result, SchedulerError},
    handler::HandlerRegistry,
    schedule::CronSchedule,
    store::JobStore,
    types::{
        JobData, JobDefinition, JobKey, JobUpdate, MisfirePolicy, ScheduledJob, TriggerDefinition,
        TriggerState,
    },
};

/// Body of a create request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub id: String,
    pub group: String,
    pub cron: String,
    #[serde(default)]
    pub job_data: JobData,
    /// Falls back to the configured default handler.
    #[serde(default)]
    pub handler: Option<String>,
    #[serde(default)]
    pub misfire_policy: Option<MisfirePolicy>,
    #[serde(default)]
    pub requests_recovery: bool,
}

impl JobRequest {
    pub fn key(&self) -> JobKey {
        JobKey::new(&self.group, &self.id)
    }
}

/// Body of an update request. Absent fields are left unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    pub id: String,
    pub group: String,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub job_data: Option<JobData>,
}

/// Body of delete, pause and resume requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRequest {
    pub id: String,
    pub group: String,
}

impl KeyRequest {
    pub fn key(&self) -> JobKey {
        JobKey::new(&self.group, &self.id)
    }
}

/// Runtime job management: the only writer of job and trigger definitions.
///
/// Every request is validated before anything is written, and each write is
/// a single store transaction, so a running dispatch loop never observes a
/// half-applied change.
pub struct JobRegistry {
    store: Arc<dyn JobStore>,
    handlers: Arc<HandlerRegistry>,
    default_handler: String,
    clock: fn() -> DateTime<Utc>,
}

impl JobRegistry {
    pub fn new(
        store: Arc<dyn JobStore>,
        handlers: Arc<HandlerRegistry>,
        default_handler: impl Into<String>,
    ) -> Self {
        Self {
            store,
            handlers,
            default_handler: default_handler.into(),
            clock: Utc::now,
        }
    }

    /// Replace the wall clock, for tests.
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    fn now(&self) -> DateTime<Utc> {
        let now = (self.clock)();
        now.duration_trunc(TimeDelta::milliseconds(1)).unwrap_or(now)
    }

    pub fn create_job(&self, request: JobRequest) -> Result<ScheduledJob> {
        let key = validate_key(&request.group, &request.id)?;
        let handler = request
            .handler
            .clone()
            .unwrap_or_else(|| self.default_handler.clone());
        if !self.handlers.contains(&handler) {
            return Err(SchedulerError::InvalidHandler(format!(
                "no handler registered as '{handler}'"
            )));
        }

        let now = self.now();
        let next = first_fire_time(&request.cron, now)?;

        let job = JobDefinition {
            key: key.clone(),
            handler,
            job_data: request.job_data,
            requests_recovery: request.requests_recovery,
            created_at: now,
            updated_at: now,
        };
        let trigger = TriggerDefinition {
            key: key.clone(),
            cron: request.cron.trim().to_string(),
            state: TriggerState::Waiting,
            next_fire_time: Some(next),
            previous_fire_time: None,
            misfire_policy: request.misfire_policy.unwrap_or_default(),
            instance_id: None,
            fired_at: None,
            last_error: None,
            updated_at: now,
        };
        self.store.put_job(&job, &trigger)?;
        info!(job = %key, cron = %trigger.cron, %next, "job created");
        Ok(ScheduledJob { job, trigger })
    }

    /// Replace the schedule and/or job data of an existing job.
    ///
    /// Allowed while the trigger is executing: the new expression and next
    /// fire time are persisted now, and the in-flight run only moves the state.
    pub fn update_job(
        &self,
        key: &JobKey,
        cron: Option<&str>,
        job_data: Option<JobData>,
    ) -> Result<ScheduledJob> {
        validate_key(&key.group, &key.id)?;
        let now = self.now();
        let schedule = match cron {
            Some(expr) => Some((expr.trim().to_string(), Some(first_fire_time(expr, now)?))),
            None => None,
        };
        let update = JobUpdate { schedule, job_data };
        self.store.update_job(key, &update, now)?;
        info!(job = %key, "job updated");
        self.get_job(key)
    }

    pub fn delete_job(&self, key: &JobKey) -> Result<()> {
        self.store.delete_job(key)?;
        info!(job = %key, "job deleted");
        Ok(())
    }

    /// Exclude a job from scheduling. Allowed from `waiting` or `error`.
    pub fn pause_job(&self, key: &JobKey) -> Result<ScheduledJob> {
        let current = self.get_job(key)?;
        match current.trigger.state {
            TriggerState::Paused => return Ok(current),
            TriggerState::Waiting | TriggerState::Error => {}
            other => {
                return Err(SchedulerError::Conflict {
                    key: key.to_string(),
                    reason: format!("cannot pause a trigger that is {other}"),
                })
            }
        }
        let paused = self
            .store
            .transition_trigger_state(key, current.trigger.state, TriggerState::Paused)?;
        if !paused {
            return Err(SchedulerError::Conflict {
                key: key.to_string(),
                reason: "trigger state changed concurrently".to_string(),
            });
        }
        info!(job = %key, "job paused");
        self.get_job(key)
    }

    /// Return a paused job to scheduling with a next fire time computed from now.
    /// Resuming a job that is not paused changes nothing.
    pub fn resume_job(&self, key: &JobKey) -> Result<ScheduledJob> {
        let current = self.get_job(key)?;
        let now = self.now();
        let next = CronSchedule::parse(&current.trigger.cron)?.next_after(now);
        if self.store.resume_trigger(key, next)? {
            info!(job = %key, next = ?next, "job resumed");
        } else {
            debug!(job = %key, state = %current.trigger.state, "resume ignored; job not paused");
        }
        self.get_job(key)
    }

    pub fn get_job(&self, key: &JobKey) -> Result<ScheduledJob> {
        self.store
            .get_job(key)?
            .ok_or_else(|| SchedulerError::NotFound {
                key: key.to_string(),
            })
    }

    pub fn list_jobs(&self) -> Result<Vec<ScheduledJob>> {
        self.store.list_jobs()
    }
}

fn validate_key(group: &str, id: &str) -> Result<JobKey> {
    if group.trim().is_empty() {
        return Err(SchedulerError::InvalidRequest("group must not be empty".to_string()));
    }
    if id.trim().is_empty() {
        return Err(SchedulerError::InvalidRequest("id must not be empty".to_string()));
    }
    Ok(JobKey::new(group, id))
}

/// Parse `expr` and require at least one future occurrence.
fn first_fire_time(expr: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    CronSchedule::parse(expr)?
        .next_after(now)
        .ok_or_else(|| SchedulerError::InvalidSchedule(format!("'{}' never fires after {now}", expr.trim())))
}
