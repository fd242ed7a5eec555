use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Name of the cluster-wide lock gating trigger selection.
pub const DISPATCH_LOCK: &str = "dispatch";

/// Lock record a node renews every tick to show it is alive.
pub fn instance_lock_name(instance_id: &str) -> String {
    format!("instance:{instance_id}")
}

/// Opaque string mapping passed verbatim to the job handler.
pub type JobData = BTreeMap<String, String>;

/// Composite identity shared by a job and its trigger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub group: String,
    pub id: String,
}

impl JobKey {
    pub fn new(group: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.id)
    }
}

/// Lifecycle state of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    /// Waiting for its next fire time.
    Waiting,
    /// Claimed by a node; the firing has not started yet.
    Acquired,
    /// The handler is running.
    Executing,
    /// Excluded from scheduling until resumed.
    Paused,
    /// The last run failed; reset to `Waiting` on the next dispatch cycle.
    Error,
    /// The trigger was removed.
    Deleted,
}

impl TriggerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerState::Waiting => "waiting",
            TriggerState::Acquired => "acquired",
            TriggerState::Executing => "executing",
            TriggerState::Paused => "paused",
            TriggerState::Error => "error",
            TriggerState::Deleted => "deleted",
        }
    }
}

impl fmt::Display for TriggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TriggerState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(TriggerState::Waiting),
            "acquired" => Ok(TriggerState::Acquired),
            "executing" => Ok(TriggerState::Executing),
            "paused" => Ok(TriggerState::Paused),
            "error" => Ok(TriggerState::Error),
            "deleted" => Ok(TriggerState::Deleted),
            other => Err(format!("unknown trigger state: {other}")),
        }
    }
}

/// What to do with a trigger whose fire time passed while no node could dispatch it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfirePolicy {
    /// Fire once immediately, then resume the regular cadence.
    #[default]
    FireNow,
    /// Skip the missed firing and wait for the next regular occurrence.
    DoNothing,
}

impl MisfirePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MisfirePolicy::FireNow => "fire_now",
            MisfirePolicy::DoNothing => "do_nothing",
        }
    }
}

impl std::str::FromStr for MisfirePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "fire_now" => Ok(MisfirePolicy::FireNow),
            "do_nothing" => Ok(MisfirePolicy::DoNothing),
            other => Err(format!("unknown misfire policy: {other}")),
        }
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub key: JobKey,
    /// Identifier resolved against the [`crate::handler::HandlerRegistry`].
    pub handler: String,
    pub job_data: JobData,
    /// Refire an in-flight firing that was lost when its node crashed.
    pub requests_recovery: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persisted trigger record, 1:1 with its job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDefinition {
    pub key: JobKey,
    pub cron: String,
    pub state: TriggerState,
    /// `None` when the schedule has no future occurrence.
    pub next_fire_time: Option<DateTime<Utc>>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub misfire_policy: MisfirePolicy,
    /// Node that claimed the trigger, while `acquired` or `executing`.
    pub instance_id: Option<String>,
    /// Scheduled fire time of the in-flight firing.
    pub fired_at: Option<DateTime<Utc>>,
    /// Message of the most recent handler failure.
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// A job together with its trigger, as returned by listing and polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub job: JobDefinition,
    pub trigger: TriggerDefinition,
}

/// One row of the `locks` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub name: String,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Partial update applied by `update_job`; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    /// New cron expression and the next fire time computed from it.
    pub schedule: Option<(String, Option<DateTime<Utc>>)>,
    pub job_data: Option<JobData>,
}

/// Values written by a successful `waiting → acquired` claim.
#[derive(Debug, Clone)]
pub struct TriggerClaim {
    pub instance_id: String,
    /// The fire time this claim is for.
    pub scheduled_fire_time: DateTime<Utc>,
    /// Next fire time, recomputed at claim time.
    pub next_fire_time: Option<DateTime<Utc>>,
}

/// Result of a finished firing, as persisted by `complete_trigger`.
#[derive(Debug, Clone, PartialEq)]
pub enum FiringOutcome {
    Succeeded,
    Failed(String),
}

/// Fixed-width UTC timestamp so that lexical order equals time order in SQLite.
pub(crate) fn to_db_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn from_db_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
