//! `chime-scheduler` — clustered cron scheduler over a shared SQLite store.
//!
//! # Overview
//!
//! Every node runs a [`engine::SchedulerEngine`] against the same database.
//! Once per poll interval the node holding the `dispatch` lock selects due
//! triggers, claims each with a compare-and-swap and hands it to a bounded
//! worker pool that runs the registered [`handler::JobHandler`].
//!
//! # Trigger states
//!
//! | State       | Meaning                                              |
//! |-------------|------------------------------------------------------|
//! | `waiting`   | Due at `next_fire_time`                              |
//! | `acquired`  | Claimed by a node, handler not started               |
//! | `executing` | Handler running                                      |
//! | `error`     | Last run failed; back to `waiting` next cycle        |
//! | `paused`    | Skipped until resumed                                |
//!
//! Jobs are created, changed and removed at runtime through
//! [`registry::JobRegistry`]; no node needs a restart.

pub mod coordinator;
pub mod db;
pub mod engine;
pub mod error;
pub mod handler;
pub mod registry;
pub mod schedule;
pub mod store;
pub mod types;

pub use coordinator::{ClusterCoordinator, CoordinatorHealth, LockCoordinator};
pub use engine::{CycleReport, SchedulerEngine};
pub use error::{Result, SchedulerError};
pub use handler::{HandlerRegistry, JobExecutionContext, JobHandler};
pub use registry::{JobRegistry, JobRequest, KeyRequest, UpdateRequest};
pub use schedule::{next_fire_time, CronSchedule};
pub use store::{JobStore, SqliteJobStore};
pub use types::{
    JobData, JobDefinition, JobKey, MisfirePolicy, ScheduledJob, TriggerDefinition, TriggerState,
};
