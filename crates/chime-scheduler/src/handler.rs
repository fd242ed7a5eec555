use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Result, SchedulerError};
use crate::types::{JobData, JobKey};

/// What a handler sees of the firing it is executing.
#[derive(Debug, Clone, Serialize)]
pub struct JobExecutionContext {
    pub key: JobKey,
    pub job_data: JobData,
    /// The fire time the schedule asked for.
    pub scheduled_fire_time: DateTime<Utc>,
    /// When the handler was actually invoked.
    pub fire_time: DateTime<Utc>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
    /// The node running this firing.
    pub instance_id: String,
}

/// Business logic invoked when a trigger fires.
///
/// An `Err` marks the trigger `error`; the engine does not retry.
/// Handlers may block for as long as they need: each runs on its own task,
/// bounded only by the configured handler timeout.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, ctx: &JobExecutionContext) -> anyhow::Result<()>;
}

/// Maps handler identifiers to implementations.
///
/// Jobs store only the identifier; it is resolved at create time (unknown
/// ids are rejected with `InvalidHandler`) and again at every firing.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `id`, replacing any previous registration.
    pub fn register(&mut self, id: impl Into<String>, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.handlers.insert(id.into(), handler);
        self
    }

    pub fn with(mut self, id: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.register(id, handler);
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(id).cloned()
    }

    /// Like [`get`](Self::get) but fails with `InvalidHandler`.
    pub fn resolve(&self, id: &str) -> Result<Arc<dyn JobHandler>> {
        self.get(id)
            .ok_or_else(|| SchedulerError::InvalidHandler(format!("no handler registered as '{id}'")))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.handlers.contains_key(id)
    }

    /// Registered identifiers, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handlers.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl JobHandler for Noop {
        async fn execute(&self, _ctx: &JobExecutionContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn resolve_unknown_handler_fails() {
        let registry = HandlerRegistry::new().with("noop", Arc::new(Noop));
        assert!(registry.contains("noop"));
        assert!(registry.resolve("noop").is_ok());

        let err = registry.resolve("DemoJob").err().unwrap();
        assert_eq!(err.code(), "INVALID_HANDLER");
    }

    #[test]
    fn ids_are_sorted() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("zeta", Arc::new(Noop))
            .register("alpha", Arc::new(Noop));
        assert_eq!(registry.ids(), vec!["alpha", "zeta"]);
    }
}
