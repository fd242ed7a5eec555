//! Handlers compiled into the node binary.

use std::sync::Arc;

use async_trait::async_trait;
use chime_core::config::DEFAULT_HANDLER;
use chime_scheduler::{HandlerRegistry, JobExecutionContext, JobHandler};
use tracing::info;

/// Logs every firing together with its job data.
pub struct LogJob;

#[async_trait]
impl JobHandler for LogJob {
    async fn execute(&self, ctx: &JobExecutionContext) -> anyhow::Result<()> {
        let data = serde_json::to_string(&ctx.job_data)?;
        info!(
            job = %ctx.key,
            instance = %ctx.instance_id,
            scheduled = %ctx.scheduled_fire_time,
            next = ?ctx.next_fire_time,
            %data,
            "job fired"
        );
        Ok(())
    }
}

pub fn builtin_handlers() -> HandlerRegistry {
    HandlerRegistry::new().with(DEFAULT_HANDLER, Arc::new(LogJob))
}
