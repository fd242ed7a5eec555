use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chime_core::config::SchedulerConfig;
use chrono::{DateTime, Utc};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    coordinator::{ClusterCoordinator, CoordinatorHealth},
    error::{Result, SchedulerError},
    handler::{HandlerRegistry, JobExecutionContext},
    schedule::CronSchedule,
    store::JobStore,
    types::{
        FiringOutcome, JobDefinition, JobKey, MisfirePolicy, ScheduledJob, TriggerClaim,
        TriggerState,
    },
};

/// Attempts made to persist a firing's state before deferring it to the next cycle.
const STORE_ATTEMPTS: u32 = 3;
const STORE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// What one dispatch cycle did.
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Whether this node held the dispatch lock for the cycle.
    pub dispatched: bool,
    /// Triggers moved to `acquired` and handed to a worker.
    pub claimed: Vec<JobKey>,
    /// Misfired `do_nothing` triggers advanced without firing.
    pub skipped_misfires: Vec<JobKey>,
    /// Orphaned claims released at the start of the cycle.
    pub recovered: Vec<JobKey>,
    /// Worker tasks spawned for the claimed triggers.
    pub firings: Vec<JoinHandle<()>>,
}

impl CycleReport {
    /// Wait until every firing spawned by this cycle has finished.
    pub async fn join(self) {
        for firing in self.firings {
            if let Err(e) = firing.await {
                error!("firing task failed: {e}");
            }
        }
    }
}

/// A claimed trigger on its way to a worker. Dropped once the outcome is stored.
struct FiringContext {
    job: JobDefinition,
    scheduled_fire_time: DateTime<Utc>,
    previous_fire_time: Option<DateTime<Utc>>,
    next_fire_time: Option<DateTime<Utc>>,
    instance_id: String,
    store: Arc<dyn JobStore>,
}

impl FiringContext {
    fn key(&self) -> &JobKey {
        &self.job.key
    }

    /// `acquired → executing`.
    fn begin(&self) -> Result<bool> {
        self.store
            .transition_trigger_state(self.key(), TriggerState::Acquired, TriggerState::Executing)
    }

    /// `executing → waiting|error`.
    fn complete(&self, outcome: &FiringOutcome) -> Result<bool> {
        self.store
            .complete_trigger(self.key(), &self.instance_id, outcome)
    }

    fn execution_context(&self) -> JobExecutionContext {
        JobExecutionContext {
            key: self.job.key.clone(),
            job_data: self.job.job_data.clone(),
            scheduled_fire_time: self.scheduled_fire_time,
            fire_time: Utc::now(),
            previous_fire_time: self.previous_fire_time,
            next_fire_time: self.next_fire_time,
            instance_id: self.instance_id.clone(),
        }
    }
}

/// A firing whose last store write failed. Retried at the start of every cycle.
enum Unsettled {
    /// `acquired → executing` never landed, so the handler did not run.
    Claim { key: JobKey, instance_id: String },
    /// The handler ran but its outcome was not recorded.
    Outcome {
        key: JobKey,
        instance_id: String,
        outcome: FiringOutcome,
    },
}

impl Unsettled {
    fn key(&self) -> &JobKey {
        match self {
            Unsettled::Claim { key, .. } | Unsettled::Outcome { key, .. } => key,
        }
    }
}

struct EngineInner {
    config: SchedulerConfig,
    store: Arc<dyn JobStore>,
    coordinator: Arc<dyn ClusterCoordinator>,
    handlers: Arc<HandlerRegistry>,
    workers: Arc<Semaphore>,
    /// Set once claims left over from an earlier run of this instance id are released.
    own_claims_recovered: AtomicBool,
    unsettled: Mutex<Vec<Unsettled>>,
}

struct RunningLoop {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Polls the store for due triggers and runs their handlers.
///
/// Every node of a cluster runs one engine against the same store. Only the
/// node holding the dispatch lock selects and claims triggers in a given
/// cycle; the per-trigger compare-and-swap in the store keeps a firing
/// unique even if two nodes both believe they hold the lock.
pub struct SchedulerEngine {
    inner: Arc<EngineInner>,
    lifecycle: Mutex<Option<RunningLoop>>,
}

impl SchedulerEngine {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        coordinator: Arc<dyn ClusterCoordinator>,
        handlers: Arc<HandlerRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        let workers = Arc::new(Semaphore::new(config.worker_pool_size));
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                coordinator,
                handlers,
                workers,
                own_claims_recovered: AtomicBool::new(false),
                unsettled: Mutex::new(Vec::new()),
            }),
            lifecycle: Mutex::new(None),
        })
    }

    pub fn instance_id(&self) -> &str {
        self.inner.coordinator.instance_id()
    }

    pub fn health(&self) -> CoordinatorHealth {
        self.inner.coordinator.health(Utc::now())
    }

    /// Run a single dispatch cycle as of `now`.
    ///
    /// Claimed triggers are handed to spawned worker tasks; the returned
    /// report carries their handles. Must be called inside a Tokio runtime.
    pub fn dispatch_cycle(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        self.inner.dispatch_cycle(now)
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle
            .lock()
            .map(|l| l.is_some())
            .unwrap_or(false)
    }

    /// Spawn the dispatch loop.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self
            .lifecycle
            .lock()
            .map_err(|_| SchedulerError::Unavailable("engine lifecycle lock poisoned".to_string()))?;
        if lifecycle.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.run(shutdown_rx).await });
        *lifecycle = Some(RunningLoop {
            shutdown_tx,
            handle,
        });
        info!(
            instance = %self.instance_id(),
            poll_ms = self.inner.config.poll_interval_ms,
            workers = self.inner.config.worker_pool_size,
            handlers = ?self.inner.handlers.ids(),
            "scheduler engine started"
        );
        Ok(())
    }

    /// Stop the dispatch loop and give up cluster membership.
    ///
    /// With `wait_for_jobs` the call returns only after every in-flight
    /// handler has finished, checking in all the while so no other node
    /// takes the running firings for orphans. Otherwise running handlers are
    /// left to complete on their own and this node's liveness record is left
    /// to expire rather than removed under them.
    pub async fn stop(&self, wait_for_jobs: bool) -> Result<()> {
        let running = self
            .lifecycle
            .lock()
            .map_err(|_| SchedulerError::Unavailable("engine lifecycle lock poisoned".to_string()))?
            .take()
            .ok_or(SchedulerError::NotRunning)?;

        let _ = running.shutdown_tx.send(true);
        if let Err(e) = running.handle.await {
            error!("dispatch loop ended abnormally: {e}");
        }
        if let Err(e) = self.inner.coordinator.release() {
            warn!("failed to release dispatch lock: {e}");
        }

        if wait_for_jobs {
            self.inner.drain().await;
        }

        let in_flight = self.inner.config.worker_pool_size - self.inner.workers.available_permits();
        if in_flight == 0 {
            if let Err(e) = self.inner.coordinator.sign_out() {
                warn!("failed to remove liveness record: {e}");
            }
        } else {
            info!(in_flight, "handlers still running; liveness record left to expire");
        }
        info!(instance = %self.instance_id(), "scheduler engine stopped");
        Ok(())
    }
}

impl EngineInner {
    /// Main loop. Runs one cycle per poll interval until `shutdown` broadcasts `true`.
    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let poll = self.config.poll_interval();
        let mut failures: u32 = 0;
        loop {
            let delay = match self.dispatch_cycle(Utc::now()) {
                Ok(report) => {
                    failures = 0;
                    if !report.claimed.is_empty() {
                        debug!(claimed = report.claimed.len(), "dispatch cycle done");
                    }
                    poll
                }
                Err(e) if e.is_retryable() => {
                    failures += 1;
                    let delay = backoff(poll, self.config.max_backoff(), failures);
                    warn!(failures, delay_ms = delay.as_millis() as u64, "store unavailable: {e}");
                    delay
                }
                Err(e) => {
                    error!("dispatch cycle failed: {e}");
                    poll
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("dispatch loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Wait for every worker permit, renewing the liveness record meanwhile.
    async fn drain(&self) {
        let all = self.config.worker_pool_size as u32;
        let drained = self.workers.acquire_many(all);
        tokio::pin!(drained);
        let mut check_in = tokio::time::interval(self.config.heartbeat_interval());
        loop {
            tokio::select! {
                permits = &mut drained => {
                    if let Err(e) = permits {
                        warn!("worker pool closed while draining: {e}");
                    }
                    return;
                }
                _ = check_in.tick() => {
                    if let Err(e) = self.coordinator.check_in(Utc::now()) {
                        warn!("check-in failed while draining: {e}");
                    }
                }
            }
        }
    }

    fn unsettled(&self) -> MutexGuard<'_, Vec<Unsettled>> {
        self.unsettled.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Retry store writes that firing tasks gave up on.
    fn settle(&self) {
        let pending = std::mem::take(&mut *self.unsettled());
        if pending.is_empty() {
            return;
        }
        let mut retry = Vec::new();
        for item in pending {
            let key = item.key().clone();
            let result = match &item {
                Unsettled::Claim { key, instance_id } => self.store.release_claim(key, instance_id),
                Unsettled::Outcome {
                    key,
                    instance_id,
                    outcome,
                } => self.store.complete_trigger(key, instance_id, outcome),
            };
            match result {
                Ok(true) => info!(job = %key, "settled firing deferred by a store failure"),
                Ok(false) | Err(SchedulerError::NotFound { .. }) => {
                    debug!(job = %key, "deferred firing no longer applies")
                }
                Err(e) if e.is_retryable() => {
                    debug!(job = %key, "store still unavailable for deferred firing: {e}");
                    retry.push(item);
                }
                Err(e) => error!(job = %key, "dropping deferred firing: {e}"),
            }
        }
        self.unsettled().extend(retry);
    }

    fn dispatch_cycle(self: &Arc<Self>, now: DateTime<Utc>) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let started = Instant::now();

        self.coordinator.check_in(now)?;
        if !self.own_claims_recovered.load(Ordering::Acquire) {
            // A previous process with this id may have died mid-firing; its
            // claims look live because we just checked in under the same id.
            let keys = self
                .store
                .recover_instance_triggers(self.coordinator.instance_id())?;
            self.own_claims_recovered.store(true, Ordering::Release);
            report.recovered.extend(keys);
        }
        self.settle();

        if !self.coordinator.try_acquire(now)? {
            return Ok(report);
        }
        report.dispatched = true;

        let result = self.dispatch_locked(now, started, &mut report);
        if let Err(e) = self.coordinator.release() {
            warn!("failed to release dispatch lock: {e}");
        }
        result.map(|_| report)
    }

    fn dispatch_locked(
        self: &Arc<Self>,
        now: DateTime<Utc>,
        started: Instant,
        report: &mut CycleReport,
    ) -> Result<()> {
        let orphans = self.store.recover_orphaned_triggers(now)?;
        report.recovered.extend(orphans);
        let reset = self.store.reset_errored_triggers()?;
        if reset > 0 {
            debug!(count = reset, "errored triggers returned to waiting");
        }

        let capacity = self.workers.available_permits();
        if capacity == 0 {
            debug!("worker pool saturated; skipping selection");
            return Ok(());
        }

        let poll = chrono::Duration::from_std(self.config.poll_interval())
            .unwrap_or_else(|_| chrono::Duration::seconds(1));

        for due in self.store.due_triggers(now, capacity)? {
            let elapsed = chrono::Duration::from_std(started.elapsed())
                .unwrap_or_else(|_| chrono::Duration::zero());
            if !self.coordinator.heartbeat_if_due(now + elapsed)? {
                warn!("dispatch lock lost mid-cycle; leaving remaining triggers for the next holder");
                break;
            }

            let key = due.job.key.clone();
            match self.dispatch_one(due, now, poll, report) {
                Ok(()) => {}
                Err(SchedulerError::Conflict { reason, .. }) => {
                    debug!(job = %key, "claim skipped: {reason}");
                }
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => {
                    error!(job = %key, "failed to dispatch trigger: {e}");
                }
            }
        }
        Ok(())
    }

    fn dispatch_one(
        self: &Arc<Self>,
        due: ScheduledJob,
        now: DateTime<Utc>,
        poll: chrono::Duration,
        report: &mut CycleReport,
    ) -> Result<()> {
        let ScheduledJob { job, trigger } = due;
        let key = job.key.clone();
        let Some(scheduled) = trigger.next_fire_time else {
            return Ok(());
        };
        let schedule = CronSchedule::parse(&trigger.cron)?;

        let misfired = now - scheduled > poll;
        if misfired && trigger.misfire_policy == MisfirePolicy::DoNothing {
            let next = schedule.next_after(now);
            if !self.store.advance_trigger(&key, scheduled, next)? {
                return Err(conflict(&key, "trigger changed before misfire skip"));
            }
            info!(job = %key, %scheduled, "misfired trigger skipped");
            report.skipped_misfires.push(key);
            return Ok(());
        }
        if misfired {
            info!(job = %key, %scheduled, "misfired trigger firing now");
        }

        // Regular cadence from the scheduled time; a misfire resumes from now
        // so missed occurrences are not replayed.
        let next = schedule.next_after(scheduled.max(now));

        let Ok(permit) = self.workers.clone().try_acquire_owned() else {
            return Err(conflict(&key, "no free worker"));
        };

        let claim = TriggerClaim {
            instance_id: self.coordinator.instance_id().to_string(),
            scheduled_fire_time: scheduled,
            next_fire_time: next,
        };
        if !self.store.claim_trigger(&key, scheduled, &claim)? {
            return Err(conflict(&key, "claimed elsewhere or modified"));
        }
        debug!(job = %key, %scheduled, "trigger acquired");

        let firing = FiringContext {
            job,
            scheduled_fire_time: scheduled,
            previous_fire_time: trigger.previous_fire_time,
            next_fire_time: next,
            instance_id: claim.instance_id,
            store: self.store.clone(),
        };
        let inner = self.clone();
        report
            .firings
            .push(tokio::spawn(async move { inner.fire(firing, permit).await }));
        report.claimed.push(key);
        Ok(())
    }

    /// Worker task: `acquired → executing`, run the handler, record the outcome.
    async fn fire(self: Arc<Self>, firing: FiringContext, _permit: OwnedSemaphorePermit) {
        let key = firing.key().clone();

        let begun = with_store_retries(&key, || firing.begin()).await;
        match begun {
            Ok(true) => {}
            Ok(false) => {
                warn!(job = %key, "trigger no longer acquired by this node; firing dropped");
                return;
            }
            Err(SchedulerError::NotFound { .. }) => {
                debug!(job = %key, "job deleted before firing");
                return;
            }
            Err(e) => {
                error!(job = %key, "cannot mark trigger executing, retrying next cycle: {e}");
                self.unsettled().push(Unsettled::Claim {
                    key,
                    instance_id: firing.instance_id.clone(),
                });
                return;
            }
        }

        let outcome = self
            .execute(&firing.job.handler, firing.execution_context())
            .await;
        match &outcome {
            FiringOutcome::Succeeded => debug!(job = %key, "handler succeeded"),
            FiringOutcome::Failed(reason) => {
                let err = SchedulerError::HandlerFailure {
                    key: key.to_string(),
                    reason: reason.clone(),
                };
                warn!(job = %key, "{err}");
            }
        }

        let recorded = with_store_retries(&key, || firing.complete(&outcome)).await;
        match recorded {
            Ok(true) => {}
            Ok(false) => {
                warn!(job = %key, "trigger was taken over while executing; outcome discarded")
            }
            Err(SchedulerError::NotFound { .. }) => {
                debug!(job = %key, "job deleted while executing; outcome discarded")
            }
            Err(e) => {
                error!(job = %key, "cannot record firing outcome, retrying next cycle: {e}");
                self.unsettled().push(Unsettled::Outcome {
                    key,
                    instance_id: firing.instance_id.clone(),
                    outcome,
                });
            }
        }
    }

    /// Invoke the handler on its own task, bounded by the handler timeout.
    async fn execute(&self, handler_id: &str, ctx: JobExecutionContext) -> FiringOutcome {
        let handler = match self.handlers.resolve(handler_id) {
            Ok(h) => h,
            Err(e) => return FiringOutcome::Failed(e.to_string()),
        };

        let mut task = tokio::spawn(async move { handler.execute(&ctx).await });
        let abort = task.abort_handle();
        let limit = self.config.handler_timeout();
        match tokio::time::timeout(limit, &mut task).await {
            Ok(Ok(Ok(()))) => FiringOutcome::Succeeded,
            Ok(Ok(Err(e))) => FiringOutcome::Failed(format!("{e:#}")),
            Ok(Err(e)) if e.is_panic() => FiringOutcome::Failed("handler panicked".to_string()),
            Ok(Err(e)) => FiringOutcome::Failed(format!("handler task cancelled: {e}")),
            Err(_) => {
                abort.abort();
                FiringOutcome::Failed(format!("handler timed out after {}s", limit.as_secs()))
            }
        }
    }
}

async fn with_store_retries<T>(key: &JobKey, op: impl Fn() -> Result<T>) -> Result<T> {
    let mut attempt = 1;
    loop {
        match op() {
            Err(e) if e.is_retryable() && attempt < STORE_ATTEMPTS => {
                debug!(job = %key, attempt, "store unavailable, retrying: {e}");
                tokio::time::sleep(STORE_RETRY_DELAY * attempt).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

fn conflict(key: &JobKey, reason: &str) -> SchedulerError {
    SchedulerError::Conflict {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

/// Exponential back-off from `poll`, capped at `max`.
fn backoff(poll: Duration, max: Duration, failures: u32) -> Duration {
    let factor = 1u32 << failures.saturating_sub(1).min(16);
    poll.saturating_mul(factor).min(max.max(poll))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::LockCoordinator;
    use crate::handler::JobHandler;
    use crate::store::SqliteJobStore;
    use crate::types::{instance_lock_name, JobData, JobUpdate, TriggerDefinition, DISPATCH_LOCK};
    use std::sync::atomic::AtomicUsize;
    use async_trait::async_trait;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0).unwrap()
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    /// Records the trigger state it observes while running.
    struct StateRecorder {
        store: Arc<dyn JobStore>,
        seen: Mutex<Vec<TriggerState>>,
    }

    #[async_trait]
    impl JobHandler for StateRecorder {
        async fn execute(&self, ctx: &JobExecutionContext) -> anyhow::Result<()> {
            let state = self.store.get_job(&ctx.key)?.map(|j| j.trigger.state);
            if let Some(state) = state {
                self.seen.lock().unwrap().push(state);
            }
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl JobHandler for Failing {
        async fn execute(&self, _ctx: &JobExecutionContext) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }
    }

    struct Panicking;

    #[async_trait]
    impl JobHandler for Panicking {
        async fn execute(&self, _ctx: &JobExecutionContext) -> anyhow::Result<()> {
            panic!("handler bug")
        }
    }

    struct Sleepy;

    #[async_trait]
    impl JobHandler for Sleepy {
        async fn execute(&self, _ctx: &JobExecutionContext) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    /// Blocks until released, adding a `started` permit once running.
    struct Gate {
        started: Semaphore,
        release: Semaphore,
    }

    impl Gate {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                started: Semaphore::new(0),
                release: Semaphore::new(0),
            })
        }

        async fn wait_started(&self) {
            self.started.acquire().await.unwrap().forget();
        }
    }

    #[async_trait]
    impl JobHandler for Gate {
        async fn execute(&self, _ctx: &JobExecutionContext) -> anyhow::Result<()> {
            self.started.add_permits(1);
            self.release.acquire().await?.forget();
            Ok(())
        }
    }

    /// Real locks underneath; counts check-ins and can report the dispatch
    /// lock lost after a number of in-cycle heartbeats.
    struct Scripted {
        inner: LockCoordinator,
        check_ins: AtomicUsize,
        beats: AtomicUsize,
        keep_lock_for: usize,
    }

    impl Scripted {
        fn new(store: Arc<dyn JobStore>, config: &SchedulerConfig, keep_lock_for: usize) -> Arc<Self> {
            Arc::new(Self {
                inner: LockCoordinator::new(store, "node-a", config).unwrap(),
                check_ins: AtomicUsize::new(0),
                beats: AtomicUsize::new(0),
                keep_lock_for,
            })
        }

        fn check_ins(&self) -> usize {
            self.check_ins.load(Ordering::SeqCst)
        }
    }

    impl ClusterCoordinator for Scripted {
        fn instance_id(&self) -> &str {
            self.inner.instance_id()
        }
        fn check_in(&self, now: DateTime<Utc>) -> Result<()> {
            self.check_ins.fetch_add(1, Ordering::SeqCst);
            self.inner.check_in(now)
        }
        fn try_acquire(&self, now: DateTime<Utc>) -> Result<bool> {
            self.inner.try_acquire(now)
        }
        fn heartbeat(&self, now: DateTime<Utc>) -> Result<bool> {
            self.inner.heartbeat(now)
        }
        fn heartbeat_if_due(&self, now: DateTime<Utc>) -> Result<bool> {
            if self.beats.fetch_add(1, Ordering::SeqCst) >= self.keep_lock_for {
                return Ok(false);
            }
            self.inner.heartbeat_if_due(now)
        }
        fn release(&self) -> Result<()> {
            self.inner.release()
        }
        fn is_held(&self) -> bool {
            self.inner.is_held()
        }
        fn sign_out(&self) -> Result<()> {
            self.inner.sign_out()
        }
        fn health(&self, now: DateTime<Utc>) -> CoordinatorHealth {
            self.inner.health(now)
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            poll_interval_ms: 1_000,
            lock_ttl_secs: 30,
            heartbeat_interval_secs: 10,
            worker_pool_size: 4,
            handler_timeout_secs: 1,
            ..SchedulerConfig::default()
        }
    }

    fn engine_with(
        store: Arc<dyn JobStore>,
        handlers: HandlerRegistry,
        config: SchedulerConfig,
        instance: &str,
    ) -> SchedulerEngine {
        let coordinator = Arc::new(LockCoordinator::new(store.clone(), instance, &config).unwrap());
        SchedulerEngine::new(config, store, coordinator, Arc::new(handlers)).unwrap()
    }

    fn put(
        store: &dyn JobStore,
        id: &str,
        cron: &str,
        handler: &str,
        next: DateTime<Utc>,
        policy: MisfirePolicy,
    ) -> JobKey {
        let key = JobKey::new("g1", id);
        let job = JobDefinition {
            key: key.clone(),
            handler: handler.to_string(),
            job_data: JobData::from([("extra".to_string(), "x".to_string())]),
            requests_recovery: false,
            created_at: t0(),
            updated_at: t0(),
        };
        let trigger = TriggerDefinition {
            key: key.clone(),
            cron: cron.to_string(),
            state: TriggerState::Waiting,
            next_fire_time: Some(next),
            previous_fire_time: None,
            misfire_policy: policy,
            instance_id: None,
            fired_at: None,
            last_error: None,
            updated_at: t0(),
        };
        store.put_job(&job, &trigger).unwrap();
        key
    }

    fn trigger(store: &dyn JobStore, key: &JobKey) -> TriggerDefinition {
        store.get_job(key).unwrap().unwrap().trigger
    }

    fn memory_store() -> Arc<dyn JobStore> {
        Arc::new(SqliteJobStore::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn fires_through_full_state_sequence() {
        let store = memory_store();
        let recorder = Arc::new(StateRecorder {
            store: store.clone(),
            seen: Mutex::new(Vec::new()),
        });
        let handlers = HandlerRegistry::new().with("recorder", recorder.clone());
        let engine = engine_with(store.clone(), handlers, config(), "node-a");
        let key = put(&*store, "job1", "0/5 * * * * ?", "recorder", t0(), MisfirePolicy::FireNow);

        let report = engine.dispatch_cycle(t0()).unwrap();
        assert_eq!(report.claimed, vec![key.clone()]);

        // Single-threaded runtime: the worker has not run yet.
        let claimed = trigger(&*store, &key);
        assert_eq!(claimed.state, TriggerState::Acquired);
        assert_eq!(claimed.next_fire_time, Some(t0() + secs(5)));
        assert_eq!(claimed.instance_id.as_deref(), Some("node-a"));

        report.join().await;
        assert_eq!(*recorder.seen.lock().unwrap(), vec![TriggerState::Executing]);

        let done = trigger(&*store, &key);
        assert_eq!(done.state, TriggerState::Waiting);
        assert_eq!(done.next_fire_time, Some(t0() + secs(5)));
        assert_eq!(done.previous_fire_time, Some(t0()));
        assert_eq!(done.instance_id, None);
    }

    #[tokio::test]
    async fn not_yet_due_trigger_is_left_alone() {
        let store = memory_store();
        let engine = engine_with(store.clone(), HandlerRegistry::new(), config(), "node-a");
        let key = put(&*store, "later", "0/5 * * * * ?", "log", t0() + secs(5), MisfirePolicy::FireNow);

        let report = engine.dispatch_cycle(t0()).unwrap();
        assert!(report.dispatched);
        assert!(report.claimed.is_empty());
        assert_eq!(trigger(&*store, &key).state, TriggerState::Waiting);
    }

    #[tokio::test]
    async fn misfire_fires_once_and_resumes_from_now() {
        let store = memory_store();
        let handlers = HandlerRegistry::new().with(
            "recorder",
            Arc::new(StateRecorder {
                store: store.clone(),
                seen: Mutex::new(Vec::new()),
            }),
        );
        let engine = engine_with(store.clone(), handlers, config(), "node-a");
        let key = put(&*store, "late", "0/5 * * * * ?", "recorder", t0(), MisfirePolicy::FireNow);

        // ten poll intervals late
        let now = t0() + secs(10);
        let report = engine.dispatch_cycle(now).unwrap();
        assert_eq!(report.claimed, vec![key.clone()]);
        report.join().await;

        let after = trigger(&*store, &key);
        assert_eq!(after.previous_fire_time, Some(t0()));
        assert_eq!(after.next_fire_time, Some(now + secs(5)));

        // The backlog at +5s and +10s is not replayed.
        let again = engine.dispatch_cycle(now).unwrap();
        assert!(again.claimed.is_empty());
    }

    #[tokio::test]
    async fn do_nothing_misfire_skips_the_firing() {
        let store = memory_store();
        let engine = engine_with(store.clone(), HandlerRegistry::new(), config(), "node-a");
        let key = put(&*store, "skip", "0/5 * * * * ?", "log", t0(), MisfirePolicy::DoNothing);

        let now = t0() + secs(12);
        let report = engine.dispatch_cycle(now).unwrap();
        assert!(report.claimed.is_empty());
        assert_eq!(report.skipped_misfires, vec![key.clone()]);

        let after = trigger(&*store, &key);
        assert_eq!(after.state, TriggerState::Waiting);
        assert_eq!(after.next_fire_time, Some(t0() + secs(15)));
        assert_eq!(after.previous_fire_time, None);
    }

    #[tokio::test]
    async fn failed_handler_records_error_then_resets() {
        let store = memory_store();
        let handlers = HandlerRegistry::new().with("failing", Arc::new(Failing));
        let engine = engine_with(store.clone(), handlers, config(), "node-a");
        let key = put(&*store, "bad", "0/5 * * * * ?", "failing", t0(), MisfirePolicy::FireNow);

        engine.dispatch_cycle(t0()).unwrap().join().await;
        let failed = trigger(&*store, &key);
        assert_eq!(failed.state, TriggerState::Error);
        assert_eq!(failed.last_error.as_deref(), Some("boom"));
        assert_eq!(failed.next_fire_time, Some(t0() + secs(5)));

        // The next cycle resets it and fires it again when due.
        let report = engine.dispatch_cycle(t0() + secs(5)).unwrap();
        assert_eq!(report.claimed, vec![key]);
        report.join().await;
    }

    #[tokio::test]
    async fn unknown_handler_is_a_failure() {
        let store = memory_store();
        let engine = engine_with(store.clone(), HandlerRegistry::new(), config(), "node-a");
        let key = put(&*store, "orphan", "0/5 * * * * ?", "missing", t0(), MisfirePolicy::FireNow);

        engine.dispatch_cycle(t0()).unwrap().join().await;
        let after = trigger(&*store, &key);
        assert_eq!(after.state, TriggerState::Error);
        assert!(after.last_error.unwrap().contains("missing"));
    }

    #[tokio::test(start_paused = true)]
    async fn handler_timeout_records_error() {
        let store = memory_store();
        let handlers = HandlerRegistry::new().with("sleepy", Arc::new(Sleepy));
        let engine = engine_with(store.clone(), handlers, config(), "node-a");
        let key = put(&*store, "slow", "0/5 * * * * ?", "sleepy", t0(), MisfirePolicy::FireNow);

        engine.dispatch_cycle(t0()).unwrap().join().await;
        let after = trigger(&*store, &key);
        assert_eq!(after.state, TriggerState::Error);
        assert!(after.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn panicking_handler_records_error() {
        let store = memory_store();
        let handlers = HandlerRegistry::new().with("panics", Arc::new(Panicking));
        let engine = engine_with(store.clone(), handlers, config(), "node-a");
        let key = put(&*store, "panics", "0/5 * * * * ?", "panics", t0(), MisfirePolicy::FireNow);

        engine.dispatch_cycle(t0()).unwrap().join().await;
        let after = trigger(&*store, &key);
        assert_eq!(after.state, TriggerState::Error);
        assert_eq!(after.last_error.as_deref(), Some("handler panicked"));
    }

    #[tokio::test]
    async fn delete_during_execution_discards_outcome() {
        let store = memory_store();
        let gate = Gate::new();
        let handlers = HandlerRegistry::new().with("gate", gate.clone());
        let engine = engine_with(store.clone(), handlers, config(), "node-a");
        let key = put(&*store, "job1", "0/5 * * * * ?", "gate", t0(), MisfirePolicy::FireNow);

        let report = engine.dispatch_cycle(t0()).unwrap();
        gate.wait_started().await;
        assert_eq!(trigger(&*store, &key).state, TriggerState::Executing);

        store.delete_job(&key).unwrap();
        gate.release.add_permits(1);
        report.join().await;

        assert!(store.get_job(&key).unwrap().is_none());
    }

    #[tokio::test]
    async fn update_during_execution_takes_effect_after_run() {
        let store = memory_store();
        let gate = Gate::new();
        let handlers = HandlerRegistry::new().with("gate", gate.clone());
        let engine = engine_with(store.clone(), handlers, config(), "node-a");
        let key = put(&*store, "job1", "0/5 * * * * ?", "gate", t0(), MisfirePolicy::FireNow);

        let report = engine.dispatch_cycle(t0()).unwrap();
        gate.wait_started().await;

        let new_next = t0() + secs(30);
        let update = JobUpdate {
            schedule: Some(("0/30 * * * * ?".to_string(), Some(new_next))),
            job_data: None,
        };
        store.update_job(&key, &update, t0()).unwrap();
        gate.release.add_permits(1);
        report.join().await;

        let after = trigger(&*store, &key);
        assert_eq!(after.state, TriggerState::Waiting);
        assert_eq!(after.cron, "0/30 * * * * ?");
        assert_eq!(after.next_fire_time, Some(new_next));
    }

    #[tokio::test]
    async fn node_without_lock_claims_nothing() {
        let store = memory_store();
        let a = engine_with(store.clone(), HandlerRegistry::new(), config(), "node-a");
        let b = engine_with(store.clone(), HandlerRegistry::new(), config(), "node-b");
        put(&*store, "job1", "0/5 * * * * ?", "log", t0(), MisfirePolicy::FireNow);

        // node-a holds the dispatch lock as if mid-cycle
        store.acquire_lock(DISPATCH_LOCK, "node-a", secs(30), t0()).unwrap();
        let report = b.dispatch_cycle(t0()).unwrap();
        assert!(!report.dispatched);
        assert!(report.claimed.is_empty());

        store.release_lock(DISPATCH_LOCK, "node-a").unwrap();
        let report = a.dispatch_cycle(t0()).unwrap();
        assert_eq!(report.claimed.len(), 1);
        report.join().await;
    }

    #[tokio::test]
    async fn claims_are_bounded_by_free_workers() {
        let store = memory_store();
        let gate = Gate::new();
        let handlers = HandlerRegistry::new().with("gate", gate.clone());
        let cfg = SchedulerConfig {
            worker_pool_size: 2,
            ..config()
        };
        let engine = engine_with(store.clone(), handlers, cfg, "node-a");
        for id in ["a", "b", "c"] {
            put(&*store, id, "0/5 * * * * ?", "gate", t0(), MisfirePolicy::FireNow);
        }

        let first = engine.dispatch_cycle(t0()).unwrap();
        assert_eq!(first.claimed, vec![JobKey::new("g1", "a"), JobKey::new("g1", "b")]);

        let second = engine.dispatch_cycle(t0()).unwrap();
        assert!(second.claimed.is_empty());
        assert_eq!(trigger(&*store, &JobKey::new("g1", "c")).state, TriggerState::Waiting);

        gate.release.add_permits(2);
        first.join().await;
        assert_eq!(trigger(&*store, &JobKey::new("g1", "a")).state, TriggerState::Waiting);
    }

    #[tokio::test]
    async fn lifecycle_errors() {
        let store = memory_store();
        let engine = engine_with(store.clone(), HandlerRegistry::new(), config(), "node-a");

        assert!(matches!(engine.stop(false).await, Err(SchedulerError::NotRunning)));
        engine.start().unwrap();
        assert!(engine.is_running());
        assert!(matches!(engine.start(), Err(SchedulerError::AlreadyRunning)));

        engine.stop(true).await.unwrap();
        assert!(!engine.is_running());
        assert!(store.get_lock(DISPATCH_LOCK).unwrap().is_none());
        assert!(store
            .get_lock(&instance_lock_name("node-a"))
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn lost_lock_mid_cycle_stops_claiming() {
        let store = memory_store();
        let coordinator = Scripted::new(store.clone(), &config(), 2);
        let engine = SchedulerEngine::new(
            config(),
            store.clone(),
            coordinator,
            Arc::new(HandlerRegistry::new()),
        )
        .unwrap();
        let keys: Vec<_> = ["a", "b", "c", "d"]
            .into_iter()
            .map(|id| put(&*store, id, "0/5 * * * * ?", "log", t0(), MisfirePolicy::FireNow))
            .collect();

        let report = engine.dispatch_cycle(t0()).unwrap();
        assert_eq!(report.claimed, keys[..2].to_vec());
        for key in &keys[2..] {
            let left = trigger(&*store, key);
            assert_eq!(left.state, TriggerState::Waiting);
            assert_eq!(left.next_fire_time, Some(t0()));
        }
        report.join().await;
        assert!(store.get_lock(DISPATCH_LOCK).unwrap().is_none());
    }

    #[tokio::test]
    async fn lock_is_checked_before_every_claim() {
        let store = memory_store();
        let coordinator = Scripted::new(store.clone(), &config(), usize::MAX);
        let engine = SchedulerEngine::new(
            config(),
            store.clone(),
            coordinator.clone(),
            Arc::new(HandlerRegistry::new()),
        )
        .unwrap();
        for id in ["a", "b", "c"] {
            put(&*store, id, "0/5 * * * * ?", "log", t0(), MisfirePolicy::FireNow);
        }

        let report = engine.dispatch_cycle(t0()).unwrap();
        assert_eq!(report.claimed.len(), 3);
        assert_eq!(coordinator.beats.load(Ordering::SeqCst), 3);
        report.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn draining_stop_keeps_checking_in() {
        let store = memory_store();
        let gate = Gate::new();
        let cfg = SchedulerConfig {
            handler_timeout_secs: 3_600,
            ..config()
        };
        let coordinator = Scripted::new(store.clone(), &cfg, usize::MAX);
        let handlers = HandlerRegistry::new().with("gate", gate.clone());
        let engine = Arc::new(
            SchedulerEngine::new(cfg, store.clone(), coordinator.clone(), Arc::new(handlers))
                .unwrap(),
        );
        let key = put(&*store, "job1", "0/5 * * * * ?", "gate", Utc::now(), MisfirePolicy::FireNow);

        engine.start().unwrap();
        gate.wait_started().await;

        let stopping = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.stop(true).await })
        };
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let draining_since = coordinator.check_ins();

        // well past the lock TTL; the running firing must not look orphaned
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(coordinator.check_ins() >= draining_since + 5);
        assert!(!stopping.is_finished());
        assert!(store.get_lock(&instance_lock_name("node-a")).unwrap().is_some());
        assert_eq!(trigger(&*store, &key).state, TriggerState::Executing);

        gate.release.add_permits(1);
        stopping.await.unwrap().unwrap();
        assert_eq!(trigger(&*store, &key).state, TriggerState::Waiting);
        assert!(store.get_lock(&instance_lock_name("node-a")).unwrap().is_none());
    }

    #[tokio::test]
    async fn stop_without_waiting_leaves_liveness_to_expire() {
        let store = memory_store();
        let gate = Gate::new();
        let cfg = SchedulerConfig {
            handler_timeout_secs: 3_600,
            ..config()
        };
        let handlers = HandlerRegistry::new().with("gate", gate.clone());
        let engine = engine_with(store.clone(), handlers, cfg, "node-a");
        put(&*store, "job1", "0/5 * * * * ?", "gate", Utc::now(), MisfirePolicy::FireNow);

        engine.start().unwrap();
        gate.wait_started().await;
        engine.stop(false).await.unwrap();

        assert!(store.get_lock(DISPATCH_LOCK).unwrap().is_none());
        assert!(store.get_lock(&instance_lock_name("node-a")).unwrap().is_some());
        gate.release.add_permits(1);
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let poll = Duration::from_secs(1);
        let max = Duration::from_secs(30);
        assert_eq!(backoff(poll, max, 1), Duration::from_secs(1));
        assert_eq!(backoff(poll, max, 2), Duration::from_secs(2));
        assert_eq!(backoff(poll, max, 4), Duration::from_secs(8));
        assert_eq!(backoff(poll, max, 10), max);
    }
}
