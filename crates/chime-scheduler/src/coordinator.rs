use std::sync::{Arc, Mutex, MutexGuard};

use chime_core::{config::SchedulerConfig, ChimeError};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    error::Result,
    store::JobStore,
    types::{instance_lock_name, DISPATCH_LOCK},
};

/// Health of this node's connection to the lock backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CoordinatorHealth {
    Healthy,
    /// Lock operations have failed continuously since `since`.
    Degraded { since: DateTime<Utc> },
}

/// Serialises trigger selection across the cluster.
///
/// Only the holder of the dispatch lock may select and claim due triggers.
/// A crashed holder is recovered purely by expiry: once its TTL lapses the
/// next `try_acquire` on any node succeeds.
pub trait ClusterCoordinator: Send + Sync {
    fn instance_id(&self) -> &str;

    /// Renew this node's liveness record.
    fn check_in(&self, now: DateTime<Utc>) -> Result<()>;

    /// Try to take (or keep) the dispatch lock.
    fn try_acquire(&self, now: DateTime<Utc>) -> Result<bool>;

    /// Extend the dispatch lock. `false` means it was lost.
    fn heartbeat(&self, now: DateTime<Utc>) -> Result<bool>;

    /// Heartbeat only when the heartbeat interval has elapsed.
    /// Returns whether the lock is still held.
    fn heartbeat_if_due(&self, now: DateTime<Utc>) -> Result<bool>;

    fn release(&self) -> Result<()>;

    fn is_held(&self) -> bool;

    /// Drop the liveness record on clean shutdown.
    fn sign_out(&self) -> Result<()>;

    fn health(&self, now: DateTime<Utc>) -> CoordinatorHealth;
}

#[derive(Default)]
struct LockState {
    held: bool,
    last_heartbeat: Option<DateTime<Utc>>,
    /// First failed backend call of the current failure streak.
    failing_since: Option<DateTime<Utc>>,
    degraded_reported: bool,
}

/// [`ClusterCoordinator`] backed by the `locks` table of a [`JobStore`].
pub struct LockCoordinator {
    store: Arc<dyn JobStore>,
    instance_id: String,
    ttl: Duration,
    heartbeat_interval: Duration,
    state: Mutex<LockState>,
}

impl LockCoordinator {
    pub fn new(
        store: Arc<dyn JobStore>,
        instance_id: impl Into<String>,
        config: &SchedulerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let ttl = Duration::from_std(config.lock_ttl())
            .map_err(|e| ChimeError::Config(format!("lock_ttl_secs: {e}")))?;
        let heartbeat_interval = Duration::from_std(config.heartbeat_interval())
            .map_err(|e| ChimeError::Config(format!("heartbeat_interval_secs: {e}")))?;
        Ok(Self {
            store,
            instance_id: instance_id.into(),
            ttl,
            heartbeat_interval,
            state: Mutex::new(LockState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track backend reachability; escalate once a failure streak outlives 3 × TTL.
    fn observe<T>(&self, now: DateTime<Utc>, result: Result<T>) -> Result<T> {
        let mut state = self.state();
        match &result {
            Ok(_) => {
                if state.degraded_reported {
                    info!(instance = %self.instance_id, "lock backend reachable again");
                }
                state.failing_since = None;
                state.degraded_reported = false;
            }
            Err(e) => {
                let since = *state.failing_since.get_or_insert(now);
                if now - since > self.ttl * 3 && !state.degraded_reported {
                    state.degraded_reported = true;
                    error!(
                        instance = %self.instance_id,
                        %since,
                        "cannot reach lock backend for more than 3 lock TTLs: {e}"
                    );
                }
            }
        }
        result
    }
}

impl ClusterCoordinator for LockCoordinator {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn check_in(&self, now: DateTime<Utc>) -> Result<()> {
        let name = instance_lock_name(&self.instance_id);
        self.observe(
            now,
            self.store
                .acquire_lock(&name, &self.instance_id, self.ttl, now),
        )?;
        Ok(())
    }

    fn try_acquire(&self, now: DateTime<Utc>) -> Result<bool> {
        let acquired = self.observe(
            now,
            self.store
                .acquire_lock(DISPATCH_LOCK, &self.instance_id, self.ttl, now),
        );
        let mut state = self.state();
        match acquired {
            Ok(true) => {
                if !state.held {
                    debug!(instance = %self.instance_id, "dispatch lock acquired");
                }
                state.held = true;
                state.last_heartbeat = Some(now);
                Ok(true)
            }
            Ok(false) => {
                state.held = false;
                Ok(false)
            }
            Err(e) => {
                state.held = false;
                Err(e)
            }
        }
    }

    fn heartbeat(&self, now: DateTime<Utc>) -> Result<bool> {
        let extended = self.observe(
            now,
            self.store
                .heartbeat_lock(DISPATCH_LOCK, &self.instance_id, self.ttl, now),
        )?;
        let mut state = self.state();
        if extended {
            state.last_heartbeat = Some(now);
        } else {
            if state.held {
                warn!(instance = %self.instance_id, "dispatch lock lost before heartbeat");
            }
            state.held = false;
        }
        Ok(extended)
    }

    fn heartbeat_if_due(&self, now: DateTime<Utc>) -> Result<bool> {
        {
            let state = self.state();
            if !state.held {
                return Ok(false);
            }
            match state.last_heartbeat {
                Some(last) if now - last < self.heartbeat_interval => return Ok(true),
                _ => {}
            }
        }
        self.heartbeat(now)
    }

    fn release(&self) -> Result<()> {
        if !self.is_held() {
            return Ok(());
        }
        let released = self.store.release_lock(DISPATCH_LOCK, &self.instance_id);
        let mut state = self.state();
        state.held = false;
        state.last_heartbeat = None;
        drop(state);
        released?;
        Ok(())
    }

    fn is_held(&self) -> bool {
        self.state().held
    }

    fn sign_out(&self) -> Result<()> {
        self.store
            .release_lock(&instance_lock_name(&self.instance_id), &self.instance_id)?;
        info!(instance = %self.instance_id, "signed out of cluster");
        Ok(())
    }

    fn health(&self, now: DateTime<Utc>) -> CoordinatorHealth {
        match self.state().failing_since {
            Some(since) if now - since > self.ttl * 3 => CoordinatorHealth::Degraded { since },
            _ => CoordinatorHealth::Healthy,
        }
    }
}
