//! Operations the route layer invokes to control sensor jobs.
//!
//! Every operation writes the persisted run flag first and only then touches
//! the in-memory [`Scheduler`]; the flag is what ticks obey.

use log::{Level, info};
use std::sync::Arc;
use std::time::Duration;

use crate::client::{CloudSink, SensorSource};
use crate::credentials::CredentialProvider;
use crate::db::models::{JobStatus, SensorLogEntry, SensorSchedule};
use crate::db::store::JobStore;
use crate::models::scope::{BankId, JobKey, JobKind, Scope};
use crate::services::scheduler::{Scheduler, TickLocks};
use crate::services::{fetch, send};
use crate::utils::{JobError, record};

pub const MIN_INTERVAL_SECS: i32 = 5;
pub const MAX_INTERVAL_SECS: i32 = 100;
pub const DEFAULT_INTERVAL_SECS: i32 = 10;
pub const DEFAULT_BATCH_SIZE: i32 = 5;
pub const DEFAULT_LOG_LIMIT: i64 = 50;

/// Collaborators shared by every tick body.
pub struct JobContext {
    pub store: Arc<dyn JobStore>,
    pub source: Arc<dyn SensorSource>,
    pub sink: Arc<dyn CloudSink>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub locks: TickLocks,
}

impl JobContext {
    pub fn new(
        store: Arc<dyn JobStore>,
        source: Arc<dyn SensorSource>,
        sink: Arc<dyn CloudSink>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        JobContext {
            store,
            source,
            sink,
            credentials,
            locks: TickLocks::default(),
        }
    }
}

/// Validated schedule parameters of one sensor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SensorSettings {
    pub interval_seconds: i32,
    pub batch_size: i32,
}

impl Default for SensorSettings {
    fn default() -> Self {
        SensorSettings {
            interval_seconds: DEFAULT_INTERVAL_SECS,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl SensorSettings {
    pub fn new(interval_seconds: i32, batch_size: i32) -> Result<Self, JobError> {
        if !(MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS).contains(&interval_seconds) {
            return Err(JobError::InvalidSettings(format!(
                "interval must be between {} and {} seconds, got {}",
                MIN_INTERVAL_SECS, MAX_INTERVAL_SECS, interval_seconds
            )));
        }
        if batch_size < 1 {
            return Err(JobError::InvalidSettings(format!(
                "batch size must be at least 1, got {}",
                batch_size
            )));
        }
        Ok(SensorSettings {
            interval_seconds,
            batch_size,
        })
    }

    /// Settings as persisted on the sensor row; out-of-range values written by
    /// other tools fall back to the defaults.
    pub fn from_schedule(schedule: &SensorSchedule) -> Self {
        let defaults = SensorSettings::default();
        let interval_seconds = if (MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS).contains(&schedule.interval_seconds) {
            schedule.interval_seconds
        } else {
            defaults.interval_seconds
        };
        let batch_size = if schedule.batch_size >= 1 {
            schedule.batch_size
        } else {
            defaults.batch_size
        };
        SensorSettings {
            interval_seconds,
            batch_size,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.unsigned_abs() as u64)
    }
}

/// Composition root for job control. Cheap to clone.
#[derive(Clone)]
pub struct Jobs {
    ctx: Arc<JobContext>,
    scheduler: Arc<Scheduler>,
}

impl Jobs {
    pub fn new(ctx: JobContext, scheduler: Arc<Scheduler>) -> Self {
        Jobs {
            ctx: Arc::new(ctx),
            scheduler,
        }
    }

    pub fn store(&self) -> &dyn JobStore {
        self.ctx.store.as_ref()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    fn schedule_of(&self, key: &JobKey) -> Result<SensorSchedule, JobError> {
        self.ctx
            .store
            .sensor_schedule(&key.scope, key.bank_id)?
            .ok_or(JobError::Mapping {
                scope: key.scope,
                bank_id: key.bank_id,
            })
    }

    /// Persist settings, raise `is_fetching` and start the fetch timer.
    pub fn activate(
        &self,
        scope: Scope,
        bank_id: BankId,
        interval_seconds: i32,
        batch_size: i32,
    ) -> Result<(), JobError> {
        let key = JobKey::new(scope, bank_id);
        let settings = SensorSettings::new(interval_seconds, batch_size)?;
        let endpoint = self
            .schedule_of(&key)?
            .api_endpoint
            .ok_or_else(|| JobError::InvalidSettings(format!("{} has no api endpoint", key)))?;
        let local_id = self
            .ctx
            .store
            .save_schedule(&scope, bank_id, settings.interval_seconds, settings.batch_size)?
            .ok_or(JobError::Mapping { scope, bank_id })?;
        self.ctx.store.set_fetching(&scope, local_id, true)?;

        let message = if self.schedule_fetch(key, settings, endpoint)? {
            format!("fetching job started every {}s", settings.interval_seconds)
        } else {
            "fetching job already running".to_string()
        };
        record(self.store(), Level::Info, &key, &message);
        Ok(())
    }

    /// Clear `is_fetching` and stop the fetch timer. Unknown sensors are a no-op.
    pub fn deactivate(&self, scope: Scope, bank_id: BankId) -> Result<(), JobError> {
        let key = JobKey::new(scope, bank_id);
        if let Some(local_id) = self.ctx.store.local_id(&scope, bank_id)? {
            self.ctx.store.set_fetching(&scope, local_id, false)?;
        }
        if self.scheduler.stop_fetch(&key) {
            record(self.store(), Level::Info, &key, "fetching job stopped");
        }
        Ok(())
    }

    /// Raise `is_sending` and start the send timer with the persisted settings.
    /// Only active sensors can send; rehydration resumes nothing else.
    pub fn start_send_job(&self, scope: Scope, bank_id: BankId) -> Result<(), JobError> {
        let key = JobKey::new(scope, bank_id);
        let schedule = self.schedule_of(&key)?;
        if !schedule.is_active {
            return Err(JobError::InvalidSettings(format!("{} is not active", key)));
        }
        let settings = SensorSettings::from_schedule(&schedule);
        self.ctx.store.set_sending(&scope, schedule.local_id(), true)?;
        let message = if self.schedule_send(key, settings)? {
            format!(
                "sending job started every {}s, batch size {}",
                settings.interval_seconds, settings.batch_size
            )
        } else {
            "sending job already running".to_string()
        };
        record(self.store(), Level::Info, &key, &message);
        Ok(())
    }

    /// Clear both flags and stop both timers.
    pub fn stop_jobs(&self, scope: Scope, bank_id: BankId) -> Result<(), JobError> {
        let key = JobKey::new(scope, bank_id);
        if let Some(local_id) = self.ctx.store.local_id(&scope, bank_id)? {
            self.ctx.store.clear_flags(&scope, local_id)?;
        }
        let fetch = self.scheduler.stop_fetch(&key);
        let send = self.scheduler.stop_send(&key);
        if fetch || send {
            record(self.store(), Level::Info, &key, "all jobs stopped");
        }
        Ok(())
    }

    /// Persisted flags of one sensor; an unregistered sensor reports both off.
    pub fn job_status(&self, scope: Scope, bank_id: BankId) -> Result<JobStatus, JobError> {
        let flags = match self.ctx.store.local_id(&scope, bank_id)? {
            Some(local_id) => self.ctx.store.control_flags(&scope, local_id)?.unwrap_or_default(),
            None => Default::default(),
        };
        Ok(JobStatus {
            bank_id: bank_id.0,
            is_fetching: flags.is_fetching,
            is_sending: flags.is_sending,
        })
    }

    pub fn job_statuses(&self, scope: Scope) -> Result<Vec<JobStatus>, JobError> {
        Ok(self.ctx.store.job_statuses(&scope)?)
    }

    /// Newest first; `None` uses the default limit.
    pub fn sensor_logs(
        &self,
        scope: Scope,
        bank_id: BankId,
        limit: Option<i64>,
    ) -> Result<Vec<SensorLogEntry>, JobError> {
        let limit = limit.filter(|l| *l > 0).unwrap_or(DEFAULT_LOG_LIMIT);
        Ok(self.ctx.store.recent_logs(&scope, bank_id, limit)?)
    }

    /// Cancel every timer. Persisted flags are kept so the next start resumes.
    pub fn shutdown(&self) -> usize {
        let stopped = self.scheduler.stop_all();
        info!("Job timers shut down ({} stopped)", stopped);
        stopped
    }

    /// Start the fetch timer for `key` unless one exists. Returns whether a
    /// timer was started.
    pub(crate) fn schedule_fetch(
        &self,
        key: JobKey,
        settings: SensorSettings,
        endpoint: String,
    ) -> Result<bool, JobError> {
        let ctx = Arc::clone(&self.ctx);
        self.scheduler
            .start_fetch(key, settings.interval(), move || {
                fetch::fetch_tick(&ctx, &key, &endpoint)
            })
            .map_err(|e| JobError::Schedule(format!("{} timer for {}: {}", JobKind::Fetch.as_str(), key, e)))
    }

    pub(crate) fn schedule_send(&self, key: JobKey, settings: SensorSettings) -> Result<bool, JobError> {
        let ctx = Arc::clone(&self.ctx);
        self.scheduler
            .start_send(key, settings.interval(), move || {
                send::send_tick(&ctx, &key, settings.batch_size)
            })
            .map_err(|e| JobError::Schedule(format!("{} timer for {}: {}", JobKind::Send.as_str(), key, e)))
    }
}
