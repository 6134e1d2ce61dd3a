use log::{Level, debug};

use crate::db::models::NewDataPoint;
use crate::models::scope::{JobKey, JobKind};
use crate::services::jobs::JobContext;
use crate::utils::{JobError, record};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Flag is off, missing or unreadable.
    Idle,
    /// Another tick for the same sensor is still running.
    Busy,
    Stored,
}

/// One fetch tick: check the flag, read the source, store one unsent row.
pub fn run_fetch_tick(ctx: &JobContext, key: &JobKey, endpoint: &str) -> Result<FetchOutcome, JobError> {
    let Some(_guard) = ctx.locks.try_claim(JobKind::Fetch, *key) else {
        return Ok(FetchOutcome::Busy);
    };

    let store = ctx.store.as_ref();
    let flags = store
        .local_id(&key.scope, key.bank_id)
        .and_then(|id| match id {
            Some(id) => store.control_flags(&key.scope, id),
            None => Ok(None),
        });
    match flags {
        Ok(Some(f)) if f.is_fetching => {}
        Ok(_) => return Ok(FetchOutcome::Idle),
        Err(e) => {
            debug!("{}: flag check failed, skipping tick: {}", key, e);
            return Ok(FetchOutcome::Idle);
        }
    }

    let token = ctx
        .credentials
        .source_token()?
        .ok_or(JobError::MissingCredential("source"))?;
    let reading = ctx.source.read_current(endpoint, &token)?;

    // The sensor may have been removed while the request was in flight.
    let local_id = store
        .local_id(&key.scope, key.bank_id)?
        .ok_or(JobError::Mapping {
            scope: key.scope,
            bank_id: key.bank_id,
        })?;
    let value = reading.value.clone();
    store.insert_data_point(&key.scope, key.bank_id, &NewDataPoint::from_reading(local_id, reading))?;
    record(store, Level::Debug, key, &format!("stored value {}", value));
    Ok(FetchOutcome::Stored)
}

/// Timer entry point; failures stay inside the tick.
pub fn fetch_tick(ctx: &JobContext, key: &JobKey, endpoint: &str) {
    match run_fetch_tick(ctx, key, endpoint) {
        Ok(FetchOutcome::Busy) => debug!("{}: previous fetch still running, tick skipped", key),
        Ok(_) => {}
        Err(e) => record(ctx.store.as_ref(), Level::Warn, key, &format!("fetch failed: {}", e)),
    }
}
