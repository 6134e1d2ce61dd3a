//! In-memory [`JobStore`] used by the unit tests.

use chrono::{Duration, TimeZone, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::db::models::{ControlFlags, DataPoint, JobStatus, NewDataPoint, SensorLogEntry, SensorSchedule};
use crate::db::store::{JobStore, StoreError};
use crate::db::tables::{TableKind, TableName};
use crate::models::scope::{BankId, LocalId, Scope};

#[derive(Debug, Clone)]
struct SensorRow {
    local_id: i64,
    interval_seconds: i32,
    batch_size: i32,
    is_active: bool,
    api_endpoint: Option<String>,
}

#[derive(Debug, Default)]
struct ScopeTables {
    sensors: BTreeMap<i64, SensorRow>,
    control: BTreeMap<i64, ControlFlags>,
    data: BTreeMap<i64, Vec<DataPoint>>,
    logs: Vec<SensorLogEntry>,
}

impl ScopeTables {
    fn schedule(&self, bank_id: i64, row: &SensorRow) -> SensorSchedule {
        let flags = self.control.get(&row.local_id).copied().unwrap_or_default();
        SensorSchedule {
            local_id: row.local_id,
            bank_id,
            interval_seconds: row.interval_seconds,
            batch_size: row.batch_size,
            is_active: row.is_active,
            api_endpoint: row.api_endpoint.clone(),
            is_fetching: flags.is_fetching,
            is_sending: flags.is_sending,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    scopes: BTreeMap<Scope, ScopeTables>,
    next_id: i64,
    touched: BTreeSet<Scope>,
    failing: BTreeSet<Scope>,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_scope<T>(&self, scope: &Scope, f: impl FnOnce(&mut ScopeTables) -> T) -> Result<T, StoreError> {
        let mut inner = self.lock();
        inner.touched.insert(*scope);
        if inner.failing.contains(scope) {
            return Err(StoreError::Pool(format!("{} unavailable", scope)));
        }
        match inner.scopes.get_mut(scope) {
            Some(tables) => Ok(f(tables)),
            None => Err(StoreError::MissingTable(TableName::for_scope(TableKind::Control, scope))),
        }
    }

    /// Provision a scope without sensors.
    pub fn add_scope(&self, scope: Scope) {
        self.lock().scopes.entry(scope).or_default();
    }

    /// Register an active sensor with default settings.
    pub fn register(&self, scope: Scope, bank_id: BankId, endpoint: &str) -> LocalId {
        self.register_with(scope, bank_id, 10, 5, Some(endpoint))
    }

    pub fn register_with(
        &self,
        scope: Scope,
        bank_id: BankId,
        interval_seconds: i32,
        batch_size: i32,
        endpoint: Option<&str>,
    ) -> LocalId {
        let mut inner = self.lock();
        let local_id = inner.next_id();
        inner.scopes.entry(scope).or_default().sensors.insert(
            bank_id.0,
            SensorRow {
                local_id,
                interval_seconds,
                batch_size,
                is_active: true,
                api_endpoint: endpoint.map(str::to_string),
            },
        );
        LocalId(local_id)
    }

    /// Insert `count` unsent rows with increasing timestamps; returns their ids.
    pub fn seed_rows(&self, scope: &Scope, bank_id: BankId, count: usize) -> Vec<i64> {
        let mut inner = self.lock();
        let base = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            let id = inner.next_id();
            let tables = inner.scopes.entry(*scope).or_default();
            let local_id = tables.sensors.get(&bank_id.0).map(|s| s.local_id).unwrap_or_default();
            tables.data.entry(bank_id.0).or_default().push(DataPoint {
                id,
                sensor_id: local_id,
                value: format!("{}", i),
                quality: "0".to_string(),
                quality_good: true,
                timestamp: base + Duration::seconds(i as i64),
                sent_to_cloud: false,
            });
            ids.push(id);
        }
        ids
    }

    pub fn row_count(&self, scope: &Scope, bank_id: BankId) -> usize {
        self.lock()
            .scopes
            .get(scope)
            .and_then(|t| t.data.get(&bank_id.0))
            .map_or(0, Vec::len)
    }

    pub fn set_active(&self, scope: &Scope, bank_id: BankId, active: bool) {
        if let Some(row) = self
            .lock()
            .scopes
            .get_mut(scope)
            .and_then(|t| t.sensors.get_mut(&bank_id.0))
        {
            row.is_active = active;
        }
    }

    /// Make every call against `scope` fail.
    pub fn fail_scope(&self, scope: Scope) {
        self.lock().failing.insert(scope);
    }

    /// Scopes any store call has addressed since the last reset.
    pub fn touched_scopes(&self) -> BTreeSet<Scope> {
        self.lock().touched.clone()
    }

    pub fn reset_touched(&self) {
        self.lock().touched.clear();
    }
}

impl JobStore for MemoryJobStore {
    fn list_scopes(&self) -> Result<Vec<Scope>, StoreError> {
        Ok(self.lock().scopes.keys().copied().collect())
    }

    fn local_id(&self, scope: &Scope, bank_id: BankId) -> Result<Option<LocalId>, StoreError> {
        self.with_scope(scope, |t| t.sensors.get(&bank_id.0).map(|s| LocalId(s.local_id)))
    }

    fn sensor_schedule(&self, scope: &Scope, bank_id: BankId) -> Result<Option<SensorSchedule>, StoreError> {
        self.with_scope(scope, |t| t.sensors.get(&bank_id.0).map(|s| t.schedule(bank_id.0, s)))
    }

    fn save_schedule(
        &self,
        scope: &Scope,
        bank_id: BankId,
        interval_seconds: i32,
        batch_size: i32,
    ) -> Result<Option<LocalId>, StoreError> {
        self.with_scope(scope, |t| {
            t.sensors.get_mut(&bank_id.0).map(|s| {
                s.interval_seconds = interval_seconds;
                s.batch_size = batch_size;
                s.is_active = true;
                LocalId(s.local_id)
            })
        })
    }

    fn control_flags(&self, scope: &Scope, sensor_id: LocalId) -> Result<Option<ControlFlags>, StoreError> {
        self.with_scope(scope, |t| t.control.get(&sensor_id.0).copied())
    }

    fn set_fetching(&self, scope: &Scope, sensor_id: LocalId, on: bool) -> Result<(), StoreError> {
        self.with_scope(scope, |t| t.control.entry(sensor_id.0).or_default().is_fetching = on)
    }

    fn set_sending(&self, scope: &Scope, sensor_id: LocalId, on: bool) -> Result<(), StoreError> {
        self.with_scope(scope, |t| t.control.entry(sensor_id.0).or_default().is_sending = on)
    }

    fn clear_flags(&self, scope: &Scope, sensor_id: LocalId) -> Result<(), StoreError> {
        self.with_scope(scope, |t| {
            if let Some(flags) = t.control.get_mut(&sensor_id.0) {
                *flags = ControlFlags::default();
            }
        })
    }

    fn clear_all_flags(&self, scope: &Scope) -> Result<usize, StoreError> {
        self.with_scope(scope, |t| {
            let mut changed = 0;
            for flags in t.control.values_mut() {
                if flags.is_fetching || flags.is_sending {
                    *flags = ControlFlags::default();
                    changed += 1;
                }
            }
            changed
        })
    }

    fn running_jobs(&self, scope: &Scope) -> Result<Vec<SensorSchedule>, StoreError> {
        self.with_scope(scope, |t| {
            t.sensors
                .iter()
                .map(|(bank, s)| t.schedule(*bank, s))
                .filter(|s| s.is_active && (s.is_fetching || s.is_sending))
                .collect()
        })
    }

    fn job_statuses(&self, scope: &Scope) -> Result<Vec<JobStatus>, StoreError> {
        self.with_scope(scope, |t| {
            t.sensors
                .iter()
                .filter_map(|(bank, s)| {
                    t.control.get(&s.local_id).map(|f| JobStatus {
                        bank_id: *bank,
                        is_fetching: f.is_fetching,
                        is_sending: f.is_sending,
                    })
                })
                .collect()
        })
    }

    fn insert_data_point(&self, scope: &Scope, bank_id: BankId, row: &NewDataPoint) -> Result<(), StoreError> {
        let id = self.lock().next_id();
        self.with_scope(scope, |t| {
            t.data.entry(bank_id.0).or_default().push(DataPoint {
                id,
                sensor_id: row.sensor_id.0,
                value: row.value.clone(),
                quality: row.quality.clone(),
                quality_good: row.quality_good,
                timestamp: row.timestamp,
                sent_to_cloud: false,
            })
        })
    }

    fn unsent_batch(&self, scope: &Scope, bank_id: BankId, limit: i64) -> Result<Vec<DataPoint>, StoreError> {
        self.with_scope(scope, |t| {
            let mut rows: Vec<DataPoint> = t
                .data
                .get(&bank_id.0)
                .map(|rows| rows.iter().filter(|r| !r.sent_to_cloud).cloned().collect())
                .unwrap_or_default();
            rows.sort_by_key(|r| (r.timestamp, r.id));
            rows.truncate(limit.max(0) as usize);
            rows
        })
    }

    fn mark_sent(&self, scope: &Scope, bank_id: BankId, ids: &[i64]) -> Result<usize, StoreError> {
        self.with_scope(scope, |t| {
            let mut changed = 0;
            for row in t.data.get_mut(&bank_id.0).into_iter().flatten() {
                if !row.sent_to_cloud && ids.contains(&row.id) {
                    row.sent_to_cloud = true;
                    changed += 1;
                }
            }
            changed
        })
    }

    fn append_log(&self, scope: &Scope, bank_id: BankId, message: &str) -> Result<(), StoreError> {
        self.with_scope(scope, |t| {
            t.logs.push(SensorLogEntry {
                sensor_id: bank_id.0,
                log: message.to_string(),
                timestamp: Utc::now(),
            })
        })
    }

    fn recent_logs(&self, scope: &Scope, bank_id: BankId, limit: i64) -> Result<Vec<SensorLogEntry>, StoreError> {
        self.with_scope(scope, |t| {
            t.logs
                .iter()
                .rev()
                .filter(|l| l.sensor_id == bank_id.0)
                .take(limit.max(0) as usize)
                .cloned()
                .collect()
        })
    }
}
