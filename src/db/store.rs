//! Persisted job store: run flags, buffered samples and sensor log lines.
//!
//! - [`JobStore`] is the only way the jobs, the health monitor and the
//!   rehydrator touch persisted state.
//! - [`PgJobStore`] implements it over a pooled Postgres connection. Tenant
//!   tables are addressed through [`TableName`]; values are always bound.

use chrono::Utc;
use diesel::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sql_types::{Array, BigInt, Bool, Integer, Text, Timestamptz};
use log::debug;
use std::fmt::{self, Display, Formatter};

use crate::db::models::{
    ControlFlags, DataPoint, JobStatus, LocalIdRow, NewDataPoint, SensorLogEntry, SensorSchedule, TableNameRow,
};
use crate::db::tables::{TableKind, TableName, control_table_pattern, scope_from_control_table};
use crate::models::scope::{BankId, LocalId, Scope};

pub type PgPool = Pool<ConnectionManager<PgConnection>>;

#[derive(Debug)]
pub enum StoreError {
    /// No connection could be checked out of the pool.
    Pool(String),
    Query(diesel::result::Error),
    /// The scope has not been provisioned.
    MissingTable(TableName),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Pool(e) => write!(f, "connection pool: {}", e),
            StoreError::Query(e) => write!(f, "query failed: {}", e),
            StoreError::MissingTable(t) => write!(f, "table {} does not exist", t),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Query(e) => Some(e),
            _ => None,
        }
    }
}

impl From<diesel::result::Error> for StoreError {
    fn from(value: diesel::result::Error) -> Self {
        if let diesel::result::Error::DatabaseError(_, info) = &value {
            if let Some(table) = undefined_relation(info.message()) {
                return StoreError::MissingTable(TableName::from_catalog(table));
            }
        }
        StoreError::Query(value)
    }
}

/// Table named by Postgres' `relation "..." does not exist` (SQLSTATE 42P01).
fn undefined_relation(message: &str) -> Option<&str> {
    let name = message.strip_prefix("relation \"")?.strip_suffix("\" does not exist")?;
    // Schema-qualified names are reported as written in the statement.
    Some(name.rsplit('.').next().unwrap_or(name))
}

pub trait JobStore: Send + Sync {
    /// Every provisioned scope, discovered from the control tables present.
    fn list_scopes(&self) -> Result<Vec<Scope>, StoreError>;

    fn local_id(&self, scope: &Scope, bank_id: BankId) -> Result<Option<LocalId>, StoreError>;

    fn sensor_schedule(&self, scope: &Scope, bank_id: BankId) -> Result<Option<SensorSchedule>, StoreError>;

    /// Persist schedule settings on a registered sensor and mark it active.
    /// Returns `None` when the sensor is not registered in the scope.
    fn save_schedule(
        &self,
        scope: &Scope,
        bank_id: BankId,
        interval_seconds: i32,
        batch_size: i32,
    ) -> Result<Option<LocalId>, StoreError>;

    fn control_flags(&self, scope: &Scope, sensor_id: LocalId) -> Result<Option<ControlFlags>, StoreError>;

    /// Upsert; creates the control record on first activation.
    fn set_fetching(&self, scope: &Scope, sensor_id: LocalId, on: bool) -> Result<(), StoreError>;

    fn set_sending(&self, scope: &Scope, sensor_id: LocalId, on: bool) -> Result<(), StoreError>;

    fn clear_flags(&self, scope: &Scope, sensor_id: LocalId) -> Result<(), StoreError>;

    /// Clear both flags on every record in the scope; returns rows changed.
    fn clear_all_flags(&self, scope: &Scope) -> Result<usize, StoreError>;

    /// Active sensors with at least one flag set.
    fn running_jobs(&self, scope: &Scope) -> Result<Vec<SensorSchedule>, StoreError>;

    fn job_statuses(&self, scope: &Scope) -> Result<Vec<JobStatus>, StoreError>;

    fn insert_data_point(&self, scope: &Scope, bank_id: BankId, row: &NewDataPoint) -> Result<(), StoreError>;

    /// Oldest unsent rows first, at most `limit`.
    fn unsent_batch(&self, scope: &Scope, bank_id: BankId, limit: i64) -> Result<Vec<DataPoint>, StoreError>;

    fn mark_sent(&self, scope: &Scope, bank_id: BankId, ids: &[i64]) -> Result<usize, StoreError>;

    fn append_log(&self, scope: &Scope, bank_id: BankId, message: &str) -> Result<(), StoreError>;

    /// Newest first.
    fn recent_logs(&self, scope: &Scope, bank_id: BankId, limit: i64) -> Result<Vec<SensorLogEntry>, StoreError>;
}

pub fn build_pool(database_url: &str, max_size: u32) -> Result<PgPool, String> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    Pool::builder()
        .max_size(max_size)
        .build(manager)
        .map_err(|e| format!("DB pool setup failed: {}", e))
}

pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        PgJobStore { pool }
    }

    fn conn(&self) -> Result<PooledConnection<ConnectionManager<PgConnection>>, StoreError> {
        self.pool.get().map_err(|e| StoreError::Pool(e.to_string()))
    }

    fn schedule_query(scope: &Scope, filter: &str) -> String {
        let sensors = TableName::for_scope(TableKind::Sensors, scope).quoted();
        let control = TableName::for_scope(TableKind::Control, scope).quoted();
        let endpoints = TableName::for_scope(TableKind::Endpoints, scope).quoted();
        format!(
            "SELECT s.id AS local_id, s.bank_id, \
                    COALESCE(s.interval_seconds, 0) AS interval_seconds, \
                    COALESCE(s.batch_size, 0) AS batch_size, \
                    COALESCE(s.is_active, false) AS is_active, \
                    (SELECT a.api_endpoint FROM {endpoints} a WHERE a.sensor_id = s.bank_id \
                     ORDER BY a.id DESC LIMIT 1) AS api_endpoint, \
                    COALESCE(c.is_fetching, false) AS is_fetching, \
                    COALESCE(c.is_sending, false) AS is_sending \
             FROM {sensors} s LEFT JOIN {control} c ON c.sensor_id = s.id \
             WHERE {filter} \
             ORDER BY s.bank_id"
        )
    }

    fn upsert_flag(&self, scope: &Scope, sensor_id: LocalId, column: &str, on: bool) -> Result<(), StoreError> {
        let control = TableName::for_scope(TableKind::Control, scope).quoted();
        let mut conn = self.conn()?;
        diesel::sql_query(format!(
            "INSERT INTO {control} (sensor_id, {column}) VALUES ($1, $2) \
             ON CONFLICT (sensor_id) DO UPDATE SET {column} = EXCLUDED.{column}"
        ))
        .bind::<BigInt, _>(sensor_id.0)
        .bind::<Bool, _>(on)
        .execute(&mut conn)?;
        Ok(())
    }
}

impl JobStore for PgJobStore {
    fn list_scopes(&self) -> Result<Vec<Scope>, StoreError> {
        let mut conn = self.conn()?;
        let rows: Vec<TableNameRow> = diesel::sql_query(
            "SELECT table_name::text AS table_name FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_name LIKE $1 \
             ORDER BY table_name",
        )
        .bind::<Text, _>(control_table_pattern())
        .load(&mut conn)?;

        let mut scopes = Vec::with_capacity(rows.len());
        for row in rows {
            match scope_from_control_table(&row.table_name) {
                Some(scope) => scopes.push(scope),
                None => debug!("Ignoring table {} (not a scope control table)", row.table_name),
            }
        }
        scopes.sort();
        Ok(scopes)
    }

    fn local_id(&self, scope: &Scope, bank_id: BankId) -> Result<Option<LocalId>, StoreError> {
        let sensors = TableName::for_scope(TableKind::Sensors, scope).quoted();
        let mut conn = self.conn()?;
        let row: Option<LocalIdRow> = diesel::sql_query(format!("SELECT id FROM {sensors} WHERE bank_id = $1"))
            .bind::<BigInt, _>(bank_id.0)
            .get_result(&mut conn)
            .optional()?;
        Ok(row.map(|r| LocalId(r.id)))
    }

    fn sensor_schedule(&self, scope: &Scope, bank_id: BankId) -> Result<Option<SensorSchedule>, StoreError> {
        let mut conn = self.conn()?;
        let row = diesel::sql_query(Self::schedule_query(scope, "s.bank_id = $1"))
            .bind::<BigInt, _>(bank_id.0)
            .get_result::<SensorSchedule>(&mut conn)
            .optional()?;
        Ok(row)
    }

    fn save_schedule(
        &self,
        scope: &Scope,
        bank_id: BankId,
        interval_seconds: i32,
        batch_size: i32,
    ) -> Result<Option<LocalId>, StoreError> {
        let sensors = TableName::for_scope(TableKind::Sensors, scope).quoted();
        let mut conn = self.conn()?;
        let row: Option<LocalIdRow> = diesel::sql_query(format!(
            "UPDATE {sensors} SET interval_seconds = $1, batch_size = $2, is_active = true \
             WHERE bank_id = $3 RETURNING id"
        ))
        .bind::<Integer, _>(interval_seconds)
        .bind::<Integer, _>(batch_size)
        .bind::<BigInt, _>(bank_id.0)
        .get_result(&mut conn)
        .optional()?;
        Ok(row.map(|r| LocalId(r.id)))
    }

    fn control_flags(&self, scope: &Scope, sensor_id: LocalId) -> Result<Option<ControlFlags>, StoreError> {
        let control = TableName::for_scope(TableKind::Control, scope).quoted();
        let mut conn = self.conn()?;
        let row = diesel::sql_query(format!(
            "SELECT COALESCE(is_fetching, false) AS is_fetching, COALESCE(is_sending, false) AS is_sending \
             FROM {control} WHERE sensor_id = $1"
        ))
        .bind::<BigInt, _>(sensor_id.0)
        .get_result::<ControlFlags>(&mut conn)
        .optional()?;
        Ok(row)
    }

    fn set_fetching(&self, scope: &Scope, sensor_id: LocalId, on: bool) -> Result<(), StoreError> {
        self.upsert_flag(scope, sensor_id, "is_fetching", on)
    }

    fn set_sending(&self, scope: &Scope, sensor_id: LocalId, on: bool) -> Result<(), StoreError> {
        self.upsert_flag(scope, sensor_id, "is_sending", on)
    }

    fn clear_flags(&self, scope: &Scope, sensor_id: LocalId) -> Result<(), StoreError> {
        let control = TableName::for_scope(TableKind::Control, scope).quoted();
        let mut conn = self.conn()?;
        diesel::sql_query(format!(
            "UPDATE {control} SET is_fetching = false, is_sending = false WHERE sensor_id = $1"
        ))
        .bind::<BigInt, _>(sensor_id.0)
        .execute(&mut conn)?;
        Ok(())
    }

    fn clear_all_flags(&self, scope: &Scope) -> Result<usize, StoreError> {
        let control = TableName::for_scope(TableKind::Control, scope).quoted();
        let mut conn = self.conn()?;
        let changed = diesel::sql_query(format!(
            "UPDATE {control} SET is_fetching = false, is_sending = false WHERE is_fetching OR is_sending"
        ))
        .execute(&mut conn)?;
        Ok(changed)
    }

    fn running_jobs(&self, scope: &Scope) -> Result<Vec<SensorSchedule>, StoreError> {
        let mut conn = self.conn()?;
        let rows = diesel::sql_query(Self::schedule_query(
            scope,
            "COALESCE(s.is_active, false) AND (COALESCE(c.is_fetching, false) OR COALESCE(c.is_sending, false))",
        ))
        .load::<SensorSchedule>(&mut conn)?;
        Ok(rows)
    }

    fn job_statuses(&self, scope: &Scope) -> Result<Vec<JobStatus>, StoreError> {
        let sensors = TableName::for_scope(TableKind::Sensors, scope).quoted();
        let control = TableName::for_scope(TableKind::Control, scope).quoted();
        let mut conn = self.conn()?;
        let rows = diesel::sql_query(format!(
            "SELECT s.bank_id, COALESCE(c.is_fetching, false) AS is_fetching, \
                    COALESCE(c.is_sending, false) AS is_sending \
             FROM {control} c JOIN {sensors} s ON c.sensor_id = s.id \
             ORDER BY s.bank_id"
        ))
        .load::<JobStatus>(&mut conn)?;
        Ok(rows)
    }

    fn insert_data_point(&self, scope: &Scope, bank_id: BankId, row: &NewDataPoint) -> Result<(), StoreError> {
        let data = TableName::data(scope, bank_id).quoted();
        let mut conn = self.conn()?;
        diesel::sql_query(format!(
            "INSERT INTO {data} (sensor_id, value, quality, quality_good, timestamp, sent_to_cloud) \
             VALUES ($1, $2, $3, $4, $5, false)"
        ))
        .bind::<BigInt, _>(row.sensor_id.0)
        .bind::<Text, _>(row.value.as_str())
        .bind::<Text, _>(row.quality.as_str())
        .bind::<Bool, _>(row.quality_good)
        .bind::<Timestamptz, _>(row.timestamp)
        .execute(&mut conn)?;
        Ok(())
    }

    fn unsent_batch(&self, scope: &Scope, bank_id: BankId, limit: i64) -> Result<Vec<DataPoint>, StoreError> {
        let data = TableName::data(scope, bank_id).quoted();
        let mut conn = self.conn()?;
        let rows = diesel::sql_query(format!(
            "SELECT id, sensor_id, value, quality, quality_good, timestamp, sent_to_cloud \
             FROM {data} WHERE NOT sent_to_cloud ORDER BY timestamp ASC, id ASC LIMIT $1"
        ))
        .bind::<BigInt, _>(limit)
        .load::<DataPoint>(&mut conn)?;
        Ok(rows)
    }

    fn mark_sent(&self, scope: &Scope, bank_id: BankId, ids: &[i64]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let data = TableName::data(scope, bank_id).quoted();
        let mut conn = self.conn()?;
        let changed = diesel::sql_query(format!(
            "UPDATE {data} SET sent_to_cloud = true WHERE id = ANY($1) AND NOT sent_to_cloud"
        ))
        .bind::<Array<BigInt>, _>(ids.to_vec())
        .execute(&mut conn)?;
        Ok(changed)
    }

    fn append_log(&self, scope: &Scope, bank_id: BankId, message: &str) -> Result<(), StoreError> {
        let logs = TableName::for_scope(TableKind::Logs, scope).quoted();
        let mut conn = self.conn()?;
        diesel::sql_query(format!("INSERT INTO {logs} (sensor_id, log, timestamp) VALUES ($1, $2, $3)"))
            .bind::<BigInt, _>(bank_id.0)
            .bind::<Text, _>(message)
            .bind::<Timestamptz, _>(Utc::now())
            .execute(&mut conn)?;
        Ok(())
    }

    fn recent_logs(&self, scope: &Scope, bank_id: BankId, limit: i64) -> Result<Vec<SensorLogEntry>, StoreError> {
        let logs = TableName::for_scope(TableKind::Logs, scope).quoted();
        let mut conn = self.conn()?;
        let rows = diesel::sql_query(format!(
            "SELECT sensor_id, log, timestamp FROM {logs} WHERE sensor_id = $1 \
             ORDER BY timestamp DESC, id DESC LIMIT $2"
        ))
        .bind::<BigInt, _>(bank_id.0)
        .bind::<BigInt, _>(limit)
        .load::<SensorLogEntry>(&mut conn)?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diesel::result::{DatabaseErrorInformation, DatabaseErrorKind, Error};

    struct PgMessage(&'static str);

    impl DatabaseErrorInformation for PgMessage {
        fn message(&self) -> &str {
            self.0
        }
        fn details(&self) -> Option<&str> {
            None
        }
        fn hint(&self) -> Option<&str> {
            None
        }
        fn table_name(&self) -> Option<&str> {
            None
        }
        fn column_name(&self) -> Option<&str> {
            None
        }
        fn constraint_name(&self) -> Option<&str> {
            None
        }
        fn statement_position(&self) -> Option<i32> {
            None
        }
    }

    fn db_error(message: &'static str) -> Error {
        Error::DatabaseError(DatabaseErrorKind::Unknown, Box::new(PgMessage(message)))
    }

    #[test]
    fn undefined_table_becomes_missing_table() {
        match StoreError::from(db_error("relation \"interval_control_9_4\" does not exist")) {
            StoreError::MissingTable(t) => assert_eq!(t.as_str(), "interval_control_9_4"),
            other => panic!("expected MissingTable, got {other:?}"),
        }
        match StoreError::from(db_error("relation \"public.sensor_data_9_77\" does not exist")) {
            StoreError::MissingTable(t) => assert_eq!(t.as_str(), "sensor_data_9_77"),
            other => panic!("expected MissingTable, got {other:?}"),
        }
    }

    #[test]
    fn other_database_errors_stay_query_errors() {
        let err = db_error("duplicate key value violates unique constraint \"x_pkey\"");
        assert!(matches!(StoreError::from(err), StoreError::Query(_)));
        assert!(matches!(StoreError::from(Error::NotFound), StoreError::Query(_)));
    }

    #[test]
    fn schedule_columns_tolerate_nulls() {
        let sql = PgJobStore::schedule_query(&Scope::subsite(3, 1), "s.bank_id = $1");
        assert!(sql.contains("COALESCE(s.interval_seconds, 0) AS interval_seconds"));
        assert!(sql.contains("COALESCE(s.batch_size, 0) AS batch_size"));
        assert!(sql.contains("COALESCE(s.is_active, false) AS is_active"));
        assert!(sql.contains("COALESCE(c.is_fetching, false) AS is_fetching"));
    }

    #[test]
    fn endpoint_lookup_uses_scope_tables() {
        let sql = PgJobStore::schedule_query(&Scope::subsite(3, 1), "s.bank_id = $1");
        assert!(sql.contains("FROM \"sensor_apis_3_1\" a WHERE a.sensor_id = s.bank_id"));
        assert!(sql.contains("ORDER BY a.id DESC LIMIT 1"));
        assert!(sql.contains("FROM \"active_sensors_3_1\" s LEFT JOIN \"interval_control_3_1\" c"));
    }
}
