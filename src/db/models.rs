//! Row structs for the tenant-scoped tables and the credential tables.
//!
//! Tenant tables are named at runtime, so their rows are read with
//! `sql_query` + `QueryableByName` rather than through `diesel::table!`.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Bool, Integer, Nullable, Text, Timestamptz};
use serde::Serialize;

use crate::models::desigo::{IngestRow, SourceReading};
use crate::models::scope::{BankId, LocalId};
use crate::schema;

/// Run flags of one sensor, the authority on whether its timers should work.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, QueryableByName)]
pub struct ControlFlags {
    #[diesel(sql_type = Bool)]
    pub is_fetching: bool,
    #[diesel(sql_type = Bool)]
    pub is_sending: bool,
}

#[derive(Debug, Copy, Clone, QueryableByName)]
pub struct LocalIdRow {
    #[diesel(sql_type = BigInt)]
    pub id: i64,
}

/// Registered sensor joined with its endpoint and, where present, its flags.
#[derive(Debug, Clone, PartialEq, QueryableByName)]
pub struct SensorSchedule {
    #[diesel(sql_type = BigInt)]
    pub local_id: i64,
    #[diesel(sql_type = BigInt)]
    pub bank_id: i64,
    #[diesel(sql_type = Integer)]
    pub interval_seconds: i32,
    #[diesel(sql_type = Integer)]
    pub batch_size: i32,
    #[diesel(sql_type = Bool)]
    pub is_active: bool,
    #[diesel(sql_type = Nullable<Text>)]
    pub api_endpoint: Option<String>,
    #[diesel(sql_type = Bool)]
    pub is_fetching: bool,
    #[diesel(sql_type = Bool)]
    pub is_sending: bool,
}

impl SensorSchedule {
    pub fn local_id(&self) -> LocalId {
        LocalId(self.local_id)
    }

    pub fn bank_id(&self) -> BankId {
        BankId(self.bank_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, QueryableByName)]
pub struct JobStatus {
    #[diesel(sql_type = BigInt)]
    pub bank_id: i64,
    #[diesel(sql_type = Bool)]
    pub is_fetching: bool,
    #[diesel(sql_type = Bool)]
    pub is_sending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewDataPoint {
    pub sensor_id: LocalId,
    pub value: String,
    pub quality: String,
    pub quality_good: bool,
    pub timestamp: DateTime<Utc>,
}

impl NewDataPoint {
    pub fn from_reading(sensor_id: LocalId, reading: SourceReading) -> Self {
        NewDataPoint {
            sensor_id,
            value: reading.value,
            quality: reading.quality,
            quality_good: reading.quality_good,
            timestamp: reading.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, QueryableByName)]
pub struct DataPoint {
    #[diesel(sql_type = BigInt)]
    pub id: i64,
    #[diesel(sql_type = BigInt)]
    pub sensor_id: i64,
    #[diesel(sql_type = Text)]
    pub value: String,
    #[diesel(sql_type = Text)]
    pub quality: String,
    #[diesel(sql_type = Bool)]
    pub quality_good: bool,
    #[diesel(sql_type = Timestamptz)]
    pub timestamp: DateTime<Utc>,
    #[diesel(sql_type = Bool)]
    pub sent_to_cloud: bool,
}

impl DataPoint {
    /// Outbound form: the cloud only knows the bank id.
    pub fn to_ingest_row(&self, bank_id: BankId) -> IngestRow {
        IngestRow {
            id: self.id,
            sensor_id: bank_id.0,
            value: self.value.clone(),
            quality: self.quality.clone(),
            quality_good: self.quality_good,
            timestamp: self.timestamp,
            sent_to_cloud: self.sent_to_cloud,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, QueryableByName)]
pub struct SensorLogEntry {
    #[diesel(sql_type = BigInt)]
    pub sensor_id: i64,
    #[diesel(sql_type = Text)]
    pub log: String,
    #[diesel(sql_type = Timestamptz)]
    pub timestamp: DateTime<Utc>,
}

impl SensorLogEntry {
    pub fn render(&self) -> String {
        format!("[{}] {}", self.timestamp.format("%Y-%m-%d %H:%M:%S"), self.log)
    }
}

#[derive(Debug, Clone, QueryableByName)]
pub struct TableNameRow {
    #[diesel(sql_type = Text)]
    pub table_name: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = schema::auth_tokens)]
pub struct AuthToken {
    pub id: i64,
    pub token: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = schema::source_auth_tokens)]
pub struct SourceAuthToken {
    pub id: i64,
    pub username: Option<String>,
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
