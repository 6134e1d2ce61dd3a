use crate::client::SourceError;
use crate::db::store::{JobStore, StoreError};
use crate::models::scope::{BankId, JobKey, Scope};
use core::fmt;
use log::{Level, log, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Failures of a single job operation. None of these ever leave the tick or
/// request they happened in.
#[derive(Debug)]
pub enum JobError {
    /// Network, non-success status or timeout talking to the source or the cloud.
    TransientSource(SourceError),
    /// Payload did not have the expected shape.
    MalformedResponse(SourceError),
    /// The bank id has no row in the scope's sensor table.
    Mapping { scope: Scope, bank_id: BankId },
    Persistence(StoreError),
    MissingCredential(&'static str),
    InvalidSettings(String),
    /// A timer thread could not be started.
    Schedule(String),
}

impl Display for JobError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            JobError::TransientSource(e) => write!(f, "source unavailable: {}", e),
            JobError::MalformedResponse(e) => write!(f, "{}", e),
            JobError::Mapping { scope, bank_id } => {
                write!(f, "no sensor with bank id {} in {}", bank_id.0, scope)
            }
            JobError::Persistence(e) => write!(f, "store error: {}", e),
            JobError::MissingCredential(kind) => write!(f, "no {} token stored", kind),
            JobError::InvalidSettings(msg) => write!(f, "invalid settings: {}", msg),
            JobError::Schedule(msg) => write!(f, "scheduling failed: {}", msg),
        }
    }
}

impl Error for JobError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            JobError::TransientSource(e) | JobError::MalformedResponse(e) => Some(e),
            JobError::Persistence(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for JobError {
    fn from(value: StoreError) -> Self {
        JobError::Persistence(value)
    }
}

impl From<SourceError> for JobError {
    fn from(value: SourceError) -> Self {
        match value {
            e @ SourceError::Malformed { .. } => JobError::MalformedResponse(e),
            e => JobError::TransientSource(e),
        }
    }
}

/// Log a per-sensor event to the process log and to the scope's log table.
/// A failing log insert is only reported, never propagated.
pub fn record(store: &dyn JobStore, level: Level, key: &JobKey, message: &str) {
    log!(level, "{}: {}", key, message);
    if let Err(e) = store.append_log(&key.scope, key.bank_id, message) {
        warn!("{}: could not persist log line: {}", key, e);
    }
}

/// Identifier for a batch, stable for the same rows so a replay after a crash
/// can be recognised by the receiver.
pub fn batch_id(key: &JobKey, row_ids: &[i64]) -> String {
    let first = row_ids.iter().min().copied().unwrap_or_default();
    let last = row_ids.iter().max().copied().unwrap_or_default();
    let subsite = key
        .scope
        .subsite_id()
        .map(|s| s.0.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{}:{}:{}:{}-{}:{}",
        key.scope.tenant_id().0,
        subsite,
        key.bank_id.0,
        first,
        last,
        row_ids.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_id_is_order_independent_and_scoped() {
        let key = JobKey::new(Scope::subsite(1, 7), BankId(5));
        assert_eq!(batch_id(&key, &[12, 10, 11]), "1:7:5:10-12:3");
        assert_eq!(batch_id(&key, &[10, 11, 12]), batch_id(&key, &[12, 11, 10]));

        let tenant_key = JobKey::new(Scope::tenant(1), BankId(5));
        assert_eq!(batch_id(&tenant_key, &[10, 11, 12]), "1:-:5:10-12:3");
    }

    #[test]
    fn malformed_source_errors_are_classified() {
        let malformed = SourceError::Malformed {
            path: ".".into(),
            message: "x".into(),
        };
        assert!(matches!(JobError::from(malformed), JobError::MalformedResponse(_)));
        assert!(matches!(
            JobError::from(SourceError::Timeout("t".into())),
            JobError::TransientSource(_)
        ));
    }
}
