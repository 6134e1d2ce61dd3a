//! Test doubles for the source, the cloud sink, the heartbeat probe and the
//! credential provider.

use chrono::{TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use crate::client::{CloudSink, HeartbeatProbe, SensorSource, SourceError};
use crate::credentials::CredentialProvider;
use crate::db::store::StoreError;
use crate::models::desigo::{IngestBatch, SourceReading};
use crate::models::scope::Scope;

type ErrorFactory = Box<dyn Fn() -> SourceError + Send + Sync>;

pub fn reading(value: &str) -> SourceReading {
    SourceReading {
        value: value.to_string(),
        quality: "0".to_string(),
        quality_good: true,
        timestamp: Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap(),
    }
}

#[derive(Default)]
struct SourceLog {
    calls: usize,
    last_token: Option<String>,
}

/// Answers every read with the same reading or the same error.
pub struct ScriptedSource {
    reading: Option<SourceReading>,
    error: Option<ErrorFactory>,
    log: Mutex<SourceLog>,
}

impl Default for ScriptedSource {
    fn default() -> Self {
        ScriptedSource::failing(|| SourceError::Transport("no reading scripted".into()))
    }
}

impl ScriptedSource {
    pub fn always(reading: SourceReading) -> Self {
        ScriptedSource {
            reading: Some(reading),
            error: None,
            log: Mutex::default(),
        }
    }

    pub fn failing(error: impl Fn() -> SourceError + Send + Sync + 'static) -> Self {
        ScriptedSource {
            reading: None,
            error: Some(Box::new(error)),
            log: Mutex::default(),
        }
    }

    pub fn calls(&self) -> usize {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).calls
    }

    pub fn last_token(&self) -> Option<String> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).last_token.clone()
    }
}

impl SensorSource for ScriptedSource {
    fn read_current(&self, _endpoint: &str, token: &str) -> Result<SourceReading, SourceError> {
        {
            let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
            log.calls += 1;
            log.last_token = Some(token.to_string());
        }
        match (&self.reading, &self.error) {
            (Some(r), _) => Ok(r.clone()),
            (None, Some(make)) => Err(make()),
            (None, None) => Err(SourceError::Transport("no reading scripted".into())),
        }
    }
}

/// Records every dispatch attempt; succeeds unless built with [`RecordingSink::failing`].
#[derive(Default)]
pub struct RecordingSink {
    error: Option<ErrorFactory>,
    attempts: Mutex<Vec<(Scope, IngestBatch, String)>>,
    accepted: Mutex<Vec<(Scope, IngestBatch, String)>>,
}

impl RecordingSink {
    pub fn failing(error: impl Fn() -> SourceError + Send + Sync + 'static) -> Self {
        RecordingSink {
            error: Some(Box::new(error)),
            ..Default::default()
        }
    }

    /// Accepted batches with their scope and bearer token.
    pub fn batches(&self) -> Vec<(Scope, IngestBatch, String)> {
        self.accepted.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn attempted_batch_ids(&self) -> Vec<String> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, b, _)| b.batch_id.clone())
            .collect()
    }
}

impl CloudSink for RecordingSink {
    fn dispatch(&self, scope: &Scope, batch: &IngestBatch, token: &str) -> Result<(), SourceError> {
        let entry = (*scope, batch.clone(), token.to_string());
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
        if let Some(make) = &self.error {
            return Err(make());
        }
        self.accepted.lock().unwrap_or_else(PoisonError::into_inner).push(entry);
        Ok(())
    }
}

/// Plays back a fixed sequence of probe results, then keeps succeeding.
#[derive(Default)]
pub struct ScriptedProbe {
    script: Mutex<VecDeque<bool>>,
}

impl ScriptedProbe {
    pub fn new(script: &[bool]) -> Self {
        ScriptedProbe {
            script: Mutex::new(script.iter().copied().collect()),
        }
    }
}

impl HeartbeatProbe for ScriptedProbe {
    fn probe(&self) -> Result<(), SourceError> {
        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(true);
        if next {
            Ok(())
        } else {
            Err(SourceError::Http {
                status: 503,
                message: "unavailable".into(),
            })
        }
    }
}

pub struct StaticCredentials {
    cloud: Option<String>,
    source: Option<String>,
}

impl StaticCredentials {
    pub fn both(cloud: &str, source: &str) -> Self {
        StaticCredentials {
            cloud: Some(cloud.to_string()),
            source: Some(source.to_string()),
        }
    }

    pub fn none() -> Self {
        StaticCredentials {
            cloud: None,
            source: None,
        }
    }
}

impl CredentialProvider for StaticCredentials {
    fn cloud_token(&self) -> Result<Option<String>, StoreError> {
        Ok(self.cloud.clone())
    }

    fn source_token(&self) -> Result<Option<String>, StoreError> {
        Ok(self.source.clone())
    }
}
