//! Blocking HTTP clients for the measurement source and the cloud ingest API.
//!
//! - `ureq` agents, one per remote, each with a global timeout so a stalled
//!   call fails like any other transport error.
//! - Status codes are inspected here rather than surfaced as `ureq` errors.
//! - The job bodies depend on the [`SensorSource`], [`CloudSink`] and
//!   [`HeartbeatProbe`] traits, not on these concrete clients.

use http::StatusCode;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

use crate::credentials::CredentialProvider;
use crate::models::desigo::{IngestBatch, PropertySample, SourceReading};
use crate::models::scope::Scope;

#[derive(Debug)]
pub enum SourceError {
    MissingAuth,
    Timeout(String),
    Transport(String),
    Http { status: u16, message: String },
    /// Body did not have the expected shape; `path` points at the offending field.
    Malformed { path: String, message: String },
}

impl core::fmt::Display for SourceError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SourceError::MissingAuth => write!(f, "missing bearer token"),
            SourceError::Timeout(s) => write!(f, "timed out: {}", s),
            SourceError::Transport(s) => write!(f, "transport error: {}", s),
            SourceError::Http { status, message } => write!(f, "http {}: {}", status, message),
            SourceError::Malformed { path, message } => write!(f, "malformed response at {}: {}", path, message),
        }
    }
}

impl std::error::Error for SourceError {}

impl From<ureq::Error> for SourceError {
    fn from(value: ureq::Error) -> Self {
        match value {
            e @ ureq::Error::Timeout(_) => SourceError::Timeout(e.to_string()),
            ureq::Error::StatusCode(status) => SourceError::Http {
                status,
                message: String::new(),
            },
            e => SourceError::Transport(e.to_string()),
        }
    }
}

/// One authenticated read of a sensor's current value.
pub trait SensorSource: Send + Sync {
    fn read_current(&self, endpoint: &str, token: &str) -> Result<SourceReading, SourceError>;
}

/// One authenticated batch upload.
pub trait CloudSink: Send + Sync {
    fn dispatch(&self, scope: &Scope, batch: &IngestBatch, token: &str) -> Result<(), SourceError>;
}

/// Lightweight reachability check of the measurement source.
pub trait HeartbeatProbe: Send + Sync {
    fn probe(&self) -> Result<(), SourceError>;
}

fn build_agent(timeout: Duration, insecure_tls: bool) -> ureq::Agent {
    let mut config = ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .http_status_as_error(false);
    if insecure_tls {
        // On-site servers commonly present self-signed certificates.
        config = config.tls_config(ureq::tls::TlsConfig::builder().disable_verification(true).build());
    }
    ureq::Agent::new_with_config(config.build())
}

fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}

fn error_for_status(status: StatusCode, resp: &mut http::Response<ureq::Body>) -> SourceError {
    let body = resp
        .body_mut()
        .read_to_string()
        .unwrap_or_else(|_| String::from("<no body>"));
    SourceError::Http {
        status: status.as_u16(),
        message: body,
    }
}

fn parse_json<T: DeserializeOwned>(body: &str) -> Result<T, SourceError> {
    let de = &mut serde_json::Deserializer::from_str(body);
    serde_path_to_error::deserialize(de).map_err(|e| SourceError::Malformed {
        path: e.path().to_string(),
        message: e.inner().to_string(),
    })
}

pub struct SourceClient {
    agent: ureq::Agent,
}

impl SourceClient {
    pub fn new(timeout: Duration, insecure_tls: bool) -> Self {
        SourceClient {
            agent: build_agent(timeout, insecure_tls),
        }
    }
}

impl SensorSource for SourceClient {
    fn read_current(&self, endpoint: &str, token: &str) -> Result<SourceReading, SourceError> {
        if token.trim().is_empty() {
            return Err(SourceError::MissingAuth);
        }
        let mut resp = self
            .agent
            .get(endpoint)
            .header("Accept", "application/json")
            .header("Authorization", &bearer(token))
            .call()?;
        let status = resp.status();
        if !status.is_success() {
            return Err(error_for_status(status, &mut resp));
        }
        let body = resp.body_mut().read_to_string()?;
        let samples: Vec<PropertySample> = parse_json(&body)?;
        SourceReading::from_samples(samples).ok_or_else(|| SourceError::Malformed {
            path: "[0].Value".to_string(),
            message: "no sample in response".to_string(),
        })
    }
}

/// Heartbeat against the measurement source using the stored source token.
pub struct SourceHeartbeat {
    agent: ureq::Agent,
    url: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl SourceHeartbeat {
    pub fn new(
        url: impl Into<String>,
        timeout: Duration,
        insecure_tls: bool,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        SourceHeartbeat {
            agent: build_agent(timeout, insecure_tls),
            url: url.into(),
            credentials,
        }
    }
}

impl HeartbeatProbe for SourceHeartbeat {
    fn probe(&self) -> Result<(), SourceError> {
        let token = self
            .credentials
            .source_token()
            .map_err(|e| SourceError::Transport(format!("credential lookup: {}", e)))?
            .ok_or(SourceError::MissingAuth)?;
        let mut resp = self
            .agent
            .post(&self.url)
            .header("Authorization", &bearer(&token))
            .send_json(serde_json::json!({}))?;
        let status = resp.status();
        if status.is_success() || status.is_redirection() {
            Ok(())
        } else {
            Err(error_for_status(status, &mut resp))
        }
    }
}

pub struct CloudClient {
    agent: ureq::Agent,
    base_url: String,
}

impl CloudClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        CloudClient {
            agent: build_agent(timeout, false),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn ingest_url(&self, scope: &Scope) -> String {
        match scope {
            Scope::Tenant(_) => format!("{}/api/sensor-data/receive-data", self.base_url),
            Scope::Subsite(..) => format!("{}/api/subsite/sensor-data/receive-data", self.base_url),
        }
    }
}

impl CloudSink for CloudClient {
    fn dispatch(&self, scope: &Scope, batch: &IngestBatch, token: &str) -> Result<(), SourceError> {
        if token.trim().is_empty() {
            return Err(SourceError::MissingAuth);
        }
        let mut resp = self
            .agent
            .post(&self.ingest_url(scope))
            .header("Accept", "application/json")
            .header("Authorization", &bearer(token))
            .send_json(batch)?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(error_for_status(status, &mut resp))
        }
    }
}
