//! Identity types shared by the scheduler, the job bodies and the store.
//!
//! A sensor is addressed by `(scope, bank id)`. The bank id is stable across a
//! tenant; the local id is only meaningful inside one scope's sensor table.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub i64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubsiteId(pub i64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BankId(pub i64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(pub i64);

/// Isolated namespace of control/data tables.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scope {
    Tenant(TenantId),
    Subsite(TenantId, SubsiteId),
}

impl Scope {
    pub fn tenant(tenant_id: i64) -> Self {
        Scope::Tenant(TenantId(tenant_id))
    }

    pub fn subsite(tenant_id: i64, subsite_id: i64) -> Self {
        Scope::Subsite(TenantId(tenant_id), SubsiteId(subsite_id))
    }

    pub fn tenant_id(&self) -> TenantId {
        match self {
            Scope::Tenant(t) | Scope::Subsite(t, _) => *t,
        }
    }

    pub fn subsite_id(&self) -> Option<SubsiteId> {
        match self {
            Scope::Tenant(_) => None,
            Scope::Subsite(_, s) => Some(*s),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Tenant(t) => write!(f, "tenant {}", t.0),
            Scope::Subsite(t, s) => write!(f, "tenant {} subsite {}", t.0, s.0),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobKind {
    Fetch,
    Send,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Fetch => "fetch",
            JobKind::Send => "send",
        }
    }
}

/// One sensor inside one scope; the scheduler keys its timers on this.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobKey {
    pub scope: Scope,
    pub bank_id: BankId,
}

impl JobKey {
    pub fn new(scope: Scope, bank_id: BankId) -> Self {
        JobKey { scope, bank_id }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sensor {} ({})", self.bank_id.0, self.scope)
    }
}
