//! Bearer tokens handed over by the credential collaborator.
//!
//! Tokens are issued and verified elsewhere; this service only reads the most
//! recently stored one whenever a tick or probe needs it.

use diesel::prelude::*;

use crate::db::models::{AuthToken, SourceAuthToken};
use crate::db::store::{PgPool, StoreError};
use crate::schema;

pub trait CredentialProvider: Send + Sync {
    /// Token for the cloud ingest endpoint.
    fn cloud_token(&self) -> Result<Option<String>, StoreError>;

    /// Token for the measurement source.
    fn source_token(&self) -> Result<Option<String>, StoreError>;
}

pub struct PgCredentials {
    pool: PgPool,
}

impl PgCredentials {
    pub fn new(pool: PgPool) -> Self {
        PgCredentials { pool }
    }
}

impl CredentialProvider for PgCredentials {
    fn cloud_token(&self) -> Result<Option<String>, StoreError> {
        use schema::auth_tokens::dsl as A;

        let mut conn = self.pool.get().map_err(|e| StoreError::Pool(e.to_string()))?;
        let latest = A::auth_tokens
            .order(A::id.desc())
            .select(AuthToken::as_select())
            .first(&mut conn)
            .optional()?;
        Ok(latest.map(|t| t.token))
    }

    fn source_token(&self) -> Result<Option<String>, StoreError> {
        use schema::source_auth_tokens::dsl as S;

        let mut conn = self.pool.get().map_err(|e| StoreError::Pool(e.to_string()))?;
        let latest = S::source_auth_tokens
            .order(S::id.desc())
            .select(SourceAuthToken::as_select())
            .first(&mut conn)
            .optional()?;
        Ok(latest.map(|t| t.token))
    }
}
