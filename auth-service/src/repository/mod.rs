//! Storage seams for managed-mode accounts, sessions and tenant trust
//! configuration. Each trait has an in-memory and a Postgres implementation.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common_auth::{AuthResult, TrustConfigRecord};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAccount {
    pub id: Uuid,
    pub site_id: String,
    /// Lower-cased and trimmed.
    pub email: String,
    pub password_hash: String,
    pub name: String,
    pub avatar_url: Option<String>,
    pub verified: bool,
    /// SHA-256 hex digest of the outstanding verification token.
    pub verification_token_hash: Option<String>,
    /// SHA-256 hex digest of the outstanding reset token.
    pub reset_token_hash: Option<String>,
    pub reset_token_expires: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A session row. Tokens are only ever stored as digests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSession {
    pub id: Uuid,
    pub account_id: Uuid,
    pub site_id: String,
    pub access_token_hash: String,
    pub refresh_token_hash: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl StoredSession {
    pub fn access_active_at(&self, now: DateTime<Utc>) -> bool {
        now < self.access_expires_at
    }

    pub fn refresh_active_at(&self, now: DateTime<Utc>) -> bool {
        now < self.refresh_expires_at
    }
}

#[async_trait]
pub trait AccountRepository: Send + Sync {
    /// Fails with `DuplicateEmail` when `(site_id, email)` is taken.
    async fn insert(&self, account: &LocalAccount) -> AuthResult<()>;

    async fn get(&self, id: Uuid) -> AuthResult<Option<LocalAccount>>;

    async fn find_by_email(&self, site_id: &str, email: &str) -> AuthResult<Option<LocalAccount>>;

    async fn update_profile(
        &self,
        id: Uuid,
        name: &str,
        avatar_url: Option<&str>,
        now: DateTime<Utc>,
    ) -> AuthResult<Option<LocalAccount>>;

    async fn set_reset_token(
        &self,
        id: Uuid,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> AuthResult<bool>;

    /// Replaces the password and clears the reset token in one conditional
    /// write, only while the token is unexpired. Returns the account id.
    async fn consume_reset_token(
        &self,
        site_id: &str,
        token_hash: &str,
        new_password_hash: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<Option<Uuid>>;

    /// Marks the account verified and clears the token. Returns the account id.
    async fn consume_verification_token(
        &self,
        site_id: &str,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<Option<Uuid>>;

    /// Deletes the account and, with it, every session it owns.
    async fn delete(&self, id: Uuid) -> AuthResult<bool>;
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn insert(&self, session: &StoredSession) -> AuthResult<()>;

    /// Returns the session whatever its expiry.
    async fn find_by_access_hash(&self, token_hash: &str) -> AuthResult<Option<StoredSession>>;

    /// Returns the session whatever its expiry.
    async fn find_by_refresh_hash(&self, token_hash: &str) -> AuthResult<Option<StoredSession>>;

    /// Removes and returns the session only if its refresh token is still
    /// active at `now`.
    async fn take_active_by_refresh_hash(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<Option<StoredSession>>;

    /// Deletes the session only if it belongs to `site_id`.
    async fn delete(&self, site_id: &str, id: Uuid) -> AuthResult<bool>;

    async fn delete_by_access_hash(&self, token_hash: &str) -> AuthResult<bool>;

    async fn delete_for_account(&self, site_id: &str, account_id: Uuid) -> AuthResult<u64>;

    /// Deletes sessions whose refresh token expired at or before `now`.
    async fn purge_expired(&self, now: DateTime<Utc>) -> AuthResult<u64>;
}

#[async_trait]
pub trait TrustConfigRepository: Send + Sync {
    async fn get(&self, site_id: &str) -> AuthResult<Option<TrustConfigRecord>>;

    async fn upsert(&self, record: &TrustConfigRecord) -> AuthResult<()>;

    async fn delete(&self, site_id: &str) -> AuthResult<bool>;
}
