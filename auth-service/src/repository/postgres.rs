use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common_auth::{AuthError, AuthResult, TrustConfigRecord};
use sqlx::{FromRow, PgPool};
use tracing::warn;
use uuid::Uuid;

use super::{
    AccountRepository, LocalAccount, SessionRepository, StoredSession, TrustConfigRepository,
};

const UNIQUE_VIOLATION: &str = "23505";

const ACCOUNT_COLUMNS: &str = "id, site_id, email, password_hash, name, avatar_url, verified, \
     verification_token, reset_token, reset_token_expires, created_at, updated_at";

const SESSION_COLUMNS: &str = "id, account_id, site_id, access_token_hash, refresh_token_hash, \
     access_expires_at, refresh_expires_at, created_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn store_error(err: sqlx::Error) -> AuthError {
    warn!(error = %err, "database operation failed");
    AuthError::Store(err.to_string())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == UNIQUE_VIOLATION)
}

#[derive(FromRow)]
struct AccountRow {
    id: Uuid,
    site_id: String,
    email: String,
    password_hash: String,
    name: String,
    avatar_url: Option<String>,
    verified: bool,
    verification_token: Option<String>,
    reset_token: Option<String>,
    reset_token_expires: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<AccountRow> for LocalAccount {
    fn from(row: AccountRow) -> Self {
        Self {
            id: row.id,
            site_id: row.site_id,
            email: row.email,
            password_hash: row.password_hash,
            name: row.name,
            avatar_url: row.avatar_url,
            verified: row.verified,
            verification_token_hash: row.verification_token,
            reset_token_hash: row.reset_token,
            reset_token_expires: row.reset_token_expires,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct SessionRow {
    id: Uuid,
    account_id: Uuid,
    site_id: String,
    access_token_hash: String,
    refresh_token_hash: String,
    access_expires_at: DateTime<Utc>,
    refresh_expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl From<SessionRow> for StoredSession {
    fn from(row: SessionRow) -> Self {
        Self {
            id: row.id,
            account_id: row.account_id,
            site_id: row.site_id,
            access_token_hash: row.access_token_hash,
            refresh_token_hash: row.refresh_token_hash,
            access_expires_at: row.access_expires_at,
            refresh_expires_at: row.refresh_expires_at,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct TrustConfigRow {
    site_id: String,
    auth_mode: String,
    validation_method: Option<String>,
    secret: Option<String>,
    public_key: Option<String>,
    jwks_endpoint: Option<String>,
    issuer: Option<String>,
    audience: Option<String>,
    expiration_buffer_seconds: i32,
}

impl From<TrustConfigRow> for TrustConfigRecord {
    fn from(row: TrustConfigRow) -> Self {
        Self {
            site_id: row.site_id,
            auth_mode: row.auth_mode,
            validation_method: row.validation_method,
            secret: row.secret,
            public_key: row.public_key,
            jwks_endpoint: row.jwks_endpoint,
            issuer: row.issuer,
            audience: row.audience,
            expiration_buffer_seconds: u32::try_from(row.expiration_buffer_seconds).unwrap_or(0),
        }
    }
}

#[async_trait]
impl AccountRepository for PgStore {
    async fn insert(&self, account: &LocalAccount) -> AuthResult<()> {
        sqlx::query(
            "INSERT INTO local_accounts (id, site_id, email, password_hash, name, avatar_url, verified, \
             verification_token, reset_token, reset_token_expires, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(account.id)
        .bind(&account.site_id)
        .bind(&account.email)
        .bind(&account.password_hash)
        .bind(&account.name)
        .bind(&account.avatar_url)
        .bind(account.verified)
        .bind(&account.verification_token_hash)
        .bind(&account.reset_token_hash)
        .bind(account.reset_token_expires)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(|err| {
            if is_unique_violation(&err) {
                AuthError::DuplicateEmail
            } else {
                store_error(err)
            }
        })
    }

    async fn get(&self, id: Uuid) -> AuthResult<Option<LocalAccount>> {
        let query = format!("SELECT {ACCOUNT_COLUMNS} FROM local_accounts WHERE id = $1");
        sqlx::query_as::<_, AccountRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map(|row| row.map(LocalAccount::from))
            .map_err(store_error)
    }

    async fn find_by_email(&self, site_id: &str, email: &str) -> AuthResult<Option<LocalAccount>> {
        let query = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM local_accounts WHERE site_id = $1 AND email = $2"
        );
        sqlx::query_as::<_, AccountRow>(&query)
            .bind(site_id)
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map(|row| row.map(LocalAccount::from))
            .map_err(store_error)
    }

    async fn update_profile(
        &self,
        id: Uuid,
        name: &str,
        avatar_url: Option<&str>,
        now: DateTime<Utc>,
    ) -> AuthResult<Option<LocalAccount>> {
        let query = format!(
            "UPDATE local_accounts SET name = $2, avatar_url = $3, updated_at = $4 \
             WHERE id = $1 RETURNING {ACCOUNT_COLUMNS}"
        );
        sqlx::query_as::<_, AccountRow>(&query)
            .bind(id)
            .bind(name)
            .bind(avatar_url)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map(|row| row.map(LocalAccount::from))
            .map_err(store_error)
    }

    async fn set_reset_token(
        &self,
        id: Uuid,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> AuthResult<bool> {
        sqlx::query(
            "UPDATE local_accounts SET reset_token = $2, reset_token_expires = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(token_hash)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map(|result| result.rows_affected() > 0)
        .map_err(store_error)
    }

    async fn consume_reset_token(
        &self,
        site_id: &str,
        token_hash: &str,
        new_password_hash: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<Option<Uuid>> {
        sqlx::query_scalar::<_, Uuid>(
            "UPDATE local_accounts \
             SET password_hash = $3, reset_token = NULL, reset_token_expires = NULL, updated_at = $4 \
             WHERE site_id = $1 AND reset_token = $2 AND reset_token_expires > $4 \
             RETURNING id",
        )
        .bind(site_id)
        .bind(token_hash)
        .bind(new_password_hash)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)
    }

    async fn consume_verification_token(
        &self,
        site_id: &str,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<Option<Uuid>> {
        sqlx::query_scalar::<_, Uuid>(
            "UPDATE local_accounts \
             SET verified = TRUE, verification_token = NULL, updated_at = $3 \
             WHERE site_id = $1 AND verification_token = $2 \
             RETURNING id",
        )
        .bind(site_id)
        .bind(token_hash)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)
    }

    async fn delete(&self, id: Uuid) -> AuthResult<bool> {
        sqlx::query("DELETE FROM local_accounts WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map(|result| result.rows_affected() > 0)
            .map_err(store_error)
    }
}

#[async_trait]
impl SessionRepository for PgStore {
    async fn insert(&self, session: &StoredSession) -> AuthResult<()> {
        sqlx::query(
            "INSERT INTO local_sessions (id, account_id, site_id, access_token_hash, refresh_token_hash, \
             access_expires_at, refresh_expires_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(session.id)
        .bind(session.account_id)
        .bind(&session.site_id)
        .bind(&session.access_token_hash)
        .bind(&session.refresh_token_hash)
        .bind(session.access_expires_at)
        .bind(session.refresh_expires_at)
        .bind(session.created_at)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(store_error)
    }

    async fn find_by_access_hash(&self, token_hash: &str) -> AuthResult<Option<StoredSession>> {
        let query =
            format!("SELECT {SESSION_COLUMNS} FROM local_sessions WHERE access_token_hash = $1");
        sqlx::query_as::<_, SessionRow>(&query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await
            .map(|row| row.map(StoredSession::from))
            .map_err(store_error)
    }

    async fn find_by_refresh_hash(&self, token_hash: &str) -> AuthResult<Option<StoredSession>> {
        let query =
            format!("SELECT {SESSION_COLUMNS} FROM local_sessions WHERE refresh_token_hash = $1");
        sqlx::query_as::<_, SessionRow>(&query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await
            .map(|row| row.map(StoredSession::from))
            .map_err(store_error)
    }

    async fn take_active_by_refresh_hash(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<Option<StoredSession>> {
        let query = format!(
            "DELETE FROM local_sessions WHERE refresh_token_hash = $1 AND refresh_expires_at > $2 \
             RETURNING {SESSION_COLUMNS}"
        );
        sqlx::query_as::<_, SessionRow>(&query)
            .bind(token_hash)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map(|row| row.map(StoredSession::from))
            .map_err(store_error)
    }

    async fn delete(&self, site_id: &str, id: Uuid) -> AuthResult<bool> {
        sqlx::query("DELETE FROM local_sessions WHERE id = $1 AND site_id = $2")
            .bind(id)
            .bind(site_id)
            .execute(&self.pool)
            .await
            .map(|result| result.rows_affected() > 0)
            .map_err(store_error)
    }

    async fn delete_by_access_hash(&self, token_hash: &str) -> AuthResult<bool> {
        sqlx::query("DELETE FROM local_sessions WHERE access_token_hash = $1")
            .bind(token_hash)
            .execute(&self.pool)
            .await
            .map(|result| result.rows_affected() > 0)
            .map_err(store_error)
    }

    async fn delete_for_account(&self, site_id: &str, account_id: Uuid) -> AuthResult<u64> {
        sqlx::query("DELETE FROM local_sessions WHERE account_id = $1 AND site_id = $2")
            .bind(account_id)
            .bind(site_id)
            .execute(&self.pool)
            .await
            .map(|result| result.rows_affected())
            .map_err(store_error)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> AuthResult<u64> {
        sqlx::query("DELETE FROM local_sessions WHERE refresh_expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map(|result| result.rows_affected())
            .map_err(store_error)
    }
}

#[async_trait]
impl TrustConfigRepository for PgStore {
    async fn get(&self, site_id: &str) -> AuthResult<Option<TrustConfigRecord>> {
        sqlx::query_as::<_, TrustConfigRow>(
            "SELECT site_id, auth_mode, validation_method, secret, public_key, jwks_endpoint, \
             issuer, audience, expiration_buffer_seconds \
             FROM site_auth_configs WHERE site_id = $1",
        )
        .bind(site_id)
        .fetch_optional(&self.pool)
        .await
        .map(|row| row.map(TrustConfigRecord::from))
        .map_err(store_error)
    }

    async fn upsert(&self, record: &TrustConfigRecord) -> AuthResult<()> {
        let buffer = i32::try_from(record.expiration_buffer_seconds)
            .map_err(|_| AuthError::InvalidTrustConfig("expiration buffer is too large".into()))?;

        sqlx::query(
            "INSERT INTO site_auth_configs (site_id, auth_mode, validation_method, secret, public_key, \
             jwks_endpoint, issuer, audience, expiration_buffer_seconds) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (site_id) DO UPDATE SET auth_mode = EXCLUDED.auth_mode, \
             validation_method = EXCLUDED.validation_method, secret = EXCLUDED.secret, \
             public_key = EXCLUDED.public_key, jwks_endpoint = EXCLUDED.jwks_endpoint, \
             issuer = EXCLUDED.issuer, audience = EXCLUDED.audience, \
             expiration_buffer_seconds = EXCLUDED.expiration_buffer_seconds, updated_at = NOW()",
        )
        .bind(&record.site_id)
        .bind(&record.auth_mode)
        .bind(&record.validation_method)
        .bind(&record.secret)
        .bind(&record.public_key)
        .bind(&record.jwks_endpoint)
        .bind(&record.issuer)
        .bind(&record.audience)
        .bind(buffer)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(store_error)
    }

    async fn delete(&self, site_id: &str) -> AuthResult<bool> {
        sqlx::query("DELETE FROM site_auth_configs WHERE site_id = $1")
            .bind(site_id)
            .execute(&self.pool)
            .await
            .map(|result| result.rows_affected() > 0)
            .map_err(store_error)
    }
}
