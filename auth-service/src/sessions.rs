use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use common_auth::{AuthError, AuthResult, CanonicalIdentity, TrustConfig, Validator};
use tracing::{debug, info};
use uuid::Uuid;

use crate::repository::{AccountRepository, LocalAccount, SessionRepository, StoredSession};
use crate::tokens::{generate_opaque_token, hash_token, AccessTokenSigner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTtl {
    pub access: Duration,
    pub refresh: Duration,
}

impl Default for SessionTtl {
    fn default() -> Self {
        Self {
            access: Duration::minutes(60),
            refresh: Duration::days(30),
        }
    }
}

/// The raw tokens of a new session. They are not stored anywhere and cannot
/// be recovered later.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub session: StoredSession,
    pub access_token: String,
    pub refresh_token: String,
}

/// Mints and tracks sessions for one managed-mode tenant.
#[derive(Clone)]
pub struct SessionIssuer {
    site_id: String,
    signer: Arc<AccessTokenSigner>,
    validator: Validator,
    sessions: Arc<dyn SessionRepository>,
    accounts: Arc<dyn AccountRepository>,
    ttl: SessionTtl,
}

impl SessionIssuer {
    /// Fails with `InvalidTrustConfig` unless `config` is a managed-mode config.
    pub fn new(
        config: &TrustConfig,
        sessions: Arc<dyn SessionRepository>,
        accounts: Arc<dyn AccountRepository>,
        ttl: SessionTtl,
    ) -> AuthResult<Self> {
        Ok(Self {
            site_id: config.site_id.clone(),
            signer: Arc::new(AccessTokenSigner::for_tenant(config)?),
            validator: Validator::new(config)?,
            sessions,
            accounts,
            ttl,
        })
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn ttl(&self) -> SessionTtl {
        self.ttl
    }

    pub async fn create_session(&self, account: &LocalAccount) -> AuthResult<IssuedSession> {
        if account.site_id != self.site_id {
            return Err(AuthError::InvalidCredentials);
        }

        let now = Utc::now();
        let access_expires_at = expires_after(now, self.ttl.access)?;
        let refresh_expires_at = expires_after(now, self.ttl.refresh)?;

        let access_token =
            self.signer
                .sign(&CanonicalIdentity::from(account), now, access_expires_at)?;
        let refresh_token = generate_opaque_token();

        let session = StoredSession {
            id: Uuid::new_v4(),
            account_id: account.id,
            site_id: self.site_id.clone(),
            access_token_hash: hash_token(&access_token),
            refresh_token_hash: hash_token(&refresh_token),
            access_expires_at,
            refresh_expires_at,
            created_at: now,
        };
        self.sessions.insert(&session).await?;
        info!(site_id = %self.site_id, account_id = %account.id, session_id = %session.id, "session created");

        Ok(IssuedSession {
            session,
            access_token,
            refresh_token,
        })
    }

    /// Active session for an access token; expired sessions count as absent.
    pub async fn get_session_by_token(&self, access_token: &str) -> AuthResult<StoredSession> {
        self.get_session_by_token_at(access_token, Utc::now()).await
    }

    pub async fn get_session_by_token_at(
        &self,
        access_token: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<StoredSession> {
        let session = self.find_by_access_token_raw(access_token).await?;
        if session.access_active_at(now) {
            Ok(session)
        } else {
            Err(AuthError::SessionNotFound)
        }
    }

    /// Active session for a refresh token; expired sessions count as absent.
    pub async fn get_session_by_refresh_token(
        &self,
        refresh_token: &str,
    ) -> AuthResult<StoredSession> {
        self.get_session_by_refresh_token_at(refresh_token, Utc::now())
            .await
    }

    pub async fn get_session_by_refresh_token_at(
        &self,
        refresh_token: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<StoredSession> {
        let session = self.find_by_refresh_token_raw(refresh_token).await?;
        if session.refresh_active_at(now) {
            Ok(session)
        } else {
            Err(AuthError::SessionNotFound)
        }
    }

    /// Ignores expiry. For diagnostics only.
    pub async fn find_by_access_token_raw(&self, access_token: &str) -> AuthResult<StoredSession> {
        self.sessions
            .find_by_access_hash(&hash_token(access_token))
            .await?
            .filter(|session| session.site_id == self.site_id)
            .ok_or(AuthError::SessionNotFound)
    }

    /// Ignores expiry. For diagnostics only.
    pub async fn find_by_refresh_token_raw(
        &self,
        refresh_token: &str,
    ) -> AuthResult<StoredSession> {
        self.sessions
            .find_by_refresh_hash(&hash_token(refresh_token))
            .await?
            .filter(|session| session.site_id == self.site_id)
            .ok_or(AuthError::SessionNotFound)
    }

    /// Validates the access token and requires its session to be active, so
    /// a logged-out token stops working before it expires.
    pub async fn authenticate_access_token(
        &self,
        access_token: &str,
    ) -> AuthResult<(CanonicalIdentity, StoredSession)> {
        let identity = self.validator.validate(access_token).await?;
        let session = self.get_session_by_token(access_token).await?;
        if session.account_id.to_string() != identity.id {
            return Err(AuthError::SessionNotFound);
        }
        Ok((identity, session))
    }

    /// Exchanges an active refresh token for a new session. The old session
    /// is removed, so each refresh token works once.
    pub async fn refresh_session(
        &self,
        refresh_token: &str,
    ) -> AuthResult<(LocalAccount, IssuedSession)> {
        let hash = hash_token(refresh_token);
        let current = self
            .sessions
            .find_by_refresh_hash(&hash)
            .await?
            .filter(|session| session.site_id == self.site_id)
            .ok_or(AuthError::SessionNotFound)?;

        let previous = self
            .sessions
            .take_active_by_refresh_hash(&hash, Utc::now())
            .await?
            .ok_or(AuthError::SessionNotFound)?;
        debug!(session_id = %previous.id, "refresh token consumed");

        let account = self
            .accounts
            .get(current.account_id)
            .await?
            .ok_or(AuthError::SessionNotFound)?;
        let issued = self.create_session(&account).await?;
        Ok((account, issued))
    }

    /// Logout. Fails with `SessionNotFound` when nothing was deleted.
    pub async fn delete_session_by_token(&self, access_token: &str) -> AuthResult<()> {
        let session = self.find_by_access_token_raw(access_token).await?;
        if self
            .sessions
            .delete_by_access_hash(&session.access_token_hash)
            .await?
        {
            info!(site_id = %self.site_id, session_id = %session.id, "session deleted");
            Ok(())
        } else {
            Err(AuthError::SessionNotFound)
        }
    }

    /// Sessions of other sites are left alone and reported as not deleted.
    pub async fn delete_session(&self, id: Uuid) -> AuthResult<bool> {
        let removed = self.sessions.delete(&self.site_id, id).await?;
        if removed {
            info!(site_id = %self.site_id, session_id = %id, "session deleted");
        }
        Ok(removed)
    }

    pub async fn delete_sessions_for_account(&self, account_id: Uuid) -> AuthResult<u64> {
        let removed = self
            .sessions
            .delete_for_account(&self.site_id, account_id)
            .await?;
        info!(site_id = %self.site_id, account_id = %account_id, removed, "sessions revoked");
        Ok(removed)
    }

    /// Deletes sessions whose refresh token expired by `now`. Store-wide.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> AuthResult<u64> {
        let removed = self.sessions.purge_expired(now).await?;
        if removed > 0 {
            info!(removed, "expired sessions purged");
        }
        Ok(removed)
    }
}

fn expires_after(now: DateTime<Utc>, ttl: Duration) -> AuthResult<DateTime<Utc>> {
    now.checked_add_signed(ttl)
        .ok_or_else(|| AuthError::Internal(format!("session ttl of {ttl} is out of range")))
}
