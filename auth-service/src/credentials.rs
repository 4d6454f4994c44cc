use std::sync::{Arc, OnceLock};

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{DateTime, Duration, Utc};
use common_auth::{AuthError, AuthResult, CanonicalIdentity};
use rand_core::OsRng;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::repository::{AccountRepository, LocalAccount};
use crate::tokens::{generate_opaque_token, hash_token};

/// Hash of a random throwaway password, verified against when the account
/// does not exist so both failure paths do the same work.
static DUMMY_PASSWORD_HASH: OnceLock<String> = OnceLock::new();

fn dummy_password_hash() -> &'static str {
    DUMMY_PASSWORD_HASH.get_or_init(|| hash_password(&generate_opaque_token()).unwrap_or_default())
}

/// Public view of a managed-mode account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountProfile {
    pub id: Uuid,
    pub site_id: String,
    pub email: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub verified: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&LocalAccount> for AccountProfile {
    fn from(account: &LocalAccount) -> Self {
        Self {
            id: account.id,
            site_id: account.site_id.clone(),
            email: account.email.clone(),
            name: account.name.clone(),
            avatar_url: account.avatar_url.clone(),
            verified: account.verified,
            created_at: account.created_at,
            updated_at: account.updated_at,
        }
    }
}

impl From<&LocalAccount> for CanonicalIdentity {
    fn from(account: &LocalAccount) -> Self {
        let mut identity = CanonicalIdentity::new(account.id.to_string(), account.name.clone());
        identity.email = Some(account.email.clone());
        identity.avatar_url = account.avatar_url.clone();
        identity.verified = account.verified;
        identity
    }
}

/// A freshly created account together with the one verification token that
/// will ever be handed out for it.
#[derive(Debug, Clone)]
pub struct CreatedAccount {
    pub account: LocalAccount,
    pub verification_token: String,
}

#[derive(Clone)]
pub struct CredentialStore {
    accounts: Arc<dyn AccountRepository>,
    reset_ttl: Duration,
}

impl CredentialStore {
    pub fn new(accounts: Arc<dyn AccountRepository>, reset_ttl: Duration) -> Self {
        Self {
            accounts,
            reset_ttl,
        }
    }

    pub async fn create_account(
        &self,
        site_id: &str,
        email: &str,
        password: &str,
        name: &str,
    ) -> AuthResult<CreatedAccount> {
        let email = normalize_email(email)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(AuthError::InvalidAccountData("name is required"));
        }
        let password_hash = hash_password(password)?;
        let verification_token = generate_opaque_token();

        let now = Utc::now();
        let account = LocalAccount {
            id: Uuid::new_v4(),
            site_id: site_id.to_string(),
            email,
            password_hash,
            name: name.to_string(),
            avatar_url: None,
            verified: false,
            verification_token_hash: Some(hash_token(&verification_token)),
            reset_token_hash: None,
            reset_token_expires: None,
            created_at: now,
            updated_at: now,
        };

        self.accounts.insert(&account).await?;
        info!(site_id, account_id = %account.id, "account created");

        Ok(CreatedAccount {
            account,
            verification_token,
        })
    }

    /// Unknown account and wrong password fail with the same error.
    pub async fn authenticate(
        &self,
        site_id: &str,
        email: &str,
        password: &str,
    ) -> AuthResult<LocalAccount> {
        let Ok(email) = normalize_email(email) else {
            verify_password(password, dummy_password_hash());
            return Err(AuthError::InvalidCredentials);
        };

        match self.accounts.find_by_email(site_id, &email).await? {
            Some(account) if verify_password(password, &account.password_hash) => Ok(account),
            Some(_) => Err(AuthError::InvalidCredentials),
            None => {
                verify_password(password, dummy_password_hash());
                Err(AuthError::InvalidCredentials)
            }
        }
    }

    pub async fn get_account(&self, id: Uuid) -> AuthResult<Option<LocalAccount>> {
        self.accounts.get(id).await
    }

    pub async fn find_account(&self, site_id: &str, email: &str) -> AuthResult<Option<LocalAccount>> {
        match normalize_email(email) {
            Ok(email) => self.accounts.find_by_email(site_id, &email).await,
            Err(_) => Ok(None),
        }
    }

    pub async fn update_profile(
        &self,
        id: Uuid,
        name: &str,
        avatar_url: Option<&str>,
    ) -> AuthResult<LocalAccount> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AuthError::InvalidAccountData("name is required"));
        }
        let avatar_url = avatar_url.map(str::trim).filter(|url| !url.is_empty());

        self.accounts
            .update_profile(id, name, avatar_url, Utc::now())
            .await?
            .ok_or(AuthError::SessionNotFound)
    }

    /// Issues a reset token for the account, if there is one. The caller
    /// answers identically either way.
    pub async fn set_reset_token(&self, site_id: &str, email: &str) -> AuthResult<Option<String>> {
        let Some(account) = self.find_account(site_id, email).await? else {
            return Ok(None);
        };

        let token = generate_opaque_token();
        let expires_at = Utc::now() + self.reset_ttl;
        if !self
            .accounts
            .set_reset_token(account.id, &hash_token(&token), expires_at)
            .await?
        {
            return Ok(None);
        }

        info!(site_id, account_id = %account.id, "password reset requested");
        Ok(Some(token))
    }

    pub async fn reset_password(
        &self,
        site_id: &str,
        token: &str,
        new_password: &str,
    ) -> AuthResult<()> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::ExpiredOrInvalidToken);
        }
        let password_hash = hash_password(new_password)?;

        let account_id = self
            .accounts
            .consume_reset_token(site_id, &hash_token(token), &password_hash, Utc::now())
            .await?
            .ok_or(AuthError::ExpiredOrInvalidToken)?;

        info!(site_id, account_id = %account_id, "password reset completed");
        Ok(())
    }

    pub async fn verify_email(&self, site_id: &str, token: &str) -> AuthResult<Uuid> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::ExpiredOrInvalidToken);
        }

        let account_id = self
            .accounts
            .consume_verification_token(site_id, &hash_token(token), Utc::now())
            .await?
            .ok_or(AuthError::ExpiredOrInvalidToken)?;

        info!(site_id, account_id = %account_id, "email verified");
        Ok(account_id)
    }

    /// Removes the account; its sessions go with it.
    pub async fn delete_account(&self, id: Uuid) -> AuthResult<bool> {
        let deleted = self.accounts.delete(id).await?;
        if deleted {
            info!(account_id = %id, "account deleted");
        }
        Ok(deleted)
    }
}

fn normalize_email(email: &str) -> AuthResult<String> {
    let email = email.trim().to_ascii_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(AuthError::InvalidAccountData("email is invalid"));
    }
    Ok(email)
}

fn hash_password(password: &str) -> AuthResult<String> {
    if password.trim().is_empty() {
        return Err(AuthError::WeakPassword);
    }

    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| AuthError::Internal(format!("failed to hash password: {err}")))
}

fn verify_password(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}
