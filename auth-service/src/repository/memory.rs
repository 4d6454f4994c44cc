use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common_auth::{AuthError, AuthResult, TrustConfigRecord};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    AccountRepository, LocalAccount, SessionRepository, StoredSession, TrustConfigRepository,
};

#[derive(Default)]
struct State {
    accounts: HashMap<Uuid, LocalAccount>,
    sessions: HashMap<Uuid, StoredSession>,
    trust_configs: HashMap<String, TrustConfigRecord>,
}

/// In-process store used by tests and when no `DATABASE_URL` is configured.
///
/// Accounts and sessions share one lock so account deletion cascades
/// atomically, like the foreign key does in Postgres.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn session_count(&self) -> usize {
        self.state.read().await.sessions.len()
    }
}

#[async_trait]
impl AccountRepository for MemoryStore {
    async fn insert(&self, account: &LocalAccount) -> AuthResult<()> {
        let mut state = self.state.write().await;
        let taken = state
            .accounts
            .values()
            .any(|existing| existing.site_id == account.site_id && existing.email == account.email);
        if taken {
            return Err(AuthError::DuplicateEmail);
        }
        state.accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> AuthResult<Option<LocalAccount>> {
        Ok(self.state.read().await.accounts.get(&id).cloned())
    }

    async fn find_by_email(&self, site_id: &str, email: &str) -> AuthResult<Option<LocalAccount>> {
        let state = self.state.read().await;
        Ok(state
            .accounts
            .values()
            .find(|account| account.site_id == site_id && account.email == email)
            .cloned())
    }

    async fn update_profile(
        &self,
        id: Uuid,
        name: &str,
        avatar_url: Option<&str>,
        now: DateTime<Utc>,
    ) -> AuthResult<Option<LocalAccount>> {
        let mut state = self.state.write().await;
        Ok(state.accounts.get_mut(&id).map(|account| {
            account.name = name.to_string();
            account.avatar_url = avatar_url.map(str::to_string);
            account.updated_at = now;
            account.clone()
        }))
    }

    async fn set_reset_token(
        &self,
        id: Uuid,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> AuthResult<bool> {
        let mut state = self.state.write().await;
        Ok(match state.accounts.get_mut(&id) {
            Some(account) => {
                account.reset_token_hash = Some(token_hash.to_string());
                account.reset_token_expires = Some(expires_at);
                true
            }
            None => false,
        })
    }

    async fn consume_reset_token(
        &self,
        site_id: &str,
        token_hash: &str,
        new_password_hash: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<Option<Uuid>> {
        let mut state = self.state.write().await;
        let account = state.accounts.values_mut().find(|account| {
            account.site_id == site_id
                && account.reset_token_hash.as_deref() == Some(token_hash)
                && account.reset_token_expires.is_some_and(|expires| now < expires)
        });

        Ok(account.map(|account| {
            account.password_hash = new_password_hash.to_string();
            account.reset_token_hash = None;
            account.reset_token_expires = None;
            account.updated_at = now;
            account.id
        }))
    }

    async fn consume_verification_token(
        &self,
        site_id: &str,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<Option<Uuid>> {
        let mut state = self.state.write().await;
        let account = state.accounts.values_mut().find(|account| {
            account.site_id == site_id
                && account.verification_token_hash.as_deref() == Some(token_hash)
        });

        Ok(account.map(|account| {
            account.verified = true;
            account.verification_token_hash = None;
            account.updated_at = now;
            account.id
        }))
    }

    async fn delete(&self, id: Uuid) -> AuthResult<bool> {
        let mut state = self.state.write().await;
        if state.accounts.remove(&id).is_none() {
            return Ok(false);
        }
        state.sessions.retain(|_, session| session.account_id != id);
        Ok(true)
    }
}

#[async_trait]
impl SessionRepository for MemoryStore {
    async fn insert(&self, session: &StoredSession) -> AuthResult<()> {
        let mut state = self.state.write().await;
        if !state.accounts.contains_key(&session.account_id) {
            return Err(AuthError::Store(format!(
                "account {} does not exist",
                session.account_id
            )));
        }
        state.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn find_by_access_hash(&self, token_hash: &str) -> AuthResult<Option<StoredSession>> {
        let state = self.state.read().await;
        Ok(state
            .sessions
            .values()
            .find(|session| session.access_token_hash == token_hash)
            .cloned())
    }

    async fn find_by_refresh_hash(&self, token_hash: &str) -> AuthResult<Option<StoredSession>> {
        let state = self.state.read().await;
        Ok(state
            .sessions
            .values()
            .find(|session| session.refresh_token_hash == token_hash)
            .cloned())
    }

    async fn take_active_by_refresh_hash(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<Option<StoredSession>> {
        let mut state = self.state.write().await;
        let id = state
            .sessions
            .values()
            .find(|session| {
                session.refresh_token_hash == token_hash && session.refresh_active_at(now)
            })
            .map(|session| session.id);
        Ok(id.and_then(|id| state.sessions.remove(&id)))
    }

    async fn delete(&self, site_id: &str, id: Uuid) -> AuthResult<bool> {
        let mut state = self.state.write().await;
        match state.sessions.get(&id) {
            Some(session) if session.site_id == site_id => {
                state.sessions.remove(&id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_by_access_hash(&self, token_hash: &str) -> AuthResult<bool> {
        let mut state = self.state.write().await;
        let before = state.sessions.len();
        state
            .sessions
            .retain(|_, session| session.access_token_hash != token_hash);
        Ok(state.sessions.len() != before)
    }

    async fn delete_for_account(&self, site_id: &str, account_id: Uuid) -> AuthResult<u64> {
        let mut state = self.state.write().await;
        let before = state.sessions.len();
        state
            .sessions
            .retain(|_, session| session.account_id != account_id || session.site_id != site_id);
        Ok((before - state.sessions.len()) as u64)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> AuthResult<u64> {
        let mut state = self.state.write().await;
        let before = state.sessions.len();
        state
            .sessions
            .retain(|_, session| session.refresh_active_at(now));
        Ok((before - state.sessions.len()) as u64)
    }
}

#[async_trait]
impl TrustConfigRepository for MemoryStore {
    async fn get(&self, site_id: &str) -> AuthResult<Option<TrustConfigRecord>> {
        Ok(self.state.read().await.trust_configs.get(site_id).cloned())
    }

    async fn upsert(&self, record: &TrustConfigRecord) -> AuthResult<()> {
        let mut state = self.state.write().await;
        state
            .trust_configs
            .insert(record.site_id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, site_id: &str) -> AuthResult<bool> {
        Ok(self
            .state
            .write()
            .await
            .trust_configs
            .remove(site_id)
            .is_some())
    }
}
