use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common_auth::{
    AuthError, AuthResult, TrustConfig, TrustConfigRecord, TrustMode, Validator,
    ValidatorOptions, ValidatorResolver, AUTH_COOKIE_NAME,
};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::repository::{AccountRepository, SessionRepository, TrustConfigRepository};
use crate::sessions::{SessionIssuer, SessionTtl};

/// Everything built from one tenant's trust configuration.
pub struct SiteAuth {
    pub config: TrustConfig,
    pub validator: Arc<Validator>,
    /// Present only for managed-mode sites.
    pub sessions: Option<Arc<SessionIssuer>>,
}

/// Per-site cache of validation pipelines and session issuers.
///
/// Entries are built lazily from the stored configuration and dropped by
/// [`ValidatorRegistry::invalidate`] whenever that configuration changes.
pub struct ValidatorRegistry {
    configs: Arc<dyn TrustConfigRepository>,
    accounts: Arc<dyn AccountRepository>,
    sessions: Arc<dyn SessionRepository>,
    options: ValidatorOptions,
    ttl: SessionTtl,
    cookie_name: String,
    sites: RwLock<SiteCache>,
}

/// Cached entries plus a per-site generation that every invalidation bumps.
/// A pipeline is only cached if its generation did not move while it was
/// being built.
#[derive(Default)]
struct SiteCache {
    entries: HashMap<String, Arc<SiteAuth>>,
    generations: HashMap<String, u64>,
}

impl SiteCache {
    fn generation(&self, site_id: &str) -> u64 {
        self.generations.get(site_id).copied().unwrap_or(0)
    }
}

impl ValidatorRegistry {
    pub fn new(
        configs: Arc<dyn TrustConfigRepository>,
        accounts: Arc<dyn AccountRepository>,
        sessions: Arc<dyn SessionRepository>,
        options: ValidatorOptions,
        ttl: SessionTtl,
    ) -> Self {
        Self {
            configs,
            accounts,
            sessions,
            options,
            ttl,
            cookie_name: AUTH_COOKIE_NAME.to_string(),
            sites: RwLock::new(SiteCache::default()),
        }
    }

    pub fn with_cookie_name(mut self, cookie_name: impl Into<String>) -> Self {
        self.cookie_name = cookie_name.into();
        self
    }

    /// `None` means the site has no trust configuration and runs anonymously.
    pub async fn site(&self, site_id: &str) -> AuthResult<Option<Arc<SiteAuth>>> {
        loop {
            let generation = {
                let sites = self.sites.read().await;
                if let Some(site) = sites.entries.get(site_id) {
                    return Ok(Some(site.clone()));
                }
                sites.generation(site_id)
            };

            let record = self.configs.get(site_id).await?;
            let site = match record {
                Some(record) => Some(Arc::new(self.build(TrustConfig::try_from(record)?)?)),
                None => None,
            };

            let mut sites = self.sites.write().await;
            if sites.generation(site_id) != generation {
                debug!(site_id, "site auth changed while loading, retrying");
                continue;
            }
            let Some(site) = site else {
                return Ok(None);
            };
            let entry = sites
                .entries
                .entry(site_id.to_string())
                .or_insert(site)
                .clone();
            debug!(site_id, mode = ?entry.config.auth_mode(), "site auth loaded");
            return Ok(Some(entry));
        }
    }

    pub async fn validator(&self, site_id: &str) -> AuthResult<Option<Arc<Validator>>> {
        Ok(self.site(site_id).await?.map(|site| site.validator.clone()))
    }

    /// Session issuer of a managed-mode site. Any other site is reported as
    /// not configured for local accounts.
    pub async fn session_issuer(&self, site_id: &str) -> AuthResult<Arc<SessionIssuer>> {
        self.site(site_id)
            .await?
            .and_then(|site| site.sessions.clone())
            .ok_or_else(|| AuthError::SiteNotConfigured(site_id.to_string()))
    }

    pub async fn invalidate(&self, site_id: &str) {
        let mut sites = self.sites.write().await;
        *sites.generations.entry(site_id.to_string()).or_insert(0) += 1;
        if sites.entries.remove(site_id).is_some() {
            debug!(site_id, "site auth invalidated");
        }
    }

    /// Validates and stores a configuration, then drops the cached pipeline.
    pub async fn save_config(&self, record: TrustConfigRecord) -> AuthResult<TrustConfig> {
        let config = TrustConfig::try_from(record)?;
        self.configs
            .upsert(&TrustConfigRecord::from(&config))
            .await?;
        self.invalidate(&config.site_id).await;
        info!(site_id = %config.site_id, mode = ?config.auth_mode(), "trust configuration saved");
        Ok(config)
    }

    /// Reverts the site to anonymous mode.
    pub async fn delete_config(&self, site_id: &str) -> AuthResult<bool> {
        let removed = self.configs.delete(site_id).await?;
        self.invalidate(site_id).await;
        if removed {
            info!(site_id, "trust configuration deleted");
        }
        Ok(removed)
    }

    fn build(&self, config: TrustConfig) -> AuthResult<SiteAuth> {
        let validator = Arc::new(Validator::with_options(&config, &self.options)?);
        let sessions = match config.mode {
            TrustMode::Managed { .. } => Some(Arc::new(SessionIssuer::new(
                &config,
                self.sessions.clone(),
                self.accounts.clone(),
                self.ttl,
            )?)),
            TrustMode::External(_) => None,
        };

        Ok(SiteAuth {
            config,
            validator,
            sessions,
        })
    }
}

#[async_trait]
impl ValidatorResolver for ValidatorRegistry {
    async fn resolve(&self, site_id: &str) -> AuthResult<Arc<Validator>> {
        self.validator(site_id)
            .await?
            .ok_or_else(|| AuthError::SiteNotConfigured(site_id.to_string()))
    }

    fn cookie_name(&self) -> &str {
        &self.cookie_name
    }
}
