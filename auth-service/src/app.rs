use std::sync::Arc;

use anyhow::Result;
use axum::extract::FromRef;
use axum::http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use common_auth::ValidatorResolver;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::warn;

use crate::config::ServiceConfig;
use crate::credentials::CredentialStore;
use crate::handlers;
use crate::metrics::AuthMetrics;
use crate::registry::ValidatorRegistry;
use crate::repository::memory::MemoryStore;
use crate::repository::{AccountRepository, SessionRepository, TrustConfigRepository};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ValidatorRegistry>,
    pub credentials: Arc<CredentialStore>,
    pub config: Arc<ServiceConfig>,
    pub metrics: Arc<AuthMetrics>,
}

impl FromRef<AppState> for Arc<dyn ValidatorResolver> {
    fn from_ref(state: &AppState) -> Self {
        state.registry.clone()
    }
}

impl FromRef<AppState> for Arc<ServiceConfig> {
    fn from_ref(state: &AppState) -> Self {
        state.config.clone()
    }
}

impl AppState {
    pub fn new(
        accounts: Arc<dyn AccountRepository>,
        sessions: Arc<dyn SessionRepository>,
        configs: Arc<dyn TrustConfigRepository>,
        config: ServiceConfig,
    ) -> Result<Self> {
        let registry = ValidatorRegistry::new(
            configs,
            accounts.clone(),
            sessions,
            config.validator_options(),
            config.session_ttl(),
        )
        .with_cookie_name(config.cookie.name.clone());
        let credentials = CredentialStore::new(accounts, config.reset_token_ttl());

        Ok(Self {
            registry: Arc::new(registry),
            credentials: Arc::new(credentials),
            config: Arc::new(config),
            metrics: Arc::new(AuthMetrics::new()?),
        })
    }

    /// State backed by a fresh [`MemoryStore`], returned alongside so callers
    /// can seed it.
    pub fn in_memory(config: ServiceConfig) -> Result<(Self, MemoryStore)> {
        let store = MemoryStore::new();
        let state = Self::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            config,
        )?;
        Ok((state, store))
    }

    pub fn record_login_metric(&self, outcome: &str) {
        self.metrics.login_attempt(outcome);
    }
}

pub fn build_router(state: AppState) -> Router {
    let site_auth = Router::new()
        .route("/config", get(handlers::site_config))
        .route("/signup", post(handlers::signup))
        .route("/login", post(handlers::login))
        .route("/refresh", post(handlers::refresh))
        .route("/logout", post(handlers::logout))
        .route(
            "/user",
            get(handlers::current_user)
                .put(handlers::update_user)
                .delete(handlers::delete_user),
        )
        .route("/identity", get(handlers::identity))
        .route("/password/reset-request", post(handlers::request_password_reset))
        .route("/password/reset", post(handlers::reset_password))
        .route("/verify-email", post(handlers::verify_email));

    Router::new()
        .route("/healthz", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .nest("/api/v1/sites/:site_id/auth", site_auth)
        .with_state(state)
}

/// Cookies are only honored cross-origin for the configured origins. With
/// none configured any origin may call, but only with a bearer token.
pub fn cors_layer(config: &ServiceConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([ACCEPT, CONTENT_TYPE, AUTHORIZATION]);

    if config.allowed_origins.is_empty() {
        return cors.allow_origin(AllowOrigin::mirror_request());
    }

    let origins = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "ignoring unparseable allowed origin");
                None
            }
        })
        .collect::<Vec<_>>();
    cors.allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
}
