use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{FromRef, FromRequestParts, Path};
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::{request::Parts, HeaderMap, HeaderValue};

use crate::error::{AuthError, AuthResult};
use crate::identity::CanonicalIdentity;
use crate::validator::Validator;

/// Cookie carrying the access token for browser clients.
pub const AUTH_COOKIE_NAME: &str = "kotomi_auth_token";

/// Looks up the validator for a tenant. Implemented by whatever owns the
/// trust configurations.
#[async_trait]
pub trait ValidatorResolver: Send + Sync {
    async fn resolve(&self, site_id: &str) -> AuthResult<Arc<Validator>>;

    /// Cookie consulted when no `Authorization` header is present.
    fn cookie_name(&self) -> &str {
        AUTH_COOKIE_NAME
    }
}

/// Raw access token taken from the `Authorization` header or, failing that,
/// the auth cookie. Not validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerToken(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for BearerToken
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        token_from_headers(&parts.headers, AUTH_COOKIE_NAME).map(BearerToken)
    }
}

/// Validated identity for the tenant named by the `site_id` path segment.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub site_id: String,
    pub identity: CanonicalIdentity,
    pub token: String,
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthContext
where
    Arc<dyn ValidatorResolver>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let resolver = Arc::<dyn ValidatorResolver>::from_ref(state);

        let Path(params) = Path::<HashMap<String, String>>::from_request_parts(parts, state)
            .await
            .map_err(|err| AuthError::Internal(format!("route parameters: {err}")))?;
        let site_id = params
            .get("site_id")
            .cloned()
            .ok_or_else(|| AuthError::Internal("route has no site_id segment".into()))?;

        let token = token_from_headers(&parts.headers, resolver.cookie_name())?;
        let validator = resolver.resolve(&site_id).await?;
        let identity = validator.validate(&token).await?;

        Ok(Self {
            site_id,
            identity,
            token,
        })
    }
}

/// Prefers `Authorization: Bearer`; falls back to the named cookie.
pub fn token_from_headers(headers: &HeaderMap, cookie_name: &str) -> AuthResult<String> {
    if let Some(value) = headers.get(AUTHORIZATION) {
        return parse_bearer(value);
    }
    token_from_cookies(headers, cookie_name).ok_or(AuthError::MissingCredentials)
}

pub fn parse_bearer(value: &HeaderValue) -> AuthResult<String> {
    let raw = value
        .to_str()
        .map_err(|_| AuthError::MissingCredentials)?
        .trim();

    let token = raw
        .strip_prefix("Bearer ")
        .ok_or(AuthError::MissingCredentials)?
        .trim();

    if token.is_empty() {
        return Err(AuthError::MissingCredentials);
    }

    Ok(token.to_owned())
}

pub fn token_from_cookies(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == cookie_name)
        .map(|(_, value)| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KeyMaterial, TrustConfig};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};
    use chrono::Utc;
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use serde_json::json;
    use tower::ServiceExt;

    #[test]
    fn parse_bearer_accepts_valid_token() {
        let header = HeaderValue::from_static("Bearer abc.def.ghi");
        let token = parse_bearer(&header).expect("token");
        assert_eq!(token, "abc.def.ghi");
    }

    #[test]
    fn parse_bearer_rejects_wrong_scheme() {
        let header = HeaderValue::from_static("Basic credentials");
        let err = parse_bearer(&header).expect_err("should reject");
        assert!(matches!(err, AuthError::MissingCredentials));
    }

    #[test]
    fn parse_bearer_rejects_empty_value() {
        let header = HeaderValue::from_static("Bearer    ");
        let err = parse_bearer(&header).expect_err("should reject empty token");
        assert!(matches!(err, AuthError::MissingCredentials));
    }

    #[test]
    fn cookie_is_used_when_header_is_absent() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; kotomi_auth_token=abc.def.ghi"),
        );
        assert_eq!(
            token_from_headers(&headers, AUTH_COOKIE_NAME).expect("cookie token"),
            "abc.def.ghi"
        );
    }

    #[test]
    fn header_wins_over_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));
        headers.insert(COOKIE, HeaderValue::from_static("kotomi_auth_token=from-cookie"));
        assert_eq!(
            token_from_headers(&headers, AUTH_COOKIE_NAME).expect("token"),
            "from-header"
        );
    }

    #[test]
    fn no_credentials_is_reported() {
        let err = token_from_headers(&HeaderMap::new(), AUTH_COOKIE_NAME).expect_err("nothing");
        assert!(matches!(err, AuthError::MissingCredentials));
    }

    struct SingleTenant(Arc<Validator>);

    #[async_trait]
    impl ValidatorResolver for SingleTenant {
        async fn resolve(&self, site_id: &str) -> AuthResult<Arc<Validator>> {
            if site_id == self.0.site_id() {
                Ok(self.0.clone())
            } else {
                Err(AuthError::InvalidTrustConfig(format!("unknown site {site_id}")))
            }
        }
    }

    fn app() -> Router {
        let config = TrustConfig::external("site-1", KeyMaterial::Hmac { secret: "s".into() });
        let validator = Arc::new(Validator::new(&config).expect("validator"));
        let resolver: Arc<dyn ValidatorResolver> = Arc::new(SingleTenant(validator));

        Router::new()
            .route(
                "/sites/:site_id/me",
                get(|ctx: AuthContext| async move { Json(ctx.identity) }),
            )
            .with_state(resolver)
    }

    fn token() -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &json!({
                "sub": "u1",
                "exp": Utc::now().timestamp() + 600,
                "kotomi_user": { "id": "u1", "name": "Jane" }
            }),
            &EncodingKey::from_secret(b"s"),
        )
        .expect("sign token")
    }

    #[tokio::test]
    async fn auth_context_validates_against_path_tenant() {
        let request = Request::builder()
            .uri("/sites/site-1/me")
            .header(AUTHORIZATION, format!("Bearer {}", token()))
            .body(Body::empty())
            .expect("request");
        let response = app().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn auth_context_rejects_missing_token() {
        let request = Request::builder()
            .uri("/sites/site-1/me")
            .body(Body::empty())
            .expect("request");
        let response = app().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
