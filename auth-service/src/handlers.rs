use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use common_auth::extractors::token_from_headers;
use common_auth::{
    AuthContext, AuthError, AuthMode, CanonicalIdentity, TrustMode, ValidationMethod,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::credentials::AccountProfile;
use crate::sessions::IssuedSession;
use crate::AppState;

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: &'static str,
    message: String,
}

/// Handler error. Authentication failures keep the generic rendering of
/// [`AuthError`]; only request-shape problems get a specific message.
#[derive(Debug)]
pub enum ApiError {
    Auth(AuthError),
    BadRequest(String),
}

impl From<AuthError> for ApiError {
    fn from(value: AuthError) -> Self {
        ApiError::Auth(value)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(value: JsonRejection) -> Self {
        ApiError::BadRequest(value.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", message),
            ApiError::Auth(AuthError::WeakPassword) => (
                StatusCode::BAD_REQUEST,
                "WEAK_PASSWORD",
                "password does not meet requirements".to_string(),
            ),
            ApiError::Auth(AuthError::InvalidAccountData(reason)) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST", reason.to_string())
            }
            ApiError::Auth(AuthError::DuplicateEmail) => (
                StatusCode::CONFLICT,
                "EMAIL_TAKEN",
                "an account with this email already exists".to_string(),
            ),
            ApiError::Auth(err) => {
                if !err.is_rejection() {
                    warn!(error = %err, kind = err.kind(), "auth request failed");
                }
                return err.into_response();
            }
        };
        (status, Json(ErrorResponse { code, message })).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn required(field: &'static str, value: &str) -> ApiResult<()> {
    if value.trim().is_empty() {
        Err(ApiError::BadRequest(format!("{field} is required")))
    } else {
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateProfileRequest {
    pub name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyEmailRequest {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub user: AccountProfile,
    pub token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub user: AccountProfile,
}

#[derive(Debug, Serialize)]
pub struct SiteConfigResponse {
    /// `None` when the site accepts anonymous traffic only.
    pub auth_mode: Option<AuthMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_method: Option<ValidationMethod>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
}

pub async fn health() -> &'static str {
    "ok"
}

pub async fn metrics(State(state): State<AppState>) -> ApiResult<Response> {
    state
        .metrics
        .render()
        .map_err(|err| ApiError::Auth(AuthError::Internal(err.to_string())))
}

/// Public description of how a site authenticates. Never includes key material.
pub async fn site_config(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
) -> ApiResult<Json<SiteConfigResponse>> {
    let response = match state.registry.site(&site_id).await? {
        None => SiteConfigResponse {
            auth_mode: None,
            validation_method: None,
        },
        Some(site) => SiteConfigResponse {
            auth_mode: Some(site.config.auth_mode()),
            validation_method: match &site.config.mode {
                TrustMode::External(material) => Some(material.method()),
                TrustMode::Managed { .. } => None,
            },
        },
    };
    Ok(Json(response))
}

pub async fn signup(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
    payload: Result<Json<SignupRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<UserResponse>)> {
    let Json(request) = payload?;
    required("email", &request.email)?;
    required("name", &request.name)?;

    state.registry.session_issuer(&site_id).await?;
    let created = state
        .credentials
        .create_account(&site_id, &request.email, &request.password, &request.name)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(UserResponse {
            user: AccountProfile::from(&created.account),
        }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(request) = payload?;
    required("email", &request.email)?;
    required("password", &request.password)?;

    let issuer = state.registry.session_issuer(&site_id).await?;
    let account = match state
        .credentials
        .authenticate(&site_id, &request.email, &request.password)
        .await
    {
        Ok(account) => {
            state.record_login_metric("success");
            account
        }
        Err(err) => {
            state.record_login_metric(if err.is_rejection() { "rejected" } else { "error" });
            return Err(err.into());
        }
    };

    let issued = issuer.create_session(&account).await?;
    state.metrics.session_issued();
    info!(site_id = %site_id, account_id = %account.id, "login succeeded");

    session_response(&state, AccountProfile::from(&account), issued)
}

pub async fn refresh(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
    payload: Result<Json<RefreshRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(request) = payload?;
    required("refresh_token", &request.refresh_token)?;

    let issuer = state.registry.session_issuer(&site_id).await?;
    let (account, issued) = issuer.refresh_session(request.refresh_token.trim()).await?;
    state.metrics.session_issued();

    session_response(&state, AccountProfile::from(&account), issued)
}

pub async fn logout(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let token = token_from_headers(&headers, &state.config.cookie.name)?;
    let issuer = state.registry.session_issuer(&site_id).await?;
    issuer.delete_session_by_token(&token).await?;

    let mut response = StatusCode::NO_CONTENT.into_response();
    set_cookie(&mut response, &state.config.cookie.clear())?;
    Ok(response)
}

pub async fn current_user(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<UserResponse>> {
    let account = authenticated_account(&state, &site_id, &headers).await?;
    Ok(Json(UserResponse {
        user: AccountProfile::from(&account),
    }))
}

pub async fn update_user(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<UpdateProfileRequest>, JsonRejection>,
) -> ApiResult<Json<UserResponse>> {
    let Json(request) = payload?;
    required("name", &request.name)?;

    let account = authenticated_account(&state, &site_id, &headers).await?;
    let updated = state
        .credentials
        .update_profile(account.id, &request.name, request.avatar_url.as_deref())
        .await?;
    Ok(Json(UserResponse {
        user: AccountProfile::from(&updated),
    }))
}

pub async fn delete_user(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let account = authenticated_account(&state, &site_id, &headers).await?;
    state.credentials.delete_account(account.id).await?;

    let mut response = StatusCode::NO_CONTENT.into_response();
    set_cookie(&mut response, &state.config.cookie.clear())?;
    Ok(response)
}

/// Identity of the caller for any configured site, whichever mode it uses.
pub async fn identity(context: AuthContext) -> Json<CanonicalIdentity> {
    Json(context.identity)
}

/// Always answers the same way so the endpoint cannot be used to probe for
/// registered addresses.
pub async fn request_password_reset(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
    payload: Result<Json<ResetRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<StatusResponse>)> {
    let Json(request) = payload?;
    required("email", &request.email)?;

    state.registry.session_issuer(&site_id).await?;
    if state
        .credentials
        .set_reset_token(&site_id, &request.email)
        .await?
        .is_some()
    {
        // Delivery belongs to the notification service; the token never leaves here.
        info!(site_id = %site_id, "password reset token issued");
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(StatusResponse { status: "accepted" }),
    ))
}

pub async fn reset_password(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
    payload: Result<Json<ResetPasswordRequest>, JsonRejection>,
) -> ApiResult<Json<StatusResponse>> {
    let Json(request) = payload?;
    required("token", &request.token)?;

    state.registry.session_issuer(&site_id).await?;
    state
        .credentials
        .reset_password(&site_id, &request.token, &request.password)
        .await?;
    Ok(Json(StatusResponse { status: "ok" }))
}

pub async fn verify_email(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
    payload: Result<Json<VerifyEmailRequest>, JsonRejection>,
) -> ApiResult<Json<StatusResponse>> {
    let Json(request) = payload?;
    required("token", &request.token)?;

    state.registry.session_issuer(&site_id).await?;
    state
        .credentials
        .verify_email(&site_id, &request.token)
        .await?;
    Ok(Json(StatusResponse { status: "verified" }))
}

async fn authenticated_account(
    state: &AppState,
    site_id: &str,
    headers: &HeaderMap,
) -> ApiResult<crate::repository::LocalAccount> {
    let token = token_from_headers(headers, &state.config.cookie.name)?;
    let issuer = state.registry.session_issuer(site_id).await?;

    let session = match issuer.authenticate_access_token(&token).await {
        Ok((_, session)) => {
            state.metrics.token_validation("accepted");
            session
        }
        Err(err) => {
            state.metrics.token_validation(err.kind());
            return Err(err.into());
        }
    };

    state
        .credentials
        .get_account(session.account_id)
        .await?
        .ok_or(ApiError::Auth(AuthError::SessionNotFound))
}

fn session_response(
    state: &AppState,
    user: AccountProfile,
    issued: IssuedSession,
) -> ApiResult<Response> {
    let max_age = (issued.session.access_expires_at - Utc::now()).num_seconds();
    let cookie = state.config.cookie.issue(&issued.access_token, max_age);

    let mut response = Json(SessionResponse {
        user,
        token: issued.access_token,
        refresh_token: issued.refresh_token,
        expires_at: issued.session.access_expires_at,
    })
    .into_response();
    set_cookie(&mut response, &cookie)?;
    Ok(response)
}

fn set_cookie(response: &mut Response, cookie: &str) -> ApiResult<()> {
    let value = HeaderValue::from_str(cookie)
        .map_err(|err| ApiError::Auth(AuthError::Internal(format!("invalid cookie: {err}"))))?;
    response.headers_mut().append(SET_COOKIE, value);
    Ok(())
}
