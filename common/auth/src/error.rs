use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no bearer token was presented")]
    MissingCredentials,
    #[error("token is malformed: {0}")]
    MalformedToken(String),
    #[error("token algorithm '{0}' is not accepted by this trust policy")]
    UnsupportedAlgorithm(String),
    #[error("token signature is invalid")]
    SignatureInvalid,
    #[error("unable to resolve verification key: {reason}")]
    KeyResolutionFailed { reason: String, transient: bool },
    #[error("issuer claim does not match")]
    IssuerMismatch,
    #[error("audience claim does not match")]
    AudienceMismatch,
    #[error("token has expired")]
    Expired,
    #[error("token is not valid yet")]
    NotYetValid,
    #[error("claim '{0}' has an invalid type")]
    ClaimTypeInvalid(&'static str),
    #[error("identity claim is missing or malformed: {0}")]
    MissingIdentityClaim(String),
    #[error("an account with this email already exists for the site")]
    DuplicateEmail,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("token is expired or invalid")]
    ExpiredOrInvalidToken,
    #[error("session not found")]
    SessionNotFound,
    #[error("site '{0}' has no usable trust configuration")]
    SiteNotConfigured(String),
    #[error("operation canceled before completion")]
    Canceled,
    #[error("password does not meet requirements")]
    WeakPassword,
    #[error("invalid account data: {0}")]
    InvalidAccountData(&'static str),
    #[error("invalid trust configuration: {0}")]
    InvalidTrustConfig(String),
    #[error("store failure: {0}")]
    Store(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// True for deliberate authentication rejections. Everything else is an
    /// infrastructure or configuration failure and is reported distinctly.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            AuthError::MissingCredentials
                | AuthError::MalformedToken(_)
                | AuthError::UnsupportedAlgorithm(_)
                | AuthError::SignatureInvalid
                | AuthError::KeyResolutionFailed {
                    transient: false,
                    ..
                }
                | AuthError::IssuerMismatch
                | AuthError::AudienceMismatch
                | AuthError::Expired
                | AuthError::NotYetValid
                | AuthError::ClaimTypeInvalid(_)
                | AuthError::MissingIdentityClaim(_)
                | AuthError::DuplicateEmail
                | AuthError::InvalidCredentials
                | AuthError::ExpiredOrInvalidToken
                | AuthError::SessionNotFound
                | AuthError::SiteNotConfigured(_)
                | AuthError::WeakPassword
                | AuthError::InvalidAccountData(_)
        )
    }

    /// Transient failures a caller may choose to retry. Nothing in this crate
    /// retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AuthError::KeyResolutionFailed {
                transient: true,
                ..
            } | AuthError::Canceled
                | AuthError::Store(_)
        )
    }

    /// Stable label for metrics. Never sent to clients.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::MissingCredentials => "missing_credentials",
            AuthError::MalformedToken(_) => "malformed_token",
            AuthError::UnsupportedAlgorithm(_) => "unsupported_algorithm",
            AuthError::SignatureInvalid => "signature_invalid",
            AuthError::KeyResolutionFailed { .. } => "key_resolution_failed",
            AuthError::IssuerMismatch => "issuer_mismatch",
            AuthError::AudienceMismatch => "audience_mismatch",
            AuthError::Expired => "expired",
            AuthError::NotYetValid => "not_yet_valid",
            AuthError::ClaimTypeInvalid(_) => "claim_type_invalid",
            AuthError::MissingIdentityClaim(_) => "missing_identity_claim",
            AuthError::DuplicateEmail => "duplicate_email",
            AuthError::InvalidCredentials => "invalid_credentials",
            AuthError::ExpiredOrInvalidToken => "expired_or_invalid_token",
            AuthError::SessionNotFound => "session_not_found",
            AuthError::SiteNotConfigured(_) => "site_not_configured",
            AuthError::Canceled => "canceled",
            AuthError::WeakPassword => "weak_password",
            AuthError::InvalidAccountData(_) => "invalid_account_data",
            AuthError::InvalidTrustConfig(_) => "invalid_trust_config",
            AuthError::Store(_) => "store",
            AuthError::Internal(_) => "internal",
        }
    }

    pub(crate) fn key_resolution(reason: impl Into<String>) -> Self {
        Self::KeyResolutionFailed {
            reason: reason.into(),
            transient: false,
        }
    }

    pub(crate) fn key_set_unreachable(reason: impl Into<String>) -> Self {
        Self::KeyResolutionFailed {
            reason: reason.into(),
            transient: true,
        }
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(value: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match value.kind() {
            ErrorKind::InvalidSignature => Self::SignatureInvalid,
            ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
                Self::UnsupportedAlgorithm(value.to_string())
            }
            ErrorKind::InvalidEcdsaKey | ErrorKind::InvalidRsaKey(_) | ErrorKind::InvalidKeyFormat => {
                Self::key_resolution(value.to_string())
            }
            ErrorKind::InvalidToken
            | ErrorKind::Base64(_)
            | ErrorKind::Json(_)
            | ErrorKind::Utf8(_) => Self::MalformedToken(value.to_string()),
            _ => Self::SignatureInvalid,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: &'static str,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        // Rejections collapse into one response; which check failed stays in the logs.
        let (status, code, message) = match &self {
            err if err.is_rejection() => (
                StatusCode::UNAUTHORIZED,
                "AUTH_REJECTED",
                "authentication failed",
            ),
            AuthError::InvalidTrustConfig(_) | AuthError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "AUTH_INTERNAL",
                "authentication is unavailable",
            ),
            _ => (
                StatusCode::SERVICE_UNAVAILABLE,
                "AUTH_UNAVAILABLE",
                "authentication is temporarily unavailable",
            ),
        };

        tracing::debug!(error = %self, kind = self.kind(), "authentication request failed");
        (status, Json(ErrorBody { code, message })).into_response()
    }
}
