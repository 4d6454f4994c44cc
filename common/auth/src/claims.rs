use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::config::TrustConfig;
use crate::error::{AuthError, AuthResult};

/// Name of the nested claim carrying the embedded identity.
pub const IDENTITY_CLAIM: &str = "kotomi_user";

/// Payload of a signature-verified token, decoded once.
///
/// Registered claims are kept as raw JSON so type problems surface as
/// `ClaimTypeInvalid` from the validator instead of a generic decode error.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenClaims {
    pub iss: Option<Value>,
    pub sub: Option<Value>,
    pub aud: Option<AudienceRepr>,
    pub exp: Option<Value>,
    pub nbf: Option<Value>,
    pub iat: Option<Value>,
    #[serde(rename = "kotomi_user")]
    pub identity: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AudienceRepr {
    Single(String),
    Many(Vec<Value>),
    Other(Value),
}

impl AudienceRepr {
    fn contains(&self, expected: &str) -> bool {
        match self {
            AudienceRepr::Single(value) => value == expected,
            AudienceRepr::Many(items) => items.iter().any(|item| item.as_str() == Some(expected)),
            AudienceRepr::Other(_) => false,
        }
    }
}

impl TokenClaims {
    pub fn from_value(value: Value) -> AuthResult<Self> {
        serde_json::from_value(value).map_err(|err| AuthError::MalformedToken(err.to_string()))
    }

    pub fn expires_at(&self) -> AuthResult<Option<i64>> {
        numeric_date(self.exp.as_ref(), "exp")
    }

    pub fn not_before(&self) -> AuthResult<Option<i64>> {
        numeric_date(self.nbf.as_ref(), "nbf")
    }

    pub fn subject(&self) -> AuthResult<Option<&str>> {
        match &self.sub {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(sub)) => Ok(Some(sub.as_str())),
            Some(_) => Err(AuthError::ClaimTypeInvalid("sub")),
        }
    }
}

/// Checks issuer, audience and the validity window of verified claims.
#[derive(Debug, Clone)]
pub struct ClaimValidator {
    issuer: Option<String>,
    audience: Option<String>,
    buffer_seconds: i64,
}

impl ClaimValidator {
    pub fn new(config: &TrustConfig) -> Self {
        Self {
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            buffer_seconds: config.expiration_buffer().num_seconds(),
        }
    }

    pub fn validate(&self, claims: &TokenClaims) -> AuthResult<()> {
        self.validate_at(claims, Utc::now())
    }

    /// Validates against an explicit clock reading. A token stays valid up to
    /// and including `exp + buffer`.
    pub fn validate_at(&self, claims: &TokenClaims, now: DateTime<Utc>) -> AuthResult<()> {
        if let Some(expected) = &self.issuer {
            match &claims.iss {
                Some(Value::String(issuer)) if issuer == expected => {}
                _ => return Err(AuthError::IssuerMismatch),
            }
        }

        if let Some(expected) = &self.audience {
            let matches = claims
                .aud
                .as_ref()
                .map(|aud| aud.contains(expected))
                .unwrap_or(false);
            if !matches {
                return Err(AuthError::AudienceMismatch);
            }
        }

        let now = now.timestamp();
        let expires_at = claims
            .expires_at()?
            .ok_or(AuthError::ClaimTypeInvalid("exp"))?;
        if now > expires_at.saturating_add(self.buffer_seconds) {
            return Err(AuthError::Expired);
        }

        if let Some(not_before) = claims.not_before()? {
            if now.saturating_add(self.buffer_seconds) < not_before {
                return Err(AuthError::NotYetValid);
            }
        }

        Ok(())
    }
}

fn numeric_date(value: Option<&Value>, name: &'static str) -> AuthResult<Option<i64>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(number)) => number
            .as_i64()
            .or_else(|| number.as_f64().filter(|v| v.is_finite()).map(|v| v.trunc() as i64))
            .map(Some)
            .ok_or(AuthError::ClaimTypeInvalid(name)),
        Some(_) => Err(AuthError::ClaimTypeInvalid(name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeyMaterial;
    use chrono::Duration;
    use serde_json::json;

    fn config(buffer: u32) -> TrustConfig {
        TrustConfig::external("site", KeyMaterial::Hmac { secret: "s".into() })
            .with_issuer("https://ex.com")
            .with_audience("kotomi")
            .with_expiration_buffer(buffer)
    }

    fn claims(value: Value) -> TokenClaims {
        TokenClaims::from_value(value).expect("claims decode")
    }

    fn base_claims(exp: i64) -> Value {
        json!({ "iss": "https://ex.com", "aud": "kotomi", "sub": "u1", "exp": exp })
    }

    #[test]
    fn expiry_inside_buffer_is_accepted() {
        let now = Utc::now();
        let token = claims(base_claims((now - Duration::seconds(10)).timestamp()));
        ClaimValidator::new(&config(60))
            .validate_at(&token, now)
            .expect("inside buffer");
    }

    #[test]
    fn expiry_outside_buffer_is_rejected() {
        let now = Utc::now();
        let token = claims(base_claims((now - Duration::seconds(10)).timestamp()));
        let err = ClaimValidator::new(&config(5))
            .validate_at(&token, now)
            .expect_err("outside buffer");
        assert!(matches!(err, AuthError::Expired));
    }

    #[test]
    fn buffer_boundary_is_inclusive() {
        let now = Utc::now();
        let token = claims(base_claims((now - Duration::seconds(30)).timestamp()));
        ClaimValidator::new(&config(30))
            .validate_at(&token, now)
            .expect("exactly at exp + buffer");
        let err = ClaimValidator::new(&config(30))
            .validate_at(&token, now + Duration::seconds(1))
            .expect_err("one second past exp + buffer");
        assert!(matches!(err, AuthError::Expired));
    }

    #[test]
    fn missing_or_non_numeric_exp_is_a_type_error() {
        let now = Utc::now();
        let validator = ClaimValidator::new(&config(60));

        let missing = claims(json!({ "iss": "https://ex.com", "aud": "kotomi" }));
        assert!(matches!(
            validator.validate_at(&missing, now),
            Err(AuthError::ClaimTypeInvalid("exp"))
        ));

        let textual = claims(json!({ "iss": "https://ex.com", "aud": "kotomi", "exp": "tomorrow" }));
        assert!(matches!(
            validator.validate_at(&textual, now),
            Err(AuthError::ClaimTypeInvalid("exp"))
        ));
    }

    #[test]
    fn fractional_exp_is_truncated() {
        let now = Utc::now();
        let exp = (now + Duration::seconds(120)).timestamp() as f64 + 0.75;
        let token = claims(json!({ "iss": "https://ex.com", "aud": "kotomi", "exp": exp }));
        ClaimValidator::new(&config(0)).validate_at(&token, now).expect("valid");
    }

    #[test]
    fn issuer_must_match_exactly() {
        let now = Utc::now();
        let exp = (now + Duration::hours(1)).timestamp();
        let validator = ClaimValidator::new(&config(60));

        let wrong = claims(json!({ "iss": "https://ex.com/", "aud": "kotomi", "exp": exp }));
        assert!(matches!(validator.validate_at(&wrong, now), Err(AuthError::IssuerMismatch)));

        let missing = claims(json!({ "aud": "kotomi", "exp": exp }));
        assert!(matches!(validator.validate_at(&missing, now), Err(AuthError::IssuerMismatch)));
    }

    #[test]
    fn audience_accepts_single_value_or_list() {
        let now = Utc::now();
        let exp = (now + Duration::hours(1)).timestamp();
        let validator = ClaimValidator::new(&config(60));

        let listed = claims(json!({ "iss": "https://ex.com", "aud": ["other", "kotomi"], "exp": exp }));
        validator.validate_at(&listed, now).expect("listed audience");

        let wrong = claims(json!({ "iss": "https://ex.com", "aud": "kotomi-admin", "exp": exp }));
        assert!(matches!(validator.validate_at(&wrong, now), Err(AuthError::AudienceMismatch)));

        let numeric = claims(json!({ "iss": "https://ex.com", "aud": 7, "exp": exp }));
        assert!(matches!(validator.validate_at(&numeric, now), Err(AuthError::AudienceMismatch)));
    }

    #[test]
    fn unconfigured_issuer_and_audience_are_not_checked() {
        let now = Utc::now();
        let config = TrustConfig::external("site", KeyMaterial::Hmac { secret: "s".into() });
        let token = claims(json!({ "exp": (now + Duration::minutes(5)).timestamp() }));
        ClaimValidator::new(&config).validate_at(&token, now).expect("valid");
    }

    #[test]
    fn not_before_in_the_future_is_rejected() {
        let now = Utc::now();
        let mut value = base_claims((now + Duration::hours(1)).timestamp());
        value["nbf"] = json!((now + Duration::minutes(10)).timestamp());
        let err = ClaimValidator::new(&config(60))
            .validate_at(&claims(value), now)
            .expect_err("not yet valid");
        assert!(matches!(err, AuthError::NotYetValid));
    }

    #[test]
    fn not_before_within_buffer_is_accepted() {
        let now = Utc::now();
        let mut value = base_claims((now + Duration::hours(1)).timestamp());
        value["nbf"] = json!((now + Duration::seconds(20)).timestamp());
        ClaimValidator::new(&config(60))
            .validate_at(&claims(value), now)
            .expect("clock skew tolerated");
    }
}
