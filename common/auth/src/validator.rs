use std::time::Duration;

use tracing::{debug, instrument};

use crate::claims::ClaimValidator;
use crate::config::{TrustConfig, ValidatorOptions};
use crate::error::AuthResult;
use crate::identity::{CanonicalIdentity, IdentityExtractor};
use crate::verifier::{SignatureVerifier, VerifiedToken};

/// Full token check for one tenant: signature, then claims, then identity.
///
/// Built once per trust configuration and shared across requests.
#[derive(Clone)]
pub struct Validator {
    site_id: String,
    verifier: SignatureVerifier,
    claims: ClaimValidator,
    identity: IdentityExtractor,
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator")
            .field("site_id", &self.site_id)
            .finish_non_exhaustive()
    }
}

impl Validator {
    pub fn new(config: &TrustConfig) -> AuthResult<Self> {
        Self::with_options(config, &ValidatorOptions::default())
    }

    pub fn with_options(config: &TrustConfig, options: &ValidatorOptions) -> AuthResult<Self> {
        Ok(Self {
            site_id: config.site_id.clone(),
            verifier: SignatureVerifier::new(config, options)?,
            claims: ClaimValidator::new(config),
            identity: IdentityExtractor,
        })
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub async fn validate(&self, token: &str) -> AuthResult<CanonicalIdentity> {
        let verified = self.verifier.verify(token).await;
        self.finish(verified)
    }

    /// Like [`Validator::validate`], but gives up on a remote key fetch after `deadline`.
    pub async fn validate_with_deadline(
        &self,
        token: &str,
        deadline: Duration,
    ) -> AuthResult<CanonicalIdentity> {
        let verified = self.verifier.verify_with_deadline(token, deadline).await;
        self.finish(verified)
    }

    #[instrument(skip_all, fields(site_id = %self.site_id))]
    fn finish(
        &self,
        verified: AuthResult<VerifiedToken>,
    ) -> AuthResult<CanonicalIdentity> {
        let result = verified.and_then(|token| {
            self.claims.validate(&token.claims)?;
            self.identity.extract(&token.claims)
        });

        match &result {
            Ok(identity) => debug!(user_id = %identity.id, "token accepted"),
            Err(err) => debug!(reason = err.kind(), "token rejected"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeyMaterial;
    use crate::error::AuthError;
    use chrono::{Duration as ChronoDuration, Utc};
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use serde_json::{json, Value};

    fn config() -> TrustConfig {
        TrustConfig::external("site-1", KeyMaterial::Hmac { secret: "s".into() })
            .with_issuer("https://ex.com")
            .with_audience("kotomi")
    }

    fn sign(claims: &Value, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .expect("sign token")
    }

    fn claims_expiring_in(seconds: i64) -> Value {
        json!({
            "iss": "https://ex.com",
            "aud": "kotomi",
            "sub": "u1",
            "exp": (Utc::now() + ChronoDuration::seconds(seconds)).timestamp(),
            "kotomi_user": { "id": "u1", "name": "Jane" }
        })
    }

    #[tokio::test]
    async fn valid_hmac_token_yields_identity() {
        let validator = Validator::new(&config()).expect("validator");
        let identity = validator
            .validate(&sign(&claims_expiring_in(3600), "s"))
            .await
            .expect("accepted");

        assert_eq!(identity.id, "u1");
        assert_eq!(identity.name, "Jane");
        assert_eq!(identity.email, None);
        assert!(!identity.verified);
        assert!(identity.roles.is_empty());
    }

    #[tokio::test]
    async fn recently_expired_token_is_accepted_within_buffer() {
        let validator = Validator::new(&config()).expect("validator");
        validator
            .validate(&sign(&claims_expiring_in(-10), "s"))
            .await
            .expect("inside default buffer");

        let strict = Validator::new(&config().with_expiration_buffer(5)).expect("validator");
        let err = strict
            .validate(&sign(&claims_expiring_in(-10), "s"))
            .await
            .expect_err("outside buffer");
        assert!(matches!(err, AuthError::Expired));
    }

    #[tokio::test]
    async fn signature_is_checked_before_claims() {
        let validator = Validator::new(&config()).expect("validator");
        let mut claims = claims_expiring_in(-3600);
        claims["iss"] = json!("https://attacker.example");

        let err = validator
            .validate(&sign(&claims, "wrong"))
            .await
            .expect_err("bad signature");
        assert!(matches!(err, AuthError::SignatureInvalid));
    }

    #[tokio::test]
    async fn issuer_mismatch_is_reported() {
        let validator = Validator::new(&config()).expect("validator");
        let mut claims = claims_expiring_in(3600);
        claims["iss"] = json!("https://other.example");

        let err = validator.validate(&sign(&claims, "s")).await.expect_err("issuer");
        assert!(matches!(err, AuthError::IssuerMismatch));
        assert!(err.is_rejection());
    }

    #[tokio::test]
    async fn missing_identity_claim_is_rejected() {
        let validator = Validator::new(&config()).expect("validator");
        let mut claims = claims_expiring_in(3600);
        claims.as_object_mut().expect("object").remove("kotomi_user");

        let err = validator.validate(&sign(&claims, "s")).await.expect_err("no identity");
        assert!(matches!(err, AuthError::MissingIdentityClaim(_)));
    }

    #[tokio::test]
    async fn validators_are_tenant_isolated() {
        let first = Validator::new(&config()).expect("validator");
        let second = Validator::new(
            &TrustConfig::external("site-2", KeyMaterial::Hmac { secret: "t".into() })
                .with_issuer("https://ex.com")
                .with_audience("kotomi"),
        )
        .expect("validator");
        let token = sign(&claims_expiring_in(3600), "s");

        first.validate(&token).await.expect("own tenant");
        let err = second.validate(&token).await.expect_err("other tenant");
        assert!(matches!(err, AuthError::SignatureInvalid));
        assert_eq!(second.site_id(), "site-2");
    }

    #[tokio::test]
    async fn concurrent_validations_share_one_validator() {
        let validator = std::sync::Arc::new(Validator::new(&config()).expect("validator"));
        let token = sign(&claims_expiring_in(3600), "s");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let validator = validator.clone();
                let token = token.clone();
                tokio::spawn(async move { validator.validate(&token).await })
            })
            .collect();

        for handle in handles {
            handle.await.expect("join").expect("accepted");
        }
    }
}
