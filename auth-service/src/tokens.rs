use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use common_auth::{
    AuthError, AuthResult, CanonicalIdentity, IdentityClaim, TrustConfig, TrustMode,
    MANAGED_AUDIENCE, MANAGED_ISSUER,
};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rand_core::{OsRng, RngCore};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

const OPAQUE_TOKEN_BYTES: usize = 32;

/// Signs managed-mode access tokens with the tenant's own secret.
pub struct AccessTokenSigner {
    issuer: String,
    audience: String,
    encoding_key: EncodingKey,
}

impl AccessTokenSigner {
    pub fn for_tenant(config: &TrustConfig) -> AuthResult<Self> {
        let TrustMode::Managed { signing_secret } = &config.mode else {
            return Err(AuthError::InvalidTrustConfig(format!(
                "site {} does not use managed authentication",
                config.site_id
            )));
        };

        Ok(Self {
            issuer: config
                .issuer
                .clone()
                .unwrap_or_else(|| MANAGED_ISSUER.to_string()),
            audience: config
                .audience
                .clone()
                .unwrap_or_else(|| MANAGED_AUDIENCE.to_string()),
            encoding_key: EncodingKey::from_secret(signing_secret.as_bytes()),
        })
    }

    pub fn sign(
        &self,
        identity: &CanonicalIdentity,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> AuthResult<String> {
        let claims = AccessClaims {
            iss: &self.issuer,
            sub: &identity.id,
            aud: &self.audience,
            exp: expires_at.timestamp(),
            iat: issued_at.timestamp(),
            jti: Uuid::new_v4().to_string(),
            kotomi_user: IdentityClaim::from(identity),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|err| AuthError::Internal(format!("failed to sign access token: {err}")))
    }
}

#[derive(Serialize)]
struct AccessClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    exp: i64,
    iat: i64,
    jti: String,
    kotomi_user: IdentityClaim,
}

/// High-entropy URL-safe token for refresh, reset and verification flows.
pub fn generate_opaque_token() -> String {
    let mut bytes = [0u8; OPAQUE_TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Digest under which a token is stored and looked up.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}
