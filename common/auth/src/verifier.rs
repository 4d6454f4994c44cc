use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Header, Validation};
use serde_json::Value;
use tracing::debug;

use crate::claims::TokenClaims;
use crate::config::{KeyMaterial, TrustConfig, TrustMode, ValidatorOptions};
use crate::error::{AuthError, AuthResult};
use crate::jwks::{JwksCache, JwksFetcher, KeySet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    Hmac,
    Rsa,
    Ec,
    Ed,
}

pub(crate) fn family_of(algorithm: Algorithm) -> KeyFamily {
    match algorithm {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => KeyFamily::Hmac,
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512 => KeyFamily::Rsa,
        Algorithm::ES256 | Algorithm::ES384 => KeyFamily::Ec,
        Algorithm::EdDSA => KeyFamily::Ed,
    }
}

/// A token whose signature has been checked. Claims are not validated yet.
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    pub algorithm: Algorithm,
    pub key_id: Option<String>,
    pub claims: TokenClaims,
}

#[derive(Clone)]
enum KeySource {
    Static { family: KeyFamily, key: DecodingKey },
    Remote(RemoteKeys),
}

#[derive(Clone)]
struct RemoteKeys {
    fetcher: JwksFetcher,
    cache: Option<JwksCache>,
}

/// Checks token signatures against one tenant's key material.
#[derive(Clone)]
pub struct SignatureVerifier {
    source: KeySource,
    jwks_timeout: Duration,
}

impl SignatureVerifier {
    /// Decodes configured key material once; a broken key fails here rather
    /// than on every request.
    pub fn new(config: &TrustConfig, options: &ValidatorOptions) -> AuthResult<Self> {
        let source = match &config.mode {
            TrustMode::Managed { signing_secret } => KeySource::Static {
                family: KeyFamily::Hmac,
                key: DecodingKey::from_secret(signing_secret.as_bytes()),
            },
            TrustMode::External(KeyMaterial::Hmac { secret }) => KeySource::Static {
                family: KeyFamily::Hmac,
                key: DecodingKey::from_secret(secret.as_bytes()),
            },
            TrustMode::External(KeyMaterial::Rsa { public_key_pem }) => KeySource::Static {
                family: KeyFamily::Rsa,
                key: DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
                    .map_err(|err| AuthError::key_resolution(format!("RSA public key: {err}")))?,
            },
            TrustMode::External(KeyMaterial::Ecdsa { public_key_pem }) => KeySource::Static {
                family: KeyFamily::Ec,
                key: DecodingKey::from_ec_pem(public_key_pem.as_bytes())
                    .map_err(|err| AuthError::key_resolution(format!("EC public key: {err}")))?,
            },
            TrustMode::External(KeyMaterial::Jwks { endpoint }) => KeySource::Remote(RemoteKeys {
                fetcher: JwksFetcher::new(endpoint.clone()),
                cache: options.jwks_cache.clone(),
            }),
        };

        Ok(Self {
            source,
            jwks_timeout: options.jwks_timeout,
        })
    }

    pub async fn verify(&self, token: &str) -> AuthResult<VerifiedToken> {
        self.verify_with_deadline(token, self.jwks_timeout).await
    }

    /// `deadline` bounds the remote key set fetch; static keys never wait.
    pub async fn verify_with_deadline(
        &self,
        token: &str,
        deadline: Duration,
    ) -> AuthResult<VerifiedToken> {
        let header = read_header(token)?;
        let algorithm = header.alg;

        let key = match &self.source {
            KeySource::Static { family, key } => {
                if family_of(algorithm) != *family {
                    return Err(AuthError::UnsupportedAlgorithm(format!("{algorithm:?}")));
                }
                key.clone()
            }
            KeySource::Remote(remote) => {
                let family = family_of(algorithm);
                if !matches!(family, KeyFamily::Rsa | KeyFamily::Ec) {
                    return Err(AuthError::UnsupportedAlgorithm(format!("{algorithm:?}")));
                }
                let kid = header
                    .kid
                    .as_deref()
                    .ok_or_else(|| AuthError::key_resolution("token missing kid header"))?;
                remote.resolve(kid, algorithm, deadline).await?
            }
        };

        let data = decode::<Value>(token, &key, &signature_only(algorithm))?;
        let claims = TokenClaims::from_value(data.claims)?;
        debug!(alg = ?algorithm, kid = ?header.kid, "token signature verified");

        Ok(VerifiedToken {
            algorithm,
            key_id: header.kid,
            claims,
        })
    }
}

impl RemoteKeys {
    async fn resolve(
        &self,
        kid: &str,
        algorithm: Algorithm,
        deadline: Duration,
    ) -> AuthResult<DecodingKey> {
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.get(self.fetcher.url()).await {
                if cached.contains(kid) {
                    return cached.resolve(kid, algorithm);
                }
                // Unknown kid on a warm cache usually means the tenant rotated keys.
                debug!(kid, url = self.fetcher.url(), "kid not cached, refetching key set");
            }
        }

        let keys = Arc::new(self.fetch_before(deadline).await?);
        if let Some(cache) = &self.cache {
            cache.insert(self.fetcher.url(), keys.clone()).await;
        }
        keys.resolve(kid, algorithm)
    }

    async fn fetch_before(&self, deadline: Duration) -> AuthResult<KeySet> {
        tokio::time::timeout(deadline, self.fetcher.fetch())
            .await
            .map_err(|_| AuthError::Canceled)?
    }
}

/// Parses the token header. Unknown algorithms (including `none`) are
/// reported as unsupported rather than malformed.
fn read_header(token: &str) -> AuthResult<Header> {
    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::MalformedToken("token is empty".into()));
    }
    if token.split('.').count() != 3 {
        return Err(AuthError::MalformedToken(
            "expected three dot-separated segments".into(),
        ));
    }

    decode_header(token).map_err(|err| match raw_algorithm(token) {
        Some(alg) if alg.parse::<Algorithm>().is_err() => AuthError::UnsupportedAlgorithm(alg),
        _ => AuthError::MalformedToken(err.to_string()),
    })
}

fn raw_algorithm(token: &str) -> Option<String> {
    let segment = token.split('.').next()?;
    let bytes = URL_SAFE_NO_PAD.decode(segment.trim_end_matches('=')).ok()?;
    let header: Value = serde_json::from_slice(&bytes).ok()?;
    header.get("alg")?.as_str().map(str::to_string)
}

/// Signature check only; registered claims are validated by `ClaimValidator`.
fn signature_only(algorithm: Algorithm) -> Validation {
    let mut validation = Validation::new(algorithm);
    validation.required_spec_claims = HashSet::new();
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation
}
