use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{AuthError, AuthResult};
use crate::jwks::JwksCache;

/// Clock-skew buffer applied when a stored record leaves it unset.
pub const DEFAULT_EXPIRATION_BUFFER_SECONDS: u32 = 60;
/// Issuer and audience used for tokens this service mints itself.
pub const MANAGED_ISSUER: &str = "kotomi";
pub const MANAGED_AUDIENCE: &str = "kotomi";

const SIGNING_SECRET_BYTES: usize = 32;

/// Key material a tenant registers for delegated (external) authentication.
#[derive(Clone, PartialEq, Eq)]
pub enum KeyMaterial {
    Hmac { secret: String },
    Rsa { public_key_pem: String },
    Ecdsa { public_key_pem: String },
    Jwks { endpoint: String },
}

impl KeyMaterial {
    pub fn method(&self) -> ValidationMethod {
        match self {
            KeyMaterial::Hmac { .. } => ValidationMethod::Hmac,
            KeyMaterial::Rsa { .. } => ValidationMethod::Rsa,
            KeyMaterial::Ecdsa { .. } => ValidationMethod::Ecdsa,
            KeyMaterial::Jwks { .. } => ValidationMethod::Jwks,
        }
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyMaterial::Hmac { .. } => f.write_str("Hmac { secret: <redacted> }"),
            KeyMaterial::Rsa { .. } => f.write_str("Rsa { .. }"),
            KeyMaterial::Ecdsa { .. } => f.write_str("Ecdsa { .. }"),
            KeyMaterial::Jwks { endpoint } => {
                f.debug_struct("Jwks").field("endpoint", endpoint).finish()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMethod {
    Hmac,
    Rsa,
    Ecdsa,
    Jwks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    External,
    Managed,
}

#[derive(Clone, PartialEq, Eq)]
pub enum TrustMode {
    /// The tenant's identity provider signs tokens; we only verify them.
    External(KeyMaterial),
    /// This service issues tokens, signed with a per-tenant secret.
    Managed { signing_secret: String },
}

impl std::fmt::Debug for TrustMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrustMode::External(material) => f.debug_tuple("External").field(material).finish(),
            TrustMode::Managed { .. } => f.write_str("Managed { signing_secret: <redacted> }"),
        }
    }
}

/// Per-tenant trust policy, already resolved and validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustConfig {
    pub site_id: String,
    pub mode: TrustMode,
    /// Expected `iss`; unchecked when `None`.
    pub issuer: Option<String>,
    /// Expected `aud`; unchecked when `None`.
    pub audience: Option<String>,
    pub expiration_buffer_seconds: u32,
}

impl TrustConfig {
    pub fn external(site_id: impl Into<String>, material: KeyMaterial) -> Self {
        Self {
            site_id: site_id.into(),
            mode: TrustMode::External(material),
            issuer: None,
            audience: None,
            expiration_buffer_seconds: DEFAULT_EXPIRATION_BUFFER_SECONDS,
        }
    }

    pub fn managed(site_id: impl Into<String>, signing_secret: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
            mode: TrustMode::Managed {
                signing_secret: signing_secret.into(),
            },
            issuer: Some(MANAGED_ISSUER.to_string()),
            audience: Some(MANAGED_AUDIENCE.to_string()),
            expiration_buffer_seconds: DEFAULT_EXPIRATION_BUFFER_SECONDS,
        }
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    pub fn with_expiration_buffer(mut self, seconds: u32) -> Self {
        self.expiration_buffer_seconds = seconds;
        self
    }

    pub fn auth_mode(&self) -> AuthMode {
        match self.mode {
            TrustMode::External(_) => AuthMode::External,
            TrustMode::Managed { .. } => AuthMode::Managed,
        }
    }

    pub fn expiration_buffer(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::from(self.expiration_buffer_seconds))
    }
}

/// Flat record shape used by storage and the admin collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustConfigRecord {
    pub site_id: String,
    pub auth_mode: String,
    #[serde(default)]
    pub validation_method: Option<String>,
    #[serde(default, skip_serializing)]
    pub secret: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub jwks_endpoint: Option<String>,
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
    #[serde(default)]
    pub expiration_buffer_seconds: u32,
}

impl From<&TrustConfig> for TrustConfigRecord {
    fn from(config: &TrustConfig) -> Self {
        let mut record = TrustConfigRecord {
            site_id: config.site_id.clone(),
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            expiration_buffer_seconds: config.expiration_buffer_seconds,
            ..Default::default()
        };

        match &config.mode {
            TrustMode::Managed { signing_secret } => {
                record.auth_mode = "managed".to_string();
                record.secret = Some(signing_secret.clone());
            }
            TrustMode::External(material) => {
                record.auth_mode = "external".to_string();
                match material {
                    KeyMaterial::Hmac { secret } => {
                        record.validation_method = Some("hmac".to_string());
                        record.secret = Some(secret.clone());
                    }
                    KeyMaterial::Rsa { public_key_pem } => {
                        record.validation_method = Some("rsa".to_string());
                        record.public_key = Some(public_key_pem.clone());
                    }
                    KeyMaterial::Ecdsa { public_key_pem } => {
                        record.validation_method = Some("ecdsa".to_string());
                        record.public_key = Some(public_key_pem.clone());
                    }
                    KeyMaterial::Jwks { endpoint } => {
                        record.validation_method = Some("jwks".to_string());
                        record.jwks_endpoint = Some(endpoint.clone());
                    }
                }
            }
        }

        record
    }
}

impl TryFrom<TrustConfigRecord> for TrustConfig {
    type Error = AuthError;

    fn try_from(record: TrustConfigRecord) -> AuthResult<Self> {
        let site_id = normalize(Some(record.site_id))
            .ok_or_else(|| invalid("site_id must not be empty"))?;
        let secret = normalize(record.secret);
        let public_key = normalize(record.public_key);
        let jwks_endpoint = normalize(record.jwks_endpoint);
        let populated = [&secret, &public_key, &jwks_endpoint]
            .iter()
            .filter(|value| value.is_some())
            .count();

        let mode = match record.auth_mode.trim().to_ascii_lowercase().as_str() {
            "managed" | "kotomi" => {
                if public_key.is_some() || jwks_endpoint.is_some() {
                    return Err(invalid("managed mode only accepts a signing secret"));
                }
                let signing_secret =
                    secret.ok_or_else(|| invalid("managed mode requires a signing secret"))?;
                TrustMode::Managed { signing_secret }
            }
            "external" => {
                if populated != 1 {
                    return Err(invalid(
                        "exactly one of secret, public_key or jwks_endpoint must be set",
                    ));
                }
                let method = normalize(record.validation_method)
                    .ok_or_else(|| invalid("external mode requires a validation method"))?;
                let material = match (method.to_ascii_lowercase().as_str(), secret, public_key, jwks_endpoint) {
                    ("hmac", Some(secret), None, None) => KeyMaterial::Hmac { secret },
                    ("rsa", None, Some(public_key_pem), None) => KeyMaterial::Rsa { public_key_pem },
                    ("ecdsa", None, Some(public_key_pem), None) => {
                        KeyMaterial::Ecdsa { public_key_pem }
                    }
                    ("jwks", None, None, Some(endpoint)) => KeyMaterial::Jwks { endpoint },
                    (other @ ("hmac" | "rsa" | "ecdsa" | "jwks"), _, _, _) => {
                        return Err(invalid(format!(
                            "key material does not match validation method '{other}'"
                        )))
                    }
                    (other, _, _, _) => {
                        return Err(invalid(format!("unsupported validation method '{other}'")))
                    }
                };
                TrustMode::External(material)
            }
            other => return Err(invalid(format!("unsupported auth mode '{other}'"))),
        };

        let expiration_buffer_seconds = if record.expiration_buffer_seconds == 0 {
            DEFAULT_EXPIRATION_BUFFER_SECONDS
        } else {
            record.expiration_buffer_seconds
        };

        let (issuer, audience) = match mode {
            TrustMode::Managed { .. } => (
                normalize(record.issuer).or_else(|| Some(MANAGED_ISSUER.to_string())),
                normalize(record.audience).or_else(|| Some(MANAGED_AUDIENCE.to_string())),
            ),
            TrustMode::External(_) => (normalize(record.issuer), normalize(record.audience)),
        };

        Ok(Self {
            site_id,
            mode,
            issuer,
            audience,
            expiration_buffer_seconds,
        })
    }
}

/// Runtime knobs for the validation pipeline that are not part of a tenant's policy.
#[derive(Debug, Clone)]
pub struct ValidatorOptions {
    /// Deadline for a remote key set fetch.
    pub jwks_timeout: Duration,
    /// Shared key set cache. `None` fetches on every validation.
    pub jwks_cache: Option<JwksCache>,
}

impl Default for ValidatorOptions {
    fn default() -> Self {
        Self {
            jwks_timeout: Duration::from_secs(5),
            jwks_cache: None,
        }
    }
}

impl ValidatorOptions {
    pub fn with_jwks_timeout(mut self, timeout: Duration) -> Self {
        self.jwks_timeout = timeout;
        self
    }

    pub fn with_jwks_cache(mut self, cache: JwksCache) -> Self {
        self.jwks_cache = Some(cache);
        self
    }

    /// Convenience for a private cache; a zero `ttl` disables caching.
    pub fn with_jwks_cache_ttl(self, ttl: Duration) -> Self {
        if ttl.is_zero() {
            return self;
        }
        self.with_jwks_cache(JwksCache::new(ttl))
    }
}

/// Fresh, independent signing secret for a managed-mode tenant.
pub fn generate_signing_secret() -> String {
    let mut bytes = [0u8; SIGNING_SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn normalize(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn invalid(message: impl Into<String>) -> AuthError {
    AuthError::InvalidTrustConfig(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn external_record(method: &str) -> TrustConfigRecord {
        TrustConfigRecord {
            site_id: "site-1".into(),
            auth_mode: "external".into(),
            validation_method: Some(method.into()),
            ..Default::default()
        }
    }

    #[test]
    fn record_with_single_key_material_converts() {
        let mut record = external_record("hmac");
        record.secret = Some("s".into());
        record.issuer = Some("https://ex.com".into());
        record.audience = Some("  ".into());

        let config = TrustConfig::try_from(record).expect("valid record");
        assert_eq!(config.mode, TrustMode::External(KeyMaterial::Hmac { secret: "s".into() }));
        assert_eq!(config.issuer.as_deref(), Some("https://ex.com"));
        assert_eq!(config.audience, None);
        assert_eq!(config.expiration_buffer_seconds, DEFAULT_EXPIRATION_BUFFER_SECONDS);
    }

    #[test]
    fn record_with_two_key_materials_is_rejected() {
        let mut record = external_record("rsa");
        record.public_key = Some("-----BEGIN PUBLIC KEY-----".into());
        record.jwks_endpoint = Some("https://ex.com/jwks".into());

        let err = TrustConfig::try_from(record).expect_err("ambiguous record");
        assert!(matches!(err, AuthError::InvalidTrustConfig(_)));
    }

    #[test]
    fn record_with_material_for_another_method_is_rejected() {
        let mut record = external_record("jwks");
        record.secret = Some("s".into());

        let err = TrustConfig::try_from(record).expect_err("mismatched record");
        assert!(matches!(err, AuthError::InvalidTrustConfig(_)));
    }

    #[test]
    fn managed_record_defaults_issuer_and_audience() {
        let record = TrustConfigRecord {
            site_id: "site-2".into(),
            auth_mode: "managed".into(),
            secret: Some("tenant-secret".into()),
            expiration_buffer_seconds: 15,
            ..Default::default()
        };

        let config = TrustConfig::try_from(record).expect("valid record");
        assert_eq!(config.auth_mode(), AuthMode::Managed);
        assert_eq!(config.issuer.as_deref(), Some(MANAGED_ISSUER));
        assert_eq!(config.audience.as_deref(), Some(MANAGED_AUDIENCE));
        assert_eq!(config.expiration_buffer_seconds, 15);
    }

    #[test]
    fn managed_record_without_secret_is_rejected() {
        let record = TrustConfigRecord {
            site_id: "site-3".into(),
            auth_mode: "managed".into(),
            ..Default::default()
        };
        assert!(TrustConfig::try_from(record).is_err());
    }

    #[test]
    fn config_round_trips_through_record() {
        let config = TrustConfig::external(
            "site-4",
            KeyMaterial::Jwks {
                endpoint: "https://idp.example/.well-known/jwks.json".into(),
            },
        )
        .with_issuer("https://idp.example")
        .with_expiration_buffer(30);

        let restored = TrustConfig::try_from(TrustConfigRecord::from(&config)).expect("round trip");
        assert_eq!(restored, config);
    }

    #[test]
    fn generated_secrets_are_unique() {
        let first = generate_signing_secret();
        let second = generate_signing_secret();
        assert_ne!(first, second);
        assert_eq!(first.len(), 43);
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let config = TrustConfig::managed("site-5", "do-not-print");
        assert!(!format!("{config:?}").contains("do-not-print"));
    }
}
