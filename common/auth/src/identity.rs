use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::claims::{TokenClaims, IDENTITY_CLAIM};
use crate::error::{AuthError, AuthResult};

/// Schema version of the embedded identity claim understood by this crate.
pub const IDENTITY_SCHEMA_VERSION: u32 = 1;

/// Normalized user identity, the same shape regardless of which auth mode produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalIdentity {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_url: Option<String>,
    #[serde(default)]
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
}

impl CanonicalIdentity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: None,
            avatar_url: None,
            profile_url: None,
            verified: false,
            roles: Vec::new(),
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|value| value == role)
    }
}

/// Wire form of the `kotomi_user` claim.
///
/// `id` and `name` are strict; every optional field decodes leniently so a
/// wrongly typed value is dropped instead of failing the whole token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityClaim {
    #[serde(default = "current_schema_version")]
    pub v: u32,
    pub id: String,
    pub name: String,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub profile_url: Option<String>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
    #[serde(default, deserialize_with = "lenient_strings", skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
}

impl From<&CanonicalIdentity> for IdentityClaim {
    fn from(identity: &CanonicalIdentity) -> Self {
        Self {
            v: IDENTITY_SCHEMA_VERSION,
            id: identity.id.clone(),
            name: identity.name.clone(),
            email: identity.email.clone(),
            avatar_url: identity.avatar_url.clone(),
            profile_url: identity.profile_url.clone(),
            verified: Some(identity.verified),
            roles: identity.roles.clone(),
        }
    }
}

fn current_schema_version() -> u32 {
    IDENTITY_SCHEMA_VERSION
}

fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

fn lenient_strings<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(role) => Some(role),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    })
}

/// Maps verified claims onto a [`CanonicalIdentity`].
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityExtractor;

impl IdentityExtractor {
    pub fn extract(&self, claims: &TokenClaims) -> AuthResult<CanonicalIdentity> {
        let raw = match &claims.identity {
            Some(value @ Value::Object(_)) => value.clone(),
            Some(_) => return Err(missing(format!("{IDENTITY_CLAIM} is not an object"))),
            None => return Err(missing(format!("{IDENTITY_CLAIM} is absent"))),
        };

        let claim: IdentityClaim =
            serde_json::from_value(raw).map_err(|err| missing(err.to_string()))?;

        if claim.v != IDENTITY_SCHEMA_VERSION {
            return Err(missing(format!("unsupported schema version {}", claim.v)));
        }

        let id = claim.id.trim();
        let name = claim.name.trim();
        if id.is_empty() {
            return Err(missing("id is empty"));
        }
        if name.is_empty() {
            return Err(missing("name is empty"));
        }

        if let Some(subject) = claims.subject()? {
            if subject != id {
                return Err(missing("id does not match the token subject"));
            }
        }

        Ok(CanonicalIdentity {
            id: id.to_string(),
            name: name.to_string(),
            email: non_empty(claim.email),
            avatar_url: non_empty(claim.avatar_url),
            profile_url: non_empty(claim.profile_url),
            verified: claim.verified.unwrap_or(false),
            roles: claim.roles,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn missing(reason: impl Into<String>) -> AuthError {
    AuthError::MissingIdentityClaim(reason.into())
}
