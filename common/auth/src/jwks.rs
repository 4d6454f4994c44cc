use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::{Algorithm, DecodingKey};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{AuthError, AuthResult};
use crate::verifier::{family_of, KeyFamily};

#[derive(Clone)]
pub struct JwksFetcher {
    client: Client,
    url: String,
}

impl JwksFetcher {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn fetch(&self) -> AuthResult<KeySet> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|err| AuthError::key_set_unreachable(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let reason = format!("HTTP {} from {}", status, self.url);
            return Err(if status.is_server_error() {
                AuthError::key_set_unreachable(reason)
            } else {
                AuthError::key_resolution(reason)
            });
        }

        let body: JwksResponse = response
            .json()
            .await
            .map_err(|err| AuthError::key_resolution(format!("invalid key set: {err}")))?;

        let set = KeySet::from_entries(body.keys);
        if set.is_empty() {
            warn!(url = %self.url, "fetched key set is empty");
        }
        debug!(url = %self.url, keys = set.len(), "fetched key set");
        Ok(set)
    }
}

/// Verification keys of one remote key set, indexed by key id.
#[derive(Clone, Default)]
pub struct KeySet {
    keys: HashMap<String, Result<ResolvedKey, KeyProblem>>,
}

#[derive(Clone)]
pub struct ResolvedKey {
    pub key: DecodingKey,
    pub family: KeyFamily,
    /// Algorithm pinned by the key's own `alg` member, if any.
    pub algorithm: Option<Algorithm>,
}

#[derive(Debug, Clone)]
enum KeyProblem {
    UnsupportedType(String),
    Unusable(String),
}

impl KeySet {
    fn from_entries(entries: Vec<JwkEntry>) -> Self {
        let mut keys = HashMap::new();
        for entry in entries {
            let Some(kid) = entry.kid.clone() else {
                debug!("skipping key set entry without kid");
                continue;
            };
            let converted = convert(&kid, entry);
            if let Err(KeyProblem::Unusable(reason)) = &converted {
                warn!(kid, reason, "key set entry cannot be converted");
            }
            keys.insert(kid, converted);
        }
        Self { keys }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, kid: &str) -> bool {
        self.keys.contains_key(kid)
    }

    /// Selects the key for `kid` and checks that it may verify `algorithm`.
    pub fn resolve(&self, kid: &str, algorithm: Algorithm) -> AuthResult<DecodingKey> {
        match self.keys.get(kid) {
            None => Err(AuthError::key_resolution(format!("no key with kid '{kid}'"))),
            Some(Err(KeyProblem::UnsupportedType(kty))) => {
                Err(AuthError::UnsupportedAlgorithm(format!("key type '{kty}'")))
            }
            Some(Err(KeyProblem::Unusable(reason))) => Err(AuthError::key_resolution(format!(
                "key '{kid}' is unusable: {reason}"
            ))),
            Some(Ok(resolved)) => {
                if family_of(algorithm) != resolved.family {
                    return Err(AuthError::UnsupportedAlgorithm(format!("{algorithm:?}")));
                }
                if let Some(pinned) = resolved.algorithm {
                    if pinned != algorithm {
                        return Err(AuthError::UnsupportedAlgorithm(format!("{algorithm:?}")));
                    }
                }
                Ok(resolved.key.clone())
            }
        }
    }
}

fn convert(kid: &str, entry: JwkEntry) -> Result<ResolvedKey, KeyProblem> {
    let kty = entry.kty.unwrap_or_else(|| "RSA".to_string());
    let algorithm = match entry.alg.as_deref() {
        Some(alg) => Some(
            alg.parse::<Algorithm>()
                .map_err(|_| KeyProblem::UnsupportedType(format!("{kty}/{alg}")))?,
        ),
        None => None,
    };

    let (family, key) = match kty.as_str() {
        "RSA" => {
            let (n, e) = entry
                .n
                .zip(entry.e)
                .ok_or_else(|| KeyProblem::Unusable(format!("'{kid}' missing RSA components")))?;
            let key = DecodingKey::from_rsa_components(&n, &e)
                .map_err(|err| KeyProblem::Unusable(err.to_string()))?;
            (KeyFamily::Rsa, key)
        }
        "EC" => {
            let curve_algorithm = match entry.crv.as_deref() {
                Some("P-256") => Algorithm::ES256,
                Some("P-384") => Algorithm::ES384,
                other => {
                    return Err(KeyProblem::UnsupportedType(format!(
                        "EC/{}",
                        other.unwrap_or("unknown curve")
                    )))
                }
            };
            if let Some(alg) = algorithm.filter(|alg| *alg != curve_algorithm) {
                return Err(KeyProblem::UnsupportedType(format!("{kty}/{alg:?}")));
            }
            let (x, y) = entry
                .x
                .zip(entry.y)
                .ok_or_else(|| KeyProblem::Unusable(format!("'{kid}' missing EC coordinates")))?;
            let key = DecodingKey::from_ec_components(&x, &y)
                .map_err(|err| KeyProblem::Unusable(err.to_string()))?;
            return Ok(ResolvedKey {
                key,
                family: KeyFamily::Ec,
                algorithm: Some(curve_algorithm),
            });
        }
        other => return Err(KeyProblem::UnsupportedType(other.to_string())),
    };

    if let Some(alg) = algorithm.filter(|alg| family_of(*alg) != family) {
        return Err(KeyProblem::UnsupportedType(format!("{kty}/{alg:?}")));
    }

    Ok(ResolvedKey {
        key,
        family,
        algorithm,
    })
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<JwkEntry>,
}

#[derive(Debug, Deserialize)]
struct JwkEntry {
    kid: Option<String>,
    kty: Option<String>,
    alg: Option<String>,
    n: Option<String>,
    e: Option<String>,
    crv: Option<String>,
    x: Option<String>,
    y: Option<String>,
}

/// Time-bounded cache of fetched key sets, keyed by endpoint URL. Cloning
/// shares the underlying map.
#[derive(Clone)]
pub struct JwksCache {
    ttl: Duration,
    inner: Arc<RwLock<HashMap<String, CachedKeySet>>>,
}

struct CachedKeySet {
    fetched_at: Instant,
    keys: Arc<KeySet>,
}

impl std::fmt::Debug for JwksCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwksCache").field("ttl", &self.ttl).finish()
    }
}

impl JwksCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn get(&self, url: &str) -> Option<Arc<KeySet>> {
        let guard = self.inner.read().await;
        guard
            .get(url)
            .filter(|cached| cached.fetched_at.elapsed() < self.ttl)
            .map(|cached| cached.keys.clone())
    }

    pub async fn insert(&self, url: impl Into<String>, keys: Arc<KeySet>) {
        let mut guard = self.inner.write().await;
        guard.insert(
            url.into(),
            CachedKeySet {
                fetched_at: Instant::now(),
                keys,
            },
        );
    }
}
