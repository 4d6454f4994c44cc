use anyhow::{anyhow, Context, Result};
use std::env;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use common_auth::{ValidatorOptions, AUTH_COOKIE_NAME};

use crate::sessions::SessionTtl;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieSameSite {
    Lax,
    Strict,
    None,
}

impl CookieSameSite {
    pub fn as_str(&self) -> &'static str {
        match self {
            CookieSameSite::Lax => "Lax",
            CookieSameSite::Strict => "Strict",
            CookieSameSite::None => "None",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieSettings {
    pub name: String,
    pub domain: Option<String>,
    pub secure: bool,
    pub same_site: CookieSameSite,
}

impl Default for CookieSettings {
    fn default() -> Self {
        Self {
            name: AUTH_COOKIE_NAME.to_string(),
            domain: None,
            secure: false,
            same_site: CookieSameSite::Lax,
        }
    }
}

impl CookieSettings {
    /// `Set-Cookie` value carrying an access token for `max_age_seconds`.
    pub fn issue(&self, token: &str, max_age_seconds: i64) -> String {
        let mut cookie = format!(
            "{}={}; Path=/; HttpOnly; SameSite={}; Max-Age={}",
            self.name,
            token,
            self.same_site.as_str(),
            max_age_seconds.max(0)
        );
        self.push_attributes(&mut cookie);
        cookie
    }

    /// `Set-Cookie` value that removes the cookie.
    pub fn clear(&self) -> String {
        let mut cookie = format!(
            "{}=; Path=/; HttpOnly; SameSite={}; Max-Age=0",
            self.name,
            self.same_site.as_str()
        );
        self.push_attributes(&mut cookie);
        cookie
    }

    fn push_attributes(&self, cookie: &mut String) {
        if let Some(domain) = &self.domain {
            cookie.push_str("; Domain=");
            cookie.push_str(domain);
        }
        if self.secure {
            cookie.push_str("; Secure");
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub database_url: Option<String>,
    pub host: IpAddr,
    pub port: u16,
    pub access_ttl_seconds: u64,
    pub refresh_ttl_seconds: u64,
    pub reset_token_ttl_seconds: u64,
    pub jwks_timeout_ms: u64,
    pub jwks_cache_ttl_seconds: u64,
    pub cookie: CookieSettings,
    /// Origins allowed to make credentialed (cookie) requests. Empty means
    /// any origin may call with a bearer token but never with cookies.
    pub allowed_origins: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            host: IpAddr::from([0, 0, 0, 0]),
            port: 8085,
            access_ttl_seconds: 3600,
            refresh_ttl_seconds: 2_592_000,
            reset_token_ttl_seconds: 3600,
            jwks_timeout_ms: 5000,
            jwks_cache_ttl_seconds: 0,
            cookie: CookieSettings::default(),
            allowed_origins: Vec::new(),
        }
    }
}

impl ServiceConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from((self.host, self.port))
    }

    pub fn session_ttl(&self) -> SessionTtl {
        SessionTtl {
            access: seconds(self.access_ttl_seconds),
            refresh: seconds(self.refresh_ttl_seconds),
        }
    }

    pub fn reset_token_ttl(&self) -> chrono::Duration {
        seconds(self.reset_token_ttl_seconds)
    }

    pub fn validator_options(&self) -> ValidatorOptions {
        ValidatorOptions::default()
            .with_jwks_timeout(Duration::from_millis(self.jwks_timeout_ms))
            .with_jwks_cache_ttl(Duration::from_secs(self.jwks_cache_ttl_seconds))
    }
}

fn seconds(value: u64) -> chrono::Duration {
    let max = i64::MAX / 1000;
    chrono::Duration::seconds(i64::try_from(value).unwrap_or(max).min(max))
}

pub fn load_service_config() -> Result<ServiceConfig> {
    let defaults = ServiceConfig::default();

    let database_url = env::var("DATABASE_URL")
        .ok()
        .and_then(|value| normalize_optional(&value));

    let host = match env::var("HOST").ok().and_then(|value| normalize_optional(&value)) {
        Some(value) => value
            .parse()
            .with_context(|| format!("Failed to parse HOST '{value}'"))?,
        None => defaults.host,
    };
    let port = match env::var("PORT").ok().and_then(|value| normalize_optional(&value)) {
        Some(value) => value
            .parse()
            .with_context(|| format!("Failed to parse PORT '{value}'"))?,
        None => defaults.port,
    };

    let access_ttl_seconds = ttl_from_env("AUTH_ACCESS_TTL_SECONDS", defaults.access_ttl_seconds)?;
    let refresh_ttl_seconds =
        ttl_from_env("AUTH_REFRESH_TTL_SECONDS", defaults.refresh_ttl_seconds)?;
    let reset_token_ttl_seconds =
        ttl_from_env("AUTH_RESET_TOKEN_TTL_SECONDS", defaults.reset_token_ttl_seconds)?;
    let jwks_timeout_ms = u64_from_env("AUTH_JWKS_TIMEOUT_MS")?.unwrap_or(defaults.jwks_timeout_ms);
    let jwks_cache_ttl_seconds =
        u64_from_env("AUTH_JWKS_CACHE_TTL_SECONDS")?.unwrap_or(defaults.jwks_cache_ttl_seconds);

    let cookie = CookieSettings {
        name: env::var("AUTH_COOKIE_NAME")
            .ok()
            .and_then(|value| normalize_optional(&value))
            .unwrap_or(defaults.cookie.name),
        domain: env::var("AUTH_COOKIE_DOMAIN")
            .ok()
            .and_then(|value| normalize_optional(&value)),
        secure: bool_from_env("AUTH_COOKIE_SECURE").unwrap_or(false),
        same_site: env::var("AUTH_COOKIE_SAMESITE")
            .ok()
            .map(|value| parse_same_site(&value))
            .transpose()
            .context("Failed to parse AUTH_COOKIE_SAMESITE")?
            .unwrap_or(CookieSameSite::Lax),
    };

    let allowed_origins = env::var("AUTH_ALLOWED_ORIGINS")
        .map(|value| parse_origins(&value))
        .unwrap_or_default();

    Ok(ServiceConfig {
        database_url,
        host,
        port,
        access_ttl_seconds,
        refresh_ttl_seconds,
        reset_token_ttl_seconds,
        jwks_timeout_ms,
        jwks_cache_ttl_seconds,
        cookie,
        allowed_origins,
    })
}

/// Ten years.
pub const MAX_TTL_SECONDS: u64 = 315_360_000;

/// Lifetime in seconds, between one second and [`MAX_TTL_SECONDS`].
pub fn ttl_from_env(key: &str, default: u64) -> Result<u64> {
    let value = u64_from_env(key)?.unwrap_or(default);
    if value == 0 || value > MAX_TTL_SECONDS {
        return Err(anyhow!(
            "{key} must be between 1 and {MAX_TTL_SECONDS} seconds, got {value}"
        ));
    }
    Ok(value)
}

pub fn bool_from_env(key: &str) -> Option<bool> {
    env::var(key).ok().map(|value| {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

pub fn u64_from_env(key: &str) -> Result<Option<u64>> {
    env::var(key)
        .ok()
        .and_then(|value| normalize_optional(&value))
        .map(|value| {
            value
                .parse::<u64>()
                .map_err(|err| anyhow!("Invalid value for {key} '{value}': {err}"))
        })
        .transpose()
}

pub fn normalize_optional(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_origins(value: &str) -> Vec<String> {
    value
        .split(',')
        .filter_map(normalize_optional)
        .map(|origin| origin.trim_end_matches('/').to_string())
        .collect()
}

fn parse_same_site(value: &str) -> Result<CookieSameSite> {
    match value.trim().to_ascii_lowercase().as_str() {
        "lax" => Ok(CookieSameSite::Lax),
        "strict" => Ok(CookieSameSite::Strict),
        "none" => Ok(CookieSameSite::None),
        other => Err(anyhow!(
            "Unsupported cookie same-site policy '{other}'. Use Lax, Strict, or None."
        )),
    }
}
