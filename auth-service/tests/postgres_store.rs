use std::sync::Arc;

use auth_service::credentials::CredentialStore;
use auth_service::registry::ValidatorRegistry;
use auth_service::repository::postgres::PgStore;
use auth_service::repository::{SessionRepository, TrustConfigRepository};
use auth_service::sessions::{SessionIssuer, SessionTtl};
use chrono::Duration;
use common_auth::{AuthError, TrustConfig, TrustConfigRecord, ValidatorOptions};
use uuid::Uuid;

mod support;
use support::TestDatabase;

fn unique_site(prefix: &str) -> String {
    format!("{prefix}-{}.example.com", Uuid::new_v4().simple())
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres)")]
async fn accounts_sessions_and_cascade() -> anyhow::Result<()> {
    let Some(db) = TestDatabase::setup().await? else { return Ok(()); };
    let store = PgStore::new(db.pool_clone());
    let site = unique_site("pg");

    let credentials = CredentialStore::new(Arc::new(store.clone()), Duration::hours(1));
    let created = credentials
        .create_account(&site, "jane@example.com", "correct horse", "Jane")
        .await?;
    let err = credentials
        .create_account(&site, "JANE@example.com", "other", "Jane")
        .await
        .expect_err("duplicate email");
    assert!(matches!(err, AuthError::DuplicateEmail));

    let account = credentials
        .authenticate(&site, "jane@example.com", "correct horse")
        .await?;
    assert_eq!(account.id, created.account.id);

    let issuer = SessionIssuer::new(
        &TrustConfig::managed(&site, "pg-secret"),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        SessionTtl::default(),
    )?;
    let first = issuer.create_session(&account).await?;
    let second = issuer.create_session(&account).await?;

    let by_access = issuer.get_session_by_token(&first.access_token).await?;
    let by_refresh = issuer.get_session_by_refresh_token(&first.refresh_token).await?;
    assert_eq!(by_access.id, by_refresh.id);

    issuer.delete_session_by_token(&first.access_token).await?;
    assert!(matches!(
        issuer.get_session_by_token(&first.access_token).await,
        Err(AuthError::SessionNotFound)
    ));

    assert!(credentials.delete_account(account.id).await?);
    assert!(store
        .find_by_refresh_hash(&second.session.refresh_token_hash)
        .await?
        .is_none());

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres)")]
async fn reset_token_is_single_use_and_expires() -> anyhow::Result<()> {
    let Some(db) = TestDatabase::setup().await? else { return Ok(()); };
    let store = PgStore::new(db.pool_clone());
    let site = unique_site("reset");

    let credentials = CredentialStore::new(Arc::new(store.clone()), Duration::hours(1));
    credentials
        .create_account(&site, "jane@example.com", "old password", "Jane")
        .await?;

    let token = credentials
        .set_reset_token(&site, "jane@example.com")
        .await?
        .ok_or_else(|| anyhow::anyhow!("no token"))?;
    credentials.reset_password(&site, &token, "new password").await?;
    assert!(matches!(
        credentials.reset_password(&site, &token, "third password").await,
        Err(AuthError::ExpiredOrInvalidToken)
    ));
    credentials
        .authenticate(&site, "jane@example.com", "new password")
        .await?;

    let expired = CredentialStore::new(Arc::new(store.clone()), Duration::seconds(-1));
    let stale = expired
        .set_reset_token(&site, "jane@example.com")
        .await?
        .ok_or_else(|| anyhow::anyhow!("no token"))?;
    assert!(matches!(
        expired.reset_password(&site, &stale, "ignored").await,
        Err(AuthError::ExpiredOrInvalidToken)
    ));
    credentials
        .authenticate(&site, "jane@example.com", "new password")
        .await?;

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres)")]
async fn trust_configs_round_trip_through_the_registry() -> anyhow::Result<()> {
    let Some(db) = TestDatabase::setup().await? else { return Ok(()); };
    let store = PgStore::new(db.pool_clone());
    let site = unique_site("config");

    let registry = ValidatorRegistry::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        ValidatorOptions::default(),
        SessionTtl::default(),
    );
    let saved = registry
        .save_config(TrustConfigRecord {
            site_id: site.clone(),
            auth_mode: "external".into(),
            validation_method: Some("jwks".into()),
            jwks_endpoint: Some("https://id.example.com/.well-known/jwks.json".into()),
            ..Default::default()
        })
        .await?;
    assert_eq!(saved.expiration_buffer_seconds, 60);

    let stored = TrustConfigRepository::get(&store, &site)
        .await?
        .ok_or_else(|| anyhow::anyhow!("config not stored"))?;
    assert_eq!(TrustConfig::try_from(stored)?, saved);
    assert!(registry.validator(&site).await?.is_some());

    assert!(registry.delete_config(&site).await?);
    assert!(registry.validator(&site).await?.is_none());

    Ok(())
}
