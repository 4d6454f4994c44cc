#![allow(dead_code)]

use std::{env, path::PathBuf};

use anyhow::Result;
use auth_service::config::ServiceConfig;
use auth_service::{build_router, AppState};
use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use common_auth::{TrustConfig, TrustConfigRecord};
use http_body_util::BodyExt;
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tower::util::ServiceExt;

pub const SITE: &str = "blog.example.com";

pub struct TestDatabase {
    pool: PgPool,
}

impl TestDatabase {
    pub async fn setup() -> Result<Option<Self>> {
        let Ok(database_url) = env::var("AUTH_TEST_DATABASE_URL") else {
            eprintln!(
                "Skipping auth-service integration tests: set AUTH_TEST_DATABASE_URL to run them.",
            );
            return Ok(None);
        };

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await?;
        run_migrations(&pool).await?;

        Ok(Some(Self { pool }))
    }

    pub fn pool_clone(&self) -> PgPool {
        self.pool.clone()
    }
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    let migrations_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations");
    let mut entries = std::fs::read_dir(&migrations_dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort();

    for path in entries {
        let sql = std::fs::read_to_string(&path)?;
        for statement in sql.split(';') {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                continue;
            }
            sqlx::query(trimmed).execute(pool).await?;
        }
    }

    Ok(())
}

/// Router over in-memory storage with `SITE` configured for managed accounts.
pub async fn managed_app() -> Result<(Router, AppState)> {
    let (state, _) = AppState::in_memory(ServiceConfig::default())?;
    state
        .registry
        .save_config(TrustConfigRecord::from(&TrustConfig::managed(
            SITE,
            common_auth::generate_signing_secret(),
        )))
        .await?;
    Ok((build_router(state.clone()), state))
}

pub fn json_request(method: &str, uri: &str, body: Value) -> Result<Request<Body>> {
    Ok(Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))?)
}

pub async fn send(app: &Router, request: Request<Body>) -> Result<Response<Body>> {
    Ok(app.clone().oneshot(request).await?)
}

pub async fn body_json(response: Response<Body>) -> Result<Value> {
    let bytes = response.into_body().collect().await?.to_bytes();
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn auth_path(site_id: &str, path: &str) -> String {
    format!("/api/v1/sites/{site_id}/auth{path}")
}
