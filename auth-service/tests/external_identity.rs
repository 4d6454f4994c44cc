use auth_service::config::ServiceConfig;
use auth_service::{build_router, AppState};
use axum::body::Body;
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::{Request, StatusCode};
use chrono::Utc;
use common_auth::TrustConfigRecord;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};

mod support;
use support::{auth_path, body_json, send};

const SITE: &str = "docs.example.com";
const SECRET: &str = "tenant-provider-secret";

fn provider_token(secret: &str, exp_offset: i64) -> String {
    let now = Utc::now().timestamp();
    let claims = json!({
        "iss": "https://id.example.com",
        "sub": "u1",
        "aud": "kotomi",
        "iat": now,
        "exp": now + exp_offset,
        "kotomi_user": { "id": "u1", "name": "Jane", "email": "jane@example.com", "roles": ["editor"] },
    });
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("token")
}

async fn external_app() -> anyhow::Result<(axum::Router, AppState)> {
    let (state, _) = AppState::in_memory(ServiceConfig::default())?;
    state
        .registry
        .save_config(TrustConfigRecord {
            site_id: SITE.into(),
            auth_mode: "external".into(),
            validation_method: Some("hmac".into()),
            secret: Some(SECRET.into()),
            issuer: Some("https://id.example.com".into()),
            audience: Some("kotomi".into()),
            expiration_buffer_seconds: 60,
            ..Default::default()
        })
        .await?;
    Ok((build_router(state.clone()), state))
}

async fn identity(app: &axum::Router, header: (&str, String)) -> anyhow::Result<(StatusCode, Value)> {
    let request = Request::builder()
        .uri(auth_path(SITE, "/identity"))
        .header(header.0, header.1)
        .body(Body::empty())?;
    let response = send(app, request).await?;
    let status = response.status();
    Ok((status, body_json(response).await?))
}

#[tokio::test]
async fn provider_tokens_resolve_to_the_canonical_identity() -> anyhow::Result<()> {
    let (app, _) = external_app().await?;

    let (status, body) = identity(
        &app,
        (AUTHORIZATION.as_str(), format!("Bearer {}", provider_token(SECRET, 3600))),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "u1");
    assert_eq!(body["name"], "Jane");
    assert_eq!(body["roles"], json!(["editor"]));

    let (status, _) = identity(
        &app,
        (COOKIE.as_str(), format!("kotomi_auth_token={}", provider_token(SECRET, 3600))),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);

    Ok(())
}

#[tokio::test]
async fn every_rejection_renders_the_same_body() -> anyhow::Result<()> {
    let (app, _) = external_app().await?;

    let cases = [
        format!("Bearer {}", provider_token("someone-else", 3600)),
        format!("Bearer {}", provider_token(SECRET, -3600)),
        "Bearer not-a-token".to_string(),
        "Basic dXNlcjpwdw==".to_string(),
    ];

    let mut bodies = Vec::new();
    for value in cases {
        let (status, body) = identity(&app, (AUTHORIZATION.as_str(), value)).await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        bodies.push(body);
    }
    assert!(bodies.iter().all(|body| body == &bodies[0]));
    assert_eq!(bodies[0]["code"], "AUTH_REJECTED");

    Ok(())
}

#[tokio::test]
async fn external_sites_have_no_local_accounts() -> anyhow::Result<()> {
    let (app, _) = external_app().await?;

    let config = send(
        &app,
        Request::builder()
            .uri(auth_path(SITE, "/config"))
            .body(Body::empty())?,
    )
    .await?;
    let body = body_json(config).await?;
    assert_eq!(body["auth_mode"], "external");
    assert_eq!(body["validation_method"], "hmac");
    assert!(body.get("secret").is_none());

    let signup = support::json_request(
        "POST",
        &auth_path(SITE, "/signup"),
        json!({ "email": "jane@example.com", "password": "pw", "name": "Jane" }),
    )?;
    assert_eq!(send(&app, signup).await?.status(), StatusCode::UNAUTHORIZED);

    Ok(())
}

#[tokio::test]
async fn deleting_the_config_makes_the_site_anonymous() -> anyhow::Result<()> {
    let (app, state) = external_app().await?;
    let bearer = format!("Bearer {}", provider_token(SECRET, 3600));

    let (status, _) = identity(&app, (AUTHORIZATION.as_str(), bearer.clone())).await?;
    assert_eq!(status, StatusCode::OK);

    assert!(state.registry.delete_config(SITE).await?);
    let (status, _) = identity(&app, (AUTHORIZATION.as_str(), bearer)).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    Ok(())
}
