use anyhow::Result;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct AuthMetrics {
    registry: Registry,
    login_attempts: IntCounterVec,
    token_validations: IntCounterVec,
    sessions_issued: IntCounter,
}

impl AuthMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let login_attempts = IntCounterVec::new(
            Opts::new(
                "auth_login_attempts_total",
                "Count of login attempts grouped by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(login_attempts.clone()))?;

        let token_validations = IntCounterVec::new(
            Opts::new(
                "auth_token_validations_total",
                "Count of token validations grouped by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(token_validations.clone()))?;

        let sessions_issued = IntCounter::new(
            "auth_sessions_issued_total",
            "Count of sessions issued by login or refresh",
        )?;
        registry.register(Box::new(sessions_issued.clone()))?;

        Ok(Self {
            registry,
            login_attempts,
            token_validations,
            sessions_issued,
        })
    }

    pub fn login_attempt(&self, outcome: &str) {
        self.login_attempts.with_label_values(&[outcome]).inc();
    }

    /// `outcome` is `accepted` or an error kind.
    pub fn token_validation(&self, outcome: &str) {
        self.token_validations.with_label_values(&[outcome]).inc();
    }

    pub fn session_issued(&self) {
        self.sessions_issued.inc();
    }

    pub fn render(&self) -> Result<Response> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            )
            .body(Body::from(buffer))?;
        Ok(response)
    }
}
