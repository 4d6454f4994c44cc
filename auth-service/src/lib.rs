pub mod app;
pub mod config;
pub mod credentials;
pub mod handlers;
pub mod metrics;
pub mod registry;
pub mod repository;
pub mod sessions;
pub mod tokens;

pub use app::{build_router, AppState};
