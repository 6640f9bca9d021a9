//! HTTP gateway exposing mail-server administration over pooled remote shell sessions.

pub mod auth;
pub mod boundary;
pub mod config;
pub mod metrics;
pub mod routes;
pub mod state;
pub mod telemetry;

pub use config::AppConfig;
pub use routes::build_router;
pub use state::AppState;
