//! HTTP front end for the schemaforge pipeline.

pub mod config;
pub mod error;
pub mod handlers;
pub mod router;
pub mod state;
pub mod telemetry;

pub use config::ServerConfig;
pub use error::{AppError, AppResult};
pub use router::build_app_router;
pub use state::AppState;
