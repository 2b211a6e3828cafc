//! HTTP control API

pub mod auth;
pub mod extract;
pub mod handlers;
pub mod routes;
pub mod state;
pub mod types;

pub use routes::create_router;
pub use state::AppState;
pub use types::{ApiError, ErrorCode};
