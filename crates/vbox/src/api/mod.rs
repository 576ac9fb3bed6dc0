//! HTTP API module.
//!
//! Mounts the editor socket, the preview proxy and the JSON management
//! endpoints on one router.

mod error;
mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
pub use state::AppState;
