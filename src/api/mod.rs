//! HTTP surface: routing, handlers and error responses

pub mod error;
pub mod handlers;
pub mod server;

pub use error::{ApiError, FieldError};
pub use handlers::{AppState, ProjectId, PROJECT_HEADER};
pub use server::{build_router, build_state, run_server, ServerConfig};
