//! REST API for the booking ingestion core.

pub mod auth_helpers;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod types;
pub mod utils;

mod rest;

pub use error::{ApiError, ErrorCode};
pub use extract::{ApiJson, ApiPath, ApiQuery};
pub use rest::*;
