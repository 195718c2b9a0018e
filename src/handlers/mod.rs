//! HTTP handler modules.

pub mod backend_handlers;
pub mod health_handlers;
pub mod upload_handlers;
