//! Core data models for the upload coordinator.
//!
//! These entities represent one resumable upload attempt and its durably
//! acknowledged parts. They map cleanly to database tables via
//! `sqlx::FromRow` and serialize naturally as JSON via `serde`.

pub mod part;
pub mod session;
pub mod wire;
