//! Route composition.

pub mod routes;
