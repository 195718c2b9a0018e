//! Service layer: the upload session protocol and its durable store.

pub mod upload_service;
