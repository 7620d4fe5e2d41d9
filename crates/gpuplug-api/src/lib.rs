//! gpuplug-api: HTTP service layer for gpuplug
//!
//! This crate exposes the resource managers over a small REST API:
//! - Resource pool listing
//! - Per-device health
//! - Preferred allocation

pub mod rest;

pub use rest::create_router;
