//! gpuplug-core: Core types for the gpuplug resource manager
//!
//! This crate provides the fundamental types used throughout gpuplug:
//! - Devices, their indices and health
//! - Resource names and matching rules
//! - Configuration types
//! - Error handling

pub mod config;
pub mod device;
pub mod error;
pub mod resource;

pub use config::*;
pub use device::*;
pub use error::*;
pub use resource::*;
