//! gpuplug-rm: Resource managers for accelerator devices
//!
//! This crate turns the hardware inventory into orchestrator-visible
//! resource pools:
//! - Inventory building from resource matching rules
//! - Preferred allocation within a pool
//! - Health monitoring with unhealthy transition reports

pub mod allocator;
pub mod health;
pub mod inventory;
pub mod manager;
pub mod session;

pub use allocator::preferred_allocation;
pub use health::check_health;
pub use inventory::{add_default_resources, build_device_map, build_resource_managers, DeviceMap};
pub use manager::ResourceManager;
pub use session::Session;
