//! gpuplug-nvml: Hardware library abstraction
//!
//! This crate provides the seam between the resource managers and the
//! accelerator driver:
//! - `DeviceLib`/`LibHandle`/`EventSource` traits
//! - NVML backend (feature `nvml`)
//! - A null backend for builds without a driver library
//! - A scripted mock for tests (feature `mock`)

#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod null;
#[cfg(feature = "nvml")]
pub mod nvml;
pub mod traits;

#[cfg(any(test, feature = "mock"))]
pub use mock::{MockDeviceLib, MockEventSender};
pub use null::NullDeviceLib;
#[cfg(feature = "nvml")]
pub use nvml::NvmlLib;
pub use traits::{
    DeviceLib, EventKind, EventSource, HealthEvent, LibHandle, Partition, PhysicalDevice,
};
