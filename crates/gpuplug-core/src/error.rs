//! Error types for gpuplug

use thiserror::Error;

/// Failure reported by the hardware library for a single call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HardwareError {
    /// The operation is not supported by this device or driver
    #[error("not supported")]
    NotSupported,

    /// Any other driver failure
    #[error("{0}")]
    Driver(String),
}

/// Errors raised while building the device inventory
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InitError {
    /// The hardware library could not be initialized
    #[error("Failed to initialize hardware library: {0}")]
    Unavailable(String),

    /// Enumeration failed after a successful initialization
    #[error("Hardware error: {0}")]
    Hardware(#[from] HardwareError),

    /// Partitions on the node do not fit the configured strategy
    #[error("Invalid partition configuration: {0}")]
    InvalidPartitionConfig(String),

    /// Resource rules could not be applied
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Caller contract violations on an allocation request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidRequest {
    /// A required device is missing from the available set
    #[error("required device {0} is not in the available set")]
    RequiredNotAvailable(String),

    /// The device is not part of this resource pool
    #[error("device {id} is not part of resource {resource}")]
    UnknownDevice { id: String, resource: String },

    /// The same device appears twice in one list
    #[error("device {0} is listed more than once")]
    DuplicateDevice(String),

    /// The requested size is outside `[len(required), len(available)]`
    #[error("allocation size {size} is outside [{min}, {max}]")]
    SizeOutOfRange { size: usize, min: usize, max: usize },
}

/// Fatal errors of a health monitoring loop
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MonitorError {
    /// The hardware library could not be initialized for monitoring
    #[error("Failed to initialize hardware library: {0}")]
    Init(String),

    /// Registering for health events failed
    #[error("Failed to subscribe to health events: {0}")]
    Subscribe(String),

    /// Waiting on the event stream failed
    #[error("Health event stream failed: {0}")]
    Stream(String),

    /// The event stream ended while still watching
    #[error("Health event stream closed unexpectedly")]
    Closed,

    /// Nobody is receiving unhealthy device reports any more
    #[error("Unhealthy device channel closed")]
    ReportChannelClosed,
}

/// Top-level error type for the service layer and daemon
#[derive(Error, Debug)]
pub enum PluginError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Inventory build error
    #[error(transparent)]
    Init(#[from] InitError),

    /// Allocation contract violation
    #[error(transparent)]
    InvalidRequest(#[from] InvalidRequest),

    /// Health monitor error
    #[error(transparent)]
    Monitor(#[from] MonitorError),

    /// Resource not found
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for gpuplug operations
pub type PluginResult<T> = Result<T, PluginError>;

impl From<toml::de::Error> for PluginError {
    fn from(err: toml::de::Error) -> Self {
        PluginError::Config(format!("Failed to parse config: {}", err))
    }
}
