//! Hardware library trait definitions

use async_trait::async_trait;
use gpuplug_core::{HardwareError, InitError, MonitorError, PartitionPlacement};

/// A physical GPU as enumerated by the hardware library
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalDevice {
    /// Enumeration index
    pub index: u32,
    /// Device UUID
    pub uuid: String,
    /// Product name, e.g. "NVIDIA A100-SXM4-40GB"
    pub product_name: String,
    /// Whether partition (MIG) mode is enabled
    pub mig_enabled: bool,
}

impl PhysicalDevice {
    pub fn new(index: u32, uuid: impl Into<String>, product_name: impl Into<String>) -> Self {
        Self {
            index,
            uuid: uuid.into(),
            product_name: product_name.into(),
            mig_enabled: false,
        }
    }
}

/// One partition of a physical GPU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Partition index on its parent
    pub index: u32,
    /// Partition UUID
    pub uuid: String,
    /// Profile name, e.g. "1g.5gb"
    pub profile: String,
    /// Instance ids used to attribute health events
    pub placement: PartitionPlacement,
}

/// Kind of hardware health event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Critical Xid error with its code
    Xid(u64),
    /// Double-bit ECC error
    DoubleBitEcc,
    /// Single-bit ECC error
    SingleBitEcc,
    /// The device cannot deliver health events at all
    RegistrationUnsupported,
    /// Any other event type, carrying the raw type mask
    Other(u64),
}

/// A health notification from the hardware library
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthEvent {
    /// UUID of the physical GPU, if the library could resolve it
    pub uuid: Option<String>,
    /// What happened
    pub kind: EventKind,
    /// Partition the event is attributed to, if any
    pub placement: Option<PartitionPlacement>,
}

impl HealthEvent {
    pub fn xid(uuid: impl Into<String>, xid: u64) -> Self {
        Self {
            uuid: Some(uuid.into()),
            kind: EventKind::Xid(xid),
            placement: None,
        }
    }

    pub fn with_placement(mut self, placement: PartitionPlacement) -> Self {
        self.placement = Some(placement);
        self
    }
}

/// Entry point to a hardware library
pub trait DeviceLib: Send + Sync {
    /// Initialize the library, returning a handle that must be shut down
    fn init(&self) -> Result<Box<dyn LibHandle>, InitError>;

    /// Whether partition-aware enumeration is available at all
    fn has_partition_support(&self) -> bool;

    /// Backend name for logs
    fn name(&self) -> &'static str;
}

/// An initialized hardware library session
pub trait LibHandle: Send {
    /// Enumerate physical GPUs in index order
    fn devices(&self) -> Result<Vec<PhysicalDevice>, HardwareError>;

    /// Enumerate the partitions of a GPU
    fn partitions(&self, device: &PhysicalDevice) -> Result<Vec<Partition>, HardwareError>;

    /// Partition profiles the hardware can create
    fn partition_profiles(&self) -> Result<Vec<String>, HardwareError>;

    /// Subscribe to health events for the given physical GPUs
    fn subscribe(&self, uuids: &[String]) -> Result<Box<dyn EventSource>, MonitorError>;

    /// Release the session
    fn shutdown(&mut self) -> Result<(), HardwareError>;
}

/// A subscription to health events
#[async_trait]
pub trait EventSource: Send {
    /// Wait for the next event; `None` once the stream has ended
    async fn next_event(&mut self) -> Option<Result<HealthEvent, MonitorError>>;

    /// Release the subscription
    fn close(&mut self);
}
