//! Allocatable devices and their health

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::atomic::{self, AtomicBool};
use std::sync::Arc;

/// Device health as seen by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Health {
    Healthy,
    Unhealthy,
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Health::Healthy => write!(f, "Healthy"),
            Health::Unhealthy => write!(f, "Unhealthy"),
        }
    }
}

/// Hardware enumeration index of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceIndex {
    /// A whole GPU
    Gpu(u32),
    /// A partition of the GPU at `parent`
    Partition { parent: u32, partition: u32 },
}

impl DeviceIndex {
    /// Index of the physical GPU this device lives on
    pub fn parent(&self) -> u32 {
        match self {
            DeviceIndex::Gpu(index) => *index,
            DeviceIndex::Partition { parent, .. } => *parent,
        }
    }

    fn key(&self) -> (u32, Option<u32>) {
        match self {
            DeviceIndex::Gpu(index) => (*index, None),
            DeviceIndex::Partition { parent, partition } => (*parent, Some(*partition)),
        }
    }
}

impl Ord for DeviceIndex {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl PartialOrd for DeviceIndex {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for DeviceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceIndex::Gpu(index) => write!(f, "{}", index),
            DeviceIndex::Partition { parent, partition } => write!(f, "{}:{}", parent, partition),
        }
    }
}

/// GPU and compute instance ids identifying a partition on its parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionPlacement {
    pub gpu_instance_id: u32,
    pub compute_instance_id: u32,
}

/// One allocatable unit: a whole accelerator or one partition of it
#[derive(Debug)]
pub struct Device {
    id: String,
    index: DeviceIndex,
    parent_uuid: String,
    model: String,
    placement: Option<PartitionPlacement>,
    unhealthy: AtomicBool,
}

impl Device {
    /// Create a healthy whole-GPU device
    pub fn gpu(uuid: impl Into<String>, index: u32, product_name: impl Into<String>) -> Self {
        let uuid = uuid.into();
        Self {
            parent_uuid: uuid.clone(),
            id: uuid,
            index: DeviceIndex::Gpu(index),
            model: product_name.into(),
            placement: None,
            unhealthy: AtomicBool::new(false),
        }
    }

    /// Create a healthy partition device
    pub fn partition(
        uuid: impl Into<String>,
        parent_uuid: impl Into<String>,
        parent: u32,
        partition: u32,
        profile: impl Into<String>,
        placement: PartitionPlacement,
    ) -> Self {
        Self {
            id: uuid.into(),
            index: DeviceIndex::Partition { parent, partition },
            parent_uuid: parent_uuid.into(),
            model: profile.into(),
            placement: Some(placement),
            unhealthy: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn index(&self) -> DeviceIndex {
        self.index
    }

    /// UUID of the physical GPU; equal to `id` for whole GPUs
    pub fn parent_uuid(&self) -> &str {
        &self.parent_uuid
    }

    /// Product name for GPUs, profile name for partitions
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn placement(&self) -> Option<PartitionPlacement> {
        self.placement
    }

    pub fn is_partition(&self) -> bool {
        self.placement.is_some()
    }

    pub fn health(&self) -> Health {
        if self.unhealthy.load(atomic::Ordering::Acquire) {
            Health::Unhealthy
        } else {
            Health::Healthy
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.health() == Health::Healthy
    }

    /// Mark the device unhealthy.
    ///
    /// Returns `true` only for the call that performed the transition, so
    /// each device is reported at most once.
    pub fn mark_unhealthy(&self) -> bool {
        !self.unhealthy.swap(true, atomic::Ordering::AcqRel)
    }

    /// Serializable view of the current device state
    pub fn status(&self) -> DeviceStatus {
        DeviceStatus {
            id: self.id.clone(),
            index: self.index.to_string(),
            model: self.model.clone(),
            health: self.health(),
        }
    }
}

/// Point-in-time view of a device for reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub id: String,
    pub index: String,
    pub model: String,
    pub health: Health,
}

/// Ordered, read-only set of devices owned by one resource pool
#[derive(Debug, Clone, Default)]
pub struct Devices(Vec<Arc<Device>>);

impl Devices {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Device>> {
        self.0.iter()
    }

    /// Look up a device by id
    pub fn get(&self, id: &str) -> Option<&Arc<Device>> {
        self.0.iter().find(|d| d.id() == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Device ids in pool order
    pub fn ids(&self) -> Vec<String> {
        self.0.iter().map(|d| d.id().to_string()).collect()
    }
}

impl From<Vec<Device>> for Devices {
    fn from(devices: Vec<Device>) -> Self {
        Self(devices.into_iter().map(Arc::new).collect())
    }
}

impl<'a> IntoIterator for &'a Devices {
    type Item = &'a Arc<Device>;
    type IntoIter = std::slice::Iter<'a, Arc<Device>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_unhealthy_is_sticky() {
        let device = Device::gpu("GPU-0", 0, "Tesla T4");
        assert!(device.is_healthy());

        assert!(device.mark_unhealthy());
        assert_eq!(device.health(), Health::Unhealthy);

        // Second transition is suppressed
        assert!(!device.mark_unhealthy());
        assert_eq!(device.health(), Health::Unhealthy);
    }

    #[test]
    fn test_device_index_ordering() {
        let gpu3 = DeviceIndex::Gpu(3);
        let part0 = DeviceIndex::Partition {
            parent: 0,
            partition: 1,
        };
        let gpu0 = DeviceIndex::Gpu(0);

        assert!(gpu0 < part0);
        assert!(part0 < gpu3);
        assert_eq!(part0.to_string(), "0:1");
        assert_eq!(gpu3.parent(), 3);
    }

    #[test]
    fn test_devices_lookup() {
        let devices = Devices::from(vec![
            Device::gpu("GPU-0", 0, "A100"),
            Device::gpu("GPU-1", 1, "A100"),
        ]);

        assert_eq!(devices.len(), 2);
        assert!(devices.contains("GPU-1"));
        assert!(!devices.contains("GPU-2"));
        assert_eq!(devices.ids(), vec!["GPU-0", "GPU-1"]);
    }

    #[test]
    fn test_partition_device() {
        let placement = PartitionPlacement {
            gpu_instance_id: 1,
            compute_instance_id: 0,
        };
        let device = Device::partition("MIG-a", "GPU-0", 0, 2, "1g.5gb", placement);

        assert!(device.is_partition());
        assert_eq!(device.parent_uuid(), "GPU-0");
        assert_eq!(device.placement(), Some(placement));

        let status = device.status();
        assert_eq!(status.index, "0:2");
        assert_eq!(status.health, Health::Healthy);
    }
}
