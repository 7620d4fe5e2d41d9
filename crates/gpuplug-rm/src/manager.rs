//! Resource manager: one resource name bound to its devices

use gpuplug_core::{Device, Devices, HealthConfig, InvalidRequest, MonitorError, ResourceName};
use gpuplug_nvml::DeviceLib;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::allocator::preferred_allocation;
use crate::health::check_health;

/// Lists a pool of devices, picks allocations from it and watches its health
#[derive(Clone)]
pub struct ResourceManager {
    resource: ResourceName,
    devices: Devices,
    lib: Arc<dyn DeviceLib>,
    health: HealthConfig,
}

impl ResourceManager {
    /// Create a manager for an already classified pool
    pub fn new(
        resource: ResourceName,
        devices: Devices,
        lib: Arc<dyn DeviceLib>,
        health: HealthConfig,
    ) -> Self {
        Self {
            resource,
            devices,
            lib,
            health,
        }
    }

    /// The resource name advertised for this pool
    pub fn resource(&self) -> &ResourceName {
        &self.resource
    }

    /// The devices managed by this pool
    pub fn devices(&self) -> &Devices {
        &self.devices
    }

    pub fn device(&self, id: &str) -> Option<&Arc<Device>> {
        self.devices.get(id)
    }

    pub fn healthy_devices(&self) -> Vec<Arc<Device>> {
        self.devices
            .iter()
            .filter(|d| d.is_healthy())
            .cloned()
            .collect()
    }

    /// Pick `size` devices out of `available`, always including `required`
    pub fn get_preferred_allocation(
        &self,
        available: &[String],
        required: &[String],
        size: usize,
    ) -> Result<Vec<String>, InvalidRequest> {
        preferred_allocation(&self.resource, &self.devices, available, required, size)
    }

    /// Watch device health, sending newly unhealthy devices to `unhealthy`,
    /// until `stop` is cancelled
    pub async fn check_health(
        &self,
        stop: CancellationToken,
        unhealthy: mpsc::Sender<Arc<Device>>,
    ) -> Result<(), MonitorError> {
        check_health(
            self.lib.as_ref(),
            &self.resource,
            &self.devices,
            &self.health,
            stop,
            unhealthy,
        )
        .await
    }
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("resource", &self.resource)
            .field("devices", &self.devices.len())
            .field("backend", &self.lib.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuplug_nvml::{HealthEvent, MockDeviceLib, PhysicalDevice};
    use std::time::Duration;

    use crate::inventory::build_resource_managers;
    use gpuplug_core::PluginConfig;

    fn four_gpus() -> MockDeviceLib {
        (0..4).fold(MockDeviceLib::new(), |lib, i| {
            lib.with_gpu(PhysicalDevice::new(i, format!("GPU-{}", i), "Tesla T4"))
        })
    }

    fn managers(lib: &MockDeviceLib) -> Vec<ResourceManager> {
        let mut config = PluginConfig::default();
        config.resources.add_gpu_resource("*", "gpu").unwrap();
        build_resource_managers(&config, Arc::new(lib.clone())).unwrap()
    }

    #[test]
    fn test_manager_accessors() {
        let lib = four_gpus();
        let rms = managers(&lib);
        assert_eq!(rms.len(), 1);

        let rm = &rms[0];
        assert_eq!(rm.resource().as_str(), "nvidia.com/gpu");
        assert_eq!(rm.devices().ids(), vec!["GPU-0", "GPU-1", "GPU-2", "GPU-3"]);
        assert!(rm.device("GPU-2").is_some());
        assert_eq!(rm.healthy_devices().len(), 4);
    }

    #[test]
    fn test_manager_preferred_allocation() {
        let lib = four_gpus();
        let rms = managers(&lib);
        let rm = &rms[0];
        let available = rm.devices().ids();

        let result = rm
            .get_preferred_allocation(&available, &["GPU-2".to_string()], 2)
            .unwrap();
        assert_eq!(result, vec!["GPU-2", "GPU-0"]);

        let result = rm.get_preferred_allocation(&available, &[], 5);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_manager_health_feeds_allocation() {
        let lib = four_gpus();
        let events = lib.event_stream();
        let rm = managers(&lib).remove(0);

        let stop = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(4);
        let monitor = {
            let rm = rm.clone();
            let stop = stop.clone();
            tokio::spawn(async move { rm.check_health(stop, tx).await })
        };

        events.send(Ok(HealthEvent::xid("GPU-0", 79))).unwrap();
        let device = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(device.id(), "GPU-0");
        assert_eq!(rm.healthy_devices().len(), 3);

        let result = rm
            .get_preferred_allocation(&rm.devices().ids(), &[], 1)
            .unwrap();
        assert_eq!(result, vec!["GPU-1"]);

        stop.cancel();
        assert_eq!(monitor.await.unwrap(), Ok(()));
        assert_eq!(lib.close_count(), 1);
        // One session for the inventory, one for the monitor
        assert_eq!(lib.init_count(), 2);
        assert_eq!(lib.shutdown_count(), 2);
    }
}
