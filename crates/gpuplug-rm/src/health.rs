//! Health monitoring for a resource pool
//!
//! A monitor subscribes to the hardware event stream of the GPUs backing
//! its pool and reports each device that hits a critical error exactly once
//! on the `unhealthy` channel. It runs until `stop` is cancelled or the
//! event stream fails.

use gpuplug_core::{Device, Devices, HealthConfig, MonitorError, ResourceName};
use gpuplug_nvml::{DeviceLib, EventKind, EventSource, HealthEvent};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::session::Session;

/// Xids caused by user applications rather than hardware faults
pub const APPLICATION_XIDS: [u64; 6] = [
    13,  // Graphics Engine Exception
    31,  // GPU memory page fault
    43,  // GPU stopped processing
    45,  // Preemptive cleanup, due to previous errors
    68,  // Video processor exception
    109, // Context Switch Timeout Error
];

/// An event subscription, closed when dropped
struct Subscription(Box<dyn EventSource>);

impl Drop for Subscription {
    fn drop(&mut self) {
        self.0.close();
        debug!("Health event subscription closed");
    }
}

/// Watch `devices` until `stop` is cancelled.
///
/// Returns `Ok(())` only after `stop`; any failure of the hardware event
/// stream ends the loop with an error and is not retried here.
pub async fn check_health(
    lib: &dyn DeviceLib,
    resource: &ResourceName,
    devices: &Devices,
    config: &HealthConfig,
    stop: CancellationToken,
    unhealthy: mpsc::Sender<Arc<Device>>,
) -> Result<(), MonitorError> {
    if config.disabled {
        info!(resource = %resource, "Health checks disabled");
        stop.cancelled().await;
        return Ok(());
    }

    let session = Session::open(lib).map_err(|e| MonitorError::Init(e.to_string()))?;

    let mut uuids: Vec<String> = Vec::new();
    for device in devices {
        if !uuids.iter().any(|u| u == device.parent_uuid()) {
            uuids.push(device.parent_uuid().to_string());
        }
    }

    let mut subscription = Subscription(session.subscribe(&uuids)?);
    info!(resource = %resource, gpus = uuids.len(), "Watching device health");

    loop {
        let event = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                debug!(resource = %resource, "Health monitor stopped");
                return Ok(());
            }
            event = subscription.0.next_event() => event,
        };

        let event = match event {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                error!(resource = %resource, error = %e, "Health event stream failed");
                return Err(e);
            }
            None => {
                error!(resource = %resource, "Health event stream closed");
                return Err(MonitorError::Closed);
            }
        };

        if !is_critical(&event, config) {
            continue;
        }

        for device in affected_devices(&event, devices) {
            if !device.is_healthy() {
                debug!(device = %device.id(), "Device already reported unhealthy");
                continue;
            }

            // The device only turns unhealthy once its report has a slot
            let permit = tokio::select! {
                biased;
                permit = unhealthy.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return Err(MonitorError::ReportChannelClosed),
                },
                _ = stop.cancelled() => {
                    warn!(
                        device = %device.id(),
                        "Stop requested while reporting, dropping unhealthy report"
                    );
                    return Ok(());
                }
            };

            if !device.mark_unhealthy() {
                continue;
            }
            warn!(
                resource = %resource,
                device = %device.id(),
                event = ?event.kind,
                "Marking device unhealthy"
            );
            permit.send(device);
        }
    }
}

/// Whether an event should make its devices unhealthy
fn is_critical(event: &HealthEvent, config: &HealthConfig) -> bool {
    match event.kind {
        EventKind::Xid(xid) if APPLICATION_XIDS.contains(&xid) => {
            info!(xid = xid, uuid = ?event.uuid, "Skipping application Xid");
            false
        }
        EventKind::Xid(xid) if config.ignored_xids.contains(&xid) => {
            info!(xid = xid, uuid = ?event.uuid, "Skipping ignored Xid");
            false
        }
        EventKind::Xid(_) | EventKind::RegistrationUnsupported => true,
        other => {
            debug!(kind = ?other, uuid = ?event.uuid, "Skipping non-critical event");
            false
        }
    }
}

/// Devices of this pool an event applies to
fn affected_devices(event: &HealthEvent, devices: &Devices) -> Vec<Arc<Device>> {
    let Some(uuid) = event.uuid.as_deref() else {
        debug!(kind = ?event.kind, "Event without a device, ignoring");
        return Vec::new();
    };

    devices
        .iter()
        .filter(|d| d.parent_uuid() == uuid)
        .filter(|d| match (event.placement, d.placement()) {
            (Some(at), Some(placement)) => at == placement,
            _ => true,
        })
        .cloned()
        .collect()
}
