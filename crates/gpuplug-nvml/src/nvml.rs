//! NVML-backed hardware library
//!
//! Enumeration runs on the caller's NVML session. Health events are pumped
//! by a dedicated thread that owns a second NVML session for the lifetime of
//! the subscription, since NVML event waits are blocking calls.
//!
//! MIG queries go through the raw `nvml_wrapper_sys` bindings where the
//! safe wrapper has no equivalent.

use async_trait::async_trait;
use gpuplug_core::{HardwareError, InitError, MonitorError, PartitionPlacement};
use nvml_wrapper::error::{nvml_try, NvmlError};
use nvml_wrapper_sys::bindings::{
    nvmlDeviceAttributes_t, nvmlDevice_t, nvmlEventData_t, nvmlGpuInstanceProfileInfo_t,
    NvmlLib as RawLib, NVML_DEVICE_MIG_ENABLE, NVML_GPU_INSTANCE_PROFILE_COUNT,
};
use nvml_wrapper::{Device, Nvml};
use std::collections::BTreeSet;
use std::ffi::CStr;
use std::os::raw::{c_char, c_uint};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::traits::{DeviceLib, EventSource, HealthEvent, LibHandle, Partition, PhysicalDevice};

type EventResult = Result<HealthEvent, MonitorError>;

/// Poll interval of the event pump, bounds how long a closed subscription
/// keeps its NVML session alive
const EVENT_WAIT_MS: u32 = 1000;

const EVENT_BUFFER: usize = 64;

const UUID_BUFFER_SIZE: usize = 96;

/// Instance id NVML reports for events not tied to a MIG instance
const NO_INSTANCE: u32 = u32::MAX;

/// NVIDIA hardware library
#[derive(Debug, Clone, Copy, Default)]
pub struct NvmlLib;

impl DeviceLib for NvmlLib {
    fn init(&self) -> Result<Box<dyn LibHandle>, InitError> {
        let nvml = Nvml::init().map_err(|e| InitError::Unavailable(e.to_string()))?;
        Ok(Box::new(NvmlHandle { nvml: Some(nvml) }))
    }

    fn has_partition_support(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "nvml"
    }
}

fn hardware_error(err: NvmlError) -> HardwareError {
    match err {
        NvmlError::NotSupported => HardwareError::NotSupported,
        other => HardwareError::Driver(other.to_string()),
    }
}

/// Profile name in NVIDIA's notation, e.g. `1g.5gb` or `1c.2g.10gb`
pub fn profile_name(gpu_slices: u32, compute_slices: u32, memory_mb: u64) -> String {
    let memory_gb = (memory_mb + 1023) / 1024;
    if compute_slices == gpu_slices {
        format!("{}g.{}gb", gpu_slices, memory_gb)
    } else {
        format!("{}c.{}g.{}gb", compute_slices, gpu_slices, memory_gb)
    }
}

fn raw_lib(nvml: &Nvml) -> &RawLib {
    unsafe { nvml.lib() }
}

fn raw_uuid(lib: &RawLib, device: nvmlDevice_t) -> Result<String, NvmlError> {
    let mut buf = [0 as c_char; UUID_BUFFER_SIZE];
    let len = UUID_BUFFER_SIZE as c_uint;
    nvml_try(unsafe { lib.nvmlDeviceGetUUID(device, buf.as_mut_ptr(), len) })?;
    let uuid = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Ok(uuid.to_string_lossy().into_owned())
}

fn mig_enabled(nvml: &Nvml, device: &Device) -> Result<bool, NvmlError> {
    let mut current: c_uint = 0;
    let mut pending: c_uint = 0;
    let ret = unsafe {
        raw_lib(nvml).nvmlDeviceGetMigMode(device.handle(), &mut current, &mut pending)
    };
    match nvml_try(ret) {
        Ok(()) => Ok(current == NVML_DEVICE_MIG_ENABLE),
        Err(NvmlError::NotSupported) => Ok(false),
        Err(e) => Err(e),
    }
}

fn describe_partition(
    lib: &RawLib,
    mig: nvmlDevice_t,
    index: u32,
) -> Result<Partition, NvmlError> {
    let uuid = raw_uuid(lib, mig)?;

    let mut gpu_instance_id: c_uint = 0;
    let mut compute_instance_id: c_uint = 0;
    nvml_try(unsafe { lib.nvmlDeviceGetGpuInstanceId(mig, &mut gpu_instance_id) })?;
    nvml_try(unsafe { lib.nvmlDeviceGetComputeInstanceId(mig, &mut compute_instance_id) })?;

    let mut attrs: nvmlDeviceAttributes_t = unsafe { std::mem::zeroed() };
    nvml_try(unsafe { lib.nvmlDeviceGetAttributes_v2(mig, &mut attrs) })?;

    Ok(Partition {
        index,
        uuid,
        profile: profile_name(
            attrs.gpuInstanceSliceCount,
            attrs.computeInstanceSliceCount,
            attrs.memorySizeMB,
        ),
        placement: PartitionPlacement {
            gpu_instance_id,
            compute_instance_id,
        },
    })
}

/// Initialized NVML session
pub struct NvmlHandle {
    nvml: Option<Nvml>,
}

impl NvmlHandle {
    fn nvml(&self) -> Result<&Nvml, HardwareError> {
        self.nvml
            .as_ref()
            .ok_or_else(|| HardwareError::Driver("NVML already shut down".to_string()))
    }
}

impl LibHandle for NvmlHandle {
    fn devices(&self) -> Result<Vec<PhysicalDevice>, HardwareError> {
        let nvml = self.nvml()?;
        let count = nvml.device_count().map_err(hardware_error)?;

        let mut devices = Vec::with_capacity(count as usize);
        for index in 0..count {
            let device = nvml.device_by_index(index).map_err(hardware_error)?;
            devices.push(PhysicalDevice {
                index,
                uuid: device.uuid().map_err(hardware_error)?,
                product_name: device.name().map_err(hardware_error)?,
                mig_enabled: mig_enabled(nvml, &device).map_err(hardware_error)?,
            });
        }
        Ok(devices)
    }

    fn partitions(&self, device: &PhysicalDevice) -> Result<Vec<Partition>, HardwareError> {
        let nvml = self.nvml()?;
        let lib = raw_lib(nvml);
        let parent = nvml
            .device_by_uuid(device.uuid.as_str())
            .map_err(hardware_error)?;
        let handle = unsafe { parent.handle() };

        let mut slots: c_uint = 0;
        nvml_try(unsafe { lib.nvmlDeviceGetMaxMigDeviceCount(handle, &mut slots) })
            .map_err(hardware_error)?;

        let mut partitions = Vec::new();
        for slot in 0..slots {
            let mut mig: nvmlDevice_t = std::ptr::null_mut();
            let ret = unsafe { lib.nvmlDeviceGetMigDeviceHandleByIndex(handle, slot, &mut mig) };
            match nvml_try(ret) {
                Ok(()) => {}
                // Empty slot
                Err(NvmlError::NotFound) => continue,
                Err(e) => return Err(hardware_error(e)),
            }
            let index = partitions.len() as u32;
            partitions.push(describe_partition(lib, mig, index).map_err(hardware_error)?);
        }

        debug!(uuid = %device.uuid, partitions = partitions.len(), "Enumerated MIG devices");
        Ok(partitions)
    }

    fn partition_profiles(&self) -> Result<Vec<String>, HardwareError> {
        let nvml = self.nvml()?;
        let lib = raw_lib(nvml);
        let count = nvml.device_count().map_err(hardware_error)?;

        let mut profiles = BTreeSet::new();
        for index in 0..count {
            let device = nvml.device_by_index(index).map_err(hardware_error)?;
            if !mig_enabled(nvml, &device).map_err(hardware_error)? {
                continue;
            }
            let handle = unsafe { device.handle() };

            for profile in 0..NVML_GPU_INSTANCE_PROFILE_COUNT {
                let mut info: nvmlGpuInstanceProfileInfo_t = unsafe { std::mem::zeroed() };
                let ret =
                    unsafe { lib.nvmlDeviceGetGpuInstanceProfileInfo(handle, profile, &mut info) };
                match nvml_try(ret) {
                    Ok(()) => {
                        let slices = info.sliceCount;
                        profiles.insert(profile_name(slices, slices, info.memorySizeMB));
                    }
                    Err(NvmlError::NotSupported) | Err(NvmlError::InvalidArg) => continue,
                    Err(e) => return Err(hardware_error(e)),
                }
            }
        }

        Ok(profiles.into_iter().collect())
    }

    /// Starts the event pump without waiting for it. Setup failures arrive
    /// as the first item of the stream.
    fn subscribe(&self, uuids: &[String]) -> Result<Box<dyn EventSource>, MonitorError> {
        Ok(Box::new(NvmlEventSource::spawn(uuids.to_vec())?))
    }

    fn shutdown(&mut self) -> Result<(), HardwareError> {
        match self.nvml.take() {
            Some(nvml) => nvml.shutdown().map_err(hardware_error),
            None => Ok(()),
        }
    }
}

#[cfg(target_os = "linux")]
fn pump_events(uuids: Vec<String>, tx: mpsc::Sender<EventResult>, closed: Arc<AtomicBool>) {
    use crate::traits::EventKind;
    use nvml_wrapper::bitmasks::event::EventTypes;

    let fail = |e: MonitorError| {
        let _ = tx.blocking_send(Err(e));
    };

    let nvml = match Nvml::init() {
        Ok(nvml) => nvml,
        Err(e) => return fail(MonitorError::Init(e.to_string())),
    };
    let mut set = match nvml.create_event_set() {
        Ok(set) => set,
        Err(e) => return fail(MonitorError::Subscribe(e.to_string())),
    };

    let mut unsupported = Vec::new();
    for uuid in &uuids {
        let device = match nvml.device_by_uuid(uuid.as_str()) {
            Ok(device) => device,
            Err(e) => return fail(MonitorError::Subscribe(format!("{}: {}", uuid, e))),
        };
        set = match device.register_events(EventTypes::CRITICAL_XID_ERROR, set) {
            Ok(set) => set,
            Err(e) => match (e.error, e.source) {
                (NvmlError::NotSupported, Some(set)) => {
                    warn!(uuid = %uuid, "Device does not support health events");
                    unsupported.push(uuid.clone());
                    set
                }
                (error, _) => {
                    return fail(MonitorError::Subscribe(format!("{}: {}", uuid, error)))
                }
            },
        };
    }

    for uuid in unsupported {
        let event = HealthEvent {
            uuid: Some(uuid),
            kind: EventKind::RegistrationUnsupported,
            placement: None,
        };
        if tx.blocking_send(Ok(event)).is_err() {
            return;
        }
    }

    let lib = raw_lib(&nvml);
    let set_handle = unsafe { set.handle() };

    while !closed.load(Ordering::Acquire) {
        let mut data: nvmlEventData_t = unsafe { std::mem::zeroed() };
        let ret = unsafe { lib.nvmlEventSetWait_v2(set_handle, &mut data, EVENT_WAIT_MS) };
        match nvml_try(ret) {
            Ok(()) => {}
            Err(NvmlError::Timeout) => continue,
            Err(e) => {
                let _ = tx.blocking_send(Err(MonitorError::Stream(e.to_string())));
                break;
            }
        }

        let event_type = EventTypes::from_bits_truncate(data.eventType);
        let kind = if event_type.contains(EventTypes::CRITICAL_XID_ERROR) {
            EventKind::Xid(data.eventData)
        } else if event_type.contains(EventTypes::DOUBLE_BIT_ECC_ERROR) {
            EventKind::DoubleBitEcc
        } else if event_type.contains(EventTypes::SINGLE_BIT_ECC_ERROR) {
            EventKind::SingleBitEcc
        } else {
            EventKind::Other(data.eventType)
        };
        let in_instance =
            data.gpuInstanceId != NO_INSTANCE && data.computeInstanceId != NO_INSTANCE;
        let placement = in_instance.then_some(PartitionPlacement {
            gpu_instance_id: data.gpuInstanceId,
            compute_instance_id: data.computeInstanceId,
        });
        let event = HealthEvent {
            uuid: raw_uuid(lib, data.device).ok(),
            kind,
            placement,
        };
        if tx.blocking_send(Ok(event)).is_err() {
            break;
        }
    }

    drop(set);
    debug!("NVML event pump stopped");
}

#[cfg(not(target_os = "linux"))]
fn pump_events(_uuids: Vec<String>, tx: mpsc::Sender<EventResult>, _closed: Arc<AtomicBool>) {
    let _ = tx.blocking_send(Err(MonitorError::Subscribe(
        "NVML events are only available on Linux".to_string(),
    )));
}

/// Receiving end of the event pump
struct NvmlEventSource {
    rx: mpsc::Receiver<EventResult>,
    closed: Arc<AtomicBool>,
}

impl NvmlEventSource {
    fn spawn(uuids: Vec<String>) -> Result<Self, MonitorError> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let closed = Arc::new(AtomicBool::new(false));

        let pump_closed = closed.clone();
        std::thread::Builder::new()
            .name("nvml-events".to_string())
            .spawn(move || pump_events(uuids, tx, pump_closed))
            .map_err(|e| MonitorError::Subscribe(e.to_string()))?;

        Ok(Self { rx, closed })
    }
}

#[async_trait]
impl EventSource for NvmlEventSource {
    async fn next_event(&mut self) -> Option<EventResult> {
        self.rx.recv().await
    }

    fn close(&mut self) {
        // The pump notices within one wait interval and drops its session
        self.closed.store(true, Ordering::Release);
        self.rx.close();
    }
}

impl Drop for NvmlEventSource {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_profile_name() {
        assert_eq!(profile_name(1, 1, 4864), "1g.5gb");
        assert_eq!(profile_name(3, 3, 19968), "3g.20gb");
        assert_eq!(profile_name(7, 7, 40192), "7g.40gb");
        assert_eq!(profile_name(2, 1, 9856), "1c.2g.10gb");
    }

    #[tokio::test]
    async fn test_subscribe_setup_failure_arrives_on_stream() {
        // No such GPU exists, so setup fails whether or not a driver is present
        let mut source = NvmlEventSource::spawn(vec!["GPU-does-not-exist".to_string()]).unwrap();

        let first = tokio::time::timeout(Duration::from_secs(10), source.next_event())
            .await
            .unwrap();
        assert!(matches!(
            first,
            Some(Err(MonitorError::Init(_))) | Some(Err(MonitorError::Subscribe(_)))
        ));
        source.close();
    }
}
