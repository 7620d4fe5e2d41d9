//! Device inventory: classifies hardware into resource pools
//!
//! The inventory is built once at start-up. Every physical GPU, or each of
//! its partitions when the partition strategy asks for them, is matched
//! against the configured rules in order and lands in the pool of the first
//! rule that matches. Devices matching no rule are not advertised.

use gpuplug_core::{
    Device, InitError, MigStrategy, PluginConfig, PluginError, ResourceName,
};
use gpuplug_nvml::{DeviceLib, LibHandle};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::manager::ResourceManager;
use crate::session::Session;

/// Devices per resource name, in enumeration order
pub type DeviceMap = BTreeMap<ResourceName, Vec<Device>>;

/// Build one resource manager per non-empty resource pool.
///
/// When the hardware library cannot be initialized this fails only if
/// `fail_on_init_error` is set; otherwise the node runs with no pools.
pub fn build_resource_managers(
    config: &PluginConfig,
    lib: Arc<dyn DeviceLib>,
) -> Result<Vec<ResourceManager>, InitError> {
    let session = match open_session(config, lib.as_ref())? {
        Some(session) => session,
        None => return Ok(Vec::new()),
    };

    let device_map = build_device_map(config, lib.as_ref(), &*session)?;
    drop(session);

    let managers: Vec<ResourceManager> = device_map
        .into_iter()
        .filter(|(_, devices)| !devices.is_empty())
        .map(|(resource, devices)| {
            info!(
                resource = %resource,
                devices = devices.len(),
                "Resource pool discovered"
            );
            ResourceManager::new(resource, devices.into(), lib.clone(), config.health.clone())
        })
        .collect();

    Ok(managers)
}

/// Open a session, applying the fail-fast policy on failure
fn open_session(config: &PluginConfig, lib: &dyn DeviceLib) -> Result<Option<Session>, InitError> {
    match Session::open(lib) {
        Ok(session) => Ok(Some(session)),
        Err(e) => {
            warn!(backend = lib.name(), error = %e, "Failed to initialize hardware library");
            warn!("If this is a GPU node, check that the container runtime exposes the GPU driver");
            warn!(
                "If this is not a GPU node, schedule the plugin on GPU nodes only \
                 using a node selector or toleration"
            );
            if config.flags.fail_on_init_error {
                return Err(e);
            }
            warn!("Continuing without any resources");
            Ok(None)
        }
    }
}

/// Partition strategy after checking what the hardware library supports
fn effective_strategy(config: &PluginConfig, lib: &dyn DeviceLib) -> MigStrategy {
    let strategy = config.flags.mig_strategy;
    if strategy != MigStrategy::None && !lib.has_partition_support() {
        warn!(
            strategy = %strategy,
            backend = lib.name(),
            "Partitioning is not supported by the hardware library, falling back to none"
        );
        return MigStrategy::None;
    }
    strategy
}

/// Classify every device reachable through `handle`
pub fn build_device_map(
    config: &PluginConfig,
    lib: &dyn DeviceLib,
    handle: &dyn LibHandle,
) -> Result<DeviceMap, InitError> {
    let strategy = effective_strategy(config, lib);
    let resources = &config.resources;

    let mut map = DeviceMap::new();
    let mut profiles = BTreeSet::new();

    for gpu in handle.devices()? {
        if strategy == MigStrategy::None || !gpu.mig_enabled {
            match resources.match_gpu(&gpu.product_name) {
                Some(name) => {
                    debug!(uuid = %gpu.uuid, resource = %name, "Matched GPU");
                    map.entry(name.clone())
                        .or_default()
                        .push(Device::gpu(gpu.uuid.clone(), gpu.index, gpu.product_name.clone()));
                }
                None => debug!(
                    uuid = %gpu.uuid,
                    product = %gpu.product_name,
                    "No resource matches GPU"
                ),
            }
            continue;
        }

        let partitions = handle.partitions(&gpu)?;
        if partitions.is_empty() {
            warn!(
                uuid = %gpu.uuid,
                "Partitioning enabled but no partitions configured, skipping GPU"
            );
            continue;
        }

        for part in partitions {
            profiles.insert(part.profile.clone());
            match resources.match_mig(&part.profile) {
                Some(name) => {
                    debug!(uuid = %part.uuid, resource = %name, "Matched partition");
                    map.entry(name.clone()).or_default().push(Device::partition(
                        part.uuid,
                        gpu.uuid.clone(),
                        gpu.index,
                        part.index,
                        part.profile,
                        part.placement,
                    ));
                }
                None => debug!(
                    uuid = %part.uuid,
                    profile = %part.profile,
                    "No resource matches partition"
                ),
            }
        }
    }

    if strategy == MigStrategy::Single && profiles.len() > 1 {
        return Err(InitError::InvalidPartitionConfig(format!(
            "strategy single requires one partition profile, found {:?}",
            profiles
        )));
    }

    Ok(map)
}

/// Install the default matching rules when the config declares none
pub fn add_default_resources(
    config: &mut PluginConfig,
    lib: &dyn DeviceLib,
) -> Result<(), InitError> {
    if !config.resources.is_empty() {
        return Ok(());
    }

    config.resources.add_gpu_resource("*", "gpu").map_err(config_error)?;

    match config.flags.mig_strategy {
        MigStrategy::None => Ok(()),
        MigStrategy::Single => config
            .resources
            .add_mig_resource("*", "gpu")
            .map_err(config_error),
        MigStrategy::Mixed => {
            if !lib.has_partition_support() {
                warn!(
                    backend = lib.name(),
                    "Strategy mixed needs partition support from the hardware library"
                );
                return Ok(());
            }

            let session = match open_session(config, lib)? {
                Some(session) => session,
                None => return Ok(()),
            };
            for profile in session.partition_profiles()? {
                config
                    .resources
                    .add_mig_resource(&profile, &format!("mig-{}", profile))
                    .map_err(config_error)?;
            }
            Ok(())
        }
    }
}

fn config_error(err: PluginError) -> InitError {
    InitError::Config(err.to_string())
}
