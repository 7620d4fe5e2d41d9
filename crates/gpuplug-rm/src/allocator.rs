//! Preferred allocation over a resource pool
//!
//! The result always starts with the required devices in the caller's
//! order, followed by the best-ranked remaining candidates. Candidates are
//! ranked by:
//!
//! 1. healthy before unhealthy,
//! 2. sharing a physical GPU with a required device,
//! 3. ascending hardware index,
//! 4. position in the available list.
//!
//! The last key makes the order total, so identical inputs always produce
//! identical output. Returning every available device follows the same
//! ranking, so the result is in ranked order rather than caller order.

use gpuplug_core::{Device, Devices, InvalidRequest, ResourceName};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Choose `size` device ids out of `available`, always including `required`
pub fn preferred_allocation(
    resource: &ResourceName,
    pool: &Devices,
    available: &[String],
    required: &[String],
    size: usize,
) -> Result<Vec<String>, InvalidRequest> {
    let by_id: HashMap<&str, &Arc<Device>> = pool.iter().map(|d| (d.id(), d)).collect();

    let mut available_set = HashSet::with_capacity(available.len());
    for id in available {
        if !by_id.contains_key(id.as_str()) {
            return Err(InvalidRequest::UnknownDevice {
                id: id.clone(),
                resource: resource.to_string(),
            });
        }
        if !available_set.insert(id.as_str()) {
            return Err(InvalidRequest::DuplicateDevice(id.clone()));
        }
    }

    let mut required_set = HashSet::with_capacity(required.len());
    for id in required {
        if !available_set.contains(id.as_str()) {
            return Err(InvalidRequest::RequiredNotAvailable(id.clone()));
        }
        if !required_set.insert(id.as_str()) {
            return Err(InvalidRequest::DuplicateDevice(id.clone()));
        }
    }

    if size < required.len() || size > available.len() {
        return Err(InvalidRequest::SizeOutOfRange {
            size,
            min: required.len(),
            max: available.len(),
        });
    }

    let required_parents: HashSet<u32> = required
        .iter()
        .filter_map(|id| by_id.get(id.as_str()))
        .map(|d| d.index().parent())
        .collect();

    // Health is read once per candidate so the sort keys stay consistent
    let mut candidates: Vec<_> = available
        .iter()
        .enumerate()
        .filter(|(_, id)| !required_set.contains(id.as_str()))
        .filter_map(|(position, id)| by_id.get(id.as_str()).map(|d| (position, *d)))
        .map(|(position, device)| {
            let key = (
                !device.is_healthy(),
                !required_parents.contains(&device.index().parent()),
                device.index(),
                position,
            );
            (key, device.id())
        })
        .collect();
    candidates.sort_by(|a, b| a.0.cmp(&b.0));

    let mut allocation = required.to_vec();
    allocation.extend(
        candidates
            .into_iter()
            .take(size - required.len())
            .map(|(_, id)| id.to_string()),
    );

    debug!(
        resource = %resource,
        size = size,
        required = required.len(),
        allocation = ?allocation,
        "Computed preferred allocation"
    );

    Ok(allocation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuplug_core::PartitionPlacement;

    fn gpu_pool(ids: &[&str]) -> Devices {
        Devices::from(
            ids.iter()
                .enumerate()
                .map(|(i, id)| Device::gpu(*id, i as u32, "Tesla T4"))
                .collect::<Vec<_>>(),
        )
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn resource() -> ResourceName {
        ResourceName::new("gpu").unwrap()
    }

    #[test]
    fn test_required_then_lowest_index() {
        let pool = gpu_pool(&["A", "B", "C", "D"]);
        let result =
            preferred_allocation(&resource(), &pool, &ids(&["A", "B", "C", "D"]), &ids(&["C"]), 2)
                .unwrap();
        assert_eq!(result, ids(&["C", "A"]));
    }

    #[test]
    fn test_index_beats_available_order() {
        let pool = gpu_pool(&["A", "B", "C", "D"]);
        let result =
            preferred_allocation(&resource(), &pool, &ids(&["D", "B", "C"]), &[], 2).unwrap();
        assert_eq!(result, ids(&["B", "C"]));
    }

    #[test]
    fn test_size_equals_required() {
        let pool = gpu_pool(&["A", "B", "C", "D"]);
        let required = ids(&["D", "B"]);
        let result =
            preferred_allocation(&resource(), &pool, &ids(&["A", "B", "C", "D"]), &required, 2)
                .unwrap();
        assert_eq!(result, required);
    }

    #[test]
    fn test_size_equals_available() {
        let pool = gpu_pool(&["A", "B", "C", "D"]);
        let available = ids(&["D", "C", "A"]);

        let result = preferred_allocation(&resource(), &pool, &available, &[], 3).unwrap();
        assert_eq!(result, ids(&["A", "C", "D"]));

        let result =
            preferred_allocation(&resource(), &pool, &available, &ids(&["D"]), 3).unwrap();
        assert_eq!(result, ids(&["D", "A", "C"]));
    }

    #[test]
    fn test_idempotent() {
        let pool = gpu_pool(&["A", "B", "C", "D", "E"]);
        let available = ids(&["E", "B", "D", "A"]);
        let required = ids(&["D"]);

        let first = preferred_allocation(&resource(), &pool, &available, &required, 3).unwrap();
        for _ in 0..10 {
            let again =
                preferred_allocation(&resource(), &pool, &available, &required, 3).unwrap();
            assert_eq!(again, first);
        }
        assert_eq!(first, ids(&["D", "A", "B"]));
    }

    #[test]
    fn test_result_size_and_required_subset() {
        let pool = gpu_pool(&["A", "B", "C", "D", "E", "F"]);
        let available = ids(&["A", "B", "C", "D", "E", "F"]);
        let required = ids(&["F", "B"]);

        for size in required.len()..=available.len() {
            let result =
                preferred_allocation(&resource(), &pool, &available, &required, size).unwrap();
            assert_eq!(result.len(), size);
            assert!(required.iter().all(|r| result.contains(r)));

            let unique: HashSet<&String> = result.iter().collect();
            assert_eq!(unique.len(), size);
        }
    }

    #[test]
    fn test_size_out_of_range() {
        let pool = gpu_pool(&["A", "B", "C"]);
        let available = ids(&["A", "B", "C"]);

        let too_small = preferred_allocation(&resource(), &pool, &available, &ids(&["A", "B"]), 1);
        assert_eq!(
            too_small,
            Err(InvalidRequest::SizeOutOfRange {
                size: 1,
                min: 2,
                max: 3
            })
        );

        let too_large = preferred_allocation(&resource(), &pool, &available, &[], 4);
        assert!(matches!(too_large, Err(InvalidRequest::SizeOutOfRange { .. })));
    }

    #[test]
    fn test_required_not_available() {
        let pool = gpu_pool(&["A", "B", "C"]);
        let result = preferred_allocation(&resource(), &pool, &ids(&["A", "B"]), &ids(&["C"]), 2);
        assert_eq!(result, Err(InvalidRequest::RequiredNotAvailable("C".to_string())));
    }

    #[test]
    fn test_unknown_device_rejected() {
        let pool = gpu_pool(&["A", "B"]);
        let result = preferred_allocation(&resource(), &pool, &ids(&["A", "Z"]), &[], 1);
        assert!(matches!(result, Err(InvalidRequest::UnknownDevice { ref id, .. }) if id == "Z"));
    }

    #[test]
    fn test_duplicate_device_rejected() {
        let pool = gpu_pool(&["A", "B"]);
        let result = preferred_allocation(&resource(), &pool, &ids(&["A", "A"]), &[], 1);
        assert_eq!(result, Err(InvalidRequest::DuplicateDevice("A".to_string())));
    }

    #[test]
    fn test_unhealthy_devices_ranked_last() {
        let pool = gpu_pool(&["A", "B", "C"]);
        pool.get("A").unwrap().mark_unhealthy();

        let result =
            preferred_allocation(&resource(), &pool, &ids(&["A", "B", "C"]), &[], 2).unwrap();
        assert_eq!(result, ids(&["B", "C"]));
    }

    #[test]
    fn test_partitions_prefer_required_parent() {
        let placement = |gi| PartitionPlacement {
            gpu_instance_id: gi,
            compute_instance_id: 0,
        };
        let pool = Devices::from(vec![
            Device::partition("MIG-0-0", "GPU-0", 0, 0, "1g.5gb", placement(1)),
            Device::partition("MIG-0-1", "GPU-0", 0, 1, "1g.5gb", placement(2)),
            Device::partition("MIG-1-0", "GPU-1", 1, 0, "1g.5gb", placement(1)),
            Device::partition("MIG-1-1", "GPU-1", 1, 1, "1g.5gb", placement(2)),
        ]);
        let available = ids(&["MIG-0-0", "MIG-0-1", "MIG-1-0", "MIG-1-1"]);

        let result =
            preferred_allocation(&resource(), &pool, &available, &ids(&["MIG-1-1"]), 2).unwrap();
        assert_eq!(result, ids(&["MIG-1-1", "MIG-1-0"]));

        let result = preferred_allocation(&resource(), &pool, &available, &[], 2).unwrap();
        assert_eq!(result, ids(&["MIG-0-0", "MIG-0-1"]));
    }
}
