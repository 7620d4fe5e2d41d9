//! Backend used when no hardware library is compiled in

use gpuplug_core::InitError;

use crate::traits::{DeviceLib, LibHandle};

/// Hardware library that never initializes
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDeviceLib;

impl DeviceLib for NullDeviceLib {
    fn init(&self) -> Result<Box<dyn LibHandle>, InitError> {
        Err(InitError::Unavailable(
            "no hardware backend compiled in".to_string(),
        ))
    }

    fn has_partition_support(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "null"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_lib_fails_init() {
        let lib = NullDeviceLib;
        assert!(matches!(lib.init(), Err(InitError::Unavailable(_))));
        assert!(!lib.has_partition_support());
    }
}
