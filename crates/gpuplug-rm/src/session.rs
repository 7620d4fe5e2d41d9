//! Scoped hardware library sessions

use gpuplug_core::InitError;
use gpuplug_nvml::{DeviceLib, LibHandle};
use std::ops::Deref;
use tracing::{debug, warn};

/// An initialized hardware library, shut down when dropped
pub struct Session {
    handle: Box<dyn LibHandle>,
    backend: &'static str,
}

impl Session {
    /// Initialize the hardware library
    pub fn open(lib: &dyn DeviceLib) -> Result<Self, InitError> {
        let handle = lib.init()?;
        debug!(backend = lib.name(), "Hardware library initialized");
        Ok(Self {
            handle,
            backend: lib.name(),
        })
    }
}

impl Deref for Session {
    type Target = dyn LibHandle;

    fn deref(&self) -> &Self::Target {
        self.handle.as_ref()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        match self.handle.shutdown() {
            Ok(()) => debug!(backend = self.backend, "Hardware library shut down"),
            Err(e) => warn!(
                backend = self.backend,
                error = %e,
                "Error shutting down hardware library"
            ),
        }
    }
}
