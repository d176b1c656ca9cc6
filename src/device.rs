//! The device handle.
//!
//! A [`Device`] wraps the [`Driver`] that owns every native object. It is reference-counted,
//! so cloning it is cheap and every pool keeps its own clone to destroy what it created.
//!
//! ```
//! # use scoria::{Device, hal::soft::SoftDriver};
//! let device = Device::new(SoftDriver::new());
//! assert_eq!(device.driver().name(), "soft");
//! ```

use std::{fmt::Debug, sync::Arc};

use crate::hal::Driver;

/// Trait for types that were created from a [`Device`].
pub trait HasDevice {
    fn device(&self) -> &Device;
}

/// Reference-counted handle to the GPU.
#[derive(Clone)]
pub struct Device(Arc<DeviceInner>);

struct DeviceInner {
    driver: Arc<dyn Driver>,
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Device {}

impl Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Device").field(&self.0.driver.name()).finish()
    }
}

impl Device {
    pub fn new(driver: impl Driver) -> Self {
        Self::from_arc(Arc::new(driver))
    }

    /// Creates a device sharing a driver the caller keeps a handle to, for example to reach
    /// the test hooks of [`SoftDriver`](crate::hal::soft::SoftDriver).
    pub fn from_arc(driver: Arc<dyn Driver>) -> Self {
        tracing::info!(driver = driver.name(), "create device");
        Device(Arc::new(DeviceInner { driver }))
    }

    pub fn driver(&self) -> &dyn Driver {
        &*self.0.driver
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        tracing::info!(driver = self.driver.name(), "drop device");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::soft::SoftDriver;

    #[test]
    fn clones_compare_equal() {
        let a = Device::new(SoftDriver::new());
        let b = a.clone();
        let c = Device::new(SoftDriver::new());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn shares_driver() {
        let driver = Arc::new(SoftDriver::new());
        let device = Device::from_arc(driver.clone());
        device.driver().create_fence(0).unwrap();
        assert_eq!(driver.live_objects().fences, 1);
    }
}
