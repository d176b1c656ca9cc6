//! Error types.
//!
//! Only conditions a caller can act upon are reported through [`GpuError`]. Misuse of the API
//! (recording without an open context, exceeding a fixed-capacity table, resetting a recording
//! buffer that is still in flight, ...) is a bug in the calling code and panics instead.

use thiserror::Error;

/// Errors reported by the driver or by blocking operations of the runtime.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    /// The device stopped responding or was removed. All in-flight work is lost and the only
    /// recovery is [`Runtime::recover`](crate::Runtime::recover).
    #[error("the GPU device was lost")]
    DeviceLost,
    #[error("out of device memory")]
    OutOfDeviceMemory,
    #[error("out of host memory")]
    OutOfHostMemory,
    /// A blocking wait exceeded [`RuntimeConfig::wait_timeout`](crate::RuntimeConfig::wait_timeout).
    #[error("timed out waiting for fence value {0:#x}")]
    Timeout(u64),
    /// Any other failure reported by the native API.
    #[error("backend error: {0}")]
    Backend(String),
}

impl GpuError {
    /// Returns true if the runtime must be torn down and recreated after this error.
    ///
    /// A timeout is treated as fatal: a device that never signals again is indistinguishable
    /// from a lost one.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GpuError::DeviceLost | GpuError::Timeout(_))
    }
}

pub type Result<T, E = GpuError> = std::result::Result<T, E>;

#[cfg(feature = "vulkan")]
impl From<ash::vk::Result> for GpuError {
    fn from(value: ash::vk::Result) -> Self {
        use ash::vk;
        match value {
            vk::Result::ERROR_DEVICE_LOST => GpuError::DeviceLost,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => GpuError::OutOfDeviceMemory,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => GpuError::OutOfHostMemory,
            other => GpuError::Backend(format!("{other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_errors() {
        assert!(GpuError::DeviceLost.is_fatal());
        assert!(GpuError::Timeout(3).is_fatal());
        assert!(!GpuError::OutOfDeviceMemory.is_fatal());
        assert!(!GpuError::Backend("oops".into()).is_fatal());
    }

    #[test]
    fn display() {
        assert_eq!(GpuError::Timeout(0x10).to_string(), "timed out waiting for fence value 0x10");
    }
}
