//! Runtime configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Sizing knobs for the transient resource pools of a [`Runtime`](crate::Runtime).
///
/// All fields have defaults, so a configuration file only needs to list what it overrides:
///
/// ```
/// # use scoria::RuntimeConfig;
/// let config = RuntimeConfig {
///     upload_page_size: 8 * 1024 * 1024,
///     ..Default::default()
/// };
/// assert_eq!(config.scratch_page_size, 64 * 1024);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Page size of CPU-writable upload memory. Larger requests get a dedicated page.
    pub upload_page_size: u64,
    /// Page size of GPU-exclusive scratch memory. Larger requests get a dedicated page.
    pub scratch_page_size: u64,
    /// Number of views in each CPU-visible table backing the persistent view allocator.
    pub persistent_views_per_table: u32,
    /// Number of views in each pooled shader-visible table used by dynamic view caches.
    pub dynamic_table_capacity: u32,
    /// Upper bound for every blocking fence wait.
    ///
    /// `None` waits forever. When set, an expired wait fails with
    /// [`GpuError::Timeout`](crate::GpuError::Timeout), which callers should treat as a hung
    /// device.
    pub wait_timeout: Option<Duration>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            upload_page_size: 2 * 1024 * 1024,
            scratch_page_size: 64 * 1024,
            persistent_views_per_table: 256,
            dynamic_table_capacity: 1024,
            wait_timeout: None,
        }
    }
}

impl RuntimeConfig {
    pub(crate) fn validate(&self) {
        assert!(self.upload_page_size > 0, "upload_page_size must be non-zero");
        assert!(self.scratch_page_size > 0, "scratch_page_size must be non-zero");
        assert!(
            self.persistent_views_per_table > 0,
            "persistent_views_per_table must be non-zero"
        );
        assert!(
            self.dynamic_table_capacity > 0,
            "dynamic_table_capacity must be non-zero"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_uses_defaults() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{ "dynamic_table_capacity": 64 }"#).unwrap();
        assert_eq!(config.dynamic_table_capacity, 64);
        assert_eq!(config.upload_page_size, 2 * 1024 * 1024);
        assert_eq!(config.wait_timeout, None);
    }

    #[test]
    fn timeout_round_trips() {
        let config = RuntimeConfig {
            wait_timeout: Some(Duration::from_millis(1500)),
            ..Default::default()
        };
        let text = serde_json::to_string(&config).unwrap();
        let parsed: RuntimeConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    #[should_panic(expected = "scratch_page_size")]
    fn zero_page_size_is_rejected() {
        RuntimeConfig {
            scratch_page_size: 0,
            ..Default::default()
        }
        .validate();
    }
}
