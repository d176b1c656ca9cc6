//! Fence values and the per-queue fence timeline.
//!
//! Every queue owns one [`FenceTimeline`], a counter that the GPU raises as it finishes
//! submitted work. The values handed out for a queue embed the queue kind in their top byte,
//! so a bare [`FenceValue`] is enough to find the timeline it belongs to:
//!
//! ```
//! # use scoria::{FenceValue, hal::QueueKind};
//! let v = FenceValue::new(QueueKind::Compute, 12);
//! assert_eq!(v.kind(), QueueKind::Compute);
//! assert_eq!(v.sequence(), 12);
//! assert!(FenceValue::new(QueueKind::Compute, 11) < v);
//! ```

use std::{
    fmt::{Debug, Display},
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use crate::{
    Device, HasDevice,
    error::{GpuError, Result},
    hal::{QueueKind, RawFence},
};

/// A point on the timeline of one queue.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FenceValue(pub u64);

impl FenceValue {
    pub const KIND_SHIFT: u32 = 56;
    pub const SEQUENCE_MASK: u64 = (1 << Self::KIND_SHIFT) - 1;

    pub fn new(kind: QueueKind, sequence: u64) -> Self {
        assert!(sequence <= Self::SEQUENCE_MASK, "fence sequence overflow");
        FenceValue(((kind.index() as u64) << Self::KIND_SHIFT) | sequence)
    }

    /// The value a timeline starts at: nothing submitted, nothing pending.
    pub fn initial(kind: QueueKind) -> Self {
        Self::new(kind, 0)
    }

    /// The queue that produced this value.
    ///
    /// # Panics
    ///
    /// Panics if the top byte does not name a queue kind.
    pub fn kind(self) -> QueueKind {
        let index = (self.0 >> Self::KIND_SHIFT) as usize;
        QueueKind::from_index(index)
            .unwrap_or_else(|| panic!("{:#x} is not a fence value", self.0))
    }

    pub fn sequence(self) -> u64 {
        self.0 & Self::SEQUENCE_MASK
    }
}

impl Debug for FenceValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FenceValue({self})")
    }
}

impl Display for FenceValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match QueueKind::from_index((self.0 >> Self::KIND_SHIFT) as usize) {
            Some(kind) => write!(f, "{}:{}", kind.name(), self.sequence()),
            None => write!(f, "{:#x}", self.0),
        }
    }
}

/// The GPU-driven completion counter of one queue.
///
/// The last value observed from the GPU is cached, so checking an old value costs a single
/// atomic load. The driver is only asked when the cache is behind the queried value.
pub struct FenceTimeline {
    device: Device,
    kind: QueueKind,
    raw: RawFence,
    completed: AtomicU64,
    timeout: Option<Duration>,
}

impl HasDevice for FenceTimeline {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl Debug for FenceTimeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FenceTimeline")
            .field(&self.raw)
            .field(&self.last_completed())
            .finish()
    }
}

impl FenceTimeline {
    /// Creates the timeline of a queue. `timeout` bounds every [`wait`](Self::wait).
    pub fn new(device: Device, kind: QueueKind, timeout: Option<Duration>) -> Result<Self> {
        let initial = FenceValue::initial(kind);
        let raw = device.driver().create_fence(initial.0)?;
        Ok(Self {
            device,
            kind,
            raw,
            completed: AtomicU64::new(initial.0),
            timeout,
        })
    }

    pub fn raw(&self) -> RawFence {
        self.raw
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// The cached completed value. May lag behind the GPU.
    pub fn last_completed(&self) -> FenceValue {
        FenceValue(self.completed.load(Ordering::Acquire))
    }

    /// Reads the counter from the GPU and updates the cache.
    pub fn refresh(&self) -> Result<FenceValue> {
        let value = self.device.driver().fence_value(self.raw)?;
        let old = self.completed.fetch_max(value, Ordering::AcqRel);
        Ok(FenceValue(old.max(value)))
    }

    fn check_kind(&self, value: FenceValue) {
        assert_eq!(
            value.kind(),
            self.kind,
            "fence value {value} does not belong to the {} queue",
            self.kind.name()
        );
    }

    /// Returns true once the GPU has reached `value`. Never blocks.
    ///
    /// A failure to read the counter is logged and reported as "not complete"; the next
    /// blocking call on the timeline reports the error itself.
    pub fn is_complete(&self, value: FenceValue) -> bool {
        self.check_kind(value);
        if value.0 <= self.completed.load(Ordering::Acquire) {
            return true;
        }
        match self.refresh() {
            Ok(completed) => value <= completed,
            Err(err) => {
                tracing::error!(%err, fence = %value, "failed to read fence");
                false
            }
        }
    }

    /// Blocks the calling thread until the GPU has reached `value`.
    pub fn wait(&self, value: FenceValue) -> Result<()> {
        if self.is_complete(value) {
            return Ok(());
        }
        let reached = self
            .device
            .driver()
            .wait_fence(self.raw, value.0, self.timeout)?;
        if !reached {
            tracing::error!(fence = %value, timeout = ?self.timeout, "fence wait timed out");
            return Err(GpuError::Timeout(value.0));
        }
        self.completed.fetch_max(value.0, Ordering::AcqRel);
        Ok(())
    }

    /// Advances the counter from the CPU. Lower values than the current one are ignored.
    pub fn signal_from_host(&self, value: FenceValue) -> Result<()> {
        self.check_kind(value);
        self.device.driver().signal_fence(self.raw, value.0)?;
        self.completed.fetch_max(value.0, Ordering::AcqRel);
        Ok(())
    }
}

impl Drop for FenceTimeline {
    fn drop(&mut self) {
        self.device.driver().destroy_fence(self.raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::soft::SoftDriver;

    fn timeline(kind: QueueKind, timeout: Option<Duration>) -> FenceTimeline {
        FenceTimeline::new(Device::new(SoftDriver::new()), kind, timeout).unwrap()
    }

    #[test]
    fn value_encoding() {
        let v = FenceValue::new(QueueKind::Copy, 7);
        assert_eq!(v.0, (2 << 56) | 7);
        assert_eq!(v.kind(), QueueKind::Copy);
        assert_eq!(v.to_string(), "copy:7");
        assert_eq!(FenceValue::initial(QueueKind::Graphics).0, 0);
    }

    #[test]
    fn starts_complete_at_initial() {
        let t = timeline(QueueKind::Compute, None);
        assert!(t.is_complete(FenceValue::initial(QueueKind::Compute)));
        assert!(!t.is_complete(FenceValue::new(QueueKind::Compute, 1)));
    }

    #[test]
    fn completion_is_monotonic() {
        let t = timeline(QueueKind::Graphics, None);
        t.signal_from_host(FenceValue::new(QueueKind::Graphics, 4)).unwrap();
        for seq in 0..=4 {
            assert!(t.is_complete(FenceValue::new(QueueKind::Graphics, seq)));
        }
        assert!(!t.is_complete(FenceValue::new(QueueKind::Graphics, 5)));
        t.signal_from_host(FenceValue::new(QueueKind::Graphics, 2)).unwrap();
        assert_eq!(t.last_completed(), FenceValue::new(QueueKind::Graphics, 4));
    }

    #[test]
    fn bounded_wait_times_out() {
        let t = timeline(QueueKind::Copy, Some(Duration::from_millis(10)));
        let v = FenceValue::new(QueueKind::Copy, 1);
        assert_eq!(t.wait(v), Err(GpuError::Timeout(v.0)));
    }

    #[test]
    #[should_panic(expected = "does not belong")]
    fn foreign_value_panics() {
        let t = timeline(QueueKind::Graphics, None);
        t.is_complete(FenceValue::new(QueueKind::Copy, 1));
    }
}
