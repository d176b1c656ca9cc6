//! Resource state tracking and barrier batching.
//!
//! Callers keep a [`TrackedResource`] next to each GPU resource they want synchronized. When a
//! [`Context`](crate::Context) is asked to transition it, the resource's last known state and
//! the requested state become a [`Barrier`] that is queued in a [`BarrierBatch`]. The batch is
//! emitted as a single [`Command::Barriers`](crate::hal::Command::Barriers) right before the
//! next draw, dispatch or copy, or earlier when the batch is full.
//!
//! ```
//! # use scoria::hal::RawResource;
//! use scoria::tracking::{BarrierBatch, ResourceStates, TrackedResource};
//!
//! let mut texture = TrackedResource::new(RawResource(7), ResourceStates::COPY_DEST);
//! let mut batch = BarrierBatch::default();
//! batch.transition(&mut texture, ResourceStates::PIXEL_SHADER_RESOURCE);
//! assert_eq!(batch.len(), 1);
//! assert_eq!(texture.state(), ResourceStates::PIXEL_SHADER_RESOURCE);
//! ```

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::hal::{Barrier, QueueKind, RawResource};

bitflags! {
    /// How a resource is going to be used by subsequent GPU work.
    ///
    /// The empty set is the common state: any queue may access the resource with simple
    /// copy or presentation semantics.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct ResourceStates: u32 {
        const VERTEX_BUFFER = 1 << 0;
        const CONSTANT_BUFFER = 1 << 1;
        const INDEX_BUFFER = 1 << 2;
        const RENDER_TARGET = 1 << 3;
        const UNORDERED_ACCESS = 1 << 4;
        const DEPTH_WRITE = 1 << 5;
        const DEPTH_READ = 1 << 6;
        const NON_PIXEL_SHADER_RESOURCE = 1 << 7;
        const PIXEL_SHADER_RESOURCE = 1 << 8;
        const INDIRECT_ARGUMENT = 1 << 9;
        const COPY_DEST = 1 << 10;
        const COPY_SOURCE = 1 << 11;

        const GENERIC_READ = Self::VERTEX_BUFFER.bits()
            | Self::CONSTANT_BUFFER.bits()
            | Self::INDEX_BUFFER.bits()
            | Self::NON_PIXEL_SHADER_RESOURCE.bits()
            | Self::PIXEL_SHADER_RESOURCE.bits()
            | Self::INDIRECT_ARGUMENT.bits()
            | Self::COPY_SOURCE.bits();
    }
}

impl ResourceStates {
    pub const COMMON: ResourceStates = ResourceStates::empty();

    /// States a compute queue is able to transition between.
    pub const COMPUTE_QUEUE_VALID: ResourceStates = ResourceStates::UNORDERED_ACCESS
        .union(ResourceStates::NON_PIXEL_SHADER_RESOURCE)
        .union(ResourceStates::COPY_DEST)
        .union(ResourceStates::COPY_SOURCE);

    /// States a copy queue is able to transition between.
    pub const COPY_QUEUE_VALID: ResourceStates =
        ResourceStates::COPY_DEST.union(ResourceStates::COPY_SOURCE);

    /// Returns true if a queue of the given kind may use a resource in this state.
    pub fn is_valid_on(self, queue: QueueKind) -> bool {
        match queue {
            QueueKind::Graphics => true,
            QueueKind::Compute => ResourceStates::COMPUTE_QUEUE_VALID.contains(self),
            QueueKind::Copy => ResourceStates::COPY_QUEUE_VALID.contains(self),
        }
    }

    /// Returns true if any bit of this state lets the GPU write the resource.
    pub fn is_write(self) -> bool {
        self.intersects(
            ResourceStates::RENDER_TARGET
                | ResourceStates::UNORDERED_ACCESS
                | ResourceStates::DEPTH_WRITE
                | ResourceStates::COPY_DEST,
        )
    }
}

/// A native resource together with the state it was last transitioned to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrackedResource {
    handle: RawResource,
    state: ResourceStates,
}

impl TrackedResource {
    pub fn new(handle: RawResource, initial_state: ResourceStates) -> Self {
        Self {
            handle,
            state: initial_state,
        }
    }
    pub fn handle(&self) -> RawResource {
        self.handle
    }
    pub fn state(&self) -> ResourceStates {
        self.state
    }
}

/// Pending barriers of a recording context.
///
/// Holds at most [`BarrierBatch::CAPACITY`] barriers; [`push`](Self::push) reports when the
/// batch is full so the owner can emit it before queueing more.
#[derive(Default, Debug)]
pub struct BarrierBatch {
    pending: SmallVec<[Barrier; BarrierBatch::CAPACITY]>,
}

impl BarrierBatch {
    pub const CAPACITY: usize = 16;

    /// Queues the barrier needed to move `resource` into `new_state` and updates the tracked
    /// state. Returns true if a barrier was queued.
    ///
    /// Transitioning an unordered-access resource to unordered access again queues a UAV
    /// barrier so that consecutive dispatches writing the same resource are ordered.
    ///
    /// # Panics
    ///
    /// Panics if the batch is already full.
    pub fn transition(
        &mut self,
        resource: &mut TrackedResource,
        new_state: ResourceStates,
    ) -> bool {
        let old_state = resource.state;
        let barrier = if old_state != new_state {
            Barrier::Transition {
                resource: resource.handle,
                before: old_state,
                after: new_state,
            }
        } else if new_state == ResourceStates::UNORDERED_ACCESS {
            Barrier::Uav {
                resource: resource.handle,
            }
        } else {
            return false;
        };
        resource.state = new_state;
        self.push(barrier);
        true
    }

    /// Queues a barrier.
    ///
    /// # Panics
    ///
    /// Panics if the batch is already full.
    pub fn push(&mut self, barrier: Barrier) {
        assert!(!self.is_full(), "barrier batch overflow; emit pending barriers first");
        self.pending.push(barrier);
    }

    pub fn is_full(&self) -> bool {
        self.pending.len() >= Self::CAPACITY
    }
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Removes and returns all pending barriers.
    pub fn take(&mut self) -> SmallVec<[Barrier; BarrierBatch::CAPACITY]> {
        std::mem::take(&mut self.pending)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_state_is_free() {
        let mut res = TrackedResource::new(RawResource(1), ResourceStates::COPY_DEST);
        let mut batch = BarrierBatch::default();
        assert!(!batch.transition(&mut res, ResourceStates::COPY_DEST));
        assert!(batch.is_empty());
    }

    #[test]
    fn uav_to_uav_records_uav_barrier() {
        let mut res = TrackedResource::new(RawResource(1), ResourceStates::UNORDERED_ACCESS);
        let mut batch = BarrierBatch::default();
        assert!(batch.transition(&mut res, ResourceStates::UNORDERED_ACCESS));
        assert_eq!(
            batch.take().as_slice(),
            &[Barrier::Uav {
                resource: RawResource(1)
            }]
        );
    }

    #[test]
    fn transition_records_before_and_after() {
        let mut res = TrackedResource::new(RawResource(9), ResourceStates::RENDER_TARGET);
        let mut batch = BarrierBatch::default();
        batch.transition(&mut res, ResourceStates::PIXEL_SHADER_RESOURCE);
        batch.transition(&mut res, ResourceStates::COPY_SOURCE);
        let barriers = batch.take();
        assert_eq!(barriers.len(), 2);
        assert_eq!(
            barriers[1],
            Barrier::Transition {
                resource: RawResource(9),
                before: ResourceStates::PIXEL_SHADER_RESOURCE,
                after: ResourceStates::COPY_SOURCE,
            }
        );
        assert!(batch.is_empty());
    }

    #[test]
    #[should_panic(expected = "barrier batch overflow")]
    fn overflow_panics() {
        let mut batch = BarrierBatch::default();
        for i in 0..=BarrierBatch::CAPACITY {
            batch.push(Barrier::Uav {
                resource: RawResource(i as u64),
            });
        }
    }

    #[test]
    fn queue_validity() {
        assert!(ResourceStates::UNORDERED_ACCESS.is_valid_on(QueueKind::Compute));
        assert!(!ResourceStates::RENDER_TARGET.is_valid_on(QueueKind::Compute));
        assert!(ResourceStates::COPY_DEST.is_valid_on(QueueKind::Copy));
        assert!(ResourceStates::COMMON.is_valid_on(QueueKind::Copy));
        assert!(!ResourceStates::PIXEL_SHADER_RESOURCE.is_valid_on(QueueKind::Copy));
        assert!(ResourceStates::DEPTH_READ.is_valid_on(QueueKind::Graphics));
    }

    #[test]
    fn write_states() {
        assert!(ResourceStates::COPY_DEST.is_write());
        assert!(!ResourceStates::GENERIC_READ.is_write());
    }
}
