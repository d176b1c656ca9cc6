//! Recording contexts.
//!
//! A [`Context`] is the unit of command recording. It is taken from the runtime's
//! [`ContextManager`] with [`Runtime::begin`](crate::Runtime::begin), owned by one thread while
//! recording, and handed back with [`Context::finish`], which submits the recorded work and
//! returns the fence value of the submission.
//!
//! Each context owns a recording buffer, one [`LinearAllocator`] per memory kind and one
//! [`DynamicViewCache`] per view table kind. On finish, all of them are retired under the
//! returned fence, and the context itself goes back to the pool of its queue kind.
//!
//! Resource transitions are batched: up to [`BarrierBatch::CAPACITY`] barriers are held back
//! and recorded together right before the next draw, dispatch or copy.
//!
//! ```
//! # use scoria::{Runtime, RuntimeConfig, hal::{QueueKind, RawResource, soft::SoftDriver}};
//! # use scoria::tracking::{ResourceStates, TrackedResource};
//! let runtime = Runtime::init(SoftDriver::new(), RuntimeConfig::default()).unwrap();
//! let mut target = TrackedResource::new(RawResource(1), ResourceStates::COMMON);
//!
//! let mut ctx = runtime.begin(QueueKind::Compute).unwrap();
//! ctx.transition_resource(&mut target, ResourceStates::UNORDERED_ACCESS, false);
//! ctx.dispatch(8, 8, 1).unwrap();
//! let fence = ctx.finish(true).unwrap();
//! assert!(runtime.is_fence_complete(fence));
//! ```

use std::{
    fmt::Debug,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use bytemuck::Pod;

use crate::{
    command::RecordingBuffer,
    descriptor::{BindingLayout, DynamicViewCache, GpuViewRange},
    error::Result,
    fence::FenceValue,
    hal::{Barrier, BindPoint, Command, CpuView, QueueKind, RawBuffer, RawResource, ViewTableKind},
    linear::{Allocation, LinearAllocator},
    runtime::Shared,
    tracking::{BarrierBatch, ResourceStates, TrackedResource},
};

/// Alignment of staging copies made by [`Context::write_buffer`].
const WRITE_ALIGNMENT: u64 = 16;

pub(crate) struct ContextState {
    kind: QueueKind,
    name: String,
    buffer: Option<RecordingBuffer>,
    upload: LinearAllocator,
    scratch: LinearAllocator,
    views: [DynamicViewCache; 2],
    barriers: BarrierBatch,
    pipelines: [Option<(RawResource, BindingLayout)>; 2],
}

fn bind_point_index(bind_point: BindPoint) -> usize {
    match bind_point {
        BindPoint::Graphics => 0,
        BindPoint::Compute => 1,
    }
}

impl ContextState {
    fn new(shared: &Shared, kind: QueueKind) -> Self {
        Self {
            kind,
            name: String::new(),
            buffer: None,
            upload: LinearAllocator::new(shared.upload_pages.clone()),
            scratch: LinearAllocator::new(shared.scratch_pages.clone()),
            views: ViewTableKind::ALL
                .map(|kind| DynamicViewCache::new(shared.table_pools[kind.index()].clone())),
            barriers: BarrierBatch::default(),
            pipelines: [None, None],
        }
    }

    fn buffer(&mut self) -> &mut RecordingBuffer {
        self.buffer
            .as_mut()
            .unwrap_or_else(|| panic!("recording without an open context"))
    }

    fn flush_barriers(&mut self) {
        if self.barriers.is_empty() {
            return;
        }
        let barriers = self.barriers.take();
        self.buffer().record(Command::Barriers(barriers));
    }

    /// Emits pending barriers and commits stale views before a draw or dispatch.
    fn prepare(&mut self, bind_point: BindPoint) -> Result<()> {
        self.flush_barriers();
        let Self { buffer, views, .. } = self;
        let buffer = buffer
            .as_mut()
            .unwrap_or_else(|| panic!("recording without an open context"));
        for cache in views.iter_mut() {
            cache.commit_stale_tables(bind_point, buffer)?;
        }
        Ok(())
    }

    fn retire(&mut self, fence: FenceValue) {
        self.upload.cleanup_used_pages(fence);
        self.scratch.cleanup_used_pages(fence);
        for cache in &mut self.views {
            cache.cleanup_used_tables(fence);
        }
        self.barriers.clear();
        self.pipelines = [None, None];
        self.name.clear();
    }
}

/// Pools idle contexts per queue kind.
pub struct ContextManager {
    idle: [Mutex<Vec<Box<ContextState>>>; 3],
    created: AtomicUsize,
}

impl Default for ContextManager {
    fn default() -> Self {
        Self {
            idle: Default::default(),
            created: AtomicUsize::new(0),
        }
    }
}

impl ContextManager {
    pub(crate) fn allocate(&self, shared: &Shared, kind: QueueKind) -> Box<ContextState> {
        if let Some(state) = self.idle[kind.index()].lock().unwrap().pop() {
            return state;
        }
        let total = self.created.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(queue = kind.name(), total, "create context");
        Box::new(ContextState::new(shared, kind))
    }

    pub(crate) fn free(&self, state: Box<ContextState>) {
        debug_assert!(state.buffer.is_none());
        self.idle[state.kind.index()].lock().unwrap().push(state);
    }

    /// Number of contexts created so far, across all queue kinds.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Number of idle contexts of a queue kind.
    pub fn idle(&self, kind: QueueKind) -> usize {
        self.idle[kind.index()].lock().unwrap().len()
    }

    pub(crate) fn clear(&self) {
        for idle in &self.idle {
            idle.lock().unwrap().clear();
        }
    }
}

/// A recording session on one queue. See the [module documentation](self).
pub struct Context {
    shared: Arc<Shared>,
    state: Option<Box<ContextState>>,
}

impl Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("Context");
        if let Some(state) = &self.state {
            debug
                .field("queue", &state.kind)
                .field("name", &state.name)
                .field("buffer", &state.buffer);
        }
        debug.finish()
    }
}

impl Context {
    pub(crate) fn begin(shared: Arc<Shared>, kind: QueueKind, name: &str) -> Result<Self> {
        let mut state = shared.contexts.allocate(&shared, kind);
        match shared.queues.get(kind).request_buffer() {
            Ok(buffer) => state.buffer = Some(buffer),
            Err(err) => {
                shared.contexts.free(state);
                return Err(err);
            }
        }
        state.name.push_str(name);
        tracing::debug!(queue = kind.name(), name, "begin context");
        Ok(Self {
            shared,
            state: Some(state),
        })
    }

    fn state(&mut self) -> &mut ContextState {
        self.state
            .as_deref_mut()
            .unwrap_or_else(|| panic!("recording without an open context"))
    }

    pub fn queue_kind(&self) -> QueueKind {
        self.state
            .as_ref()
            .map_or(QueueKind::Graphics, |state| state.kind)
    }

    /// Declares that `resource` is about to be used in `new_state`.
    ///
    /// The barrier is held back until the next operation that needs it, unless
    /// `flush_immediate` is set or the batch is full.
    ///
    /// # Panics
    ///
    /// Panics if either state of the transition is not valid on this context's queue.
    pub fn transition_resource(
        &mut self,
        resource: &mut TrackedResource,
        new_state: ResourceStates,
        flush_immediate: bool,
    ) {
        let state = self.state();
        for s in [resource.state(), new_state] {
            assert!(
                s.is_valid_on(state.kind),
                "{s:?} is not a valid resource state on the {} queue",
                state.kind.name()
            );
        }
        if state.barriers.is_full() {
            state.flush_barriers();
        }
        state.barriers.transition(resource, new_state);
        if flush_immediate || state.barriers.is_full() {
            state.flush_barriers();
        }
    }

    /// Orders earlier unordered-access writes to `resource` before later accesses.
    pub fn insert_uav_barrier(&mut self, resource: &TrackedResource, flush_immediate: bool) {
        let state = self.state();
        if state.barriers.is_full() {
            state.flush_barriers();
        }
        state.barriers.push(Barrier::Uav {
            resource: resource.handle(),
        });
        if flush_immediate || state.barriers.is_full() {
            state.flush_barriers();
        }
    }

    /// Records all pending barriers now.
    pub fn flush_resource_barriers(&mut self) {
        self.state().flush_barriers();
    }

    /// Number of barriers waiting to be recorded.
    pub fn pending_barriers(&self) -> usize {
        self.state.as_ref().map_or(0, |state| state.barriers.len())
    }

    /// Binds a pipeline and the layout its bindings follow. Switching to a different layout
    /// discards all staged views of the bind point.
    pub fn set_pipeline(
        &mut self,
        bind_point: BindPoint,
        pipeline: RawResource,
        layout: &BindingLayout,
    ) {
        let state = self.state();
        match (state.kind, bind_point) {
            (QueueKind::Graphics, _) | (QueueKind::Compute, BindPoint::Compute) => (),
            (kind, bind_point) => {
                panic!("cannot bind a {bind_point:?} pipeline on the {} queue", kind.name())
            }
        }
        let bound = &mut state.pipelines[bind_point_index(bind_point)];
        let layout_changed = bound.as_ref().is_none_or(|(_, l)| l != layout);
        let pipeline_changed = bound.as_ref().is_none_or(|(p, _)| *p != pipeline);
        *bound = Some((pipeline, layout.clone()));
        if layout_changed {
            for cache in &mut state.views {
                cache.parse_layout(bind_point, layout);
            }
        }
        if pipeline_changed {
            state.buffer().record(Command::BindPipeline {
                bind_point,
                pipeline,
            });
        }
    }

    /// Stages resource views at `slot[offset..]` of the bound layout.
    pub fn set_dynamic_views(
        &mut self,
        bind_point: BindPoint,
        slot: usize,
        offset: u32,
        views: &[CpuView],
    ) {
        self.state().views[ViewTableKind::Resource.index()]
            .set_views(bind_point, slot, offset, views);
    }

    /// Stages samplers at `slot[offset..]` of the bound layout.
    pub fn set_dynamic_samplers(
        &mut self,
        bind_point: BindPoint,
        slot: usize,
        offset: u32,
        samplers: &[CpuView],
    ) {
        self.state().views[ViewTableKind::Sampler.index()]
            .set_views(bind_point, slot, offset, samplers);
    }

    /// Copies a single view into a shader-visible table immediately and returns where it
    /// landed.
    pub fn upload_direct(&mut self, kind: ViewTableKind, view: CpuView) -> Result<GpuViewRange> {
        self.state().views[kind.index()].upload_direct(view)
    }

    /// The range last committed for `slot`.
    pub fn bound_views(
        &self,
        kind: ViewTableKind,
        bind_point: BindPoint,
        slot: usize,
    ) -> Option<GpuViewRange> {
        self.state
            .as_ref()?
            .views[kind.index()]
            .bound_views(bind_point, slot)
    }

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<()> {
        let state = self.state();
        assert_eq!(state.kind, QueueKind::Graphics, "draws need a graphics context");
        state.prepare(BindPoint::Graphics)?;
        state.buffer().record(Command::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
        Ok(())
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<()> {
        let state = self.state();
        assert_eq!(state.kind, QueueKind::Graphics, "draws need a graphics context");
        state.prepare(BindPoint::Graphics)?;
        state.buffer().record(Command::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        });
        Ok(())
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        let state = self.state();
        assert_ne!(state.kind, QueueKind::Copy, "dispatches need a compute or graphics context");
        state.prepare(BindPoint::Compute)?;
        state.buffer().record(Command::Dispatch { x, y, z });
        Ok(())
    }

    pub fn copy_buffer(
        &mut self,
        dst: RawBuffer,
        dst_offset: u64,
        src: RawBuffer,
        src_offset: u64,
        size: u64,
    ) {
        let state = self.state();
        state.flush_barriers();
        state.buffer().record(Command::CopyBuffer {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        });
    }

    /// Stages `bytes` in upload memory and records a copy into `dst`.
    pub fn write_buffer(&mut self, dst: RawBuffer, dst_offset: u64, bytes: &[u8]) -> Result<()> {
        let mut staging = self.allocate_upload(bytes.len() as u64, WRITE_ALIGNMENT)?;
        if let Some(slice) = staging.as_mut_slice() {
            slice.copy_from_slice(bytes);
        }
        self.copy_buffer(
            dst,
            dst_offset,
            staging.buffer(),
            staging.offset(),
            staging.size(),
        );
        Ok(())
    }

    /// [`write_buffer`](Self::write_buffer) for plain-old-data values.
    pub fn write_buffer_pod<T: Pod>(
        &mut self,
        dst: RawBuffer,
        dst_offset: u64,
        data: &[T],
    ) -> Result<()> {
        self.write_buffer(dst, dst_offset, bytemuck::cast_slice(data))
    }

    /// Fills `dst[offset..offset + size]` with a repeated 32-bit value.
    pub fn fill_buffer(&mut self, dst: RawBuffer, offset: u64, size: u64, value: u32) {
        let state = self.state();
        state.flush_barriers();
        state.buffer().record(Command::FillBuffer {
            dst,
            offset,
            size,
            value,
        });
    }

    /// CPU-writable memory that lives until the context's work has completed.
    pub fn allocate_upload(&mut self, size: u64, alignment: u64) -> Result<Allocation> {
        self.state().upload.allocate(size, alignment)
    }

    /// GPU-exclusive memory that lives until the context's work has completed.
    pub fn allocate_scratch(&mut self, size: u64, alignment: u64) -> Result<Allocation> {
        self.state().scratch.allocate(size, alignment)
    }

    /// Submits everything recorded so far and keeps recording into a fresh buffer.
    ///
    /// The bound pipelines are bound again and every staged view is committed again before
    /// the next draw or dispatch. Transient memory and view tables stay with the context
    /// until [`finish`](Self::finish).
    pub fn flush(&mut self, wait_for_completion: bool) -> Result<FenceValue> {
        let shared = self.shared.clone();
        let state = self.state();
        let queue = shared.queues.get(state.kind);
        state.flush_barriers();
        let mut buffer = state
            .buffer
            .take()
            .unwrap_or_else(|| panic!("recording without an open context"));
        let fence = match queue.execute(&mut buffer) {
            Ok(fence) => fence,
            Err(err) => {
                drop(buffer);
                return Err(err);
            }
        };
        queue.discard_buffer(fence, buffer);
        if wait_for_completion {
            queue.wait(fence)?;
        }
        let mut buffer = queue.request_buffer()?;
        for (index, bound) in state.pipelines.iter().enumerate() {
            if let Some((pipeline, _)) = bound {
                buffer.record(Command::BindPipeline {
                    bind_point: if index == 0 {
                        BindPoint::Graphics
                    } else {
                        BindPoint::Compute
                    },
                    pipeline: *pipeline,
                });
            }
        }
        state.buffer = Some(buffer);
        for cache in &mut state.views {
            cache.unbind_all_valid();
        }
        tracing::debug!(fence = %fence, name = %state.name, "flush context");
        Ok(fence)
    }

    /// Submits the recorded work, retires every transient resource of the context under the
    /// returned fence and returns the context to its pool. With `wait_for_completion`, blocks
    /// until the GPU has finished the work.
    pub fn finish(mut self, wait_for_completion: bool) -> Result<FenceValue> {
        let mut state = self
            .state
            .take()
            .unwrap_or_else(|| panic!("recording without an open context"));
        let queue = self.shared.queues.get(state.kind);
        state.flush_barriers();
        let mut buffer = state
            .buffer
            .take()
            .unwrap_or_else(|| panic!("recording without an open context"));
        let fence = match queue.execute(&mut buffer) {
            Ok(fence) => fence,
            Err(err) => {
                drop(buffer);
                state.retire(queue.last_submitted());
                self.shared.contexts.free(state);
                return Err(err);
            }
        };
        tracing::debug!(fence = %fence, name = %state.name, "finish context");
        queue.discard_buffer(fence, buffer);
        state.retire(fence);
        self.shared.contexts.free(state);
        if wait_for_completion {
            queue.wait(fence)?;
        }
        Ok(fence)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let Some(mut state) = self.state.take() else {
            return;
        };
        tracing::warn!(
            queue = state.kind.name(),
            name = %state.name,
            "context dropped without finish; unsubmitted commands are discarded"
        );
        let queue = self.shared.queues.get(state.kind);
        let fence = queue.last_submitted();
        if let Some(mut buffer) = state.buffer.take()
            && buffer.end().is_ok()
        {
            queue.discard_buffer(fence, buffer);
        }
        state.retire(fence);
        self.shared.contexts.free(state);
    }
}
