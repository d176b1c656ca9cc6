//! Hardware abstraction layer.
//!
//! Everything above this module is written against the [`Driver`] trait. A driver owns the
//! native objects and hands out opaque 64-bit handles for them, the same way Vulkan handles
//! are plain integers. Two drivers ship with the crate:
//!
//! - [`soft::SoftDriver`]: an in-process GPU that executes submissions on worker threads. It
//!   is always available and is what the test suite runs on.
//! - `vulkan::VulkanDriver` (feature `vulkan`): timeline semaphores, `vkQueueSubmit2`,
//!   `vk-mem` allocations and mutable descriptor sets.
//!
//! # Threading
//!
//! Drivers are `Send + Sync`. Calls naming the same queue are serialized by the caller
//! ([`Queue`](crate::queue::Queue) holds a lock around submissions); calls naming the same
//! recording buffer come from the single thread that owns it.

use std::{ptr::NonNull, time::Duration};

use smallvec::SmallVec;

use crate::{error::Result, tracking::ResourceStates};

pub mod soft;
#[cfg(feature = "vulkan")]
pub mod vulkan;

macro_rules! raw_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
        pub struct $name(pub u64);
        impl $name {
            pub const NULL: Self = Self(0);
            pub fn is_null(self) -> bool {
                self.0 == 0
            }
        }
    };
}

raw_handle!(
    /// A GPU timeline counter.
    RawFence
);
raw_handle!(
    /// Backing store that commands are recorded into.
    RawCommandBuffer
);
raw_handle!(
    /// A buffer, either created by a [`Driver`] for transient memory or owned by the caller.
    RawBuffer
);
raw_handle!(
    /// A table of resource views. CPU-visible tables stage views, shader-visible tables are
    /// bound for draws and dispatches.
    RawViewTable
);
raw_handle!(
    /// Any other native object: textures, texture views, samplers, pipelines.
    RawResource
);

impl From<RawBuffer> for RawResource {
    fn from(value: RawBuffer) -> Self {
        RawResource(value.0)
    }
}

/// The kind of an execution queue. Each kind has its own fence timeline and submission order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum QueueKind {
    Graphics = 0,
    Compute = 1,
    Copy = 2,
}

impl QueueKind {
    pub const ALL: [QueueKind; 3] = [QueueKind::Graphics, QueueKind::Compute, QueueKind::Copy];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            QueueKind::Graphics => "graphics",
            QueueKind::Compute => "compute",
            QueueKind::Copy => "copy",
        }
    }
}

/// Which pipeline a binding applies to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum BindPoint {
    Graphics,
    Compute,
}

/// The two families of view tables. Views of one kind can never be placed in a table of the
/// other kind.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum ViewTableKind {
    /// Buffers and textures.
    Resource = 0,
    /// Samplers.
    Sampler = 1,
}

impl ViewTableKind {
    pub const ALL: [ViewTableKind; 2] = [ViewTableKind::Resource, ViewTableKind::Sampler];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            ViewTableKind::Resource => "resource",
            ViewTableKind::Sampler => "sampler",
        }
    }
}

/// Memory flavours for transient allocations.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MemoryKind {
    /// Host-visible, written by the CPU and read by the GPU.
    Upload,
    /// Device-local scratch memory the CPU never touches.
    Scratch,
}

impl MemoryKind {
    pub fn name(self) -> &'static str {
        match self {
            MemoryKind::Upload => "upload",
            MemoryKind::Scratch => "scratch",
        }
    }
}

/// Description of a single resource view.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum ViewDesc {
    /// An empty slot. Valid in tables of either kind.
    #[default]
    Null,
    UniformBuffer {
        buffer: RawBuffer,
        offset: u64,
        size: u64,
    },
    StorageBuffer {
        buffer: RawBuffer,
        offset: u64,
        size: u64,
    },
    SampledTexture {
        view: RawResource,
    },
    StorageTexture {
        view: RawResource,
    },
    Sampler {
        sampler: RawResource,
    },
}

impl ViewDesc {
    /// The table kind this view must live in, or `None` for [`ViewDesc::Null`].
    pub fn table_kind(&self) -> Option<ViewTableKind> {
        match self {
            ViewDesc::Null => None,
            ViewDesc::Sampler { .. } => Some(ViewTableKind::Sampler),
            _ => Some(ViewTableKind::Resource),
        }
    }
}

/// A permanent, CPU-visible view slot.
///
/// Writing a [`ViewDesc`] into the slot does not make it visible to shaders; it has to be
/// copied into a shader-visible table first, which is what the dynamic view caches do.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CpuView {
    pub table: RawViewTable,
    pub index: u32,
}

impl CpuView {
    /// The view `n` slots further into the same table.
    pub fn offset(self, n: u32) -> Self {
        CpuView {
            table: self.table,
            index: self.index + n,
        }
    }
}

/// A synchronization request for a single resource.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Barrier {
    Transition {
        resource: RawResource,
        before: ResourceStates,
        after: ResourceStates,
    },
    /// Orders unordered-access writes before later unordered accesses of the same resource.
    Uav { resource: RawResource },
}

/// A command recorded into a [`RawCommandBuffer`].
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Barriers(SmallVec<[Barrier; 16]>),
    BindPipeline {
        bind_point: BindPoint,
        pipeline: RawResource,
    },
    /// Binds `table[offset..]` to a slot of the current binding layout.
    BindViewTable {
        bind_point: BindPoint,
        slot: u32,
        kind: ViewTableKind,
        table: RawViewTable,
        offset: u32,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    CopyBuffer {
        src: RawBuffer,
        src_offset: u64,
        dst: RawBuffer,
        dst_offset: u64,
        size: u64,
    },
    /// Fills `size` bytes with a repeated 32-bit pattern. `offset` and `size` are multiples of 4.
    FillBuffer {
        dst: RawBuffer,
        offset: u64,
        size: u64,
        value: u32,
    },
}

/// A buffer created by [`Driver::create_buffer`].
#[derive(Clone, Copy, Debug)]
pub struct BufferAllocation {
    pub handle: RawBuffer,
    /// Host pointer to the start of the buffer. Always `Some` for [`MemoryKind::Upload`].
    pub mapped: Option<NonNull<u8>>,
    /// GPU virtual address, or 0 when the backend does not expose one.
    pub gpu_address: u64,
}

/// The native graphics API behind a [`Device`](crate::Device).
pub trait Driver: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Creates a timeline whose counter starts at `initial_value`.
    fn create_fence(&self, initial_value: u64) -> Result<RawFence>;
    fn destroy_fence(&self, fence: RawFence);
    /// Reads the counter as last signaled by the GPU.
    fn fence_value(&self, fence: RawFence) -> Result<u64>;
    /// Blocks until the counter reaches `value`. Returns `Ok(false)` if `timeout` expired first.
    fn wait_fence(&self, fence: RawFence, value: u64, timeout: Option<Duration>) -> Result<bool>;
    /// Sets the counter from the host. Values lower than the current one are ignored.
    fn signal_fence(&self, fence: RawFence, value: u64) -> Result<()>;

    /// Submits closed recording buffers, then signals `fence` to `value` once they have
    /// finished. An empty `buffers` slice submits a bare signal.
    fn queue_submit(
        &self,
        queue: QueueKind,
        buffers: &[RawCommandBuffer],
        fence: RawFence,
        value: u64,
    ) -> Result<()>;
    /// Makes all later work on `queue` wait until `fence` reaches `value`, without blocking
    /// the CPU.
    fn queue_wait(&self, queue: QueueKind, fence: RawFence, value: u64) -> Result<()>;

    fn create_command_buffer(&self, queue: QueueKind) -> Result<RawCommandBuffer>;
    fn destroy_command_buffer(&self, buffer: RawCommandBuffer);
    /// Resets the buffer and opens it for recording. The previous submission of the buffer
    /// must have completed.
    fn begin_command_buffer(&self, buffer: RawCommandBuffer) -> Result<()>;
    fn end_command_buffer(&self, buffer: RawCommandBuffer) -> Result<()>;
    fn record(&self, buffer: RawCommandBuffer, command: Command);

    fn create_buffer(&self, kind: MemoryKind, size: u64) -> Result<BufferAllocation>;
    fn destroy_buffer(&self, buffer: RawBuffer);

    fn create_view_table(
        &self,
        kind: ViewTableKind,
        capacity: u32,
        shader_visible: bool,
    ) -> Result<RawViewTable>;
    fn destroy_view_table(&self, table: RawViewTable);
    fn write_view(&self, table: RawViewTable, index: u32, view: &ViewDesc);
    /// Copies the views at `src` into `dst[dst_start..dst_start + src.len()]`.
    fn copy_views(&self, dst: RawViewTable, dst_start: u32, src: &[CpuView]);
}
