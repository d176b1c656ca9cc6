//! # Scoria
//!
//! The command-submission and transient-resource core of a GPU renderer.
//!
//! Scoria sits between a rendering engine and a native graphics API. It hands out
//! recording contexts to any thread, submits their work to one of three queues, and keeps
//! every transient resource a context used alive until the GPU has provably finished with it.
//!
//! ## Quick Start
//!
//! ```
//! use scoria::prelude::*;
//! use scoria::hal::soft::SoftDriver;
//!
//! let runtime = Runtime::init(SoftDriver::new(), RuntimeConfig::default()).unwrap();
//! let mut ctx = runtime.begin(QueueKind::Compute).unwrap();
//! let constants = ctx.allocate_upload(256, 256).unwrap();
//! assert_eq!(constants.size(), 256);
//! ctx.dispatch(8, 8, 1).unwrap();
//! let fence = ctx.finish(false).unwrap();
//! runtime.wait_for_fence(fence).unwrap();
//! ```
//!
//! ## Overview
//!
//! ### Fences and Queues
//!
//! Every [`Queue`](queue::Queue) owns a [`FenceTimeline`](fence::FenceTimeline): a counter
//! the GPU advances as submissions finish. A [`FenceValue`] carries the queue it belongs to
//! in its top byte, so a bare value is enough to ask any queue whether work has completed.
//!
//! ### Retirement
//!
//! Recording buffers, linear allocator pages and dynamic view tables are recycled through
//! [`RetiredList`](retire::RetiredList)s keyed by the fence value of the submission that
//! last used them. A resource is never handed out again before its fence completes.
//!
//! ### Contexts
//!
//! A [`Context`] bundles a recording buffer, an upload and a scratch
//! [`LinearAllocator`](linear::LinearAllocator), one
//! [`DynamicViewCache`](descriptor::DynamicViewCache) per view kind and a batch of pending
//! barriers. Contexts are pooled per queue kind by the runtime.
//!
//! ## Feature Flags
//!
//! - `vulkan` - Enables the Vulkan driver in [`hal::vulkan`]
//!
//! Without it, only the software driver in [`hal::soft`] is available.

pub mod command;
mod config;
pub mod context;
pub mod descriptor;
pub mod device;
mod error;
pub mod fence;
pub mod hal;
pub mod linear;
pub mod queue;
pub mod retire;
mod runtime;
pub mod tracking;
pub mod utils;

pub use config::RuntimeConfig;
pub use context::{Context, ContextManager};
pub use device::{Device, HasDevice};
pub use error::{GpuError, Result};
pub use fence::FenceValue;
pub use runtime::{Runtime, RuntimeStats};

#[cfg(feature = "vulkan")]
pub use ash;

pub mod prelude {
    pub use crate::{
        Context, Device, FenceValue, GpuError, HasDevice, Runtime, RuntimeConfig,
        descriptor::{BindingLayout, GpuViewRange, SlotDesc},
        hal::{BindPoint, CpuView, Driver, MemoryKind, QueueKind, ViewDesc, ViewTableKind},
        linear::Allocation,
        tracking::{ResourceStates, TrackedResource},
    };
}
