//! The GPU runtime.
//!
//! A [`Runtime`] owns everything the command-submission core shares between threads: the
//! three queues, the page managers of both memory kinds, the pooled dynamic view tables, the
//! persistent view allocators and the pool of idle contexts. There are no globals; several
//! runtimes over different drivers may coexist.
//!
//! # Lifecycle
//!
//! ```
//! # use scoria::{Runtime, RuntimeConfig, hal::{QueueKind, soft::SoftDriver}};
//! let runtime = Runtime::init(SoftDriver::new(), RuntimeConfig::default()).unwrap();
//! let ctx = runtime.begin(QueueKind::Graphics).unwrap();
//! let fence = ctx.finish(false).unwrap();
//! runtime.wait_for_fence(fence).unwrap();
//! runtime.shutdown().unwrap();
//! ```
//!
//! When an operation reports a [fatal](crate::GpuError::is_fatal) error, in-flight work is
//! gone and nothing created from the old driver can be trusted. [`Runtime::recover`] tears
//! the runtime down without waiting for the GPU and builds a new one from scratch over a
//! fresh driver, with the same configuration.

use std::{fmt::Debug, sync::Arc};

use crate::{
    Device, HasDevice, RuntimeConfig,
    context::{Context, ContextManager},
    descriptor::{DynamicTablePool, PersistentViewAllocator, TablePoolStats},
    error::Result,
    fence::FenceValue,
    hal::{CpuView, Driver, MemoryKind, QueueKind, RawBuffer, ViewDesc, ViewTableKind},
    linear::{PageManager, PageStats},
    queue::QueueSet,
};

pub(crate) struct Shared {
    pub(crate) device: Device,
    pub(crate) config: RuntimeConfig,
    pub(crate) queues: Arc<QueueSet>,
    pub(crate) upload_pages: Arc<PageManager>,
    pub(crate) scratch_pages: Arc<PageManager>,
    pub(crate) table_pools: [Arc<DynamicTablePool>; 2],
    pub(crate) persistent: [PersistentViewAllocator; 2],
    pub(crate) contexts: ContextManager,
}

/// Pool sizes of a [`Runtime`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Recording buffers created per queue, indexed by [`QueueKind::index`].
    pub recording_buffers: [usize; 3],
    pub upload_pages: PageStats,
    pub scratch_pages: PageStats,
    /// Indexed by [`ViewTableKind::index`].
    pub dynamic_tables: [TablePoolStats; 2],
    /// Indexed by [`ViewTableKind::index`].
    pub persistent_tables: [usize; 2],
    pub contexts: usize,
}

/// The process-wide GPU runtime. See the [module documentation](self).
pub struct Runtime(Arc<Shared>);

impl HasDevice for Runtime {
    fn device(&self) -> &Device {
        &self.0.device
    }
}

impl Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("device", &self.0.device)
            .field("queues", &self.0.queues)
            .finish()
    }
}

impl Runtime {
    /// Creates the queues and every pool over `driver`.
    ///
    /// # Panics
    ///
    /// Panics if a size in `config` is zero.
    pub fn init(driver: impl Driver, config: RuntimeConfig) -> Result<Self> {
        Self::init_shared(Arc::new(driver), config)
    }

    /// Like [`init`](Self::init), for a driver the caller keeps a handle to.
    pub fn init_shared(driver: Arc<dyn Driver>, config: RuntimeConfig) -> Result<Self> {
        config.validate();
        let device = Device::from_arc(driver);
        let queues = Arc::new(QueueSet::new(&device, config.wait_timeout)?);
        let page_manager = |kind, page_size| {
            Arc::new(PageManager::new(device.clone(), kind, page_size, queues.clone()))
        };
        let shared = Shared {
            upload_pages: page_manager(MemoryKind::Upload, config.upload_page_size),
            scratch_pages: page_manager(MemoryKind::Scratch, config.scratch_page_size),
            table_pools: ViewTableKind::ALL.map(|kind| {
                Arc::new(DynamicTablePool::new(
                    device.clone(),
                    kind,
                    config.dynamic_table_capacity,
                    queues.clone(),
                ))
            }),
            persistent: ViewTableKind::ALL.map(|kind| {
                PersistentViewAllocator::new(
                    device.clone(),
                    kind,
                    config.persistent_views_per_table,
                )
            }),
            contexts: ContextManager::default(),
            queues,
            device,
            config,
        };
        tracing::info!(
            driver = shared.device.driver().name(),
            config = ?shared.config,
            "runtime initialized"
        );
        Ok(Runtime(Arc::new(shared)))
    }

    /// Waits for the GPU to go idle and destroys every pool.
    ///
    /// Contexts that are still recording keep their resources alive until they are dropped.
    pub fn shutdown(self) -> Result<()> {
        let result = self.0.queues.idle_gpu();
        if let Err(err) = &result {
            tracing::error!(%err, "failed to idle the GPU during shutdown");
        }
        self.0.contexts.clear();
        tracing::info!("runtime shut down");
        result
    }

    /// Replaces a runtime whose device was lost.
    ///
    /// Nothing is waited for: all in-flight work of the old runtime is abandoned. The new
    /// runtime uses the same configuration.
    pub fn recover(self, driver: impl Driver) -> Result<Self> {
        self.recover_shared(Arc::new(driver))
    }

    /// Like [`recover`](Self::recover), for a driver the caller keeps a handle to.
    pub fn recover_shared(self, driver: Arc<dyn Driver>) -> Result<Self> {
        tracing::error!(
            driver = self.0.device.driver().name(),
            "tearing down the runtime after a fatal error"
        );
        let config = self.0.config.clone();
        self.0.contexts.clear();
        drop(self);
        Self::init_shared(driver, config)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.0.config
    }

    pub fn queues(&self) -> &QueueSet {
        &self.0.queues
    }

    pub fn contexts(&self) -> &ContextManager {
        &self.0.contexts
    }

    /// Waits until every queue has finished all submitted work.
    pub fn idle_gpu(&self) -> Result<()> {
        self.0.queues.idle_gpu()
    }

    pub fn is_fence_complete(&self, fence: FenceValue) -> bool {
        self.0.queues.is_fence_complete(fence)
    }

    pub fn wait_for_fence(&self, fence: FenceValue) -> Result<()> {
        self.0.queues.wait_for_fence(fence)
    }

    /// Starts recording on a queue.
    pub fn begin(&self, kind: QueueKind) -> Result<Context> {
        Context::begin(self.0.clone(), kind, "")
    }

    /// Starts recording on a queue. `name` shows up in log messages about the context.
    pub fn begin_named(&self, kind: QueueKind, name: &str) -> Result<Context> {
        Context::begin(self.0.clone(), kind, name)
    }

    /// Allocates `count` persistent CPU-visible view slots.
    pub fn alloc_views(&self, kind: ViewTableKind, count: u32) -> Result<CpuView> {
        self.0.persistent[kind.index()].allocate(count)
    }

    /// Writes a view into a persistent slot.
    pub fn write_view(&self, view: CpuView, desc: &ViewDesc) {
        self.0.device.driver().write_view(view.table, view.index, desc);
    }

    /// Copies `bytes` into `dst` at `offset` on the copy queue and returns once the copy has
    /// completed.
    pub fn initialize_buffer(
        &self,
        dst: RawBuffer,
        offset: u64,
        bytes: &[u8],
    ) -> Result<FenceValue> {
        let mut ctx = self.begin_named(QueueKind::Copy, "initialize buffer")?;
        ctx.write_buffer(dst, offset, bytes)?;
        ctx.finish(true)
    }

    /// Fills `dst[offset..offset + size]` with `value` on the copy queue and returns once the
    /// fill has completed.
    pub fn fill_buffer(
        &self,
        dst: RawBuffer,
        offset: u64,
        size: u64,
        value: u32,
    ) -> Result<FenceValue> {
        let mut ctx = self.begin_named(QueueKind::Copy, "fill buffer")?;
        ctx.fill_buffer(dst, offset, size, value);
        ctx.finish(true)
    }

    pub fn stats(&self) -> RuntimeStats {
        let shared = &self.0;
        RuntimeStats {
            recording_buffers: QueueKind::ALL
                .map(|kind| shared.queues.get(kind).buffer_pool().len()),
            upload_pages: shared.upload_pages.stats(),
            scratch_pages: shared.scratch_pages.stats(),
            dynamic_tables: ViewTableKind::ALL.map(|kind| shared.table_pools[kind.index()].stats()),
            persistent_tables: ViewTableKind::ALL
                .map(|kind| shared.persistent[kind.index()].table_count()),
            contexts: shared.contexts.created(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        GpuError,
        hal::{Driver, RawResource, soft::{LiveObjects, SoftDriver}},
    };

    fn runtime(config: RuntimeConfig) -> (Arc<SoftDriver>, Runtime) {
        let driver = Arc::new(SoftDriver::new());
        (driver.clone(), Runtime::init_shared(driver, config).unwrap())
    }

    #[test]
    fn shutdown_destroys_everything() {
        let (driver, runtime) = runtime(RuntimeConfig::default());
        let view = runtime.alloc_views(ViewTableKind::Resource, 2).unwrap();
        runtime.write_view(view, &ViewDesc::SampledTexture { view: RawResource(1) });
        let mut ctx = runtime.begin(QueueKind::Graphics).unwrap();
        ctx.allocate_upload(1024, 256).unwrap();
        ctx.allocate_scratch(1024, 256).unwrap();
        ctx.upload_direct(ViewTableKind::Resource, view).unwrap();
        ctx.finish(false).unwrap();
        assert_ne!(driver.live_objects(), LiveObjects::default());

        runtime.shutdown().unwrap();
        assert_eq!(driver.live_objects(), LiveObjects::default());
    }

    #[test]
    fn initialize_buffer_blocks_until_copied() {
        let (driver, runtime) = runtime(RuntimeConfig::default());
        let dst = driver.create_buffer(MemoryKind::Scratch, 8).unwrap().handle;
        let fence = runtime.initialize_buffer(dst, 2, &[1, 2, 3]).unwrap();
        assert_eq!(fence.kind(), QueueKind::Copy);
        assert!(runtime.is_fence_complete(fence));
        assert_eq!(driver.read_buffer(dst, 0, 6), vec![0, 0, 1, 2, 3, 0]);

        runtime.fill_buffer(dst, 4, 4, 0x0909_0909).unwrap();
        assert_eq!(driver.read_buffer(dst, 4, 4), vec![9; 4]);
    }

    #[test]
    fn bounded_wait_reports_hang() {
        let (driver, runtime) = runtime(RuntimeConfig {
            wait_timeout: Some(Duration::from_millis(10)),
            ..Default::default()
        });
        driver.pause(QueueKind::Graphics);
        let ctx = runtime.begin(QueueKind::Graphics).unwrap();
        let err = ctx.finish(true).unwrap_err();
        assert!(matches!(err, GpuError::Timeout(_)));
        assert!(err.is_fatal());
        driver.resume(QueueKind::Graphics);
        runtime.idle_gpu().unwrap();
    }

    #[test]
    fn recover_after_device_loss() {
        let (lost, runtime) = runtime(RuntimeConfig {
            upload_page_size: 4096,
            ..Default::default()
        });
        lost.pause(QueueKind::Compute);
        let mut ctx = runtime.begin(QueueKind::Compute).unwrap();
        ctx.dispatch(1, 1, 1).unwrap();
        let fence = ctx.finish(false).unwrap();
        lost.lose_device();
        assert_eq!(runtime.wait_for_fence(fence), Err(GpuError::DeviceLost));
        assert!(runtime.begin(QueueKind::Compute).is_err());

        let fresh = Arc::new(SoftDriver::new());
        let runtime = runtime.recover_shared(fresh.clone()).unwrap();
        assert_eq!(lost.live_objects(), LiveObjects::default());
        assert_eq!(runtime.config().upload_page_size, 4096);

        let mut ctx = runtime.begin(QueueKind::Compute).unwrap();
        ctx.dispatch(1, 1, 1).unwrap();
        ctx.finish(true).unwrap();
        assert_eq!(fresh.stats().dispatches, 1);
    }

    #[test]
    fn runtimes_are_independent() {
        let (_a_driver, a) = runtime(RuntimeConfig::default());
        let (_b_driver, b) = runtime(RuntimeConfig::default());
        let fa = a.begin(QueueKind::Copy).unwrap().finish(true).unwrap();
        let fb = b.begin(QueueKind::Copy).unwrap().finish(true).unwrap();
        assert_eq!(fa, fb);
        assert_eq!(a.stats().contexts, 1);
        assert_eq!(b.stats().recording_buffers, [0, 0, 1]);
    }
}
