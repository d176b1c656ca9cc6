//! Transient memory: paged linear allocators.
//!
//! A [`LinearAllocator`] bump-allocates out of fixed-size pages. Pages come from a
//! [`PageManager`], one per [`MemoryKind`], so upload and scratch memory never share pages.
//! When a context finishes, its allocator hands every page it touched back to the manager
//! tagged with the context's fence value, and the manager recycles a page once that value
//! is complete.
//!
//! Requests larger than a page get a dedicated page of exactly the requested size. Those are
//! not recycled: they are destroyed once their fence is complete, so a rare huge upload does
//! not permanently grow the pool.
//!
//! Pages are shared through `Arc`. Every [`Allocation`] holds a reference to its page, and a
//! retired page is only handed out again when the manager holds the last reference. A page
//! whose fence is complete but which is still referenced is parked on the side, so it never
//! holds back pages retired after it.

use std::{
    fmt::Debug,
    sync::{Arc, Mutex},
};

use crate::{
    Device, HasDevice,
    error::Result,
    fence::FenceValue,
    hal::{MemoryKind, RawBuffer},
    queue::QueueSet,
    retire::RetiredList,
};

/// A block of GPU memory owned by a [`PageManager`].
pub struct Page {
    device: Device,
    kind: MemoryKind,
    buffer: RawBuffer,
    ptr: *mut u8,
    gpu_address: u64,
    size: u64,
}
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("kind", &self.kind)
            .field("buffer", &self.buffer)
            .field("size", &self.size)
            .finish()
    }
}

impl Page {
    fn new(device: Device, kind: MemoryKind, size: u64) -> Result<Self> {
        let allocation = device.driver().create_buffer(kind, size)?;
        Ok(Self {
            device,
            kind,
            buffer: allocation.handle,
            ptr: allocation
                .mapped
                .map_or(std::ptr::null_mut(), |ptr| ptr.as_ptr()),
            gpu_address: allocation.gpu_address,
            size,
        })
    }

    pub fn buffer(&self) -> RawBuffer {
        self.buffer
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        self.device.driver().destroy_buffer(self.buffer);
    }
}

/// Pool sizes of a [`PageManager`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageStats {
    /// Pooled pages created so far. Dedicated pages are not counted.
    pub created: usize,
    pub available: usize,
    pub retired: usize,
    /// Pages whose fence is complete but that an [`Allocation`] still references.
    pub pinned: usize,
    /// Dedicated pages waiting for their fence before being destroyed.
    pub large_pending: usize,
}

#[derive(Default)]
struct PageState {
    available: Vec<Arc<Page>>,
    retired: RetiredList<Arc<Page>>,
    pinned: Vec<Arc<Page>>,
    large: RetiredList<Arc<Page>>,
    created: usize,
}

/// Owns every page of one [`MemoryKind`].
pub struct PageManager {
    device: Device,
    kind: MemoryKind,
    page_size: u64,
    queues: Arc<QueueSet>,
    state: Mutex<PageState>,
}

impl HasDevice for PageManager {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl PageManager {
    pub fn new(device: Device, kind: MemoryKind, page_size: u64, queues: Arc<QueueSet>) -> Self {
        Self {
            device,
            kind,
            page_size,
            queues,
            state: Mutex::default(),
        }
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    fn free_completed_large_pages(&self, state: &mut PageState) {
        let freed = state
            .large
            .drain_ready(|fence, _| self.queues.is_fence_complete(fence))
            .count();
        if freed > 0 {
            tracing::debug!(kind = self.kind.name(), freed, "free large pages");
        }
    }

    /// Returns a pooled page, recycling a retired one if its fence is complete and nothing
    /// references it anymore.
    pub fn request_page(&self) -> Result<Arc<Page>> {
        let mut state = self.state.lock().unwrap();
        self.free_completed_large_pages(&mut state);
        let PageState {
            available,
            retired,
            pinned,
            ..
        } = &mut *state;
        pinned.extend(retired.drain_ready(|fence, _| self.queues.is_fence_complete(fence)));
        available.extend(pinned.extract_if(.., |page| Arc::strong_count(page) == 1));
        if let Some(page) = state.available.pop() {
            return Ok(page);
        }
        state.created += 1;
        tracing::info!(
            kind = self.kind.name(),
            size = self.page_size,
            total = state.created,
            "create page"
        );
        Ok(Arc::new(Page::new(
            self.device.clone(),
            self.kind,
            self.page_size,
        )?))
    }

    /// Retires pooled pages under `fence`.
    pub fn discard_pages(&self, fence: FenceValue, pages: impl IntoIterator<Item = Arc<Page>>) {
        let mut state = self.state.lock().unwrap();
        for page in pages {
            debug_assert_eq!(page.size, self.page_size);
            state.retired.retire(fence, page);
        }
    }

    /// Creates a dedicated page of exactly `size` bytes.
    pub fn create_large_page(&self, size: u64) -> Result<Arc<Page>> {
        {
            let mut state = self.state.lock().unwrap();
            self.free_completed_large_pages(&mut state);
        }
        tracing::info!(kind = self.kind.name(), size, "create large page");
        Ok(Arc::new(Page::new(self.device.clone(), self.kind, size)?))
    }

    /// Retires dedicated pages under `fence`. They are destroyed once it is complete.
    pub fn free_large_pages(&self, fence: FenceValue, pages: impl IntoIterator<Item = Arc<Page>>) {
        let mut state = self.state.lock().unwrap();
        for page in pages {
            state.large.retire(fence, page);
        }
        self.free_completed_large_pages(&mut state);
    }

    pub fn stats(&self) -> PageStats {
        let state = self.state.lock().unwrap();
        PageStats {
            created: state.created,
            available: state.available.len(),
            retired: state.retired.len(),
            pinned: state.pinned.len(),
            large_pending: state.large.len(),
        }
    }
}

/// A sub-range of a page.
///
/// The page stays alive, and is not recycled, for as long as the allocation exists.
pub struct Allocation {
    page: Arc<Page>,
    offset: u64,
    size: u64,
}

impl Debug for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("buffer", &self.page.buffer)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

impl Allocation {
    pub fn buffer(&self) -> RawBuffer {
        self.page.buffer
    }
    pub fn offset(&self) -> u64 {
        self.offset
    }
    pub fn size(&self) -> u64 {
        self.size
    }
    pub fn gpu_address(&self) -> u64 {
        self.page.gpu_address + self.offset
    }
    pub fn kind(&self) -> MemoryKind {
        self.page.kind
    }

    /// CPU view of the allocation. `None` for scratch memory.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        if self.page.ptr.is_null() {
            None
        } else {
            unsafe {
                Some(std::slice::from_raw_parts_mut(
                    self.page.ptr.add(self.offset as usize),
                    self.size as usize,
                ))
            }
        }
    }
}

/// Bump allocator over pages of one [`PageManager`].
pub struct LinearAllocator {
    manager: Arc<PageManager>,
    current: Option<Arc<Page>>,
    head: u64,
    full_pages: Vec<Arc<Page>>,
    large_pages: Vec<Arc<Page>>,
}

impl LinearAllocator {
    pub fn new(manager: Arc<PageManager>) -> Self {
        Self {
            manager,
            current: None,
            head: 0,
            full_pages: Vec::new(),
            large_pages: Vec::new(),
        }
    }

    pub fn kind(&self) -> MemoryKind {
        self.manager.kind
    }

    /// Allocates `size` bytes at an offset that is a multiple of `alignment`.
    ///
    /// # Panics
    ///
    /// Panics if `alignment` is not a power of two.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Result<Allocation> {
        assert!(
            alignment.is_power_of_two(),
            "alignment {alignment} is not a power of two"
        );
        if size > self.manager.page_size {
            let page = self.manager.create_large_page(size)?;
            self.large_pages.push(page.clone());
            return Ok(Allocation {
                page,
                offset: 0,
                size,
            });
        }

        let start = self.head.next_multiple_of(alignment);
        if let Some(page) = &self.current
            && start + size <= page.size
        {
            self.head = start + size;
            return Ok(Allocation {
                page: page.clone(),
                offset: start,
                size,
            });
        }

        if let Some(full) = self.current.take() {
            self.full_pages.push(full);
        }
        let page = self.manager.request_page()?;
        self.current = Some(page.clone());
        self.head = size;
        Ok(Allocation {
            page,
            offset: 0,
            size,
        })
    }

    /// Retires every page used since the last cleanup under `fence`, including the current
    /// one, and starts over on a fresh page next time.
    pub fn cleanup_used_pages(&mut self, fence: FenceValue) {
        if let Some(page) = self.current.take() {
            self.full_pages.push(page);
        }
        self.head = 0;
        self.manager.discard_pages(fence, self.full_pages.drain(..));
        self.manager.free_large_pages(fence, self.large_pages.drain(..));
    }

    /// Pages held since the last cleanup, dedicated pages included.
    pub fn pages_in_use(&self) -> usize {
        self.full_pages.len() + self.large_pages.len() + usize::from(self.current.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{QueueKind, soft::SoftDriver};

    fn setup(
        kind: MemoryKind,
        page_size: u64,
    ) -> (Arc<SoftDriver>, Arc<QueueSet>, Arc<PageManager>) {
        let driver = Arc::new(SoftDriver::new());
        let device = Device::from_arc(driver.clone());
        let queues = Arc::new(QueueSet::new(&device, None).unwrap());
        let manager = Arc::new(PageManager::new(device, kind, page_size, queues.clone()));
        (driver, queues, manager)
    }

    #[test]
    fn aligned_and_disjoint() {
        let (_driver, _queues, manager) = setup(MemoryKind::Upload, 256);
        let mut allocator = LinearAllocator::new(manager);
        let mut live: Vec<Allocation> = Vec::new();
        let requests = [
            (3, 1),
            (16, 16),
            (1, 4),
            (40, 64),
            (0, 8),
            (100, 2),
            (90, 32),
            (7, 128),
        ];
        for (i, &(size, alignment)) in requests.iter().enumerate() {
            let allocation = allocator.allocate(size, alignment).unwrap();
            assert_eq!(allocation.offset() % alignment, 0, "allocation {i}");
            for other in &live {
                if other.buffer() != allocation.buffer() || size == 0 || other.size() == 0 {
                    continue;
                }
                let disjoint = allocation.offset() + size <= other.offset()
                    || other.offset() + other.size() <= allocation.offset();
                assert!(disjoint, "{allocation:?} overlaps {other:?}");
            }
            live.push(allocation);
        }
    }

    #[test]
    fn oversized_request_gets_dedicated_page() {
        let (driver, _queues, manager) = setup(MemoryKind::Scratch, 4);
        let mut allocator = LinearAllocator::new(manager.clone());
        let small = allocator.allocate(4, 1).unwrap();
        let large = allocator.allocate(5, 1).unwrap();
        assert_ne!(small.buffer(), large.buffer());
        assert_eq!(driver.buffer_len(large.buffer()), Some(5));
        assert_eq!(driver.buffer_len(small.buffer()), Some(4));
        assert_eq!(manager.stats().created, 1);
    }

    #[test]
    fn large_pages_are_destroyed_once_complete() {
        let (driver, queues, manager) = setup(MemoryKind::Upload, 4);
        let mut allocator = LinearAllocator::new(manager.clone());
        let large = allocator.allocate(64, 1).unwrap();
        let buffer = large.buffer();
        drop(large);
        driver.pause(QueueKind::Copy);
        let fence = queues.get(QueueKind::Copy).signal().unwrap();
        allocator.cleanup_used_pages(fence);
        assert_eq!(manager.stats().large_pending, 1);
        assert!(driver.buffer_len(buffer).is_some());

        driver.resume(QueueKind::Copy);
        queues.wait_for_fence(fence).unwrap();
        manager.free_large_pages(fence, []);
        assert_eq!(manager.stats().large_pending, 0);
        assert_eq!(driver.buffer_len(buffer), None);
    }

    #[test]
    fn pages_recycle_after_fence() {
        let (driver, queues, manager) = setup(MemoryKind::Upload, 64);
        let queue = queues.get(QueueKind::Graphics);
        let mut allocator = LinearAllocator::new(manager.clone());

        let first = allocator.allocate(8, 8).unwrap().buffer();
        driver.pause(QueueKind::Graphics);
        let fence = queue.signal().unwrap();
        allocator.cleanup_used_pages(fence);

        let second = allocator.allocate(8, 8).unwrap().buffer();
        assert_ne!(first, second);
        allocator.cleanup_used_pages(queue.signal().unwrap());

        driver.resume(QueueKind::Graphics);
        queue.wait_idle().unwrap();
        let third = allocator.allocate(8, 8).unwrap().buffer();
        assert!(third == first || third == second);
        assert_eq!(manager.stats().created, 2);
    }

    #[test]
    fn live_allocation_pins_page() {
        let (_driver, queues, manager) = setup(MemoryKind::Upload, 64);
        let queue = queues.get(QueueKind::Graphics);
        let mut allocator = LinearAllocator::new(manager.clone());
        let kept = allocator.allocate(8, 8).unwrap();
        queue.wait_idle().unwrap();
        allocator.cleanup_used_pages(queue.last_submitted());
        let next = allocator.allocate(8, 8).unwrap();
        assert_ne!(next.buffer(), kept.buffer());
    }

    #[test]
    fn held_allocation_does_not_stall_recycling() {
        let (_driver, queues, manager) = setup(MemoryKind::Upload, 256);
        let queue = queues.get(QueueKind::Graphics);
        let mut allocator = LinearAllocator::new(manager.clone());
        let kept = allocator.allocate(16, 16).unwrap();
        allocator.cleanup_used_pages(queue.signal().unwrap());

        for _ in 0..20 {
            allocator.allocate(256, 16).unwrap();
            let fence = queue.signal().unwrap();
            allocator.cleanup_used_pages(fence);
            queues.wait_for_fence(fence).unwrap();
        }
        assert!(manager.stats().created <= 3, "{:?}", manager.stats());

        allocator.allocate(8, 8).unwrap();
        assert_eq!(manager.stats().pinned, 1);
        drop(kept);
        allocator.allocate(256, 16).unwrap();
        assert_eq!(manager.stats().pinned, 0);
        assert!(manager.stats().created <= 3);
    }

    #[test]
    fn upload_memory_is_writable() {
        let (driver, _queues, manager) = setup(MemoryKind::Upload, 64);
        let mut allocator = LinearAllocator::new(manager);
        allocator.allocate(5, 1).unwrap();
        let mut allocation = allocator.allocate(4, 4).unwrap();
        allocation.as_mut_slice().unwrap().copy_from_slice(&[9, 8, 7, 6]);
        assert_eq!(allocation.offset(), 8);
        assert_eq!(driver.read_buffer(allocation.buffer(), 8, 4), vec![9, 8, 7, 6]);
    }

    #[test]
    fn scratch_memory_is_not_mapped() {
        let (_driver, _queues, manager) = setup(MemoryKind::Scratch, 64);
        let mut allocator = LinearAllocator::new(manager);
        let mut allocation = allocator.allocate(16, 16).unwrap();
        assert!(allocation.as_mut_slice().is_none());
    }

    #[test]
    #[should_panic(expected = "not a power of two")]
    fn bad_alignment_panics() {
        let (_driver, _queues, manager) = setup(MemoryKind::Upload, 64);
        LinearAllocator::new(manager).allocate(4, 3).ok();
    }
}
